//! Real-time process list with causally ordered, double-buffered signal buses.

#![forbid(unsafe_code)]

pub mod builtin;
pub mod bus;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
#[doc(hidden)]
pub mod invariant_ppt;
#[doc(hidden)]
pub mod invariant_rt;
pub mod process;
pub mod registry;

pub use bus::{Bus, BusLayout, BusState, BusView, Buses, Side};
pub use command::Placement;
pub use config::EngineConfig;
pub use engine::{render_offline, Controller, Engine};
pub use error::EngineError;
pub use handle::{BusId, ProcessId, Sample, Status, Time, Token};
pub use process::{from_fn, FnProcess, Process, TickContext};
pub use registry::{Detached, Registry};
