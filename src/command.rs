//! Command and garbage messages between the main thread and the RT engine.
//!
//! Commands travel main → RT over a lock-free SPSC queue, each stamped with
//! the sample time it is due at. The engine holds early arrivals until their
//! block and applies them at the start of it, before the walk, so the process
//! list never changes while a tick is in progress. Detached processes and retired buses travel
//! back RT → main as garbage, so their storage is released off the audio
//! thread.
//!
//! Payloads are allocated on the main thread; moving them through the queue
//! never allocates or frees on the RT side.

use crate::bus::Bus;
use crate::handle::{BusId, ProcessId};
use crate::process::Process;
use rtrb::{Consumer, Producer, RingBuffer};

/// Where a newly attached process is linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// After the current last process.
    Back,
    /// Before the current first process.
    Front,
}

/// Messages from the main thread to the RT engine.
pub(crate) enum Command {
    /// Store and link a process, binding its bus to the new token.
    Attach {
        id: ProcessId,
        process: Box<dyn Process>,
        bus: Option<(BusId, Bus)>,
        placement: Placement,
    },

    /// Unlink a process and ship it (and its bus) back for teardown.
    Detach { id: ProcessId },

    /// Route an output channel from a bus channel, or silence it.
    Route {
        channel: usize,
        source: Option<(BusId, usize)>,
    },
}

impl Command {
    /// The process this command concerns, if any.
    pub(crate) fn target(&self) -> Option<ProcessId> {
        match self {
            Command::Attach { id, .. } => Some(*id),
            Command::Detach { id } => Some(*id),
            Command::Route { .. } => None,
        }
    }

    /// Short label for logs.
    pub(crate) fn description(&self) -> &'static str {
        match self {
            Command::Attach {
                placement: Placement::Back,
                ..
            } => "Append",
            Command::Attach {
                placement: Placement::Front,
                ..
            } => "Prepend",
            Command::Detach { .. } => "Detach",
            Command::Route { source: Some(_), .. } => "Route",
            Command::Route { source: None, .. } => "Unroute",
        }
    }
}

/// A command and the elapsed-sample count at which it takes effect.
pub(crate) struct Scheduled {
    pub(crate) due: u64,
    pub(crate) command: Command,
}

impl Scheduled {
    /// Whether a block ending at `elapsed` samples should apply this command.
    pub(crate) fn is_due(&self, elapsed: u64) -> bool {
        self.due <= elapsed
    }
}

/// Items handed back from the RT engine for teardown.
pub(crate) enum Garbage {
    /// A detached process awaiting `teardown`.
    Process {
        id: ProcessId,
        process: Box<dyn Process>,
    },
    /// A retired bus awaiting destruction.
    Bus { id: BusId, bus: Bus },
}

impl Garbage {
    pub(crate) fn description(&self) -> &'static str {
        match self {
            Garbage::Process { .. } => "Process",
            Garbage::Bus { .. } => "Bus",
        }
    }
}

/// Creates the command queue pair.
///
/// Returns (producer for main thread, consumer for RT).
pub(crate) fn new_command_queue(capacity: usize) -> (Producer<Scheduled>, Consumer<Scheduled>) {
    RingBuffer::new(capacity)
}

/// Creates the garbage queue pair.
///
/// Returns (producer for RT, consumer for main thread).
pub(crate) fn new_garbage_queue(capacity: usize) -> (Producer<Garbage>, Consumer<Garbage>) {
    RingBuffer::new(capacity)
}
