//! Trait-based process definitions and the per-tick context handed to them.

#![forbid(unsafe_code)]

use crate::bus::{Bus, BusState, BusView, Buses};
use crate::handle::{BusId, Sample, Status, Time, Token};

/// A schedulable unit of signal computation.
///
/// `tick` runs once per block on the driver thread and must not block.
/// `teardown` runs later, outside the tick path, once the process has been
/// detached.
pub trait Process: Send {
    /// Per-block handler.
    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Status;

    /// Deferred release of the process's resources.
    fn teardown(&mut self) {}

    /// Short label for logs.
    fn name(&self) -> &'static str {
        "process"
    }

    /// The bus this process writes, if any. Bound to the process's token when
    /// it is attached through the engine.
    fn output_bus(&self) -> Option<BusId> {
        None
    }
}

/// What a handler sees during its slot in the walk.
pub struct TickContext<'a> {
    time: Time,
    token: Token,
    buses: &'a mut Buses,
}

impl<'a> TickContext<'a> {
    pub(crate) fn new(time: Time, token: Token, buses: &'a mut Buses) -> Self {
        Self { time, token, buses }
    }

    /// Logical time supplied by the driver for this tick.
    pub fn time(&self) -> Time {
        self.time
    }

    /// Token of the running process.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Read a bus as seen from this process's position.
    pub fn read(&self, bus: BusId) -> Option<&[Sample]> {
        self.buses.read(bus, self.token)
    }

    /// Read one channel of a bus as seen from this process's position.
    pub fn read_channel(&self, bus: BusId, channel: usize) -> Option<&[Sample]> {
        self.buses
            .get(bus)
            .and_then(|b| b.read_channel(self.token, channel))
    }

    /// Write access to a bus owned by this process.
    ///
    /// Returns `None` when the bus is unknown or written by someone else.
    pub fn bus_mut(&mut self, bus: BusId) -> Option<&mut Bus> {
        let token = self.token;
        self.buses
            .get_mut(bus)
            .filter(|b| b.writer() == token && b.state() == BusState::Active)
    }

    /// The owned bus `own` for writing, plus read access to every other bus.
    pub fn split(&mut self, own: BusId) -> Option<(&mut Bus, BusView<'_>)> {
        let token = self.token;
        let (bus, view) = self.buses.split_mut(own, token)?;
        if bus.writer() != token || bus.state() != BusState::Active {
            return None;
        }
        Some((bus, view))
    }
}

/// Adapts a closure into a [`Process`].
pub struct FnProcess<F> {
    name: &'static str,
    output: Option<BusId>,
    func: F,
}

/// Build a process from a closure.
pub fn from_fn<F>(func: F) -> FnProcess<F>
where
    F: FnMut(&mut TickContext<'_>) -> Status + Send,
{
    FnProcess {
        name: "fn",
        output: None,
        func,
    }
}

impl<F> FnProcess<F> {
    /// Label used in logs.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Declare the bus this closure writes.
    pub fn writing(mut self, bus: BusId) -> Self {
        self.output = Some(bus);
        self
    }
}

impl<F> Process for FnProcess<F>
where
    F: FnMut(&mut TickContext<'_>) -> Status + Send,
{
    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Status {
        (self.func)(ctx)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn output_bus(&self) -> Option<BusId> {
        self.output
    }
}
