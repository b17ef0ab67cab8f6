//! Engine module: the driver-facing tick loop and its main-thread controller.
//!
//! [`new`] returns a pair. Send the [`Engine`] to the real-time thread and
//! call [`Engine::process_block`] once per block. Keep the [`Controller`] on
//! the main thread: it creates processes and buses, queues structural
//! changes for the engine to apply between blocks, and tears down whatever the
//! engine hands back.
//!
//! Every command carries the sample time it is due at. [`Controller::tick`]
//! moves that stamp to the engine's clock plus the configured latency, so a
//! burst of changes made between two controller ticks lands in the same
//! block.

// IMPORTANT: Do not call assert_invariant, tracing, or anything that locks or
// allocates from Engine::process_block.

use crate::bus::{Bus, BusLayout, BusState, Buses};
use crate::command::{new_command_queue, new_garbage_queue, Command, Garbage, Placement, Scheduled};
use crate::config::check_latency;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::handle::{BusId, IdAllocator, ProcessId, Sample, Time, Token};
use crate::invariant_ppt::{
    assert_invariant, HANDLE_FRESH, ROUTE_IN_RANGE, TEARDOWN_AFTER_DETACH, WRITER_BOUND_ON_ATTACH,
};
use crate::invariant_rt::{
    drain_invariant_signals, new_invariant_queue, signal_invariant, INV_BLOCK_COMPLETE,
    INV_COMMAND_APPLIED, INV_INPUT_DELIVERED, INV_OUTPUT_ROUTED, INV_PROCESS_FINISHED,
    INV_TEARDOWN_DEFERRED,
};
use crate::process::Process;
use crate::registry::Registry;
use rtrb::{Consumer, Producer, PushError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Build a controller/engine pair from a validated configuration.
pub fn new(config: EngineConfig) -> Result<(Controller, Engine), EngineError> {
    config.validate()?;

    let (command_tx, command_rx) = new_command_queue(config.command_capacity);
    let (garbage_tx, garbage_rx) = new_garbage_queue(config.garbage_slots());
    let (signal_tx, signal_rx) = new_invariant_queue();

    let mut bus_ids = IdAllocator::bounded(config.max_buses);
    let (index, generation) = bus_ids
        .allocate()
        .ok_or(EngineError::BusLimit { max: config.max_buses })?;
    let input_bus = BusId { index, generation };
    let input_layout = BusLayout::new(config.input_channels, config.block_size);

    let mut buses = Buses::with_capacity(config.max_buses);
    buses.place(input_bus, Bus::with_writer(input_layout, Token::DRIVER));

    let mut bus_layouts = HashMap::new();
    bus_layouts.insert(input_bus, input_layout);

    tracing::info!(
        sample_rate = config.sample_rate,
        block_size = config.block_size,
        inputs = config.input_channels,
        outputs = config.output_channels,
        latency = config.latency,
        "engine created"
    );

    let clock = Arc::new(AtomicU64::new(0));

    let controller = Controller {
        config: config.clone(),
        commands: command_tx,
        garbage: garbage_rx,
        signals: signal_rx,
        process_ids: IdAllocator::bounded(config.max_processes),
        bus_ids,
        processes: HashMap::new(),
        bus_layouts,
        input_bus,
        clock: Arc::clone(&clock),
        latency: config.latency,
        stamp: 0,
    };

    let engine = Engine {
        registry: Registry::with_capacity(config.max_processes),
        buses,
        commands: command_rx,
        garbage: garbage_tx,
        signals: signal_tx,
        pending: VecDeque::with_capacity(config.command_capacity),
        // Every slot yields at most one garbage item before its id is released.
        stalled: VecDeque::with_capacity(config.max_processes + config.max_buses),
        owned: vec![None; config.max_processes],
        routes: vec![None; config.output_channels],
        input_bus,
        elapsed: 0,
        clock,
        config,
    };

    Ok((controller, engine))
}

/// The real-time half: applies queued changes and walks the registry.
pub struct Engine {
    config: EngineConfig,
    registry: Registry,
    buses: Buses,
    commands: Consumer<Scheduled>,
    garbage: Producer<Garbage>,
    signals: Producer<u8>,
    pending: VecDeque<Scheduled>,
    stalled: VecDeque<Garbage>,
    owned: Vec<Option<BusId>>,
    routes: Vec<Option<(BusId, usize)>>,
    input_bus: BusId,
    elapsed: u64,
    clock: Arc<AtomicU64>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("elapsed", &self.elapsed)
            .field("pending", &self.pending.len())
            .field("stalled", &self.stalled.len())
            .finish()
    }
}

impl Engine {
    /// Process one block.
    ///
    /// `input` and `output` hold one slice per configured channel, each
    /// `block_size` frames long. The clock advances by one block first; the
    /// walk runs at the time the block ends, and only commands due by then
    /// are applied. Does not allocate or lock.
    pub fn process_block(
        &mut self,
        input: &[&[Sample]],
        output: &mut [&mut [Sample]],
    ) -> Result<(), EngineError> {
        self.check_boundary(input, output)?;

        self.elapsed += self.config.block_size as u64;
        self.clock.store(self.elapsed, Ordering::Release);

        self.apply_commands();
        self.flush_stalled();

        if let Some(bus) = self.buses.get_mut(self.input_bus) {
            bus.advance();
            for (channel, src) in input.iter().enumerate() {
                bus.write_channel(channel, src);
            }
            signal_invariant(&mut self.signals, INV_INPUT_DELIVERED);
        }

        let time = self.now();
        self.registry.tick(time, &mut self.buses);
        signal_invariant(&mut self.signals, INV_BLOCK_COMPLETE);

        while let Some(id) = self.registry.pop_finished() {
            self.detach(id);
            signal_invariant(&mut self.signals, INV_PROCESS_FINISHED);
        }

        for (channel, out) in output.iter_mut().enumerate() {
            let source = self.routes.get(channel).copied().flatten();
            let samples = source.and_then(|(bus, bus_channel)| {
                self.buses
                    .get(bus)
                    .and_then(|b| b.latest_channel(bus_channel))
            });
            match samples {
                Some(samples) => {
                    let n = out.len().min(samples.len());
                    out[..n].copy_from_slice(&samples[..n]);
                    out[n..].fill(0.0);
                    signal_invariant(&mut self.signals, INV_OUTPUT_ROUTED);
                }
                None => out.fill(0.0),
            }
        }

        Ok(())
    }

    fn check_boundary(&self, input: &[&[Sample]], output: &[&mut [Sample]]) -> Result<(), EngineError> {
        let frames = self.config.block_size;
        if input.len() != self.config.input_channels {
            return Err(EngineError::ChannelCountMismatch {
                expected: self.config.input_channels,
                got: input.len(),
            });
        }
        if output.len() != self.config.output_channels {
            return Err(EngineError::ChannelCountMismatch {
                expected: self.config.output_channels,
                got: output.len(),
            });
        }
        let lengths = input.iter().map(|c| c.len()).chain(output.iter().map(|c| c.len()));
        for got in lengths {
            if got != frames {
                return Err(EngineError::BlockSizeMismatch {
                    expected: frames,
                    got,
                });
            }
        }
        Ok(())
    }

    fn apply_commands(&mut self) {
        // Past this many held commands the rest wait in the queue.
        while self.pending.len() < self.config.command_capacity {
            let Ok(scheduled) = self.commands.pop() else {
                break;
            };
            let at = self.pending.partition_point(|held| held.due <= scheduled.due);
            self.pending.insert(at, scheduled);
        }

        while let Some(next) = self.pending.front() {
            if !next.is_due(self.elapsed) {
                break;
            }
            let Some(Scheduled { command, .. }) = self.pending.pop_front() else {
                break;
            };
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Attach {
                id,
                process,
                bus,
                placement,
            } => {
                self.registry.place(id, process);
                let token = match placement {
                    Placement::Back => self.registry.append(id),
                    Placement::Front => self.registry.prepend(id),
                };
                if let Some((bus_id, mut bus)) = bus {
                    if let Some(token) = token {
                        bus.bind(token);
                    }
                    self.buses.place(bus_id, bus);
                    if let Some(owner) = self.owned.get_mut(id.index()) {
                        *owner = Some(bus_id);
                    }
                }
            }
            Command::Detach { id } => self.detach(id),
            Command::Route { channel, source } => {
                if let Some(route) = self.routes.get_mut(channel) {
                    *route = source;
                }
            }
        }
        signal_invariant(&mut self.signals, INV_COMMAND_APPLIED);
    }

    fn detach(&mut self, id: ProcessId) {
        let Some(detached) = self.registry.remove(id) else {
            return;
        };
        if let Some(process) = self.registry.take(detached) {
            self.ship(Garbage::Process { id, process });
        }
        let owned = self.owned.get_mut(id.index()).and_then(Option::take);
        if let Some(bus_id) = owned {
            if let Some(bus) = self.buses.take(bus_id) {
                self.ship(Garbage::Bus { id: bus_id, bus });
            }
        }
    }

    fn ship(&mut self, item: Garbage) {
        // Keep arrival order behind anything already waiting.
        if !self.stalled.is_empty() {
            self.stalled.push_back(item);
            return;
        }
        match self.garbage.push(item) {
            Ok(()) => signal_invariant(&mut self.signals, INV_TEARDOWN_DEFERRED),
            Err(PushError::Full(item)) => self.stalled.push_back(item),
        }
    }

    fn flush_stalled(&mut self) {
        while let Some(item) = self.stalled.pop_front() {
            match self.garbage.push(item) {
                Ok(()) => signal_invariant(&mut self.signals, INV_TEARDOWN_DEFERRED),
                Err(PushError::Full(item)) => {
                    self.stalled.push_front(item);
                    break;
                }
            }
        }
    }

    /// Samples processed since creation, including the last block.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// Logical time of the last processed block, in seconds. Zero before the
    /// first block.
    pub fn now(&self) -> Time {
        self.elapsed as f64 / self.config.sample_rate
    }

    /// Commands received but not yet due.
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Garbage waiting for room in the queue to the main thread.
    pub fn stalled_garbage(&self) -> usize {
        self.stalled.len()
    }

    /// The process list, for inspection between blocks.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The bus set, for inspection between blocks.
    pub fn buses(&self) -> &Buses {
        &self.buses
    }

    /// The bus carrying driver input.
    pub fn input_bus(&self) -> BusId {
        self.input_bus
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

struct ProcessRecord {
    name: &'static str,
    bus: Option<BusId>,
    detaching: bool,
}

/// The main-thread half: creation, teardown, routing and the schedule clock.
pub struct Controller {
    config: EngineConfig,
    commands: Producer<Scheduled>,
    garbage: Consumer<Garbage>,
    signals: Consumer<u8>,
    process_ids: IdAllocator,
    bus_ids: IdAllocator,
    processes: HashMap<ProcessId, ProcessRecord>,
    bus_layouts: HashMap<BusId, BusLayout>,
    input_bus: BusId,
    clock: Arc<AtomicU64>,
    latency: Time,
    stamp: u64,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("processes", &self.processes.len())
            .field("buses", &self.bus_layouts.len())
            .field("stamp", &self.stamp)
            .finish()
    }
}

impl Controller {
    /// Move the schedule stamp to the engine's clock plus the latency.
    ///
    /// Commands sent until the next call are due at the returned time, in
    /// seconds. The stamp never moves backwards, so commands apply in the
    /// order they were sent even if the latency shrinks.
    pub fn tick(&mut self) -> Time {
        let target = self.engine_elapsed() + self.config.samples(self.latency);
        self.stamp = self.stamp.max(target);
        self.now()
    }

    /// Time at which commands sent now take effect, in seconds.
    pub fn now(&self) -> Time {
        self.stamp as f64 / self.config.sample_rate
    }

    /// Samples the engine has processed, as last published by it.
    pub fn engine_elapsed(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Scheduling latency in seconds.
    pub fn latency(&self) -> Time {
        self.latency
    }

    /// Change the scheduling latency. Takes effect at the next [`Controller::tick`].
    pub fn set_latency(&mut self, latency: Time) -> Result<(), EngineError> {
        check_latency(latency)?;
        self.latency = latency;
        tracing::debug!(latency, "latency changed");
        Ok(())
    }

    /// Queue `process` to be linked after the current last process.
    pub fn spawn<P: Process + 'static>(&mut self, process: P) -> Result<ProcessId, EngineError> {
        self.attach(Box::new(process), None, Placement::Back)
    }

    /// Queue `process` to be linked before the current first process.
    pub fn spawn_front<P: Process + 'static>(&mut self, process: P) -> Result<ProcessId, EngineError> {
        self.attach(Box::new(process), None, Placement::Front)
    }

    /// Allocate a bus and queue the process that writes it.
    ///
    /// `make` receives the new bus id. The bus is bound to the process's
    /// token when the engine links it, and retired with it.
    pub fn spawn_writer<P, F>(
        &mut self,
        layout: BusLayout,
        placement: Placement,
        make: F,
    ) -> Result<(ProcessId, BusId), EngineError>
    where
        P: Process + 'static,
        F: FnOnce(BusId) -> P,
    {
        let (index, generation) = self.bus_ids.allocate().ok_or(EngineError::BusLimit {
            max: self.config.max_buses,
        })?;
        let bus_id = BusId { index, generation };
        let process = make(bus_id);
        if let Some(declared) = process.output_bus().filter(|&declared| declared != bus_id) {
            self.bus_ids.release(index, generation);
            tracing::warn!(bus = %bus_id, declared = %declared, "writer declares a foreign bus");
            return Err(EngineError::ForeignOutputBus {
                expected: bus_id,
                declared,
            });
        }
        assert_invariant(
            WRITER_BOUND_ON_ATTACH,
            process.output_bus().map_or(true, |declared| declared == bus_id),
            "Writer declares its own bus or none",
            Some("spawn_writer"),
        );
        let bus = Bus::new(layout);
        match self.attach(Box::new(process), Some((bus_id, bus)), placement) {
            Ok(id) => {
                self.bus_layouts.insert(bus_id, layout);
                Ok((id, bus_id))
            }
            Err(err) => {
                self.bus_ids.release(index, generation);
                Err(err)
            }
        }
    }

    fn attach(
        &mut self,
        process: Box<dyn Process>,
        bus: Option<(BusId, Bus)>,
        placement: Placement,
    ) -> Result<ProcessId, EngineError> {
        let (index, generation) = self.process_ids.allocate().ok_or(EngineError::ProcessLimit {
            max: self.config.max_processes,
        })?;
        let id = ProcessId { index, generation };
        assert_invariant(
            HANDLE_FRESH,
            !self.processes.contains_key(&id),
            "Allocated process handle is already live",
            Some("attach"),
        );

        let name = process.name();
        let bus_id = bus.as_ref().map(|(b, _)| *b);
        let command = Command::Attach {
            id,
            process,
            bus,
            placement,
        };
        let description = command.description();
        if let Err(err) = self.send(command) {
            self.process_ids.release(index, generation);
            return Err(err);
        }

        self.processes.insert(
            id,
            ProcessRecord {
                name,
                bus: bus_id,
                detaching: false,
            },
        );
        tracing::debug!(process = %id, name, op = description, "queued");
        Ok(id)
    }

    /// Queue `id` for unlinking. Its teardown runs in [`Controller::collect_garbage`].
    pub fn detach(&mut self, id: ProcessId) -> Result<(), EngineError> {
        let record = match self.processes.get(&id) {
            Some(record) if !record.detaching => record,
            _ => return Err(EngineError::UnknownProcess(id)),
        };
        let name = record.name;
        self.send(Command::Detach { id })?;
        if let Some(record) = self.processes.get_mut(&id) {
            record.detaching = true;
        }
        tracing::debug!(process = %id, name, "detach queued");
        Ok(())
    }

    /// Feed output `channel` from `bus_channel` of `bus`.
    pub fn route_output(&mut self, channel: usize, bus: BusId, bus_channel: usize) -> Result<(), EngineError> {
        self.check_output(channel)?;
        let layout = self
            .bus_layouts
            .get(&bus)
            .ok_or(EngineError::UnknownBus(bus))?;
        if bus_channel >= layout.channels {
            return Err(EngineError::ChannelOutOfRange {
                channel: bus_channel,
                channels: layout.channels,
            });
        }
        assert_invariant(
            ROUTE_IN_RANGE,
            channel < self.config.output_channels && bus_channel < layout.channels,
            "Route targets a valid channel pair",
            Some("route_output"),
        );
        self.send_route(channel, Some((bus, bus_channel)))?;
        tracing::debug!(channel, bus = %bus, bus_channel, "output routed");
        Ok(())
    }

    /// Silence output `channel`.
    pub fn clear_output(&mut self, channel: usize) -> Result<(), EngineError> {
        self.check_output(channel)?;
        self.send_route(channel, None)?;
        tracing::debug!(channel, "output cleared");
        Ok(())
    }

    fn check_output(&self, channel: usize) -> Result<(), EngineError> {
        if channel >= self.config.output_channels {
            return Err(EngineError::ChannelOutOfRange {
                channel,
                channels: self.config.output_channels,
            });
        }
        Ok(())
    }

    fn send_route(&mut self, channel: usize, source: Option<(BusId, usize)>) -> Result<(), EngineError> {
        self.send(Command::Route { channel, source })
    }

    fn send(&mut self, command: Command) -> Result<(), EngineError> {
        let scheduled = Scheduled {
            due: self.stamp,
            command,
        };
        match self.commands.push(scheduled) {
            Ok(()) => Ok(()),
            Err(PushError::Full(Scheduled { command, .. })) => {
                // Dropping a rejected Attach frees its payload here, on the main thread.
                tracing::warn!(
                    process = ?command.target(),
                    op = command.description(),
                    "command queue full"
                );
                Err(EngineError::QueueFull)
            }
        }
    }

    /// Tear down everything the engine has detached since the last call.
    ///
    /// Runs each process's `teardown`, destroys retired buses and frees their
    /// handles for reuse. Returns the number of items collected.
    pub fn collect_garbage(&mut self) -> usize {
        let mut collected = 0;
        while let Ok(item) = self.garbage.pop() {
            let kind = item.description();
            match item {
                Garbage::Process { id, mut process } => {
                    let record = self.processes.remove(&id);
                    assert_invariant(
                        TEARDOWN_AFTER_DETACH,
                        record.is_some(),
                        "Garbage names a process this controller spawned",
                        Some("collect_garbage"),
                    );
                    process.teardown();
                    drop(process);
                    self.process_ids.release(id.index, id.generation);
                    tracing::debug!(process = %id, kind, "collected");
                }
                Garbage::Bus { id, bus } => {
                    debug_assert_eq!(bus.state(), BusState::PendingTeardown);
                    bus.destroy();
                    self.bus_layouts.remove(&id);
                    self.bus_ids.release(id.index, id.generation);
                    tracing::debug!(bus = %id, kind, "collected");
                }
            }
            collected += 1;
        }
        collected
    }

    /// Process handles currently allocated, including those awaiting collection.
    pub fn process_count(&self) -> usize {
        self.process_ids.live()
    }

    /// Whether `id` was spawned and has not been collected yet.
    pub fn is_live(&self, id: ProcessId) -> bool {
        self.processes.contains_key(&id)
    }

    /// The bus written by `id`, if it was spawned as a writer.
    pub fn bus_of(&self, id: ProcessId) -> Option<BusId> {
        self.processes.get(&id).and_then(|r| r.bus)
    }

    /// The bus carrying driver input.
    pub fn input_bus(&self) -> BusId {
        self.input_bus
    }

    /// Invariant ids signaled by the engine since the last drain.
    pub fn drain_invariant_signals(&mut self) -> Vec<u8> {
        drain_invariant_signals(&mut self.signals)
    }

    /// Configuration the pair was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Render `frames` frames of silence-driven output, block by block.
///
/// Allocates; for offline use only.
pub fn render_offline(engine: &mut Engine, frames: usize) -> Result<Vec<Vec<Sample>>, EngineError> {
    let block = engine.config.block_size;
    let silence = vec![0.0; block];
    let inputs: Vec<&[Sample]> = (0..engine.config.input_channels)
        .map(|_| silence.as_slice())
        .collect();
    let mut blocks = vec![vec![0.0; block]; engine.config.output_channels];
    let mut rendered = vec![Vec::with_capacity(frames); engine.config.output_channels];

    let mut done = 0;
    while done < frames {
        {
            let mut outputs: Vec<&mut [Sample]> = blocks.iter_mut().map(|b| b.as_mut_slice()).collect();
            engine.process_block(&inputs, &mut outputs)?;
        }
        let take = block.min(frames - done);
        for (dst, src) in rendered.iter_mut().zip(&blocks) {
            dst.extend_from_slice(&src[..take]);
        }
        done += take;
    }
    Ok(rendered)
}
