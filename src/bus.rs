//! Bus module: double-buffered signal blocks with causal read resolution.
//!
//! A bus has one writer and any number of readers. The writer calls
//! [`Bus::advance`] at the start of its handler, which flips the front
//! storage and silences it, then writes the new block into the front.
//! A reader resolves which storage it sees from its own token:
//!
//! - reader token < writer token: the reader must only see the writer's
//!   previous completed block. Once the writer has advanced this tick that is
//!   the storage that is not front; before it has, the front still holds it.
//! - reader token >= writer token: the reader sees the front.
//!
//! Readers ordered after their source get zero blocks of latency, readers
//! ordered before it get exactly one. Feedback loops are broken at a one
//! block delay by the ordering alone. [`Buses::begin_tick`] marks the start of
//! each tick.
//!
//! Lifecycle: `Uninitialized -> Active -> PendingTeardown -> Destroyed`.
//! `Destroyed` is the consumed bus ([`Bus::destroy`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::handle::{BusId, IdAllocator, Sample, SlotVec, SlotView, Token};
use crate::invariant_ppt::{assert_invariant, BUS_ZEROED};

/// Shape of one bus block: `channels` runs of `frames` samples, channel-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusLayout {
    /// Number of channels.
    pub channels: usize,
    /// Samples per channel per block.
    pub frames: usize,
}

impl BusLayout {
    /// Layout with the given channel count and block length.
    pub const fn new(channels: usize, frames: usize) -> Self {
        Self { channels, frames }
    }

    /// Single channel layout.
    pub const fn mono(frames: usize) -> Self {
        Self::new(1, frames)
    }

    /// Total samples in one block.
    pub const fn len(&self) -> usize {
        self.channels * self.frames
    }

    /// Whether a block holds no samples.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle state of a bus that still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Allocated, not yet bound to a writer.
    Uninitialized,
    /// Bound to its writer; advanced, written and read every tick.
    Active,
    /// Writer unlinked; awaiting destruction outside the tick path.
    PendingTeardown,
}

/// Which physical storage a read resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The block most recently completed by the writer.
    Front,
    /// The block before that.
    Back,
}

/// A double-buffered multichannel signal block.
#[derive(Debug)]
pub struct Bus {
    layout: BusLayout,
    storage: [Box<[Sample]>; 2],
    front: usize,
    writer: Token,
    state: BusState,
    advances: u64,
    fresh: bool,
}

impl Bus {
    /// Allocate a zeroed bus with storage A in front and no writer yet.
    pub fn new(layout: BusLayout) -> Self {
        let bus = Self {
            layout,
            storage: [
                vec![0.0; layout.len()].into_boxed_slice(),
                vec![0.0; layout.len()].into_boxed_slice(),
            ],
            front: 0,
            writer: Token::DETACHED,
            state: BusState::Uninitialized,
            advances: 0,
            fresh: false,
        };
        assert_invariant(
            BUS_ZEROED,
            bus.storage.iter().all(|s| s.iter().all(|&x| x == 0.0)),
            "New bus storage must be silent",
            Some("Bus::new"),
        );
        bus
    }

    /// Allocate a bus already bound to `writer`.
    pub fn with_writer(layout: BusLayout, writer: Token) -> Self {
        let mut bus = Self::new(layout);
        bus.bind(writer);
        bus
    }

    /// Fix the writer token. Only the first bind takes effect; the token is
    /// never re-read from the registry afterwards.
    pub fn bind(&mut self, writer: Token) -> bool {
        debug_assert!(
            self.state == BusState::Uninitialized,
            "bus bound twice (state {:?})",
            self.state
        );
        if self.state != BusState::Uninitialized {
            return false;
        }
        self.writer = writer;
        self.state = BusState::Active;
        true
    }

    /// Block shape.
    pub fn layout(&self) -> BusLayout {
        self.layout
    }

    /// Token of the owning writer.
    pub fn writer(&self) -> Token {
        self.writer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BusState {
        self.state
    }

    /// Index (0 or 1) of the storage currently in front.
    pub fn front_index(&self) -> usize {
        self.front
    }

    /// Number of advances since creation.
    pub fn advances(&self) -> u64 {
        self.advances
    }

    /// Flip front and back, then silence the new front.
    ///
    /// Call exactly once per tick, from the writer's handler, before any
    /// write or read of this tick. A second advance before [`Bus::settle`]
    /// would overwrite the block lower-token readers are still owed.
    pub fn advance(&mut self) {
        debug_assert!(
            self.state != BusState::PendingTeardown,
            "advance on a retired bus"
        );
        debug_assert!(!self.fresh, "bus advanced twice in one tick");
        self.front ^= 1;
        self.storage[self.front].fill(0.0);
        self.advances += 1;
        self.fresh = true;
    }

    /// Start a new tick: the writer has not advanced yet.
    pub fn settle(&mut self) {
        self.fresh = false;
    }

    /// Whether the writer has advanced since the last [`Bus::settle`].
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Which storage `reader` should see.
    pub fn resolve(&self, reader: Token) -> Side {
        if reader < self.writer && self.fresh {
            Side::Back
        } else {
            Side::Front
        }
    }

    fn side(&self, side: Side) -> &[Sample] {
        match side {
            Side::Front => &self.storage[self.front],
            Side::Back => &self.storage[self.front ^ 1],
        }
    }

    fn channel_range(&self, channel: usize) -> Option<std::ops::Range<usize>> {
        if channel >= self.layout.channels {
            return None;
        }
        let start = channel * self.layout.frames;
        Some(start..start + self.layout.frames)
    }

    /// The full block `reader` is allowed to see this tick.
    pub fn read(&self, reader: Token) -> &[Sample] {
        debug_assert!(reader.is_attached(), "bus read with a detached token");
        self.side(self.resolve(reader))
    }

    /// One channel of the block `reader` is allowed to see.
    pub fn read_channel(&self, reader: Token, channel: usize) -> Option<&[Sample]> {
        let range = self.channel_range(channel)?;
        Some(&self.read(reader)[range])
    }

    /// The front block, for the driver after the walk has finished.
    pub fn latest(&self) -> &[Sample] {
        self.side(Side::Front)
    }

    /// One channel of the front block.
    pub fn latest_channel(&self, channel: usize) -> Option<&[Sample]> {
        let range = self.channel_range(channel)?;
        Some(&self.latest()[range])
    }

    /// The front block, writable.
    pub fn front_mut(&mut self) -> &mut [Sample] {
        &mut self.storage[self.front]
    }

    /// One channel of the front block, writable.
    pub fn channel_mut(&mut self, channel: usize) -> Option<&mut [Sample]> {
        let range = self.channel_range(channel)?;
        Some(&mut self.storage[self.front][range])
    }

    /// Write one sample into the front block. Out of range writes are dropped.
    pub fn write(&mut self, channel: usize, frame: usize, sample: Sample) {
        debug_assert!(frame < self.layout.frames, "frame {frame} out of range");
        if frame >= self.layout.frames {
            return;
        }
        if let Some(ch) = self.channel_mut(channel) {
            ch[frame] = sample;
        }
    }

    /// Copy `src` into one channel of the front block.
    pub fn write_channel(&mut self, channel: usize, src: &[Sample]) {
        if let Some(ch) = self.channel_mut(channel) {
            let n = ch.len().min(src.len());
            ch[..n].copy_from_slice(&src[..n]);
        }
    }

    /// Add `src` onto one channel of the front block.
    pub fn mix_channel(&mut self, channel: usize, src: &[Sample]) {
        if let Some(ch) = self.channel_mut(channel) {
            for (o, &s) in ch.iter_mut().zip(src) {
                *o += s;
            }
        }
    }

    /// Mark the bus as awaiting destruction.
    pub fn retire(&mut self) {
        self.state = BusState::PendingTeardown;
    }

    /// Release the storage. Only valid once retired.
    pub fn destroy(self) {
        debug_assert!(
            self.state == BusState::PendingTeardown,
            "bus destroyed while {:?}",
            self.state
        );
        drop(self);
    }
}

/// Arena of buses keyed by [`BusId`].
#[derive(Debug)]
pub struct Buses {
    slots: SlotVec<Bus>,
    ids: IdAllocator,
}

impl Buses {
    /// Empty bus set.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Empty bus set with `capacity` slots reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotVec::with_capacity(capacity),
            ids: IdAllocator::new(),
        }
    }

    /// Allocate an unbound bus.
    pub fn create(&mut self, layout: BusLayout) -> Option<BusId> {
        self.insert(Bus::new(layout))
    }

    /// Store an existing bus. Returns `None` once every slot index is in use.
    pub fn insert(&mut self, bus: Bus) -> Option<BusId> {
        let (index, generation) = self.ids.allocate()?;
        self.slots.place(index, generation, bus);
        Some(BusId { index, generation })
    }

    /// Store a bus under an id allocated elsewhere.
    pub(crate) fn place(&mut self, id: BusId, bus: Bus) {
        self.slots.place(id.index, id.generation, bus);
    }

    /// Fix the writer token of an unbound bus.
    pub fn bind(&mut self, id: BusId, writer: Token) -> bool {
        self.get_mut(id).map(|bus| bus.bind(writer)).unwrap_or(false)
    }

    /// Look up a bus.
    pub fn get(&self, id: BusId) -> Option<&Bus> {
        self.slots.get(id.index, id.generation)
    }

    /// Look up a bus mutably.
    pub fn get_mut(&mut self, id: BusId) -> Option<&mut Bus> {
        self.slots.get_mut(id.index, id.generation)
    }

    /// Resolve a read of `id` on behalf of `reader`.
    pub fn read(&self, id: BusId, reader: Token) -> Option<&[Sample]> {
        self.get(id).map(|bus| bus.read(reader))
    }

    /// Unlink a bus from the set and retire it. The caller destroys it.
    pub fn remove(&mut self, id: BusId) -> Option<Bus> {
        let mut bus = self.take(id)?;
        bus.retire();
        self.ids.release(id.index, id.generation);
        Some(bus)
    }

    /// Like `remove`, but leaves the id with whoever allocated it.
    pub(crate) fn take(&mut self, id: BusId) -> Option<Bus> {
        let mut bus = self.slots.take(id.index, id.generation)?;
        bus.retire();
        Some(bus)
    }

    /// Mark the start of a tick on every bus.
    pub fn begin_tick(&mut self) {
        for bus in self.slots.values_mut() {
            bus.settle();
        }
    }

    /// Borrow bus `id` mutably alongside a read view of every other bus.
    pub fn split_mut(&mut self, id: BusId, reader: Token) -> Option<(&mut Bus, BusView<'_>)> {
        let (bus, slots) = self.slots.split_mut(id.index, id.generation)?;
        Some((bus, BusView { slots, reader }))
    }

    /// Number of stored buses.
    pub fn len(&self) -> usize {
        self.slots.iter().count()
    }

    /// Whether the set holds no buses.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every stored bus.
    pub fn ids(&self) -> impl Iterator<Item = BusId> + '_ {
        self.slots
            .iter()
            .map(|(index, generation, _)| BusId { index, generation })
    }
}

impl Default for Buses {
    fn default() -> Self {
        Self::new()
    }
}

/// Read access to every bus except the one split out for writing.
#[derive(Debug)]
pub struct BusView<'a> {
    slots: SlotView<'a, Bus>,
    reader: Token,
}

impl<'a> BusView<'a> {
    /// Resolve a read of `id` for the reader that owns this view.
    pub fn read(&self, id: BusId) -> Option<&'a [Sample]> {
        self.slots
            .get(id.index, id.generation)
            .map(|bus| bus.read(self.reader))
    }

    /// Resolve a read of one channel of `id`.
    pub fn read_channel(&self, id: BusId, channel: usize) -> Option<&'a [Sample]> {
        self.slots
            .get(id.index, id.generation)
            .and_then(|bus| bus.read_channel(self.reader, channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(bus: &mut Bus, value: Sample) {
        bus.front_mut().fill(value);
    }

    #[test]
    fn new_bus_is_silent_with_a_in_front() {
        let bus = Bus::new(BusLayout::new(2, 8));
        assert_eq!(bus.front_index(), 0);
        assert_eq!(bus.state(), BusState::Uninitialized);
        assert_eq!(bus.latest().len(), 16);
        assert!(bus.latest().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn advance_flips_and_silences() {
        let mut bus = Bus::with_writer(BusLayout::mono(4), Token(5));
        bus.advance();
        fill(&mut bus, 1.0);
        assert_eq!(bus.front_index(), 1);
        bus.settle();
        bus.advance();
        assert_eq!(bus.front_index(), 0);
        assert!(bus.latest().iter().all(|&x| x == 0.0));
        assert_eq!(bus.read(Token(3)), &[1.0; 4]);
        assert_eq!(bus.advances(), 2);
    }

    #[test]
    fn earlier_reader_sees_previous_block() {
        let mut bus = Bus::with_writer(BusLayout::mono(4), Token(5));
        bus.advance();
        fill(&mut bus, 1.0);
        // tick 1: reader before writer sees the zero block
        assert_eq!(bus.resolve(Token(3)), Side::Back);
        assert_eq!(bus.read(Token(3)), &[0.0; 4]);
        bus.settle();
        bus.advance();
        fill(&mut bus, 2.0);
        assert_eq!(bus.read(Token(3)), &[1.0; 4]);
    }

    #[test]
    fn earlier_reader_before_advance_sees_front() {
        let mut bus = Bus::with_writer(BusLayout::mono(2), Token(5));
        bus.advance();
        fill(&mut bus, 1.0);
        assert!(bus.is_fresh());
        bus.settle();
        assert!(!bus.is_fresh());
        // next tick, writer has not run yet: front is still the last block
        assert_eq!(bus.resolve(Token(3)), Side::Front);
        assert_eq!(bus.read(Token(3)), &[1.0, 1.0]);
        bus.advance();
        fill(&mut bus, 2.0);
        assert_eq!(bus.read(Token(3)), &[1.0, 1.0]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "bus advanced twice in one tick")]
    fn second_advance_in_one_tick_is_caught() {
        let mut bus = Bus::with_writer(BusLayout::mono(2), Token(5));
        bus.advance();
        fill(&mut bus, 1.0);
        bus.advance();
    }

    #[test]
    fn begin_tick_settles_every_bus() {
        let mut buses = Buses::new();
        let a = buses.insert(Bus::with_writer(BusLayout::mono(2), Token(1))).unwrap();
        let b = buses.insert(Bus::with_writer(BusLayout::mono(2), Token(2))).unwrap();
        for id in [a, b] {
            buses.get_mut(id).unwrap().advance();
        }
        let mut ids: Vec<_> = buses.ids().collect();
        ids.sort_by_key(|id| id.index());
        assert_eq!(ids, vec![a, b]);
        assert!(ids.iter().all(|&id| buses.get(id).unwrap().is_fresh()));

        buses.begin_tick();
        assert!(ids.iter().all(|&id| !buses.get(id).unwrap().is_fresh()));
        // both may advance again
        for id in ids {
            buses.get_mut(id).unwrap().advance();
        }
    }

    #[test]
    fn later_reader_sees_current_block() {
        let mut bus = Bus::with_writer(BusLayout::mono(4), Token(5));
        bus.advance();
        fill(&mut bus, 1.0);
        assert_eq!(bus.resolve(Token(8)), Side::Front);
        assert_eq!(bus.read(Token(8)), &[1.0; 4]);
    }

    #[test]
    fn writer_reads_its_own_front() {
        let mut bus = Bus::with_writer(BusLayout::mono(2), Token(5));
        bus.advance();
        fill(&mut bus, 0.5);
        assert_eq!(bus.read(Token(5)), &[0.5, 0.5]);
    }

    #[test]
    fn channel_writes_stay_in_their_channel() {
        let mut bus = Bus::with_writer(BusLayout::new(2, 3), Token(1));
        bus.advance();
        bus.write_channel(1, &[1.0, 2.0, 3.0]);
        bus.write(0, 2, 9.0);
        bus.mix_channel(1, &[1.0, 1.0, 1.0]);
        assert_eq!(bus.latest_channel(0).unwrap(), &[0.0, 0.0, 9.0]);
        assert_eq!(bus.latest_channel(1).unwrap(), &[2.0, 3.0, 4.0]);
        assert!(bus.latest_channel(2).is_none());
    }

    #[test]
    fn bind_only_once() {
        let mut buses = Buses::new();
        let id = buses.create(BusLayout::mono(4)).unwrap();
        assert!(buses.bind(id, Token(2)));
        assert_eq!(buses.get(id).unwrap().state(), BusState::Active);
        assert_eq!(buses.get(id).unwrap().writer(), Token(2));
    }

    #[test]
    fn insert_reports_exhausted_slots() {
        let mut buses = Buses {
            ids: IdAllocator::bounded(1),
            ..Buses::new()
        };
        assert!(buses.create(BusLayout::mono(4)).is_some());
        assert!(buses.create(BusLayout::mono(4)).is_none());
        assert!(buses.insert(Bus::new(BusLayout::mono(4))).is_none());
    }

    #[test]
    fn remove_retires_and_invalidates_id() {
        let mut buses = Buses::new();
        let id = buses.create(BusLayout::mono(4)).unwrap();
        buses.bind(id, Token(1));
        let bus = buses.remove(id).unwrap();
        assert_eq!(bus.state(), BusState::PendingTeardown);
        assert!(buses.get(id).is_none());
        let reused = buses.create(BusLayout::mono(4)).unwrap();
        assert_eq!(reused.index(), id.index());
        assert!(buses.get(id).is_none());
        bus.destroy();
    }

    #[test]
    fn split_reads_others_and_writes_own() {
        let mut buses = Buses::new();
        let src = buses.insert(Bus::with_writer(BusLayout::mono(2), Token(1))).unwrap();
        let dst = buses.insert(Bus::with_writer(BusLayout::mono(2), Token(2))).unwrap();
        buses.get_mut(src).unwrap().advance();
        buses.get_mut(src).unwrap().front_mut().fill(3.0);

        let (own, view) = buses.split_mut(dst, Token(2)).unwrap();
        own.advance();
        let input = view.read(src).unwrap();
        own.write_channel(0, input);
        assert!(view.read(dst).is_none());

        assert_eq!(buses.read(dst, Token(3)).unwrap(), &[3.0, 3.0]);
    }
}
