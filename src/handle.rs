//! Handle module: tokens, stable handles and the slot storage behind them.

#![forbid(unsafe_code)]

/// One audio sample.
pub type Sample = f32;

/// Logical time in seconds, supplied by the driver for each tick.
pub type Time = f64;

/// Position token stamped on a process when it is linked into a registry.
///
/// Tokens grow with insertion order and are never reused while a process is
/// linked. They decide which side of a bus a reader sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl Token {
    /// Token of a process that is not linked into any registry.
    pub const DETACHED: Token = Token(0);
    /// Token of the external driver. The driver writes its buses before the
    /// walk, so it orders before every linked process.
    pub const DRIVER: Token = Token(0);
    /// First token a registry hands out.
    pub const FIRST: Token = Token(1);

    /// Whether this token belongs to a linked process.
    pub fn is_attached(self) -> bool {
        self != Token::DETACHED
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Keep the process scheduled.
    Continue,
    /// The process has finished; its owner detaches it after this tick.
    Done,
}

/// Stable handle to a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Stable handle to a bus slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ProcessId {
    /// Slot index of this handle.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl BusId {
    /// Slot index of this handle.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "process#{}v{}", self.index, self.generation)
    }
}

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus#{}v{}", self.index, self.generation)
    }
}

/// Hands out slot indices and generations. A released index comes back with a
/// bumped generation so stale handles never match the new occupant.
#[derive(Debug, Clone, Default)]
pub(crate) struct IdAllocator {
    generations: Vec<u32>,
    free: Vec<u32>,
    limit: Option<usize>,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocator that refuses to grow past `limit` live slots.
    pub(crate) fn bounded(limit: usize) -> Self {
        Self {
            generations: Vec::with_capacity(limit),
            free: Vec::with_capacity(limit),
            limit: Some(limit),
        }
    }

    /// Returns `(index, generation)` of a free slot.
    pub(crate) fn allocate(&mut self) -> Option<(u32, u32)> {
        if let Some(index) = self.free.pop() {
            return Some((index, self.generations[index as usize]));
        }
        if let Some(limit) = self.limit {
            if self.generations.len() >= limit {
                return None;
            }
        }
        let index = u32::try_from(self.generations.len()).ok()?;
        self.generations.push(0);
        Some((index, 0))
    }

    pub(crate) fn release(&mut self, index: u32, generation: u32) {
        let Some(current) = self.generations.get_mut(index as usize) else {
            return;
        };
        if *current != generation {
            return;
        }
        *current = current.wrapping_add(1);
        self.free.push(index);
    }

    pub(crate) fn live(&self) -> usize {
        self.generations.len() - self.free.len()
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: T,
}

/// Index-addressed storage validated by generation.
#[derive(Debug)]
pub(crate) struct SlotVec<T> {
    entries: Vec<Option<Entry<T>>>,
}

impl<T> SlotVec<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self { entries }
    }

    /// Stores `value` at `index`. Grows only when `index` lies beyond the
    /// reserved capacity.
    pub(crate) fn place(&mut self, index: u32, generation: u32, value: T) {
        let index = index as usize;
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }
        self.entries[index] = Some(Entry { generation, value });
    }

    pub(crate) fn get(&self, index: u32, generation: u32) -> Option<&T> {
        match self.entries.get(index as usize) {
            Some(Some(entry)) if entry.generation == generation => Some(&entry.value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        match self.entries.get_mut(index as usize) {
            Some(Some(entry)) if entry.generation == generation => Some(&mut entry.value),
            _ => None,
        }
    }

    /// Access by raw index, for walks that already hold a linked index.
    pub(crate) fn at_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries
            .get_mut(index)
            .and_then(|e| e.as_mut())
            .map(|e| &mut e.value)
    }

    pub(crate) fn at(&self, index: usize) -> Option<&T> {
        self.entries
            .get(index)
            .and_then(|e| e.as_ref())
            .map(|e| &e.value)
    }

    pub(crate) fn generation_at(&self, index: usize) -> Option<u32> {
        self.entries
            .get(index)
            .and_then(|e| e.as_ref())
            .map(|e| e.generation)
    }

    pub(crate) fn take(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self.entries.get_mut(index as usize)?;
        if !matches!(slot, Some(entry) if entry.generation == generation) {
            return None;
        }
        slot.take().map(|e| e.value)
    }

    /// Splits out one slot mutably and leaves every other slot readable.
    pub(crate) fn split_mut(&mut self, index: u32, generation: u32) -> Option<(&mut T, SlotView<'_, T>)> {
        let at = index as usize;
        if at >= self.entries.len() {
            return None;
        }
        let (before, rest) = self.entries.split_at_mut(at);
        let (own, after) = rest.split_first_mut()?;
        match own {
            Some(entry) if entry.generation == generation => Some((
                &mut entry.value,
                SlotView {
                    before,
                    after,
                    split_at: at,
                },
            )),
            _ => None,
        }
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().filter_map(|e| e.as_mut().map(|e| &mut e.value))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.as_ref()
                .map(|entry| (i as u32, entry.generation, &entry.value))
        })
    }
}

/// Read-only view of a `SlotVec` with one slot split out.
#[derive(Debug)]
pub(crate) struct SlotView<'a, T> {
    before: &'a [Option<Entry<T>>],
    after: &'a [Option<Entry<T>>],
    split_at: usize,
}

impl<'a, T> SlotView<'a, T> {
    pub(crate) fn get(&self, index: u32, generation: u32) -> Option<&'a T> {
        let index = index as usize;
        let entry = if index < self.split_at {
            self.before.get(index)
        } else if index > self.split_at {
            self.after.get(index - self.split_at - 1)
        } else {
            None
        };
        match entry {
            Some(Some(entry)) if entry.generation == generation => Some(&entry.value),
            _ => None,
        }
    }
}
