//! Registry module: execution order and position tokens.
//!
//! Processes live in an index-addressed arena; the order is a singly linked
//! chain of slot indices from `head` to `tail`. Every link operation stamps
//! the process with the next token from a monotonically increasing counter,
//! whether it goes to the back (`append`) or the front (`prepend`). Tokens
//! therefore follow insertion order, not list position. A prepended process
//! runs first yet carries the latest token, and bus reads compare tokens.
//!
//! Unlinking and destruction are separate steps: `remove` only clears the
//! linkage and hands back a [`Detached`] proof; `destroy` consumes that proof.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::bus::Buses;
use crate::handle::{IdAllocator, ProcessId, SlotVec, Status, Time, Token};
use crate::process::{Process, TickContext};

struct Slot {
    process: Box<dyn Process>,
    token: Token,
    next: Option<usize>,
    linked: bool,
}

/// Proof that a process has been unlinked. Consumed by [`Registry::destroy`].
#[must_use = "a detached process keeps its resources until destroyed"]
#[derive(Debug, PartialEq, Eq)]
pub struct Detached(ProcessId);

impl Detached {
    /// Handle of the detached process.
    pub fn id(&self) -> ProcessId {
        self.0
    }
}

/// Ordered list of processes ticked once per block.
pub struct Registry {
    slots: SlotVec<Slot>,
    ids: IdAllocator,
    head: Option<usize>,
    tail: Option<usize>,
    next_token: u64,
    len: usize,
    finished: Vec<ProcessId>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("next_token", &self.next_token)
            .field("len", &self.len)
            .finish()
    }
}

impl Registry {
    /// Empty registry; the first linked process gets [`Token::FIRST`].
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Empty registry with room for `capacity` processes without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotVec::with_capacity(capacity),
            ids: IdAllocator::new(),
            head: None,
            tail: None,
            next_token: Token::FIRST.0,
            len: 0,
            finished: Vec::with_capacity(capacity),
        }
    }

    /// Store a process, detached. Link it with `append` or `prepend`.
    ///
    /// Returns `None` once every slot index is in use.
    pub fn insert(&mut self, process: Box<dyn Process>) -> Option<ProcessId> {
        let (index, generation) = self.ids.allocate()?;
        let id = ProcessId { index, generation };
        self.place(id, process);
        Some(id)
    }

    /// Store a process under an id allocated elsewhere.
    pub(crate) fn place(&mut self, id: ProcessId, process: Box<dyn Process>) {
        self.slots.place(
            id.index,
            id.generation,
            Slot {
                process,
                token: Token::DETACHED,
                next: None,
                linked: false,
            },
        );
        // Every slot can finish at most once per tick.
        let needed = id.index() + 1;
        if self.finished.capacity() < needed {
            self.finished.reserve(needed - self.finished.len());
        }
    }

    fn stamp(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Check the slot exists and is free to link. Returns its index.
    fn linkable(&self, id: ProcessId) -> Option<usize> {
        let slot = self.slots.get(id.index, id.generation)?;
        debug_assert!(!slot.linked, "{id} linked twice");
        if slot.linked {
            return None;
        }
        Some(id.index())
    }

    /// Link `id` after the current last element. Returns its new token.
    pub fn append(&mut self, id: ProcessId) -> Option<Token> {
        let index = self.linkable(id)?;
        let token = self.stamp();
        if let Some(slot) = self.slots.at_mut(index) {
            slot.token = token;
            slot.next = None;
            slot.linked = true;
        }
        match self.tail {
            Some(tail) => {
                if let Some(last) = self.slots.at_mut(tail) {
                    last.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        Some(token)
    }

    /// Link `id` before the current first element. Returns its new token,
    /// which is still the latest token handed out.
    pub fn prepend(&mut self, id: ProcessId) -> Option<Token> {
        let index = self.linkable(id)?;
        let token = self.stamp();
        let old_head = self.head;
        if let Some(slot) = self.slots.at_mut(index) {
            slot.token = token;
            slot.next = old_head;
            slot.linked = true;
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
        self.len += 1;
        Some(token)
    }

    /// Unlink `id` wherever it sits. Scans from the head.
    ///
    /// A process that is not linked just has its token cleared and `None` is
    /// returned; the list is left untouched.
    pub fn remove(&mut self, id: ProcessId) -> Option<Detached> {
        let target = id.index();
        if self.slots.get(id.index, id.generation).is_none() {
            return None;
        }

        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            if index == target {
                break;
            }
            prev = Some(index);
            cursor = self.slots.at(index).and_then(|s| s.next);
        }

        let Some(found) = cursor else {
            if let Some(slot) = self.slots.get_mut(id.index, id.generation) {
                slot.token = Token::DETACHED;
            }
            return None;
        };

        let next = self.slots.at(found).and_then(|s| s.next);
        match prev {
            Some(p) => {
                if let Some(before) = self.slots.at_mut(p) {
                    before.next = next;
                }
            }
            None => self.head = next,
        }
        if self.tail == Some(found) {
            self.tail = prev;
        }
        if let Some(slot) = self.slots.at_mut(found) {
            slot.next = None;
            slot.token = Token::DETACHED;
            slot.linked = false;
        }
        self.len -= 1;
        Some(Detached(id))
    }

    /// Invoke every linked process in list order.
    ///
    /// Processes that return [`Status::Done`] stay linked; collect them with
    /// [`Registry::pop_finished`].
    pub fn tick(&mut self, time: Time, buses: &mut Buses) {
        self.finished.clear();
        buses.begin_tick();
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let generation = self.slots.generation_at(index);
            let Some(slot) = self.slots.at_mut(index) else {
                break;
            };
            let mut ctx = TickContext::new(time, slot.token, buses);
            if slot.process.tick(&mut ctx) == Status::Done {
                if let Some(generation) = generation {
                    // Within reserved capacity: one entry per slot at most.
                    self.finished.push(ProcessId {
                        index: index as u32,
                        generation,
                    });
                }
            }
            cursor = slot.next;
        }
    }

    /// Processes that reported [`Status::Done`] during the last tick.
    pub fn finished(&self) -> &[ProcessId] {
        &self.finished
    }

    /// Pop one finished process, latest first.
    pub fn pop_finished(&mut self) -> Option<ProcessId> {
        self.finished.pop()
    }

    /// Run the process's teardown and free its slot.
    pub fn destroy(&mut self, detached: Detached) {
        if let Some(mut process) = self.take(detached) {
            process.teardown();
        }
    }

    /// Move a detached process out of its slot without tearing it down.
    pub(crate) fn take(&mut self, detached: Detached) -> Option<Box<dyn Process>> {
        let id = detached.0;
        let slot = self.slots.take(id.index, id.generation)?;
        debug_assert!(!slot.linked, "{id} taken while linked");
        self.ids.release(id.index, id.generation);
        Some(slot.process)
    }

    /// Current token of `id`; [`Token::DETACHED`] if unlinked or unknown.
    pub fn token(&self, id: ProcessId) -> Token {
        self.slots
            .get(id.index, id.generation)
            .map(|s| s.token)
            .unwrap_or(Token::DETACHED)
    }

    /// Whether `id` is currently linked.
    pub fn is_linked(&self, id: ProcessId) -> bool {
        self.slots
            .get(id.index, id.generation)
            .is_some_and(|s| s.linked)
    }

    /// Whether `id` names a stored process, linked or not.
    pub fn contains(&self, id: ProcessId) -> bool {
        self.slots.get(id.index, id.generation).is_some()
    }

    /// Borrow a stored process.
    pub fn get(&self, id: ProcessId) -> Option<&dyn Process> {
        self.slots
            .get(id.index, id.generation)
            .map(|s| s.process.as_ref())
    }

    /// Linked processes in execution order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            registry: self,
            cursor: self.head,
        }
    }

    /// Number of linked processes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no process is linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The token the next link operation will hand out.
    pub fn next_token(&self) -> Token {
        Token(self.next_token)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks a registry in execution order.
pub struct Iter<'a> {
    registry: &'a Registry,
    cursor: Option<usize>,
}

impl Iterator for Iter<'_> {
    type Item = (ProcessId, Token);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slots = &self.registry.slots;
        let slot = slots.at(index)?;
        let generation = slots.generation_at(index)?;
        self.cursor = slot.next;
        Some((
            ProcessId {
                index: index as u32,
                generation,
            },
            slot.token,
        ))
    }
}
