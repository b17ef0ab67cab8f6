//! RT-safe invariant signaling for the tick path.
//!
//! - **Tier 1 (RT-safe)**: the engine pushes invariant IDs into a lock-free
//!   SPSC queue from the audio thread.
//! - **Tier 2 (Non-RT)**: the controller drains them and contract tests judge
//!   them on the main thread.
//!
//! RT code **signals facts**. Non-RT code **judges correctness**.
//!
//! Signaling never allocates, locks or panics. A full queue drops the signal.

use rtrb::{Consumer, Producer, RingBuffer};

// ============================================================================
// RT-Safe Invariant IDs (Tier 1)
// ============================================================================

/// A queued management command was applied between walks.
pub const INV_COMMAND_APPLIED: u8 = 1;

/// Driver input was copied into the input bus before the walk.
pub const INV_INPUT_DELIVERED: u8 = 2;

/// A full walk over the registry completed.
pub const INV_BLOCK_COMPLETE: u8 = 3;

/// A process reported `Done` and was detached after the walk.
pub const INV_PROCESS_FINISHED: u8 = 4;

/// A detached process or retired bus was handed to the main thread.
pub const INV_TEARDOWN_DEFERRED: u8 = 5;

/// A routed bus channel was copied to the driver output.
pub const INV_OUTPUT_ROUTED: u8 = 6;

// ============================================================================
// Invariant Signal Queue
// ============================================================================

/// Capacity for invariant signal queue.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Creates a new invariant signal queue pair.
///
/// Returns (producer for RT, consumer for main thread).
pub fn new_invariant_queue() -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Signals an invariant from the RT path; dropped if the queue is full.
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

// ============================================================================
// Non-RT Verification (Tier 2)
// ============================================================================

/// Drains all pending invariant signals from the queue.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Contract verification: asserts that required invariants were signaled.
///
/// # Panics
/// Panics if any required invariant was not signaled at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();

    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            signals.iter().map(|&id| invariant_name(id)).collect();
        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_COMMAND_APPLIED => "COMMAND_APPLIED",
        INV_INPUT_DELIVERED => "INPUT_DELIVERED",
        INV_BLOCK_COMPLETE => "BLOCK_COMPLETE",
        INV_PROCESS_FINISHED => "PROCESS_FINISHED",
        INV_TEARDOWN_DEFERRED => "TEARDOWN_DEFERRED",
        INV_OUTPUT_ROUTED => "OUTPUT_ROUTED",
        _ => "UNKNOWN",
    }
}
