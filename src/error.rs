//! Error types for management and driver-boundary operations.

use crate::handle::{BusId, ProcessId};
use thiserror::Error;

/// Errors reported outside the per-process tick path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Configuration rejected by [`crate::config::EngineConfig::validate`].
    #[error("invalid engine config: {0}")]
    InvalidConfig(&'static str),
    /// Every process slot is in use.
    #[error("process limit of {max} reached")]
    ProcessLimit {
        /// Configured maximum.
        max: usize,
    },
    /// Every bus slot is in use.
    #[error("bus limit of {max} reached")]
    BusLimit {
        /// Configured maximum.
        max: usize,
    },
    /// The command queue to the audio thread is full.
    #[error("command queue full")]
    QueueFull,
    /// The handle does not name a live process.
    #[error("unknown process {0}")]
    UnknownProcess(ProcessId),
    /// The handle does not name a live bus.
    #[error("unknown bus {0}")]
    UnknownBus(BusId),
    /// A writer spawned for one bus declared another as its output.
    #[error("writer for {expected} declares output {declared}")]
    ForeignOutputBus {
        /// Bus allocated for the writer.
        expected: BusId,
        /// Bus the process declared.
        declared: BusId,
    },
    /// A channel index beyond the configured channel count.
    #[error("channel {channel} out of range ({channels} channels)")]
    ChannelOutOfRange {
        /// Requested channel.
        channel: usize,
        /// Channels available.
        channels: usize,
    },
    /// The driver passed a different number of channels than configured.
    #[error("expected {expected} channels, got {got}")]
    ChannelCountMismatch {
        /// Configured channel count.
        expected: usize,
        /// Channels supplied.
        got: usize,
    },
    /// The driver passed a block of the wrong length.
    #[error("expected blocks of {expected} frames, got {got}")]
    BlockSizeMismatch {
        /// Configured block size.
        expected: usize,
        /// Frames supplied.
        got: usize,
    },
}
