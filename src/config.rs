//! Engine configuration.

use crate::error::EngineError;
use crate::handle::Time;
use crate::invariant_ppt::{assert_invariant, CONFIG_VALID};

/// Fixed parameters of an engine, chosen before the first block.
///
/// Channel counts and block size are not renegotiated mid-stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Samples per second.
    pub sample_rate: f64,
    /// Frames per block. Should be a power of two.
    pub block_size: usize,
    /// Driver input channels, exposed through the input bus.
    pub input_channels: usize,
    /// Driver output channels.
    pub output_channels: usize,
    /// Process slots reserved up front.
    pub max_processes: usize,
    /// Bus slots reserved up front, including the input bus.
    pub max_buses: usize,
    /// Capacity of the command queue to the audio thread. Also bounds how
    /// many stamped commands the engine holds back until they are due.
    pub command_capacity: usize,
    /// Capacity of the garbage queue back to the main thread. `None` sizes it
    /// to `max_processes + max_buses`, which never fills.
    pub garbage_capacity: Option<usize>,
    /// Seconds the controller schedules ahead of the audio clock.
    pub latency: Time,
}

/// Capacity of the command queue when not configured.
pub const DEFAULT_COMMAND_CAPACITY: usize = 256;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            block_size: 64,
            input_channels: 2,
            output_channels: 2,
            max_processes: 256,
            max_buses: 256,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            garbage_capacity: None,
            latency: 0.0,
        }
    }
}

impl EngineConfig {
    /// Builder-style block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Builder-style sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Builder-style channel counts.
    pub fn with_channels(mut self, inputs: usize, outputs: usize) -> Self {
        self.input_channels = inputs;
        self.output_channels = outputs;
        self
    }

    /// Builder-style slot limits.
    pub fn with_limits(mut self, max_processes: usize, max_buses: usize) -> Self {
        self.max_processes = max_processes;
        self.max_buses = max_buses;
        self
    }

    /// Builder-style scheduling latency, in seconds.
    pub fn with_latency(mut self, latency: Time) -> Self {
        self.latency = latency;
        self
    }

    /// Builder-style garbage queue capacity.
    pub fn with_garbage_capacity(mut self, capacity: usize) -> Self {
        self.garbage_capacity = Some(capacity);
        self
    }

    /// Slots in the garbage queue.
    pub fn garbage_slots(&self) -> usize {
        self.garbage_capacity
            .unwrap_or(self.max_processes + self.max_buses)
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(EngineError::InvalidConfig("sample rate must be positive"));
        }
        if self.block_size == 0 {
            return Err(EngineError::InvalidConfig("block size must be non-zero"));
        }
        if self.max_processes == 0 {
            return Err(EngineError::InvalidConfig("max_processes must be non-zero"));
        }
        // One slot is taken by the input bus.
        if self.max_buses < 2 {
            return Err(EngineError::InvalidConfig("max_buses must be at least 2"));
        }
        if self.command_capacity == 0 {
            return Err(EngineError::InvalidConfig("command capacity must be non-zero"));
        }
        if self.garbage_capacity == Some(0) {
            return Err(EngineError::InvalidConfig("garbage capacity must be non-zero"));
        }
        check_latency(self.latency)?;
        if !self.block_size.is_power_of_two() {
            tracing::warn!(block_size = self.block_size, "block size is not a power of two");
        }
        assert_invariant(CONFIG_VALID, true, "Engine config validated", Some("validate"));
        Ok(())
    }

    /// Duration of one block in seconds.
    pub fn block_duration(&self) -> f64 {
        self.block_size as f64 / self.sample_rate
    }

    /// `seconds` rounded to whole samples at this rate.
    pub fn samples(&self, seconds: Time) -> u64 {
        (seconds * self.sample_rate).round() as u64
    }
}

/// Latency must be a finite, non-negative number of seconds.
pub(crate) fn check_latency(latency: Time) -> Result<(), EngineError> {
    if !(latency.is_finite() && latency >= 0.0) {
        return Err(EngineError::InvalidConfig("latency must be finite and non-negative"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 64);
        assert!((config.block_duration() - 64.0 / 44100.0).abs() < 1e-12);
    }

    #[test]
    fn zero_block_size_rejected() {
        let config = EngineConfig::default().with_block_size(0);
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn bad_sample_rate_rejected() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = EngineConfig::default().with_sample_rate(rate);
            assert!(config.validate().is_err(), "rate {rate} accepted");
        }
    }

    #[test]
    fn odd_block_size_is_allowed() {
        let config = EngineConfig::default().with_block_size(100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn latency_must_be_finite_and_non_negative() {
        for latency in [-0.01, f64::NAN, f64::INFINITY] {
            let config = EngineConfig::default().with_latency(latency);
            assert!(config.validate().is_err(), "latency {latency} accepted");
        }
        let config = EngineConfig::default().with_latency(0.05);
        assert!(config.validate().is_ok());
        assert_eq!(config.samples(config.latency), 2205);
    }

    #[test]
    fn garbage_queue_defaults_to_every_slot() {
        let config = EngineConfig::default().with_limits(8, 4);
        assert_eq!(config.garbage_slots(), 12);
        assert_eq!(config.clone().with_garbage_capacity(1).garbage_slots(), 1);
        assert!(config.with_garbage_capacity(0).validate().is_err());
    }

    #[test]
    fn bus_limit_must_leave_room_for_input() {
        let config = EngineConfig::default().with_limits(4, 1);
        assert!(config.validate().is_err());
    }
}
