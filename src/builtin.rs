//! Built-in processes: a sine source, a gain stage and a mixer.

#![forbid(unsafe_code)]

use crate::handle::{BusId, Sample, Status};
use crate::process::{Process, TickContext};

/// Writes a sine wave to every channel of its bus.
#[derive(Debug, Clone)]
pub struct Sine {
    bus: BusId,
    freq: f32,
    sample_rate: f32,
    phase: f32,
}

impl Sine {
    /// Sine at `freq` Hz writing into `bus`.
    pub fn new(bus: BusId, freq: f32, sample_rate: f32) -> Self {
        Self {
            bus,
            freq,
            sample_rate,
            phase: 0.0,
        }
    }
}

impl Process for Sine {
    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Status {
        let Some(bus) = ctx.bus_mut(self.bus) else {
            return Status::Continue;
        };
        bus.advance();
        let layout = bus.layout();
        let step = 2.0 * std::f32::consts::PI * self.freq / self.sample_rate;
        let start = self.phase;
        for channel in 0..layout.channels {
            if let Some(out) = bus.channel_mut(channel) {
                let mut phase = start;
                for sample in out.iter_mut() {
                    *sample = phase.sin();
                    phase += step;
                }
            }
        }
        self.phase = (start + step * layout.frames as f32) % (2.0 * std::f32::consts::PI);
        Status::Continue
    }

    fn name(&self) -> &'static str {
        "sine"
    }

    fn output_bus(&self) -> Option<BusId> {
        Some(self.bus)
    }
}

/// Reads one bus, scales it, and writes the result to its own bus.
#[derive(Debug, Clone)]
pub struct Gain {
    input: BusId,
    output: BusId,
    gain: Sample,
}

impl Gain {
    /// Gain stage from `input` to `output`.
    pub fn new(input: BusId, output: BusId, gain: Sample) -> Self {
        Self {
            input,
            output,
            gain,
        }
    }
}

impl Process for Gain {
    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Status {
        let Some((out, view)) = ctx.split(self.output) else {
            return Status::Continue;
        };
        out.advance();
        if let Some(input) = view.read(self.input) {
            for (o, &i) in out.front_mut().iter_mut().zip(input) {
                *o = i * self.gain;
            }
        }
        Status::Continue
    }

    fn name(&self) -> &'static str {
        "gain"
    }

    fn output_bus(&self) -> Option<BusId> {
        Some(self.output)
    }
}

/// Sums several buses into its own bus.
#[derive(Debug, Clone)]
pub struct Mix {
    inputs: Vec<BusId>,
    output: BusId,
}

impl Mix {
    /// Mixer over `inputs` writing to `output`.
    pub fn new(inputs: Vec<BusId>, output: BusId) -> Self {
        Self { inputs, output }
    }
}

impl Process for Mix {
    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Status {
        let Some((out, view)) = ctx.split(self.output) else {
            return Status::Continue;
        };
        out.advance();
        let front = out.front_mut();
        for &id in &self.inputs {
            if let Some(input) = view.read(id) {
                for (o, &i) in front.iter_mut().zip(input) {
                    *o += i;
                }
            }
        }
        Status::Continue
    }

    fn name(&self) -> &'static str {
        "mix"
    }

    fn output_bus(&self) -> Option<BusId> {
        Some(self.output)
    }
}
