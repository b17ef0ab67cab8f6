// demos/offline_wav.rs
use causalbus::builtin::{Gain, Mix, Sine};
use causalbus::engine::{new, render_offline};
use causalbus::{from_fn, BusLayout, EngineConfig, Placement, Status};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let sample_rate = 44100.0;
    let config = EngineConfig::default()
        .with_sample_rate(sample_rate)
        .with_block_size(512)
        .with_channels(0, 2);
    let (mut ctl, mut engine) = new(config)?;
    let layout = BusLayout::mono(512);

    // A 440 Hz and a 660 Hz tone, mixed and attenuated.
    let (_, low) = ctl.spawn_writer(layout, Placement::Back, |bus| {
        Sine::new(bus, 440.0, sample_rate as f32)
    })?;
    let (_, high) = ctl.spawn_writer(layout, Placement::Back, |bus| {
        Sine::new(bus, 660.0, sample_rate as f32)
    })?;
    let (_, sum) = ctl.spawn_writer(layout, Placement::Back, |bus| Mix::new(vec![low, high], bus))?;
    let (_, master) = ctl.spawn_writer(layout, Placement::Back, |bus| Gain::new(sum, bus, 0.4))?;
    ctl.route_output(0, master, 0)?;
    ctl.route_output(1, low, 0)?;

    // Retires itself after half a second.
    let mut blocks = (sample_rate / 2.0 / 512.0) as usize;
    ctl.spawn(
        from_fn(move |_| {
            blocks = blocks.saturating_sub(1);
            if blocks == 0 {
                Status::Done
            } else {
                Status::Continue
            }
        })
        .named("timer"),
    )?;

    let rendered = render_offline(&mut engine, sample_rate as usize)?;
    tracing::info!(collected = ctl.collect_garbage(), "render finished");

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: sample_rate as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create("offline.wav", spec)?;
    for (&left, &right) in rendered[0].iter().zip(&rendered[1]) {
        writer.write_sample((left * 32767.0) as i16)?;
        writer.write_sample((right * 32767.0) as i16)?;
    }
    writer.finalize()?;

    println!("Generated offline.wav: mixed tones on the left, 440 Hz on the right");
    Ok(())
}
