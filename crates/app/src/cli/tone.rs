//! `mixdown tone`: sine sources mixed onto one device

use anyhow::Context;
use clap::Args;
use mixdown_core::{
    AudioBuffer, AudioEnumerator, DeviceId, DeviceRegistry, MixerConfig, MixerUnit, OutputBackend,
};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ToneArgs {
    /// Output device name (default output when omitted)
    #[arg(short, long)]
    device: Option<String>,

    /// Number of sine sources
    #[arg(short, long, default_value_t = 3)]
    sources: usize,

    /// Seconds to play
    #[arg(long, default_value_t = 4.0)]
    seconds: f64,

    /// Switch the device to this sample rate halfway through
    #[arg(long)]
    switch_rate: Option<u32>,

    /// Gain applied to every source
    #[arg(long, default_value_t = 0.5)]
    gain: f32,
}

pub async fn run(
    backend: Arc<dyn OutputBackend>,
    config: MixerConfig,
    args: ToneArgs,
) -> anyhow::Result<()> {
    let device = match &args.device {
        Some(name) => DeviceId::new(name),
        None => backend.default_output_device()?.id,
    };
    let frames = config.buffer_frames as usize;
    let registry = DeviceRegistry::new(Arc::clone(&backend), config);

    // Producers read the rate of the buffers they generate from here.
    let rate = Arc::new(AtomicU32::new(0));
    {
        let rate = Arc::clone(&rate);
        let watched = device.clone();
        registry.subscribe(Arc::new(move |changed: &DeviceId, new_rate: u32| {
            if *changed == watched {
                rate.store(new_rate, Ordering::Release);
            }
        }));
    }

    let running = Arc::new(AtomicBool::new(true));
    let mut sources = Vec::with_capacity(args.sources);
    let mut producers = Vec::with_capacity(args.sources);
    let mut failure = None;
    for index in 0..args.sources {
        let source = registry.new_source(format!("tone-{}", index));
        source.set_gain(args.gain);
        if let Err(e) = source
            .attach_to_device(&registry, &device)
            .with_context(|| format!("attaching {} to {}", source.name(), device))
        {
            failure = Some(e);
            break;
        }
        rate.store(source.sample_rate(), Ordering::Release);

        let frequency = 220.0 * (index + 1) as f32;
        let producer = {
            let source = Arc::clone(&source);
            let rate = Arc::clone(&rate);
            let running = Arc::clone(&running);
            tokio::task::spawn_blocking(move || {
                produce(&source, frequency, frames, &rate, &running)
            })
        };
        sources.push(source);
        producers.push(producer);
    }

    if failure.is_none() {
        info!(%device, sources = sources.len(), "Playing tones");
        if let Err(e) = play(&registry, &device, &args).await {
            failure = Some(e);
        }
    }

    let owners: Vec<Arc<MixerUnit>> = registry
        .devices_in_use()
        .iter()
        .filter_map(|d| registry.owner(d))
        .collect();

    running.store(false, Ordering::Release);
    for source in &sources {
        source.terminate();
    }
    for producer in producers {
        producer.await?;
    }
    let teardown = registry.clone();
    tokio::task::spawn_blocking(move || teardown.teardown()).await?;

    for owner in owners {
        println!(
            "{}: {} Hz, {} underflows",
            owner.device().map(|d| d.to_string()).unwrap_or_default(),
            owner.sample_rate(),
            owner.underflow_count()
        );
    }
    failure.map_or(Ok(()), Err)
}

async fn play(registry: &DeviceRegistry, device: &DeviceId, args: &ToneArgs) -> anyhow::Result<()> {
    let total = Duration::from_secs_f64(args.seconds.max(0.0));
    let interrupted = match args.switch_rate {
        Some(new_rate) => {
            let half = total / 2;
            if wait(half).await {
                true
            } else {
                info!(%device, rate = new_rate, "Switching sample rate");
                registry.set_device_sample_rate(device, new_rate)?;
                wait(total - half).await
            }
        }
        None => wait(total).await,
    };
    if interrupted {
        warn!("Interrupted, stopping early");
    }
    Ok(())
}

/// Sleep for `duration` unless Ctrl-C comes first; true when interrupted
async fn wait(duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = tokio::signal::ctrl_c() => true,
    }
}

/// Push mono sine buffers until stopped. Blocks on the full queue, which
/// paces production to the device.
fn produce(
    source: &MixerUnit,
    frequency: f32,
    frames: usize,
    rate: &AtomicU32,
    running: &AtomicBool,
) {
    let mut phase = 0.0f32;
    while running.load(Ordering::Acquire) && !source.is_terminated() {
        let sample_rate = rate.load(Ordering::Acquire);
        if sample_rate == 0 {
            break;
        }
        let step = TAU * frequency / sample_rate as f32;
        let samples: Vec<f32> = (0..frames)
            .map(|_| {
                let s = phase.sin() * 0.3;
                phase = (phase + step) % TAU;
                s
            })
            .collect();
        source.push(AudioBuffer::new(samples, sample_rate, 1));
    }
}
