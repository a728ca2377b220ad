//! wrender - real-time PCM renderer CLI

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wrender::audio::{
    AudioFormat, ByteOrder, ClipPlayer, EndpointProvider, Feed, RenderSession,
};
use wrender::config::{Args, Command, RenderConfig, SampleEncoding};
use wrender::device::{DeviceWatch, WatchPolicy};
use wrender::health::{HealthConfig, HealthEvent, HealthMonitor};
use wrender::RenderError;

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RenderConfig::load(path)?,
        None => RenderConfig::load_default()?,
    };

    init_logging(&args, &config)?;

    match args.command {
        Command::List { show_ids } => cmd_list(show_ids),
        Command::Play {
            input,
            rate,
            channels,
            encoding,
            big_endian,
            device,
            gain,
            stream,
        } => {
            let format = source_format(rate, channels, encoding, big_endian);
            let options = PlayOptions {
                device: device.or_else(|| config.device().map(str::to_string)),
                gain: gain.unwrap_or(config.gain),
                stream,
            };
            cmd_play(&config, &input, format, options)
        }
        Command::Config { write } => cmd_config(write),
    }
}

fn init_logging(args: &Args, config: &RenderConfig) -> Result<()> {
    // Command line flags win over the configured level
    let level = if args.quiet || args.verbose > 0 {
        args.log_level().to_string()
    } else {
        config.log_level.clone()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = args
        .log
        .clone()
        .or_else(|| (!config.log_file.is_empty()).then(|| config.log_file.clone()));

    if let Some(log_file) = log_file {
        let file = File::create(&log_file)
            .with_context(|| format!("Failed to create log file {}", log_file))?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

fn source_format(rate: u32, channels: u16, encoding: SampleEncoding, big_endian: bool) -> AudioFormat {
    let format = match encoding {
        SampleEncoding::F32 => AudioFormat::float(rate, channels),
        other => AudioFormat::pcm(rate, other.bits(), channels),
    };
    if big_endian {
        format.with_byte_order(ByteOrder::Big)
    } else {
        format
    }
}

#[cfg(windows)]
fn provider() -> Arc<dyn EndpointProvider> {
    Arc::new(wrender::audio::WasapiProvider::new())
}

#[cfg(not(windows))]
fn provider() -> Arc<dyn EndpointProvider> {
    warn!("No audio backend on this platform, rendering into the null sink");
    Arc::new(wrender::audio::mock::MockProvider::new(Vec::new()))
}

/// List available render devices
#[cfg(windows)]
fn cmd_list(show_ids: bool) -> Result<()> {
    let enumerator = wrender::device::DeviceEnumerator::new()?;
    let devices = enumerator.enumerate_devices()?;

    if devices.is_empty() {
        println!("No audio devices found.");
        return Ok(());
    }

    println!("Available render devices:\n");

    for (i, device) in devices.iter().enumerate() {
        println!("  {}. {}", i + 1, device);
        if show_ids {
            println!("     ID: {}", device.id);
        }
    }

    println!();
    Ok(())
}

#[cfg(not(windows))]
fn cmd_list(_show_ids: bool) -> Result<()> {
    println!("Device listing is only available on Windows.");
    Ok(())
}

fn cmd_config(write: Option<std::path::PathBuf>) -> Result<()> {
    let sample = RenderConfig::sample_config();
    match write {
        Some(path) => {
            std::fs::write(&path, sample)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Sample configuration written to {}", path.display());
        }
        None => print!("{}", sample),
    }
    Ok(())
}

struct PlayOptions {
    device: Option<String>,
    gain: f32,
    stream: bool,
}

fn open_input(input: &str) -> Result<Box<dyn Read + Send>> {
    if input == "-" {
        Ok(Box::new(io::stdin()))
    } else {
        let file = File::open(input).with_context(|| format!("Failed to open {}", input))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Play a clip or stream raw PCM until the input ends or Ctrl+C
fn cmd_play(config: &RenderConfig, input: &str, format: AudioFormat, options: PlayOptions) -> Result<()> {
    let provider = provider();
    let follow_default = options.device.is_none() && config.follow_default;
    let device = options.device.or_else(|| provider.default_device());
    let reader = open_input(input)?;

    // Setup Ctrl+C handler
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || {
            println!("\nReceived Ctrl+C, stopping...");
            cancel.store(true, Ordering::SeqCst);
        });
    }

    println!(
        "Playing {} as {} on {}",
        input,
        format,
        device.as_deref().unwrap_or("<null sink>")
    );

    if !options.stream {
        let player = ClipPlayer::new(provider, device)
            .with_session_config(config.to_session_config())
            .with_chunk_bytes(config.clip_chunk_bytes)
            .with_tail(config.clip_tail())
            .with_gain(options.gain);
        let report = player.play(format, reader, &cancel)?;
        println!("Played {} bytes ({:?}).", report.bytes, report.duration);
        return Ok(());
    }

    let session = Arc::new(RenderSession::new(
        provider,
        format,
        device.clone(),
        config.to_session_config(),
    )?);
    session.set_gain(options.gain);
    session.open()?;
    session.start()?;

    let (mut health, health_events) = HealthMonitor::start(HealthConfig::default())?;
    health.watch("stream", session.diagnostics());

    let policy = match (&device, follow_default) {
        (Some(id), false) => WatchPolicy::Fixed(id.clone()),
        _ => WatchPolicy::FollowDefault,
    };
    let (device_tx, device_rx) = unbounded();
    let mut watch = DeviceWatch::spawn(session.clone(), device_rx, policy, Duration::from_millis(100))?;
    #[cfg(windows)]
    let _monitor = wrender::device::DeviceMonitor::new(device_tx)?;
    #[cfg(not(windows))]
    drop(device_tx);

    let result = stream(&session, reader, &cancel, config.clip_chunk_bytes, &health_events);

    watch.stop();
    health.stop();
    session.close()?;

    let bytes = result?;
    println!("Streamed {} bytes.", bytes);
    Ok(())
}

/// Feed the whole input into a started session
fn stream(
    session: &RenderSession,
    mut reader: Box<dyn Read + Send>,
    cancel: &AtomicBool,
    chunk_bytes: usize,
    health_events: &Receiver<HealthEvent>,
) -> Result<u64> {
    let frame_size = session.source_format().frame_size();
    let mut chunk = vec![0u8; (chunk_bytes / frame_size).max(1) * frame_size];
    let mut pending = 0usize;
    let mut total = 0u64;

    while !cancel.load(Ordering::Relaxed) {
        let read = reader.read(&mut chunk[pending..])?;
        if read == 0 {
            break;
        }
        pending += read;
        let whole = pending / frame_size * frame_size;

        let mut offset = 0;
        while offset < whole && !cancel.load(Ordering::Relaxed) {
            report_health(health_events);
            match session.feed(&chunk[offset..whole]) {
                Ok(Feed::Consumed) => offset = whole,
                Ok(Feed::Partial { consumed }) => offset += consumed,
                Err(RenderError::WriteStalled(stalled)) => {
                    warn!("Output stalled for {:?}, reopening device", stalled);
                    if let Err(e) = session.reopen() {
                        error!("Reopen failed: {}", e);
                        return Err(e.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        total += offset as u64;
        // Keep a trailing partial frame for the next read
        chunk.copy_within(whole..pending, 0);
        pending -= whole;
    }

    info!("Input finished after {} bytes", total);
    Ok(total)
}

fn report_health(events: &Receiver<HealthEvent>) {
    for event in events.try_iter() {
        match event {
            HealthEvent::Malfunctioning { device, since, .. } => {
                warn!("Output on {} stalled since {:?}", device, since);
            }
            HealthEvent::Recovered { device, .. } => {
                info!("Output on {} recovered", device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_health_drains_pending_events() {
        let (tx, rx) = unbounded();
        tx.send(HealthEvent::Recovered {
            name: "stream".into(),
            device: "spk".into(),
        })
        .unwrap();
        tx.send(HealthEvent::Malfunctioning {
            name: "stream".into(),
            device: "spk".into(),
            since: std::time::SystemTime::now(),
        })
        .unwrap();

        report_health(&rx);
        assert!(rx.is_empty());
    }
}
