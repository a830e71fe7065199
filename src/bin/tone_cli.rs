use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;
use tone_engine::audio::{CallbackTrace, FrameTimestamp, MonotonicClock};
use tone_engine::engine::backend::{default_platform, AudioPlatform, SimulatedBackend};
use tone_engine::engine::SimulatedControls;
use tone_engine::{AppConfig, PlaybackEngine};

const REPORT_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "tone_cli", about = "Low-latency tone playback harness")]
struct Cli {
    /// JSON engine configuration (defaults to assets/engine_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play through the engine and print latency reports as JSON lines
    Play {
        #[arg(long, value_enum, default_value_t = BackendKind::Platform)]
        backend: BackendKind,
        /// Output device id (0 = default)
        #[arg(long)]
        device: Option<i32>,
        /// Fixed buffer size in bursts (0 = automatic tuning)
        #[arg(long)]
        bursts: Option<i32>,
        /// Play the test tone
        #[arg(long)]
        tone: bool,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Open a stream and print its properties
    Info {
        #[arg(long, value_enum, default_value_t = BackendKind::Platform)]
        backend: BackendKind,
        #[arg(long)]
        device: Option<i32>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    /// The platform's audio output (Oboe on Android, cpal elsewhere)
    Platform,
    /// In-process stream driven by this tool; no sound is produced
    Simulated,
}

#[derive(Serialize)]
struct Report<'a> {
    elapsed_ms: u128,
    latency_ms: f64,
    buffer_size_in_frames: Option<i32>,
    callbacks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last: Option<&'a CallbackTrace>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    tone_engine::init_logging(if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    });

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path),
        None => load_default_config(),
    };

    match cli.command {
        Commands::Play {
            backend,
            device,
            bursts,
            tone,
            seconds,
        } => {
            if let Some(device) = device {
                config.stream.device_id = device;
            }
            if let Some(bursts) = bursts {
                config.stream.buffer_size_in_bursts = bursts;
            }
            config.tone.enabled |= tone;
            run_play(backend, config, Duration::from_secs(seconds))
        }
        Commands::Info { backend, device } => {
            if let Some(device) = device {
                config.stream.device_id = device;
            }
            run_info(backend, config)
        }
    }
}

#[cfg(not(target_os = "android"))]
fn load_default_config() -> AppConfig {
    AppConfig::load()
}

#[cfg(target_os = "android")]
fn load_default_config() -> AppConfig {
    AppConfig::load_android()
}

fn build_engine(
    backend: BackendKind,
    config: AppConfig,
) -> Result<(PlaybackEngine, Option<SimulatedControls>)> {
    let (platform, controls): (Arc<dyn AudioPlatform>, _) = match backend {
        BackendKind::Platform => (default_platform(&config), None),
        BackendKind::Simulated => {
            let simulated = SimulatedBackend::new();
            let controls = simulated.controls();
            (Arc::new(simulated), Some(controls))
        }
    };
    let engine = PlaybackEngine::with_platform(platform, config).context("creating engine")?;
    Ok((engine, controls))
}

fn run_play(backend: BackendKind, config: AppConfig, duration: Duration) -> Result<ExitCode> {
    let (engine, controls) = build_engine(backend, config)?;
    let mut events = engine.subscribe_events();
    engine.start().context("starting stream")?;

    let started = Instant::now();
    while started.elapsed() < duration {
        match &controls {
            Some(controls) => pump_interval(controls),
            None => std::thread::sleep(REPORT_INTERVAL),
        }

        loop {
            match events.try_recv() {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        let traces = engine.drain_callback_traces();
        let report = Report {
            elapsed_ms: started.elapsed().as_millis(),
            latency_ms: engine.sample_latency(),
            buffer_size_in_frames: engine.stream_info().map(|info| info.buffer_size_in_frames),
            callbacks: traces.len(),
            last: traces.last(),
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    engine.close();
    Ok(ExitCode::from(0))
}

/// Drive the simulated stream for one report interval's worth of frames.
fn pump_interval(controls: &SimulatedControls) {
    const SAMPLE_RATE: u64 = 48_000;
    const FRAMES_PER_CALLBACK: usize = 192;

    let frames = (SAMPLE_RATE * REPORT_INTERVAL.as_millis() as u64 / 1000) as usize;
    let clock = controls.clock();
    let mut pumped = 0;
    while pumped < frames {
        // The frame presented now is one buffer behind the write position
        if let (Some(written), Some(buffered)) = (controls.frames_written(), controls.buffer_size())
        {
            controls.set_timestamp(FrameTimestamp {
                position: written - buffered as i64,
                nanos: clock.now_nanos(),
            });
        }
        if controls.pump(FRAMES_PER_CALLBACK).is_none() {
            break;
        }
        pumped += FRAMES_PER_CALLBACK;
        clock.advance(FRAMES_PER_CALLBACK as i64 * 1_000_000_000 / SAMPLE_RATE as i64);
    }
    std::thread::sleep(REPORT_INTERVAL);
}

fn run_info(backend: BackendKind, config: AppConfig) -> Result<ExitCode> {
    let (engine, _controls) = build_engine(backend, config)?;
    let info = engine.start().context("starting stream")?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    engine.close();
    Ok(ExitCode::from(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_of(args: &[&str]) -> BackendKind {
        match Cli::try_parse_from(args).unwrap().command {
            Commands::Play { backend, .. } | Commands::Info { backend, .. } => backend,
        }
    }

    #[test]
    fn test_backend_defaults_to_platform_output() {
        assert_eq!(backend_of(&["tone_cli", "play"]), BackendKind::Platform);
        assert_eq!(backend_of(&["tone_cli", "info"]), BackendKind::Platform);
    }

    #[test]
    fn test_backend_names_parse() {
        assert_eq!(
            backend_of(&["tone_cli", "play", "--backend", "platform"]),
            BackendKind::Platform
        );
        assert_eq!(
            backend_of(&["tone_cli", "info", "--backend", "simulated"]),
            BackendKind::Simulated
        );
        assert!(Cli::try_parse_from(["tone_cli", "play", "--backend", "cpal"]).is_err());
    }
}
