use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use jiff::Zoned;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use voice_activity::analysis::{self, AnalysisReport};
use voice_activity::audio::{WavFileAnalyzer, list_devices};
use voice_activity::config::default_config_path;
use voice_activity::{
    DetectorCallbacks, DetectorConfig, DetectorController, DetectorError, MicrophoneSource,
    logging,
};

#[derive(Parser)]
#[command(name = "voice-activity")]
#[command(about = "Detect when a speaker starts and stops talking")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen to a microphone and print speech events
    Listen {
        /// Input device name (default device if omitted)
        #[arg(long)]
        device: Option<String>,

        #[command(flatten)]
        tuning: Tuning,

        /// Stop after this many seconds (0 = until Ctrl-C)
        #[arg(long, default_value = "0")]
        duration: u64,

        /// Print the noise level on every tick
        #[arg(long)]
        show_levels: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Detect speech segments in a WAV file
    Analyze {
        file: PathBuf,

        #[command(flatten)]
        tuning: Tuning,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List available audio recording devices
    Devices {
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the effective detector configuration
    Config {
        /// Print the config file path instead
        #[arg(long)]
        path: bool,
    },
}

#[derive(clap::Args)]
struct Tuning {
    /// Analyzer noise floor in dB
    #[arg(long, allow_hyphen_values = true)]
    min_decibels: Option<f32>,

    /// Silence in milliseconds before speech is considered over
    #[arg(long)]
    silence_timeout: Option<u64>,
}

impl Tuning {
    fn apply(&self, config: &mut DetectorConfig) {
        if let Some(db) = self.min_decibels {
            config.min_decibels = db;
        }
        if let Some(ms) = self.silence_timeout {
            config.silence_timeout_ms = ms;
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, PartialEq)]
enum ListenEvent {
    Level(f32),
    SpeechStart(f32),
    SpeechEnd(f32),
    Failed(DetectorError),
}

fn load_config(path: Option<&PathBuf>) -> Result<DetectorConfig> {
    let config = match path {
        Some(path) => DetectorConfig::load(path)?,
        None => DetectorConfig::load_default()?,
    };
    Ok(config)
}

fn load_level(level: &AtomicU32) -> f32 {
    f32::from_bits(level.load(Ordering::Acquire))
}

fn timestamp() -> String {
    Zoned::now().strftime("%H:%M:%S").to_string()
}

fn print_event(event: &str, level: Option<f32>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => match level {
            Some(level) => println!("[{}] {:<12} {:>5.1}", timestamp(), event, level),
            None => println!("[{}] {}", timestamp(), event),
        },
        OutputFormat::Json => {
            let json = serde_json::json!({
                "time": Zoned::now().to_string(),
                "event": event,
                "noise_level": level,
            });
            println!("{}", serde_json::to_string(&json)?);
        }
    }
    Ok(())
}

/// Forward detector callbacks onto a channel for the listen loop
///
/// `on_noise_level` runs before the transition callbacks of the same tick, so
/// a transition carries the level of the tick that caused it.
fn listen_callbacks(
    tx: mpsc::UnboundedSender<ListenEvent>,
    show_levels: bool,
) -> DetectorCallbacks {
    let tick_level = Arc::new(AtomicU32::new(0.0_f32.to_bits()));
    let (levels, starts, ends, errors) = (tx.clone(), tx.clone(), tx.clone(), tx);
    let (start_level, end_level) = (Arc::clone(&tick_level), Arc::clone(&tick_level));

    DetectorCallbacks::new()
        .on_noise_level(move |level| {
            tick_level.store(level.to_bits(), Ordering::Release);
            // Every tick produces one; only forwarded when requested
            if show_levels {
                let _ = levels.send(ListenEvent::Level(level));
            }
        })
        .on_speech_start(move || {
            let _ = starts.send(ListenEvent::SpeechStart(load_level(&start_level)));
        })
        .on_speech_end(move || {
            let _ = ends.send(ListenEvent::SpeechEnd(load_level(&end_level)));
        })
        .on_error(move |e| {
            let _ = errors.send(ListenEvent::Failed(e.clone()));
        })
}

/// Print events until interrupted, the duration elapses or the detector fails
async fn pump_events<I>(
    rx: &mut mpsc::UnboundedReceiver<ListenEvent>,
    interrupt: I,
    duration: u64,
    format: OutputFormat,
) -> Result<()>
where
    I: Future<Output = std::io::Result<()>>,
{
    let deadline = async {
        if duration == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(duration)).await
        }
    };
    tokio::pin!(deadline, interrupt);

    loop {
        tokio::select! {
            signal = &mut interrupt => {
                return signal.context("Failed to listen for Ctrl-C");
            }
            _ = &mut deadline => return Ok(()),
            event = rx.recv() => match event {
                Some(ListenEvent::Level(level)) => print_event("level", Some(level), format)?,
                Some(ListenEvent::SpeechStart(level)) => {
                    print_event("speech_start", Some(level), format)?
                }
                Some(ListenEvent::SpeechEnd(level)) => {
                    print_event("speech_end", Some(level), format)?
                }
                Some(ListenEvent::Failed(e)) => return Err(anyhow!(e)),
                None => return Ok(()),
            },
        }
    }
}

async fn listen(
    config: DetectorConfig,
    duration: u64,
    show_levels: bool,
    format: OutputFormat,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callbacks = listen_callbacks(tx, show_levels);

    let controller = DetectorController::new(MicrophoneSource::new(), config, callbacks)?;
    controller
        .start()
        .await
        .context("Failed to start voice activity detection")?;

    eprintln!("Listening... press Ctrl-C to stop");

    let result = pump_events(&mut rx, tokio::signal::ctrl_c(), duration, format).await;

    controller.stop();
    result
}

fn print_report(file: &Path, report: &AnalysisReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("File: {}", file.display());
            println!(
                "Duration: {:.1}s ({} ticks, {} skipped)",
                report.duration.as_secs_f32(),
                report.ticks,
                report.skipped_ticks
            );
            println!(
                "Noise level: peak {:.1}, mean {:.1}",
                report.peak_noise_level, report.mean_noise_level
            );
            println!("\n{:<6} {:>10} {:>10} {:>10}", "#", "Start", "End", "Length");
            println!("{}", "-".repeat(40));
            for (i, segment) in report.segments.iter().enumerate() {
                println!(
                    "{:<6} {:>9.2}s {:>9.2}s {:>9.2}s",
                    i + 1,
                    segment.start.as_secs_f32(),
                    segment.end.as_secs_f32(),
                    segment.duration().as_secs_f32()
                );
            }
            if report.segments.is_empty() {
                println!("No speech detected");
            }
        }
        OutputFormat::Json => {
            let segments: Vec<_> = report
                .segments
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "start": s.start.as_secs_f64(),
                        "end": s.end.as_secs_f64(),
                    })
                })
                .collect();
            let json = serde_json::json!({
                "file": file.display().to_string(),
                "duration": report.duration.as_secs_f64(),
                "ticks": report.ticks,
                "skipped_ticks": report.skipped_ticks,
                "peak_noise_level": report.peak_noise_level,
                "mean_noise_level": report.mean_noise_level,
                "segments": segments,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(())
}

async fn analyze_file(config: DetectorConfig, file: PathBuf, format: OutputFormat) -> Result<()> {
    config.validate()?;
    let report = tokio::task::spawn_blocking({
        let file = file.clone();
        move || -> Result<AnalysisReport> {
            let mut analyzer = WavFileAnalyzer::open(&file, &config)?;
            Ok(analysis::analyze(&mut analyzer, &config)?)
        }
    })
    .await??;

    print_report(&file, &report, format)
}

/// Lowest and highest supported rate, e.g. "8000-96000 Hz"
fn rate_range(rates: &[u32]) -> String {
    match (rates.iter().min(), rates.iter().max()) {
        (Some(min), Some(max)) if min == max => format!("{} Hz", min),
        (Some(min), Some(max)) => format!("{}-{} Hz", min, max),
        _ => "no configs".to_string(),
    }
}

fn show_devices(format: OutputFormat) -> Result<()> {
    let devices = list_devices()?;

    if let OutputFormat::Json = format {
        let json: Vec<_> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "default": d.is_default,
                    "sample_rates": d.supported_sample_rates,
                    "formats": d
                        .supported_formats
                        .iter()
                        .map(|f| f.to_string())
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }

    for device in &devices {
        let marker = if device.is_default { '*' } else { ' ' };
        let mut formats: Vec<String> = device
            .supported_formats
            .iter()
            .map(|f| f.to_string())
            .collect();
        formats.sort();
        formats.dedup();

        println!("{} {}", marker, device.name);
        println!(
            "    {}, {}",
            rate_range(&device.supported_sample_rates),
            formats.join("/")
        );
    }
    println!("\n* default input device");

    Ok(())
}

fn show_config(config: &DetectorConfig, explicit: Option<&PathBuf>, path_only: bool) -> Result<()> {
    let path = explicit.cloned().or_else(default_config_path);
    if path_only {
        match path {
            Some(path) => println!("{}", path.display()),
            None => return Err(anyhow!("Could not determine config directory")),
        }
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Listen {
            device,
            tuning,
            duration,
            show_levels,
            format,
        } => {
            tuning.apply(&mut config);
            if device.is_some() {
                config.capture.device = device;
            }
            listen(config, duration, show_levels, format).await
        }
        Commands::Analyze {
            file,
            tuning,
            format,
        } => {
            tuning.apply(&mut config);
            analyze_file(config, file, format).await
        }
        Commands::Devices { format } => show_devices(format),
        Commands::Config { path } => show_config(&config, cli.config.as_ref(), path),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
