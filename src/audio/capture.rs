//! Live microphone capture via CPAL
//!
//! The cpal stream lives on its own thread for the whole session because
//! streams are not `Send` on every backend. The data callback down-mixes to
//! mono and keeps the newest FFT window in a shared ring; the analyzer reads
//! that ring on demand.

use super::ring_buffer::{SampleRing, SharedRing};
use super::source::{AnalysisWindow, AudioSource, FrequencyAnalyzer};
use super::spectrum::{FFT_SIZE, SpectrumAnalyzer, SpectrumConfig};
use crate::config::DetectorConfig;
use crate::error::{DetectorError, DetectorResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Information about an available audio input device
#[derive(Debug)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub supported_sample_rates: Vec<u32>,
    pub supported_formats: Vec<SampleFormat>,
}

/// List all available audio input devices
pub fn list_devices() -> DetectorResult<Vec<InputDeviceInfo>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| acquisition_error("Failed to enumerate input devices", e))?;
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    let mut device_infos = Vec::new();

    for device in devices {
        let name = device.name().unwrap_or("Unknown Device".to_string());
        let is_default = default_name.as_deref() == Some(name.as_str());

        let configs: Vec<_> = match device.supported_input_configs() {
            Ok(configs) => configs.collect(),
            Err(e) => {
                warn!(device = %name, "Skipping device configs: {}", e);
                Vec::new()
            }
        };

        device_infos.push(InputDeviceInfo {
            name,
            is_default,
            supported_sample_rates: configs.iter().map(|c| c.max_sample_rate().0).collect(),
            supported_formats: configs.iter().map(|c| c.sample_format()).collect(),
        });
    }

    Ok(device_infos)
}

/// Audio source backed by the system's input devices
#[derive(Debug, Clone, Copy, Default)]
pub struct MicrophoneSource;

impl MicrophoneSource {
    pub fn new() -> Self {
        Self
    }
}

impl AudioSource for MicrophoneSource {
    type Analyzer = MicrophoneAnalyzer;

    fn acquire(
        &self,
        config: &DetectorConfig,
    ) -> impl Future<Output = DetectorResult<Self::Analyzer>> + Send {
        let config = config.clone();
        async move { MicrophoneAnalyzer::open(&config).await }
    }
}

/// Frequency analyzer over a live microphone stream
pub struct MicrophoneAnalyzer {
    device_name: String,
    ring: SharedRing,
    closed: Arc<AtomicBool>,
    spectrum: SpectrumAnalyzer,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneAnalyzer {
    async fn open(config: &DetectorConfig) -> DetectorResult<Self> {
        let capture = &config.capture;
        debug!(
            echo_cancellation = capture.echo_cancellation,
            noise_suppression = capture.noise_suppression,
            auto_gain_control = capture.auto_gain_control,
            "Capture hints are advisory for cpal input streams"
        );

        let ring = SampleRing::shared(FFT_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let thread = {
            let device = capture.device.clone();
            let ring = Arc::clone(&ring);
            let closed = Arc::clone(&closed);
            std::thread::Builder::new()
                .name("vad-capture".to_string())
                .spawn(move || run_capture(device, ring, closed, ready_tx, stop_rx))
                .map_err(|e| {
                    DetectorError::DeviceUnavailable(format!(
                        "Failed to spawn capture thread: {}",
                        e
                    ))
                })?
        };

        let device_name = match ready_rx.await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(DetectorError::DeviceUnavailable(
                    "Capture thread exited during startup".to_string(),
                ));
            }
        };

        info!(device = %device_name, "Microphone acquired");

        Ok(Self {
            device_name,
            ring,
            closed,
            spectrum: SpectrumAnalyzer::new(SpectrumConfig::with_min_decibels(
                config.min_decibels,
            )),
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl FrequencyAnalyzer for MicrophoneAnalyzer {
    fn sample(&mut self) -> DetectorResult<AnalysisWindow> {
        if self.thread.is_none() || self.closed.load(Ordering::Acquire) {
            return Err(DetectorError::SourceClosed(format!(
                "{} is no longer available",
                self.device_name
            )));
        }

        let samples = SampleRing::lock(&self.ring).snapshot();

        Ok(self.spectrum.analyze(&samples))
    }

    fn release(&mut self) -> DetectorResult<()> {
        // Dropping the sender wakes the capture thread, which drops the stream
        self.stop_tx.take();

        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| {
                DetectorError::DeviceUnavailable(format!(
                    "Capture thread for {} panicked during release",
                    self.device_name
                ))
            })?;
            info!(device = %self.device_name, "Microphone released");
        }

        Ok(())
    }
}

impl Drop for MicrophoneAnalyzer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}", e);
        }
    }
}

fn run_capture(
    device_name: Option<String>,
    ring: SharedRing,
    closed: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<DetectorResult<String>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let stream = match open_stream(device_name.as_deref(), ring, closed) {
        Ok((stream, name)) => {
            if ready_tx.send(Ok(name)).is_err() {
                // Caller gave up waiting; dropping the stream here releases the device
                return;
            }
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Blocks until the analyzer is released
    let _ = stop_rx.recv();
    drop(stream);
    debug!("Capture stream dropped");
}

fn resolve_device(host: &cpal::Host, device_name: Option<&str>) -> DetectorResult<Device> {
    match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| acquisition_error("Failed to enumerate input devices", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| {
                DetectorError::DeviceUnavailable(format!("Input device not found: {}", name))
            }),
        None => host.default_input_device().ok_or_else(|| {
            DetectorError::DeviceUnavailable("No default input device found".to_string())
        }),
    }
}

fn open_stream(
    device_name: Option<&str>,
    ring: SharedRing,
    closed: Arc<AtomicBool>,
) -> DetectorResult<(Stream, String)> {
    let host = cpal::default_host();
    let device = resolve_device(&host, device_name)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| acquisition_error("Failed to get default input config", e))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    debug!(
        device = %name,
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        format = ?sample_format,
        "Opening input stream"
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, ring, closed),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, ring, closed),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, ring, closed),
        SampleFormat::I32 => build_stream::<i32>(&device, &config, ring, closed),
        other => Err(DetectorError::DeviceUnavailable(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| acquisition_error("Failed to start input stream", e))?;

    Ok((stream, name))
}

/// Build an input stream that feeds mono samples into the ring
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    ring: SharedRing,
    closed: Arc<AtomicBool>,
) -> DetectorResult<Stream>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    let sum: f32 = frame
                        .iter()
                        .map(|&s| {
                            let sample: f32 = cpal::Sample::from_sample(s);
                            sample
                        })
                        .sum();
                    sum / frame.len() as f32
                }));

                SampleRing::lock(&ring).push_slice(&mono);
            },
            move |err| match err {
                cpal::StreamError::DeviceNotAvailable => {
                    error!("Audio input device disconnected");
                    closed.store(true, Ordering::Release);
                }
                other => warn!("Audio input stream error: {}", other),
            },
            None,
        )
        .map_err(|e| acquisition_error("Failed to build input stream", e))
}

/// Map a backend failure onto the acquisition error taxonomy
fn acquisition_error(context: &str, err: impl std::fmt::Display) -> DetectorError {
    let message = format!("{}: {}", context, err);
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        DetectorError::PermissionDenied(message)
    } else {
        DetectorError::DeviceUnavailable(message)
    }
}
