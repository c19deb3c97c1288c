//! Microphone audio capture using cpal.
//!
//! Captures audio at the device's native sample rate, downmixes and
//! resamples it to mono at the configured input rate, and cuts it into
//! fixed-size [`AudioFrame`]s with their RMS level already computed.
//! [`AudioCaptureEngine`] fans those frames out to the recognizer and the
//! level consumers for the current conversation phase.

use super::LinearResampler;
use crate::config::AudioConfig;
use crate::error::{Result, TalkError};
use crate::pipeline::messages::AudioFrame;
use crate::vad::compute_rms_energy;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames buffered between the device callback and the router task.
const FRAME_QUEUE_DEPTH: usize = 64;

/// A source of fixed-size microphone frames.
pub trait AudioSource: Send + Sync {
    /// Start delivering frames to `tx` until `cancel` fires.
    ///
    /// Must return promptly; the source runs on its own thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the device stream cannot be opened.
    fn open(&self, tx: mpsc::Sender<AudioFrame>, cancel: CancellationToken) -> Result<()>;
}

/// Audio capture from the system microphone via cpal.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    frame_size: usize,
    dropped_frames: Arc<AtomicU64>,
}

impl CpalCapture {
    /// Open the configured (or default) input device.
    ///
    /// Uses the device's default configuration for maximum compatibility,
    /// then resamples to the target rate in software.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| TalkError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| TalkError::Audio(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| TalkError::Audio("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| TalkError::Audio(format!("no default input config: {e}")))?;

        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels -> {}Hz mono, {} samples/frame",
            stream_config.sample_rate,
            stream_config.channels,
            config.input_sample_rate,
            config.frame_size
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.input_sample_rate,
            frame_size: config.frame_size.max(1),
            dropped_frames: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Frames dropped because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| TalkError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

/// Build the input stream. Runs on the thread that will own the stream.
fn build_input_stream(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    target_rate: u32,
    frame_size: usize,
    tx: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
) -> Result<cpal::Stream> {
    let channels = stream_config.channels.max(1) as usize;
    let mut resampler = LinearResampler::new(stream_config.sample_rate, target_rate);
    let mut pending: Vec<f32> = Vec::with_capacity(frame_size);

    device
        .build_input_stream(
            stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                for frame in data.chunks_exact(channels) {
                    let mono = frame.iter().sum::<f32>() / channels as f32;
                    resampler.push(mono, |s| pending.push(s));
                    if pending.len() >= frame_size {
                        let samples =
                            std::mem::replace(&mut pending, Vec::with_capacity(frame_size));
                        let rms = compute_rms_energy(&samples);
                        let chunk = AudioFrame {
                            samples,
                            sample_rate: target_rate,
                            rms,
                            captured_at: Instant::now(),
                        };
                        // Never block the audio thread.
                        if tx.try_send(chunk).is_err() {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| TalkError::Audio(format!("failed to build input stream: {e}")))
}

impl AudioSource for CpalCapture {
    fn open(&self, tx: mpsc::Sender<AudioFrame>, cancel: CancellationToken) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TalkError::Audio(format!("capture needs a tokio runtime: {e}")))?;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let device = self.device.clone();
        let stream_config = self.stream_config.clone();
        let target_rate = self.target_sample_rate;
        let frame_size = self.frame_size;
        let dropped = Arc::clone(&self.dropped_frames);

        // The stream is not Send on every platform, so it is built, held
        // and dropped on its own thread.
        std::thread::Builder::new()
            .name("talk-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(
                    &device,
                    &stream_config,
                    target_rate,
                    frame_size,
                    tx,
                    Arc::clone(&dropped),
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(TalkError::Audio(format!(
                        "failed to start input stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(cancel.cancelled());
                drop(stream);
                debug!(
                    dropped = dropped.load(Ordering::Relaxed),
                    "audio capture stopped"
                );
            })
            .map_err(|e| TalkError::Audio(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| TalkError::Audio("capture thread exited before starting".into()))?
    }
}

/// Where captured audio goes during one phase.
#[derive(Debug, Default)]
pub struct CaptureRoute {
    /// Full frames, for the recognizer.
    pub frames: Option<mpsc::Sender<AudioFrame>>,
    /// Per-frame RMS levels, for metering and barge-in detection.
    pub levels: Option<mpsc::Sender<f32>>,
}

/// Owns the audio source and routes its frames for the current phase.
pub struct AudioCaptureEngine {
    source: Arc<dyn AudioSource>,
}

impl AudioCaptureEngine {
    pub fn new(source: Arc<dyn AudioSource>) -> Self {
        Self { source }
    }

    /// Start capturing and forwarding frames along `route`.
    ///
    /// Capture runs until the returned handle is stopped or dropped, or
    /// until every destination in `route` has been closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio source cannot be opened.
    pub fn start(&self, route: CaptureRoute) -> Result<CaptureHandle> {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<AudioFrame>(FRAME_QUEUE_DEPTH);
        self.source.open(tx, cancel.clone())?;

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let CaptureRoute {
                mut frames,
                mut levels,
            } = route;
            let mut backlog_warned = false;
            loop {
                let frame = tokio::select! {
                    () = task_cancel.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(f) => f,
                        None => break,
                    },
                };

                if let Some(tx) = &levels {
                    match tx.try_send(frame.rms) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => levels = None,
                    }
                }
                if let Some(tx) = &frames {
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            if !backlog_warned {
                                warn!("recognizer is falling behind, dropping audio frames");
                                backlog_warned = true;
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => frames = None,
                    }
                }
                if frames.is_none() && levels.is_none() {
                    break;
                }
            }
            task_cancel.cancel();
        });

        Ok(CaptureHandle { cancel })
    }
}

/// Running capture. Stops the device stream when stopped or dropped.
#[derive(Debug)]
pub struct CaptureHandle {
    cancel: CancellationToken,
}

impl CaptureHandle {
    /// Stop capturing. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
