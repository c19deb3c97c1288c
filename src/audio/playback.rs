//! Audio playback to system speakers via cpal.
//!
//! [`CpalPlayback`] keeps one output stream open on a dedicated thread. The
//! device callback pulls [`AudioBuffer`]s from a bounded queue and hands
//! finished ones to a reaper thread, which drops them and so releases their
//! pool slot and counts them as completed. The callback itself never locks
//! or frees memory.
//!
//! A flush bumps a generation counter instead of emptying the queue from the
//! caller's thread. Every buffer is stamped with the generation it was
//! scheduled in, and the callback discards buffers older than the latest
//! flush. Audio scheduled right after a flush therefore still plays.

use super::pool::AudioBuffer;
use crate::config::AudioConfig;
use crate::error::{Result, TalkError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Buffers queued ahead of the device callback. Must not be below the pool size.
const QUEUE_DEPTH: usize = 16;

/// Destination for decoded speech.
pub trait PlaybackSink: Send + Sync {
    /// Queue `buffer` to play after everything already scheduled.
    ///
    /// The sink drops the buffer once it has finished playing.
    ///
    /// # Errors
    ///
    /// Returns an error if the output device is gone.
    fn schedule(&self, buffer: AudioBuffer) -> Result<()>;

    /// Discard audio scheduled so far and cut the current buffer short.
    ///
    /// Buffers scheduled after the call are unaffected.
    fn flush(&self);
}

/// A buffer with the flush generation it was scheduled in.
struct Stamped {
    generation: u64,
    buffer: AudioBuffer,
}

/// Producer side of the device queue.
struct OutputQueue {
    queue: Sender<Stamped>,
    flushed: Arc<AtomicU64>,
}

impl OutputQueue {
    fn new(reaper: Sender<AudioBuffer>, channels: usize) -> (Self, CallbackState) {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let flushed = Arc::new(AtomicU64::new(0));
        let state = CallbackState {
            queue: queue_rx,
            reaper,
            flushed: Arc::clone(&flushed),
            current: None,
            position: 0,
            channels: channels.max(1),
        };
        (
            Self {
                queue: queue_tx,
                flushed,
            },
            state,
        )
    }

    fn push(&self, buffer: AudioBuffer) -> Result<()> {
        let stamped = Stamped {
            generation: self.flushed.load(Ordering::Acquire),
            buffer,
        };
        match self.queue.try_send(stamped) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TalkError::Audio(format!(
                "playback queue full ({QUEUE_DEPTH} buffers)"
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(TalkError::Audio("output stream closed".into()))
            }
        }
    }

    fn flush(&self) {
        self.flushed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Playback state owned by the device callback.
struct CallbackState {
    queue: Receiver<Stamped>,
    reaper: Sender<AudioBuffer>,
    flushed: Arc<AtomicU64>,
    current: Option<Stamped>,
    position: usize,
    channels: usize,
}

impl CallbackState {
    fn fill(&mut self, data: &mut [f32]) {
        let cutoff = self.flushed.load(Ordering::Acquire);
        if self.current.as_ref().is_some_and(|c| c.generation < cutoff) {
            self.retire_current();
        }

        for frame in data.chunks_mut(self.channels) {
            let sample = loop {
                if let Some(cur) = &self.current {
                    if let Some(&s) = cur.buffer.samples.get(self.position) {
                        self.position += 1;
                        break s;
                    }
                    self.retire_current();
                }
                match self.queue.try_recv() {
                    Ok(next) if next.generation < cutoff => self.retire(next.buffer),
                    Ok(next) => {
                        self.current = Some(next);
                        self.position = 0;
                    }
                    Err(_) => break 0.0,
                }
            };
            frame.fill(sample);
        }
    }

    fn retire_current(&mut self) {
        if let Some(cur) = self.current.take() {
            self.retire(cur.buffer);
        }
        self.position = 0;
    }

    fn retire(&self, buf: AudioBuffer) {
        // Unbounded, so this only fails once the reaper is gone.
        if let Err(e) = self.reaper.try_send(buf) {
            drop(e.into_inner());
        }
    }
}

/// Audio playback to system speakers via cpal.
pub struct CpalPlayback {
    output: OutputQueue,
    device_rate: u32,
    _shutdown: Sender<()>,
}

impl CpalPlayback {
    /// Open the configured (or default) output device and start its stream.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream
    /// cannot be started.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| TalkError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| TalkError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| TalkError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let default_config = device
            .default_output_config()
            .map_err(|e| TalkError::Audio(format!("no default output config: {e}")))?;
        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let device_rate = stream_config.sample_rate;

        let (reaper_tx, reaper_rx) = crossbeam_channel::unbounded::<AudioBuffer>();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        std::thread::Builder::new()
            .name("talk-reaper".into())
            .spawn(move || {
                // Dropping releases the pool slot and marks the buffer completed.
                for buf in reaper_rx {
                    drop(buf);
                }
            })
            .map_err(|e| TalkError::Audio(format!("failed to spawn reaper thread: {e}")))?;

        let (output, state) = OutputQueue::new(reaper_tx, stream_config.channels as usize);

        // The stream is not Send on every platform; it lives on this thread
        // until the playback handle is dropped.
        std::thread::Builder::new()
            .name("talk-playback".into())
            .spawn(move || {
                let mut state = state;
                let stream = device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| state.fill(data),
                    move |err| {
                        error!("audio output stream error: {err}");
                    },
                    None,
                );
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(TalkError::Audio(format!(
                            "failed to build output stream: {e}"
                        ))));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(TalkError::Audio(format!(
                        "failed to start output stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Blocks until the sender half is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("audio playback stopped");
            })
            .map_err(|e| TalkError::Audio(format!("failed to spawn playback thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| TalkError::Audio("playback thread exited before starting".into()))??;

        info!("audio playback started at {device_rate}Hz");
        Ok(Self {
            output,
            device_rate,
            _shutdown: shutdown_tx,
        })
    }

    /// Output sample rate of the device.
    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
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

impl PlaybackSink for CpalPlayback {
    fn schedule(&self, mut buffer: AudioBuffer) -> Result<()> {
        if buffer.sample_rate != self.device_rate {
            buffer.samples = super::resample(&buffer.samples, buffer.sample_rate, self.device_rate);
            buffer.sample_rate = self.device_rate;
        }
        self.output.push(buffer)
    }

    fn flush(&self) {
        self.output.flush();
    }
}
