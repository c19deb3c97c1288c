//! Incremental decoding of streamed compressed audio.
//!
//! Network chunks are pushed through a [`ChunkSender`] as they arrive. A
//! blocking task reads them through symphonia and emits mono PCM as soon as
//! at least `min_buffer` of audio has been decoded, so playback can start
//! long before the stream ends.

use crate::error::{Result, TalkError};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::io::Read;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Mono PCM ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Feeds compressed bytes to a running decoder. Dropping it ends the stream.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: Sender<Bytes>,
}

impl ChunkSender {
    /// Queue `bytes` for decoding. Returns `false` if the decoder has stopped.
    pub fn push(&self, bytes: Bytes) -> bool {
        self.tx.send(bytes).is_ok()
    }

    /// A sender with no decoder behind it; the bytes go to the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, Receiver<Bytes>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

/// Blocking reader over a channel of byte chunks. End of channel is EOF.
struct ChannelReader {
    rx: Receiver<Bytes>,
    current: Bytes,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.recv() {
                Ok(next) => self.current = next,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

/// Start a decoder for one utterance.
///
/// Decoded audio goes to `out` in chunks of at least `min_buffer` (the last
/// one may be shorter). The task finishes when the [`ChunkSender`] is dropped
/// and everything has been decoded, or early if `out` is closed.
pub fn spawn_decoder(
    min_buffer: Duration,
    out: mpsc::Sender<DecodedChunk>,
) -> (ChunkSender, JoinHandle<Result<()>>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let task = tokio::task::spawn_blocking(move || {
        let reader = ChannelReader {
            rx,
            current: Bytes::new(),
        };
        decode_stream(reader, min_buffer, &out)
    });
    (ChunkSender { tx }, task)
}

fn decode_stream(
    reader: ChannelReader,
    min_buffer: Duration,
    out: &mpsc::Sender<DecodedChunk>,
) -> Result<()> {
    let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(reader)), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| TalkError::Synthesis(format!("unrecognised audio stream: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| TalkError::Synthesis("no audio track in stream".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| TalkError::Synthesis(format!("failed to create decoder: {e}")))?;

    let mut sample_rate = codec_params.sample_rate.unwrap_or(24_000);
    let mut pending: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut emitted = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphError::ResetRequired) => break,
            Err(e) => return Err(TalkError::Synthesis(format!("audio read error: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(e)) => {
                debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(TalkError::Synthesis(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        let channels = spec.channels.count().max(1);
        let frames = decoded.frames();
        let required = frames.saturating_mul(channels);
        match sample_buf.as_mut() {
            Some(b) if b.capacity() >= required => b.clear(),
            _ => sample_buf = Some(SampleBuffer::<f32>::new(frames as u64, spec)),
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);
        pending.extend(crate::audio::to_mono(buf.samples(), channels as u16));

        let min_samples = min_samples(sample_rate, min_buffer);
        if pending.len() >= min_samples {
            emitted += pending.len();
            let chunk = DecodedChunk {
                samples: std::mem::take(&mut pending),
                sample_rate,
            };
            if out.blocking_send(chunk).is_err() {
                return Ok(());
            }
        }
    }

    if !pending.is_empty() {
        emitted += pending.len();
        let _ = out.blocking_send(DecodedChunk {
            samples: pending,
            sample_rate,
        });
    }
    if emitted == 0 {
        return Err(TalkError::Synthesis("stream contained no audio".into()));
    }
    Ok(())
}

fn min_samples(sample_rate: u32, min_buffer: Duration) -> usize {
    ((sample_rate as u128 * min_buffer.as_millis()) / 1000).max(1) as usize
}
