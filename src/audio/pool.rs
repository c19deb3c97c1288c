//! Fixed-size pool of playback buffers with scheduled/completed accounting.
//!
//! A producer must [`acquire`](BufferPool::acquire) a slot before handing
//! audio to the output device. Only `capacity` buffers can be in flight, so a
//! decoder that runs ahead of the speakers waits here instead of growing an
//! unbounded queue. Dropping an [`AudioBuffer`] releases its slot and counts
//! it as completed.

use crate::error::{Result, TalkError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

/// Snapshot of playback progress for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackCounts {
    pub scheduled: u64,
    pub completed: u64,
}

impl PlaybackCounts {
    /// Every scheduled buffer has finished playing.
    pub fn is_drained(&self) -> bool {
        self.completed >= self.scheduled
    }
}

/// Scheduled vs completed buffer counters.
///
/// [`reset`](Self::reset) starts a new generation; buffers from an older
/// generation that finish afterwards are not counted.
#[derive(Debug)]
pub struct PlaybackTracker {
    generation: AtomicU64,
    counts: watch::Sender<PlaybackCounts>,
}

impl Default for PlaybackTracker {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            counts: watch::Sender::new(PlaybackCounts::default()),
        }
    }
}

impl PlaybackTracker {
    pub fn counts(&self) -> PlaybackCounts {
        *self.counts.borrow()
    }

    /// Watch the counters change.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackCounts> {
        self.counts.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Zero the counters and invalidate every buffer still in flight.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.counts.send_replace(PlaybackCounts::default());
    }

    fn mark_scheduled(&self) -> u64 {
        let generation = self.generation();
        self.counts.send_modify(|c| c.scheduled += 1);
        generation
    }

    fn mark_completed(&self, generation: u64) {
        if generation == self.generation() {
            self.counts.send_modify(|c| {
                if c.completed < c.scheduled {
                    c.completed += 1;
                }
            });
        }
    }

    /// Wait until every buffer scheduled in the current generation has completed.
    pub async fn wait_drained(&self) {
        let mut rx = self.counts.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(PlaybackCounts::is_drained).await;
    }
}

/// Semaphore-gated pool of playback slots.
#[derive(Debug, Clone)]
pub struct BufferPool {
    permits: Arc<Semaphore>,
    tracker: Arc<PlaybackTracker>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tracker: Arc::new(PlaybackTracker::default()),
            capacity,
        }
    }

    pub fn tracker(&self) -> &Arc<PlaybackTracker> {
        &self.tracker
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot and wrap `samples` in a buffer that occupies it.
    ///
    /// The buffer counts as scheduled from this point on.
    ///
    /// # Errors
    ///
    /// Returns [`TalkError::Channel`] if the pool has been closed.
    pub async fn acquire(&self, samples: Vec<f32>, sample_rate: u32) -> Result<AudioBuffer> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TalkError::Channel("playback pool closed".into()))?;
        let generation = self.tracker.mark_scheduled();
        Ok(AudioBuffer {
            samples,
            sample_rate,
            generation,
            tracker: Arc::clone(&self.tracker),
            _permit: permit,
        })
    }
}

/// Decoded mono audio occupying one pool slot until dropped.
#[derive(Debug)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    generation: u64,
    tracker: Arc<PlaybackTracker>,
    _permit: OwnedSemaphorePermit,
}

impl AudioBuffer {
    /// Release the slot after playback. Equivalent to dropping the buffer.
    pub fn release(self) {}

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

impl Drop for AudioBuffer {
    fn drop(&mut self) {
        self.tracker.mark_completed(self.generation);
    }
}
