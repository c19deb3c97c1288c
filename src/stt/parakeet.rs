//! Local recognition using NVIDIA Parakeet TDT.
//!
//! Parakeet is a batch model, so streaming partials are produced by
//! re-transcribing the growing utterance on a fixed interval. A partial is
//! only emitted when the text changes; an unchanged hypothesis is what lets
//! the recognizer's silence timer run out.

use super::{RecognitionEngine, RecognitionUpdate};
use crate::config::{ModelConfig, RecognizerConfig};
use crate::error::{Result, TalkError};
use crate::models::ModelManager;
use crate::pipeline::messages::AudioFrame;
use async_trait::async_trait;
use parakeet_rs::{ParakeetTDT, TimestampMode, Transcriber};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Model files required by Parakeet TDT.
const MODEL_FILES: [&str; 4] = [
    "encoder-model.onnx",
    "encoder-model.onnx.data",
    "decoder_joint-model.onnx",
    "vocab.txt",
];

/// Audio shorter than this is not worth transcribing.
const MIN_TRANSCRIBE_SECS: f32 = 0.3;

/// Parakeet TDT recognition engine (multilingual, with punctuation).
pub struct ParakeetEngine {
    model: Arc<Mutex<Option<ParakeetTDT>>>,
    model_id: String,
    model_manager: Arc<ModelManager>,
    partial_interval: Duration,
}

impl ParakeetEngine {
    /// Create an engine. The model is loaded lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cache directory cannot be created.
    pub fn new(config: &RecognizerConfig, model_config: &ModelConfig) -> Result<Self> {
        let model_manager = ModelManager::new(model_config)?;
        info!("recognizer configured with model: {}", config.model_id);
        Ok(Self {
            model: Arc::new(Mutex::new(None)),
            model_id: config.model_id.clone(),
            model_manager: Arc::new(model_manager),
            partial_interval: Duration::from_millis(config.partial_interval_ms.max(50)),
        })
    }

    /// Download (if needed) and load the model now rather than on the first utterance.
    ///
    /// Blocking; call from a blocking context.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be downloaded or loaded.
    pub fn ensure_loaded(&self) -> Result<()> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| TalkError::Recognition("recognizer lock poisoned".into()))?;
        if guard.is_none() {
            *guard = Some(load_model(&self.model_manager, &self.model_id)?);
        }
        Ok(())
    }

    async fn transcribe(&self, samples: Vec<f32>, sample_rate: u32) -> Result<String> {
        let model = Arc::clone(&self.model);
        let manager = Arc::clone(&self.model_manager);
        let model_id = self.model_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| TalkError::Recognition("recognizer lock poisoned".into()))?;
            if guard.is_none() {
                *guard = Some(load_model(&manager, &model_id)?);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| TalkError::Recognition("model not initialized".into()))?;

            let started = Instant::now();
            let duration_s = samples.len() as f32 / sample_rate as f32;
            let result = model
                .transcribe_samples(samples, sample_rate, 1, Some(TimestampMode::Sentences))
                .map_err(|e| TalkError::Recognition(format!("transcription failed: {e}")))?;
            debug!(
                "transcribed {duration_s:.1}s in {}ms",
                started.elapsed().as_millis()
            );
            Ok(result.text.trim().to_owned())
        })
        .await
        .map_err(|e| TalkError::Recognition(format!("transcription task failed: {e}")))?
    }
}

fn load_model(manager: &ModelManager, model_id: &str) -> Result<ParakeetTDT> {
    info!("loading recognizer model: {model_id}");
    let repo_dir = manager
        .fetch_repo_files(model_id, &MODEL_FILES)
        .map_err(|e| TalkError::Recognition(format!("recognizer unavailable: {e}")))?;
    let model = ParakeetTDT::from_pretrained(&repo_dir, None)
        .map_err(|e| TalkError::Recognition(format!("failed to load Parakeet TDT: {e}")))?;
    info!("recognizer model loaded");
    Ok(model)
}

#[async_trait]
impl RecognitionEngine for ParakeetEngine {
    async fn recognize(
        &self,
        mut frames: mpsc::Receiver<AudioFrame>,
        updates: mpsc::Sender<RecognitionUpdate>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut audio: Vec<f32> = Vec::new();
        let mut sample_rate = 16_000;
        let mut dirty = false;
        let mut last_text = String::new();
        let mut ticker = tokio::time::interval(self.partial_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        sample_rate = frame.sample_rate;
                        audio.extend_from_slice(&frame.samples);
                        dirty = true;
                    }
                    None => break,
                },
                _ = ticker.tick(), if dirty => {
                    dirty = false;
                    if (audio.len() as f32) < MIN_TRANSCRIBE_SECS * sample_rate as f32 {
                        continue;
                    }
                    let text = self.transcribe(audio.clone(), sample_rate).await?;
                    if !text.is_empty() && text != last_text {
                        last_text = text.clone();
                        if updates.send(RecognitionUpdate::Partial(text)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        // Frames closed: the utterance is over. Transcribe whatever is left.
        let text = if dirty && audio.len() as f32 >= MIN_TRANSCRIBE_SECS * sample_rate as f32 {
            self.transcribe(audio, sample_rate).await?
        } else {
            last_text
        };
        let _ = updates.send(RecognitionUpdate::Final(text)).await;
        Ok(())
    }
}
