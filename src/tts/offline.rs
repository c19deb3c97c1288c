//! Local fallback synthesis through the platform speech command.

use super::decoder::DecodedChunk;
use crate::config::TtsConfig;
use crate::error::{Result, TalkError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Placeholder for the output path in command arguments.
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Synthesizes a whole sentence without the network.
#[async_trait]
pub trait OfflineSynthesizer: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TalkError::Synthesis`] if no audio could be produced.
    async fn synthesize(&self, text: &str) -> Result<DecodedChunk>;
}

/// Runs a speech command that writes a WAV file.
///
/// The sentence goes to the command's stdin, never its argument list, so
/// text that looks like an option is still spoken.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
}

impl CommandSynthesizer {
    /// Use `tts.offline_command` if set, otherwise the platform default.
    pub fn new(config: &TtsConfig) -> Self {
        match config.offline_command.as_deref() {
            Some([program, args @ ..]) => Self {
                program: program.clone(),
                args: args.to_vec(),
            },
            _ => Self::platform_default(),
        }
    }

    /// `say` on macOS, `espeak-ng` everywhere else.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            Self {
                program: "say".to_owned(),
                args: vec![
                    "--data-format=LEI16@22050".to_owned(),
                    "-o".to_owned(),
                    OUTPUT_PLACEHOLDER.to_owned(),
                ],
            }
        } else {
            Self {
                program: "espeak-ng".to_owned(),
                args: vec!["-w".to_owned(), OUTPUT_PLACEHOLDER.to_owned()],
            }
        }
    }

    fn command_args(&self, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }

    async fn run(&self, output: &Path, text: &str) -> std::io::Result<std::process::Output> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(self.command_args(output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // A command that exits without reading stdin is judged by its
            // exit status, not by the broken pipe.
            if let Err(e) = stdin.write_all(format!("{text}\n").as_bytes()).await {
                debug!("{} did not take its input: {e}", self.program);
            }
        }
        child.wait_with_output().await
    }
}

#[async_trait]
impl OfflineSynthesizer for CommandSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<DecodedChunk> {
        let output = temp_wav_path();
        let result = self.run(&output, text).await;

        let audio = match result {
            Ok(out) if out.status.success() => {
                let path = output.clone();
                tokio::task::spawn_blocking(move || read_wav_mono(&path))
                    .await
                    .map_err(|e| TalkError::Synthesis(format!("wav read task failed: {e}")))?
            }
            Ok(out) => Err(TalkError::Synthesis(format!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
            Err(e) => Err(TalkError::Synthesis(format!(
                "failed to run {}: {e}",
                self.program
            ))),
        };
        if let Err(e) = tokio::fs::remove_file(&output).await {
            debug!("could not remove {}: {e}", output.display());
        }
        audio
    }
}

fn temp_wav_path() -> PathBuf {
    std::env::temp_dir().join(format!("clawk-talk-{}.wav", uuid::Uuid::new_v4()))
}

/// Read a WAV file as mono f32.
pub(crate) fn read_wav_mono(path: &Path) -> Result<DecodedChunk> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| TalkError::Synthesis(format!("cannot open WAV {}: {e}", path.display())))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map_err(|e| TalkError::Synthesis(format!("WAV read error: {e}")))
                        .map(|v| v as f32 / max)
                })
                .collect::<Result<Vec<f32>>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| TalkError::Synthesis(format!("WAV read error: {e}"))))
            .collect::<Result<Vec<f32>>>()?,
    };

    let samples = crate::audio::to_mono(&samples, spec.channels);
    if samples.is_empty() {
        return Err(TalkError::Synthesis("offline synthesizer produced no audio".into()));
    }
    Ok(DecodedChunk {
        samples,
        sample_rate: spec.sample_rate,
    })
}
