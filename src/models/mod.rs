//! Model downloading and caching via hf-hub.

use crate::config::ModelConfig;
use crate::error::{Result, TalkError};
use std::path::PathBuf;
use tracing::info;

/// Manages downloading and caching of recognizer models.
pub struct ModelManager {
    cache_dir: PathBuf,
}

impl ModelManager {
    /// Create a new model manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)?;
        info!("model cache directory: {}", config.cache_dir.display());

        Ok(Self {
            cache_dir: config.cache_dir.clone(),
        })
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }

    fn api(&self) -> Result<hf_hub::api::sync::Api> {
        hf_hub::api::sync::ApiBuilder::new()
            .with_cache_dir(self.cache_dir.join("hf"))
            .build()
            .map_err(|e| TalkError::Model(format!("failed to create HF API: {e}")))
    }

    /// Get the path to a cached model file, downloading if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be downloaded.
    pub fn get_model_path(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
        let repo = self.api()?.model(repo_id.to_owned());
        repo.get(filename).map_err(|e| {
            TalkError::Model(format!("failed to download {filename} from {repo_id}: {e}"))
        })
    }

    /// Fetch `files` from `repo_id` and return the snapshot directory holding them.
    ///
    /// Models like Parakeet TDT are loaded from a directory rather than
    /// individual paths; hf-hub places every file of one revision in the
    /// same snapshot directory.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be downloaded.
    pub fn fetch_repo_files(&self, repo_id: &str, files: &[&str]) -> Result<PathBuf> {
        let mut snapshot_dir = None;
        for file in files {
            let path = self.get_model_path(repo_id, file)?;
            if snapshot_dir.is_none() {
                snapshot_dir = path.parent().map(std::path::Path::to_path_buf);
            }
        }
        snapshot_dir.ok_or_else(|| {
            TalkError::Model(format!("could not determine repo directory for {repo_id}"))
        })
    }
}
