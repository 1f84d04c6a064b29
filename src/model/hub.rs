//! Local-first access to model files in the pretrained-model repository.
//!
//! Every catalog entry gets its own hub cache under `<models_dir>/<short_id>`.

use std::path::{Path, PathBuf};

use hf_hub::{
    Cache, Repo,
    api::sync::{Api, ApiBuilder, ApiRepo},
};
use tracing::{debug, info};

use crate::{config::AppConfig, error::ServiceError, model::registry::ModelDescriptor};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Weight files in order of preference.
pub const WEIGHT_FILES: [&str; 2] = ["model.safetensors", "rust_model.ot"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        [&self.config, &self.tokenizer, &self.weights]
            .into_iter()
            .map(PathBuf::as_path)
    }
}

/// Where a resolved file set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Downloaded,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    models_dir: PathBuf,
    hf_token: Option<String>,
    offline: bool,
    progress: bool,
}

impl ArtifactStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            hf_token: None,
            offline: false,
            progress: false,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.models_dir)
            .with_token(config.hf_token.clone())
            .offline(config.offline)
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.hf_token = token;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Lets the hub client draw its own per-file progress bars.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn cache_dir(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(descriptor.short_id)
    }

    pub fn ensure_models_dir(&self) -> Result<(), ServiceError> {
        if !self.models_dir.exists() {
            std::fs::create_dir_all(&self.models_dir)?;
            info!(dir = %self.models_dir.display(), "created models directory");
        }
        Ok(())
    }

    /// Looks for a complete file set on disk without touching the network.
    pub fn locate(&self, descriptor: &ModelDescriptor) -> Option<ModelFiles> {
        let repo = Cache::new(self.cache_dir(descriptor)).model(descriptor.repository_id.to_string());
        let config = repo.get(CONFIG_FILE)?;
        let tokenizer = repo.get(TOKENIZER_FILE)?;
        let weights = WEIGHT_FILES.iter().find_map(|name| repo.get(name))?;
        Some(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }

    /// Returns the local files when complete, downloading what is missing
    /// otherwise.
    pub fn fetch(&self, descriptor: &ModelDescriptor) -> Result<(ModelFiles, Origin), ServiceError> {
        if let Some(files) = self.locate(descriptor) {
            debug!(model = descriptor.short_id, "model files found locally");
            return Ok((files, Origin::Local));
        }
        if self.offline {
            return Err(ServiceError::load(
                descriptor.short_id,
                format!(
                    "not present in {} and offline mode is enabled",
                    self.cache_dir(descriptor).display()
                ),
            ));
        }

        info!(
            model = descriptor.short_id,
            repo = descriptor.repository_id,
            "local files not found, downloading from the hub"
        );
        let repo = self.remote(descriptor)?;
        let files = self.download_with(descriptor, |name| repo.get(name))?;
        Ok((files, Origin::Downloaded))
    }

    /// Downloads every file again, ignoring what is already cached.
    pub fn force_fetch(&self, descriptor: &ModelDescriptor) -> Result<ModelFiles, ServiceError> {
        if self.offline {
            return Err(ServiceError::load(
                descriptor.short_id,
                "cannot re-download while offline mode is enabled",
            ));
        }
        let repo = self.remote(descriptor)?;
        self.download_with(descriptor, |name| repo.download(name))
    }

    fn remote(&self, descriptor: &ModelDescriptor) -> Result<ApiRepo, ServiceError> {
        let api: Api = ApiBuilder::new()
            .with_cache_dir(self.cache_dir(descriptor))
            .with_token(self.hf_token.clone())
            .with_progress(self.progress)
            .build()
            .map_err(|e| ServiceError::load(descriptor.short_id, format!("hub client: {e}")))?;
        Ok(api.repo(Repo::model(descriptor.repository_id.to_string())))
    }

    fn download_with<F, E>(
        &self,
        descriptor: &ModelDescriptor,
        get: F,
    ) -> Result<ModelFiles, ServiceError>
    where
        F: Fn(&str) -> Result<PathBuf, E>,
        E: std::fmt::Display,
    {
        let required = |name: &str| {
            get(name).map_err(|e| ServiceError::load(descriptor.short_id, format!("{name}: {e}")))
        };

        let config = required(CONFIG_FILE)?;
        let tokenizer = required(TOKENIZER_FILE)?;

        let mut last_error = None;
        let mut weights = None;
        for name in WEIGHT_FILES {
            match get(name) {
                Ok(path) => {
                    weights = Some(path);
                    break;
                }
                Err(e) => {
                    debug!(model = descriptor.short_id, file = name, error = %e, "weight file unavailable");
                    last_error = Some(format!("{name}: {e}"));
                }
            }
        }
        let weights = weights.ok_or_else(|| {
            ServiceError::load(
                descriptor.short_id,
                format!(
                    "no usable weights (tried {}): {}",
                    WEIGHT_FILES.join(", "),
                    last_error.unwrap_or_default()
                ),
            )
        })?;

        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }
}
