use serde::{Deserialize, Serialize};

use crate::{error::ServiceError, model::registry};

pub const FEATURE_EXTRACTION: &str = "feature-extraction";

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    pub text: String,
    pub model_name: String,
    #[serde(default = "default_task")]
    pub task: String,
}

fn default_task() -> String {
    FEATURE_EXTRACTION.to_string()
}

impl InferenceRequest {
    /// Checks the request without touching the model cache.
    pub fn validate(&self) -> Result<&'static registry::ModelDescriptor, ServiceError> {
        if self.text.trim().is_empty() {
            return Err(ServiceError::Validation("text must not be empty".into()));
        }
        let descriptor = registry::resolve(&self.model_name)?;
        if self.task != FEATURE_EXTRACTION {
            return Err(ServiceError::Validation(format!(
                "task {:?} is not supported, only {FEATURE_EXTRACTION:?} is available",
                self.task
            )));
        }
        Ok(descriptor)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceResponse {
    pub model_name: String,
    pub text: String,
    pub task: String,
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}
