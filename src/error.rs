use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("Model {requested} not supported. Available models: {}", .available.join(", "))]
    UnknownModel {
        requested: String,
        available: Vec<String>,
    },
    #[error("failed to load model {model}: {reason}")]
    Load { model: String, reason: String },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn load(model: impl Into<String>, reason: impl ToString) -> Self {
        ServiceError::Load {
            model: model.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) | ServiceError::UnknownModel { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Load { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Tokenizer(_) | ServiceError::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::Io(_) | ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable tag carried in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::UnknownModel { .. } => "unknown_model",
            ServiceError::Load { .. } => "load",
            ServiceError::Tokenizer(_) | ServiceError::Inference(_) => "inference",
            ServiceError::Io(_) | ServiceError::Other(_) => "internal",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}
