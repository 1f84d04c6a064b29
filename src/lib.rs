pub mod config;
pub mod error;
pub mod model;
pub mod server;
pub mod telemetry;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{InferenceRequest, InferenceResponse, ModelCache, ModelLoader};
pub use server::build_router;
