pub mod cache;
pub mod hub;
mod loader;
pub mod registry;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use cache::ModelCache;
pub use hub::{ArtifactStore, ModelFiles, Origin};
pub use loader::{FeatureExtractor, LoadedModel, ModelLoader};
pub use registry::{Architecture, ModelDescriptor};
pub use types::{DeviceKind, FEATURE_EXTRACTION, InferenceRequest, InferenceResponse};
