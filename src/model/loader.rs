use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::ServiceError,
    model::{DeviceKind, registry::ModelDescriptor},
};

/// Runs the feature-extraction forward pass for one loaded model.
///
/// Calls are blocking and may take seconds on CPU; the cache invokes them on
/// the blocking thread pool.
pub trait FeatureExtractor: Send + Sync {
    fn hidden_size(&self) -> usize;

    /// Returns one row of `hidden_size` values per input token, special
    /// tokens included.
    fn extract(&self, text: &str) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// Turns a catalog entry into a ready-to-serve model.
#[async_trait]
pub trait ModelLoader: Send + Sync + 'static {
    async fn load(&self, descriptor: &'static ModelDescriptor) -> Result<LoadedModel, ServiceError>;

    fn gpu_available(&self) -> bool {
        false
    }
}

/// A cached model: tokenizer and weights behind the extractor, plus the device
/// they were placed on. Never mutated after creation.
pub struct LoadedModel {
    pub descriptor: &'static ModelDescriptor,
    pub device: DeviceKind,
    pub load_time: Duration,
    extractor: Box<dyn FeatureExtractor>,
}

impl LoadedModel {
    pub fn new(
        descriptor: &'static ModelDescriptor,
        device: DeviceKind,
        load_time: Duration,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Self {
        Self {
            descriptor,
            device,
            load_time,
            extractor,
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.extractor.hidden_size()
    }

    pub fn extract(&self, text: &str) -> Result<Vec<Vec<f32>>, ServiceError> {
        self.extractor.extract(text)
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model", &self.descriptor.short_id)
            .field("device", &self.device)
            .field("hidden_size", &self.hidden_size())
            .field("load_time", &self.load_time)
            .finish()
    }
}
