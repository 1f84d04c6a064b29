//! libtorch-backed model loading and feature extraction.

mod encoder;

use std::{fs, time::Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::{Tokenizer, TruncationParams};
use tokio::task;
use tracing::{info, warn};

pub use encoder::{Encoder, EncoderConfig, WeightError, WeightMap};

use crate::{
    config::{AppConfig, DevicePreference},
    error::ServiceError,
    model::{
        DeviceKind,
        hub::{ArtifactStore, ModelFiles, Origin},
        loader::{FeatureExtractor, LoadedModel, ModelLoader},
        registry::ModelDescriptor,
    },
};

pub fn select_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Auto => Device::cuda_if_available(),
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda(idx) => {
            if tch::Cuda::is_available() {
                Device::Cuda(idx)
            } else {
                warn!(requested = idx, "CUDA requested but not available, using CPU");
                Device::Cpu
            }
        }
    }
}

fn device_kind(device: Device) -> DeviceKind {
    if device.is_cuda() {
        DeviceKind::Gpu
    } else {
        DeviceKind::Cpu
    }
}

/// Downloads (when needed) and instantiates models on a libtorch device.
pub struct TchLoader {
    store: ArtifactStore,
    device: Device,
    max_sequence_length: usize,
}

impl TchLoader {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            store: ArtifactStore::from_config(config),
            device: select_device(config.device),
            max_sequence_length: config.max_sequence_length,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

#[async_trait]
impl ModelLoader for TchLoader {
    async fn load(&self, descriptor: &'static ModelDescriptor) -> Result<LoadedModel, ServiceError> {
        let store = self.store.clone();
        let device = self.device;
        let max_sequence_length = self.max_sequence_length;

        task::spawn_blocking(move || load_blocking(&store, descriptor, device, max_sequence_length))
            .await
            .map_err(|err| ServiceError::load(descriptor.short_id, format!("loader task failed: {err}")))?
    }

    fn gpu_available(&self) -> bool {
        tch::Cuda::is_available()
    }
}

fn load_blocking(
    store: &ArtifactStore,
    descriptor: &'static ModelDescriptor,
    device: Device,
    max_sequence_length: usize,
) -> Result<LoadedModel, ServiceError> {
    let start = Instant::now();
    let load_err = |reason: String| ServiceError::load(descriptor.short_id, reason);

    let (files, origin) = store.fetch(descriptor)?;
    let ModelFiles {
        config,
        tokenizer,
        weights,
    } = files;

    let raw = fs::read_to_string(&config)
        .map_err(|e| load_err(format!("reading {}: {e}", config.display())))?;
    let encoder_config: EncoderConfig =
        serde_json::from_str(&raw).map_err(|e| load_err(format!("parsing config.json: {e}")))?;

    let weight_map = WeightMap::load(&weights, device)
        .map_err(|e| load_err(format!("reading {}: {e}", weights.display())))?;
    let encoder = Encoder::load(&weight_map, &encoder_config, descriptor.architecture)
        .map_err(|e| load_err(e.to_string()))?;

    let max_length = max_sequence_length.min(encoder.max_input_tokens());
    let mut tokenizer =
        Tokenizer::from_file(&tokenizer).map_err(|e| load_err(format!("tokenizer: {e}")))?;
    tokenizer.with_padding(None);
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| load_err(format!("tokenizer truncation: {e}")))?;

    let source = match origin {
        Origin::Local => "local",
        Origin::Downloaded => "hub",
    };
    info!(
        model = descriptor.short_id,
        source,
        tensors = weight_map.len(),
        max_length,
        ?device,
        "weights loaded"
    );

    let hidden_size = encoder.hidden_size();
    let extractor = TchFeatureExtractor {
        tokenizer,
        encoder: Mutex::new(encoder),
        device,
        hidden_size,
    };

    Ok(LoadedModel::new(
        descriptor,
        device_kind(device),
        start.elapsed(),
        Box::new(extractor),
    ))
}

pub struct TchFeatureExtractor {
    tokenizer: Tokenizer,
    encoder: Mutex<Encoder>,
    device: Device,
    hidden_size: usize,
}

impl FeatureExtractor for TchFeatureExtractor {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn extract(&self, text: &str) -> Result<Vec<Vec<f32>>, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            return Err(ServiceError::Tokenizer("text produced no tokens".into()));
        }

        let input = Tensor::from_slice(&input_ids)
            .reshape([1, input_ids.len() as i64])
            .to(self.device);

        let hidden = no_grad(|| {
            let encoder = self.encoder.lock();
            encoder.forward(&input)
        });

        let flat = hidden
            .to_kind(Kind::Float)
            .to(Device::Cpu)
            .contiguous()
            .view([-1]);
        let values = Vec::<f32>::try_from(&flat).map_err(|e| ServiceError::Inference(e.to_string()))?;
        if values.len() != input_ids.len() * self.hidden_size {
            return Err(ServiceError::Inference(format!(
                "unexpected output size {} for {} tokens",
                values.len(),
                input_ids.len()
            )));
        }

        Ok(values
            .chunks(self.hidden_size)
            .map(<[f32]>::to_vec)
            .collect())
    }
}
