use std::{collections::HashMap, sync::Arc};

use tokio::{sync::OnceCell, task};
use tracing::{error, info};

use crate::{
    error::ServiceError,
    model::{
        loader::{LoadedModel, ModelLoader},
        registry::{self, CATALOG, ModelDescriptor},
    },
};

type Slot = Arc<OnceCell<Arc<LoadedModel>>>;

/// Process-wide map from short model id to its loaded model.
///
/// Every catalog entry owns a slot up front. A slot is filled at most once;
/// concurrent first requests for the same id wait on the same load, and a
/// failed load leaves the slot empty for the next caller to retry.
///
/// Loads run on a spawned task that owns the slot, so a caller that goes away
/// mid-load only stops waiting; the load still completes and fills the slot.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    slots: HashMap<&'static str, Slot>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let slots = CATALOG
            .iter()
            .map(|descriptor| (descriptor.short_id, Arc::new(OnceCell::new())))
            .collect();
        Self { loader, slots }
    }

    pub async fn get_or_load(&self, short_id: &str) -> Result<Arc<LoadedModel>, ServiceError> {
        let descriptor = registry::resolve(short_id)?;
        let slot = self
            .slots
            .get(descriptor.short_id)
            .cloned()
            .ok_or_else(|| ServiceError::Other(format!("no cache slot for {short_id}")))?;

        if let Some(entry) = slot.get() {
            return Ok(entry.clone());
        }

        let loader = self.loader.clone();
        tokio::spawn(async move {
            slot.get_or_try_init(|| load_entry(loader, descriptor))
                .await
                .cloned()
        })
        .await
        .map_err(|err| ServiceError::load(descriptor.short_id, format!("loader task failed: {err}")))?
    }

    pub async fn preload(&self, short_id: &str) -> Result<(), ServiceError> {
        self.get_or_load(short_id).await.map(|_| ())
    }

    /// Loads the model if needed and runs feature extraction on the blocking pool.
    pub async fn embed(&self, short_id: &str, text: &str) -> Result<Vec<Vec<f32>>, ServiceError> {
        let model = self.get_or_load(short_id).await?;
        let text = text.to_string();

        task::spawn_blocking(move || model.extract(&text))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    pub fn cached_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.initialized()).count()
    }

    /// Short ids of loaded models, in catalog order.
    pub fn loaded_models(&self) -> Vec<&'static str> {
        CATALOG
            .iter()
            .map(|d| d.short_id)
            .filter(|id| self.slots.get(id).is_some_and(|slot| slot.initialized()))
            .collect()
    }

    pub fn gpu_available(&self) -> bool {
        self.loader.gpu_available()
    }
}

async fn load_entry(
    loader: Arc<dyn ModelLoader>,
    descriptor: &'static ModelDescriptor,
) -> Result<Arc<LoadedModel>, ServiceError> {
    info!(model = descriptor.short_id, "loading model");
    match loader.load(descriptor).await {
        Ok(model) => {
            info!(
                model = descriptor.short_id,
                device = ?model.device,
                hidden_size = model.hidden_size(),
                elapsed_ms = model.load_time.as_millis() as u64,
                "model ready"
            );
            Ok(Arc::new(model))
        }
        Err(err) => {
            error!(model = descriptor.short_id, error = %err, "model load failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::model::{DeviceKind, loader::FeatureExtractor};

    struct WordSplitter;

    impl FeatureExtractor for WordSplitter {
        fn hidden_size(&self) -> usize {
            4
        }

        fn extract(&self, text: &str) -> Result<Vec<Vec<f32>>, ServiceError> {
            Ok(text.split_whitespace().map(|_| vec![0.5; 4]).collect())
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(
            &self,
            descriptor: &'static ModelDescriptor,
        ) -> Result<LoadedModel, ServiceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && call == 0 {
                return Err(ServiceError::load(descriptor.short_id, "simulated network error"));
            }
            Ok(LoadedModel::new(
                descriptor,
                DeviceKind::Cpu,
                Duration::from_millis(20),
                Box::new(WordSplitter),
            ))
        }
    }

    #[tokio::test]
    async fn repeated_lookups_share_one_entry() {
        let loader = Arc::new(CountingLoader::default());
        let cache = ModelCache::new(loader.clone());

        let first = cache.get_or_load("bert-base-uncased").await.unwrap();
        let second = cache.get_or_load("bert-base-uncased").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_count(), 1);
        assert_eq!(cache.loaded_models(), vec!["bert-base-uncased"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_collapse_into_one_load() {
        let loader = Arc::new(CountingLoader::default());
        let cache = Arc::new(ModelCache::new(loader.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_load("roberta-base").await })
            })
            .collect();

        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(entries.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn unknown_model_never_reaches_loader() {
        let loader = Arc::new(CountingLoader::default());
        let cache = ModelCache::new(loader.clone());

        let err = cache.get_or_load("gpt2").await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownModel { .. }));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.cached_count(), 0);
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let loader = Arc::new(CountingLoader {
            fail_first: true,
            ..Default::default()
        });
        let cache = ModelCache::new(loader.clone());

        assert!(cache.preload("albert-base-v2").await.is_err());
        assert_eq!(cache.cached_count(), 0);
        assert!(cache.loaded_models().is_empty());

        cache.preload("albert-base-v2").await.unwrap();
        assert_eq!(cache.cached_count(), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    /// Blocks a pool thread for the whole load, like a real checkpoint read.
    #[derive(Default)]
    struct SlowLoader {
        started: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl ModelLoader for SlowLoader {
        async fn load(
            &self,
            descriptor: &'static ModelDescriptor,
        ) -> Result<LoadedModel, ServiceError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let finished = task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(300))).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            finished.map_err(|err| ServiceError::load(descriptor.short_id, err.to_string()))?;

            Ok(LoadedModel::new(
                descriptor,
                DeviceKind::Cpu,
                Duration::from_millis(300),
                Box::new(WordSplitter),
            ))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_first_request_does_not_start_a_second_load() {
        let loader = Arc::new(SlowLoader::default());
        let cache = ModelCache::new(loader.clone());

        let first = tokio::time::timeout(
            Duration::from_millis(50),
            cache.get_or_load("bert-large-uncased"),
        )
        .await;
        assert!(first.is_err(), "first request should still be loading");

        let entry = cache.get_or_load("bert-large-uncased").await.unwrap();
        assert_eq!(entry.descriptor.short_id, "bert-large-uncased");

        assert_eq!(loader.started.load(Ordering::SeqCst), 1);
        assert_eq!(loader.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_count(), 1);
    }

    #[tokio::test]
    async fn embed_runs_extractor() {
        let cache = ModelCache::new(Arc::new(CountingLoader::default()));
        let rows = cache.embed("bert-large-uncased", "hello there world").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.len() == 4));
    }
}
