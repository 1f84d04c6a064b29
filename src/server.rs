use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    error::ServiceError,
    model::{DeviceKind, InferenceRequest, InferenceResponse, ModelCache, registry},
};

pub const API_NAME: &str = "LogPrompt - Transformer Models API";

const ENDPOINTS: [&str; 5] = [
    "GET /",
    "GET /models",
    "GET /health",
    "POST /predict",
    "POST /load-model/{model_name}",
];

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ModelCache>,
}

#[derive(Serialize)]
struct RootResponse {
    message: &'static str,
    name: &'static str,
    version: &'static str,
    supported_models: Vec<&'static str>,
    endpoints: [&'static str; 5],
}

#[derive(Serialize)]
struct ModelsResponse {
    supported_models: Vec<&'static str>,
    loaded_models: Vec<&'static str>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    models_loaded: usize,
    cuda_available: bool,
}

#[derive(Serialize)]
struct LoadModelResponse {
    message: String,
    model_name: &'static str,
    device: DeviceKind,
}

pub fn build_router(cache: Arc<ModelCache>) -> Router {
    let state = AppState { cache };

    Router::new()
        .route("/", get(root))
        .route("/models", get(list_models))
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/load-model/:model_name", post(load_model))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: API_NAME,
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        supported_models: registry::supported_ids(),
        endpoints: ENDPOINTS,
    })
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        supported_models: registry::supported_ids(),
        loaded_models: state.cache.loaded_models(),
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        models_loaded: state.cache.cached_count(),
        cuda_available: state.cache.gpu_available(),
    })
}

async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<InferenceRequest>, JsonRejection>,
) -> Result<Json<InferenceResponse>, ServiceError> {
    let Json(request) = payload.map_err(|rejection| ServiceError::Validation(rejection.body_text()))?;
    let descriptor = request.validate()?;

    let embeddings = state.cache.embed(descriptor.short_id, &request.text).await?;

    Ok(Json(InferenceResponse {
        model_name: request.model_name,
        text: request.text,
        task: request.task,
        embeddings,
    }))
}

async fn load_model(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
) -> Result<Json<LoadModelResponse>, ServiceError> {
    let descriptor = registry::resolve(&model_name)?;
    let device = state.cache.get_or_load(descriptor.short_id).await?.device;

    info!(model = descriptor.short_id, ?device, "model preloaded on request");
    Ok(Json(LoadModelResponse {
        message: format!("Model {} loaded successfully", descriptor.short_id),
        model_name: descriptor.short_id,
        device,
    }))
}
