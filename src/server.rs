use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::broker::{BrokerError, DebateBroker};
use crate::config::{DebateConfig, DebateOverrides, ServiceConfig};
use crate::debate::{DebateEvent, Orchestrator};
use crate::error::ApiError;
use crate::llm_client::{ChatBackend, ModelInfo, OllamaClient};
use crate::prompts::PromptSet;
use crate::templates::{TemplateStore, TemplateSummary};
use crate::trace_store::{
    DebateTrace, StoreStats, TraceQuery, TraceStore, TraceSummary, DEFAULT_CANDIDATE_THRESHOLD,
};

const MAX_QUERY_CHARS: usize = 4000;
const DEFAULT_PAGE_LIMIT: usize = 20;
const MAX_PAGE_LIMIT: usize = 100;
const BUSY_RETRY_AFTER_SECS: u64 = 10;

pub struct AppState {
    pub config: ServiceConfig,
    pub backend: Arc<dyn ChatBackend>,
    pub templates: Arc<TemplateStore>,
    pub store: Arc<TraceStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub broker: DebateBroker,
    pub debate_slots: Arc<Semaphore>,
    pub admission_slots: Arc<Semaphore>,
    pub cancel: watch::Receiver<bool>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/reason", post(start_debate))
        .route("/api/reason/:id/stream", get(stream_debate))
        .route("/api/traces", get(list_traces))
        .route("/api/traces/candidates", get(list_candidates))
        .route("/api/traces/:id", get(get_trace))
        .route("/api/traces/:id/rate", post(rate_trace))
        .route("/api/templates", get(list_templates))
        .route("/api/templates/reindex", post(reindex_templates))
        .with_state(state)
}

/// Open stores, index templates, and serve until shutdown. Startup
/// failures (bind, store open, template directory open) propagate.
pub async fn serve(config: ServiceConfig) -> Result<()> {
    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaClient::new(config.backend_url.clone()));
    let store = Arc::new(TraceStore::open(&config.db_path)?);
    let templates = Arc::new(TemplateStore::new(
        backend.clone(),
        config.embed_model.clone(),
    ));

    // Unreadable template directories are a configuration error; an
    // offline embedding backend is not, the index just starts empty.
    for dir in &config.template_dirs {
        std::fs::read_dir(dir)
            .with_context(|| format!("opening template directory {}", dir.display()))?;
    }
    match templates.reindex(&config.template_dirs).await {
        Ok(count) => tracing::info!(templates = count, "template index ready"),
        Err(error) => {
            tracing::warn!(%error, "template indexing failed, starting with an empty index");
        }
    }

    let prompts = Arc::new(PromptSet::load(config.prompt_dir.as_deref()));
    let orchestrator = Arc::new(Orchestrator::new(
        backend.clone(),
        templates.clone(),
        store.clone(),
        prompts,
        config.embed_model.clone(),
    ));

    let broker = DebateBroker::new();
    broker.spawn_sweeper();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        debate_slots: Arc::new(Semaphore::new(config.max_concurrent)),
        admission_slots: Arc::new(Semaphore::new(config.max_concurrent + config.queue_depth)),
        backend,
        templates,
        store,
        orchestrator,
        broker,
        cancel: cancel_rx,
        config: config.clone(),
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding to {}", config.bind))?;
    tracing::info!("disputant listening on http://{}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, cancelling in-flight debates");
            let _ = cancel_tx.send(true);
        })
        .await
        .context("server failed")?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: bool,
    version: &'static str,
    templates: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let backend_up = state.backend.list_models().await.is_ok();
    Json(HealthResponse {
        status: if backend_up { "ok" } else { "degraded" },
        backend: backend_up,
        version: env!("CARGO_PKG_VERSION"),
        templates: state.templates.len().await,
    })
}

async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ModelInfo>>, ApiError> {
    let models = state.backend.list_models().await?;
    Ok(Json(models))
}

#[derive(Debug, Deserialize)]
struct ReasonRequest {
    query: String,
    #[serde(default)]
    config: Option<DebateOverrides>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReasonResponse {
    trace_id: String,
    config: DebateConfig,
}

/// Start a debate. Returns the trace id immediately; the debate runs on
/// its own task under the concurrency cap.
async fn start_debate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReasonRequest>,
) -> Result<Json<ReasonResponse>, ApiError> {
    let query = validate_query(&body.query)?;
    let config = state
        .config
        .debate_defaults
        .merged(&body.config.unwrap_or_default());
    config.validate().map_err(ApiError::Validation)?;

    let admission = state
        .admission_slots
        .clone()
        .try_acquire_owned()
        .map_err(|_| ApiError::Busy {
            retry_after_secs: BUSY_RETRY_AFTER_SECS,
        })?;

    let trace_id = Uuid::new_v4().to_string();
    state
        .broker
        .register(&trace_id)
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let broker = state.broker.clone();
    let orchestrator = state.orchestrator.clone();
    let debate_slots = state.debate_slots.clone();
    let cancel = state.cancel.clone();
    let debate_id = trace_id.clone();
    let run_config = config.clone();
    tokio::spawn(async move {
        let _admission = admission;
        let Ok(_run_permit) = debate_slots.acquire_owned().await else {
            broker.fail(&debate_id);
            return;
        };

        let mut events = orchestrator.run(debate_id.clone(), query, run_config, cancel);
        let mut failed = false;
        while let Some(event) = events.recv().await {
            if matches!(event, DebateEvent::Failed { .. }) {
                failed = true;
            }
            broker.publish(&debate_id, event);
        }
        if failed {
            broker.fail(&debate_id);
        } else {
            broker.complete(&debate_id);
        }
    });

    Ok(Json(ReasonResponse { trace_id, config }))
}

async fn stream_debate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rx = state.broker.subscribe(&id).map_err(|err| match err {
        BrokerError::NotFound(id) => ApiError::NotFound(format!("debate '{id}' not found")),
        BrokerError::AlreadySubscribed(id) => {
            ApiError::Duplicate(format!("debate '{id}' already has a subscriber"))
        }
        BrokerError::Duplicate(id) => ApiError::Internal(format!("debate '{id}' double-registered")),
    })?;

    let stream = ReceiverStream::new(rx).filter_map(|event| async move {
        match serde_json::to_string(&event) {
            Ok(json) => Some(Ok::<_, Infallible>(Event::default().data(json))),
            Err(error) => {
                tracing::warn!(%error, "failed to serialize debate event, skipping");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[derive(Debug, Deserialize)]
struct TracesQueryParams {
    limit: Option<usize>,
    offset: Option<usize>,
    #[serde(rename = "minQuality")]
    min_quality: Option<u8>,
    search: Option<String>,
}

#[derive(Debug, Serialize)]
struct TracesResponse {
    traces: Vec<TraceSummary>,
    stats: StoreStats,
}

async fn list_traces(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TracesQueryParams>,
) -> Result<Json<TracesResponse>, ApiError> {
    if let Some(min_quality) = params.min_quality {
        if !(1..=10).contains(&min_quality) {
            return Err(ApiError::Validation(
                "minQuality must be in 1..=10".to_string(),
            ));
        }
    }
    let query = TraceQuery {
        limit: clamp_limit(params.limit, DEFAULT_PAGE_LIMIT, 1, MAX_PAGE_LIMIT),
        offset: params.offset.unwrap_or(0),
        min_quality: params.min_quality,
        search: params.search.filter(|text| !text.trim().is_empty()),
    };

    let traces = state.store.list(&query)?;
    let stats = state.store.stats()?;
    Ok(Json(TracesResponse { traces, stats }))
}

#[derive(Debug, Deserialize)]
struct CandidatesQueryParams {
    min: Option<u8>,
}

async fn list_candidates(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CandidatesQueryParams>,
) -> Result<Json<Vec<TraceSummary>>, ApiError> {
    let threshold = params.min.unwrap_or(DEFAULT_CANDIDATE_THRESHOLD);
    if !(1..=10).contains(&threshold) {
        return Err(ApiError::Validation("min must be in 1..=10".to_string()));
    }
    let candidates = state.store.finetune_candidates(threshold)?;
    Ok(Json(candidates))
}

async fn get_trace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DebateTrace>, ApiError> {
    match state.store.get(&id)? {
        Some(trace) => Ok(Json(trace)),
        None => Err(ApiError::NotFound(format!("trace '{id}' not found"))),
    }
}

#[derive(Debug, Deserialize)]
struct RateRequest {
    rating: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RateResponse {
    trace_id: String,
    user_rating: u8,
}

async fn rate_trace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RateRequest>,
) -> Result<Json<RateResponse>, ApiError> {
    let rating = u8::try_from(body.rating)
        .ok()
        .filter(|rating| (1..=10).contains(rating))
        .ok_or_else(|| ApiError::Validation("rating must be in 1..=10".to_string()))?;

    state.store.rate(&id, rating)?;
    Ok(Json(RateResponse {
        trace_id: id,
        user_rating: rating,
    }))
}

async fn list_templates(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<TemplateSummary>> {
    Json(state.templates.list().await)
}

#[derive(Debug, Serialize)]
struct ReindexResponse {
    indexed: usize,
}

async fn reindex_templates(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReindexResponse>, ApiError> {
    let indexed = state
        .templates
        .reindex(&state.config.template_dirs)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(ReindexResponse { indexed }))
}

/// The query must be 1..=4000 characters after trimming.
fn validate_query(raw: &str) -> Result<String, ApiError> {
    let query = raw.trim();
    if query.is_empty() {
        return Err(ApiError::Validation("query must not be empty".to_string()));
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(ApiError::Validation(format!(
            "query must be at most {MAX_QUERY_CHARS} characters"
        )));
    }
    Ok(query.to_string())
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}
