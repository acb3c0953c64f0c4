use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::EngineConfig,
    engine::{EngineError, ProbeEngine},
    export,
    ingest::{self, IngestError, RemoteFetcher},
    store::Stats,
    types::{EndpointRecord, RunState, TypeFilter},
};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<ProbeEngine>,
    fetcher: Arc<RemoteFetcher>,
    default_concurrency: usize,
}

impl AppState {
    pub fn new(engine: Arc<ProbeEngine>, fetcher: Arc<RemoteFetcher>, config: &EngineConfig) -> Self {
        Self {
            engine,
            fetcher,
            default_concurrency: config.concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: String, // "idle" | "running"
    pub run: Option<RunState>,
    pub stats: Stats,
}

#[derive(Debug, Serialize)]
struct EndpointsResponse {
    endpoints: Vec<EndpointRecord>,
    top: Vec<EndpointRecord>,
    stats: Stats,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub text: String,
    #[serde(default)]
    pub type_filter: TypeFilter,
}

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub type_filter: TypeFilter,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/endpoints", get(get_endpoints).delete(delete_endpoints))
        .route("/endpoints/import", post(post_import))
        .route("/endpoints/preset/{name}", post(post_preset))
        .route("/endpoints/fetch", post(post_fetch))
        .route("/runs/latency", post(post_latency_run))
        .route("/runs/throughput", post(post_throughput_run))
        .route("/runs/cancel", post(post_cancel))
        .route("/events", get(get_events))
        .route("/export.csv", get(get_export))
        .with_state(state);

    let static_svc = ServeDir::new("ui").append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("no-store"),
                )),
        )
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let app = router(state);
    info!(%bind, "serving API");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn engine_error_response(err: EngineError) -> Response {
    let status = match err {
        EngineError::RunActive(_) => StatusCode::CONFLICT,
        EngineError::NoEndpoints | EngineError::InvalidConcurrency => StatusCode::UNPROCESSABLE_ENTITY,
    };
    error_response(status, err)
}

fn ingest_error_response(err: IngestError) -> Response {
    let status = match &err {
        IngestError::NoValidEndpoints { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::UnknownPreset(_) => StatusCode::NOT_FOUND,
        IngestError::AllGatewaysFailed { .. } => StatusCode::BAD_GATEWAY,
        IngestError::Engine(EngineError::RunActive(_)) => StatusCode::CONFLICT,
        IngestError::Engine(_) | IngestError::Io { .. } | IngestError::Client(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err)
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let run = app.engine.current_run();
    let state = if run.is_some() { "running" } else { "idle" };
    let out = Status {
        state: state.into(),
        run,
        stats: app.engine.stats(),
    };
    (StatusCode::OK, Json(out))
}

async fn get_endpoints(State(app): State<AppState>) -> impl IntoResponse {
    let out = EndpointsResponse {
        endpoints: app.engine.ranked(),
        top: app.engine.top(5),
        stats: app.engine.stats(),
    };
    (StatusCode::OK, Json(out))
}

async fn delete_endpoints(State(app): State<AppState>) -> Response {
    match app.engine.clear() {
        Ok(removed) => (StatusCode::OK, Json(serde_json::json!({ "removed": removed }))).into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn post_import(State(app): State<AppState>, Json(req): Json<ImportRequest>) -> Response {
    match ingest::import_text(&app.engine, "paste", &req.text, req.type_filter) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => ingest_error_response(e),
    }
}

async fn post_preset(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    match ingest::import_preset(&app.engine, &name, TypeFilter::All) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => ingest_error_response(e),
    }
}

async fn post_fetch(State(app): State<AppState>, Json(req): Json<FetchRequest>) -> Response {
    match ingest::import_url(&app.engine, &app.fetcher, &req.url, req.type_filter).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => ingest_error_response(e),
    }
}

async fn post_latency_run(State(app): State<AppState>, body: Option<Json<RunRequest>>) -> Response {
    let concurrency = body.and_then(|Json(r)| r.concurrency).unwrap_or(app.default_concurrency);
    match app.engine.start_latency_run(concurrency) {
        Ok(handle) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "run_id": handle.run_id }))).into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn post_throughput_run(State(app): State<AppState>, body: Option<Json<RunRequest>>) -> Response {
    let concurrency = body.and_then(|Json(r)| r.concurrency).unwrap_or(app.default_concurrency);
    match app.engine.start_throughput_run(concurrency) {
        Ok(handle) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "run_id": handle.run_id }))).into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    let cancelled = app.engine.cancel_active_run();
    (StatusCode::OK, Json(serde_json::json!({ "cancelled": cancelled })))
}

async fn get_events(State(app): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Lagged receivers skip what they missed.
    let stream = BroadcastStream::new(app.engine.subscribe())
        .filter_map(|msg| msg.ok().and_then(|ev| Event::default().json_data(ev).ok()).map(Ok));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn get_export(State(app): State<AppState>) -> impl IntoResponse {
    let csv = export::render_csv(&app.engine.ranked());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8"))],
        csv,
    )
}
