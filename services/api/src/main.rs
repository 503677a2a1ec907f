//! API Service - Signup conversion reports over HTTP
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /config - Default pipeline configuration (hotel signup layout)
//! - POST /reconcile - Reconcile and rank two inline tables
//! - POST /compare - Compare rankings between two date windows
//! - POST /funnel - Daily signup-status funnel and week-over-week new recruits
//! - POST /trend - Weekly signup ranks with week-over-week movement
//! - POST /movement - Rank movement between two ranking tables
//!
//! Every request carries its own tables; nothing is cached between requests.

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use engine::{
    ranking_movement, ComparisonRow, DateWindow, FunnelConfig, FunnelOutput, MovementOptions,
    Pipeline, PipelineConfig, PipelineOutput, RankingMovement, SnapshotOutput, Table, TrendConfig,
    TrendOutput, TrendRow,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// State
// ============================================================================

struct AppState {
    /// Used when a request does not send its own configuration
    default_config: PipelineConfig,
    started_at: DateTime<Utc>,
}

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Deserialize)]
struct ReconcileRequest {
    #[serde(default)]
    config: Option<PipelineConfig>,
    primary: Table,
    secondary: Table,
}

#[derive(Deserialize)]
struct CompareRequest {
    #[serde(default)]
    config: Option<PipelineConfig>,
    primary: Table,
    secondary: Table,
    before: DateWindow,
    after: DateWindow,
}

#[derive(Deserialize)]
struct FunnelRequest {
    #[serde(default)]
    config: Option<FunnelConfig>,
    signups: Table,
    report_date: NaiveDate,
}

fn default_movers() -> usize {
    5
}

#[derive(Deserialize)]
struct TrendRequest {
    #[serde(default)]
    config: Option<TrendConfig>,
    signups: Table,
    #[serde(default = "default_movers")]
    movers: usize,
}

#[derive(Deserialize)]
struct MovementRequest {
    before: Table,
    after: Table,
    #[serde(default)]
    options: MovementOptions,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
    started_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ReconcileResponse {
    #[serde(flatten)]
    output: PipelineOutput,
    warnings: Vec<String>,
}

#[derive(Serialize)]
struct CompareResponse {
    #[serde(flatten)]
    snapshots: SnapshotOutput,
    new_entrants: usize,
    improving_share: Option<f64>,
    top_gainers: Vec<ComparisonRow>,
    top_losers: Vec<ComparisonRow>,
}

#[derive(Serialize)]
struct TrendResponse {
    #[serde(flatten)]
    output: TrendOutput,
    latest_week: Option<NaiveDate>,
    improving_share: Option<f64>,
    top_gainers: Vec<TrendRow>,
    top_losers: Vec<TrendRow>,
}

#[derive(Serialize)]
struct MovementResponse {
    #[serde(flatten)]
    movement: RankingMovement,
    new_entries: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
    })
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Json<PipelineConfig> {
    Json(state.default_config.clone())
}

/// Run an engine job off the async executor; engine errors are client errors
async fn run_blocking<T, F>(job: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce() -> engine::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(error = %e, "Rejected pipeline request");
            Err(error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
        }
        Err(e) => {
            error!(error = %e, "Pipeline task failed");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "pipeline task failed".to_string(),
            ))
        }
    }
}

async fn run_pipeline<T, F>(config: PipelineConfig, job: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(Pipeline) -> engine::Result<T> + Send + 'static,
{
    run_blocking(move || Pipeline::new(config).and_then(job)).await
}

async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReconcileRequest>,
) -> Response {
    let config = req
        .config
        .unwrap_or_else(|| state.default_config.clone());
    let result = run_pipeline(config, move |pipeline| {
        pipeline.run(&req.primary, &req.secondary)
    })
    .await;

    match result {
        Ok(output) => {
            let warnings = output.quality.warnings();
            Json(ReconcileResponse { output, warnings }).into_response()
        }
        Err(response) => response,
    }
}

async fn compare_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompareRequest>,
) -> Response {
    let config = req
        .config
        .unwrap_or_else(|| state.default_config.clone());
    let movers = config.movers;
    let result = run_pipeline(config, move |pipeline| {
        pipeline.run_snapshots(&req.primary, &req.secondary, req.before, req.after)
    })
    .await;

    match result {
        Ok(snapshots) => {
            let cmp = &snapshots.comparison;
            let top_gainers = cmp.top_gainers(movers).into_iter().cloned().collect();
            let top_losers = cmp.top_losers(movers).into_iter().cloned().collect();
            Json(CompareResponse {
                new_entrants: cmp.new_entrants(),
                improving_share: cmp.improving_share(),
                top_gainers,
                top_losers,
                snapshots,
            })
            .into_response()
        }
        Err(response) => response,
    }
}

async fn funnel_handler(Json(req): Json<FunnelRequest>) -> Response {
    let config = req.config.unwrap_or_else(FunnelConfig::signup_status);
    match run_blocking(move || config.run(&req.signups, req.report_date)).await {
        Ok(output) => Json::<FunnelOutput>(output).into_response(),
        Err(response) => response,
    }
}

async fn trend_handler(Json(req): Json<TrendRequest>) -> Response {
    let config = req.config.unwrap_or_else(TrendConfig::weekly_signups);
    let movers = req.movers;
    match run_blocking(move || config.run(&req.signups)).await {
        Ok(output) => {
            let trend = &output.trend;
            let top_gainers = trend.top_gainers(movers).into_iter().cloned().collect();
            let top_losers = trend.top_losers(movers).into_iter().cloned().collect();
            Json(TrendResponse {
                latest_week: trend.latest_week(),
                improving_share: trend.improving_share(),
                top_gainers,
                top_losers,
                output,
            })
            .into_response()
        }
        Err(response) => response,
    }
}

async fn movement_handler(Json(req): Json<MovementRequest>) -> Response {
    let result = run_blocking(move || ranking_movement(&req.before, &req.after, req.options)).await;
    match result {
        Ok(movement) => Json(MovementResponse {
            new_entries: movement.new_entries(),
            movement,
        })
        .into_response(),
        Err(response) => response,
    }
}

fn app(state: Arc<AppState>) -> Router {
    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/config", get(config_handler))
        .route("/reconcile", post(reconcile_handler))
        .route("/compare", post(compare_handler))
        .route("/funnel", post(funnel_handler))
        .route("/trend", post(trend_handler))
        .route("/movement", post(movement_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let state = Arc::new(AppState {
        default_config: PipelineConfig::hotel_signups(),
        started_at: Utc::now(),
    });

    info!("API listening on http://{}", bind);
    info!("Endpoints: GET /health, GET /config, POST /reconcile, POST /compare, POST /funnel, POST /trend, POST /movement");

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
