//! HTTP API for burn intake, signer submissions, health and status

use crate::config::ApiConfig;
use crate::coordination::{RegisterOutcome, SignatureOutcome, SwapCoordinator};
use crate::error::{RelayerError, RelayerResult, ToolError};
use crate::state::SwapStats;
use crate::swap::{BurnEvent, Swap, SwapStatus};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SwapCoordinator>,
    pub threshold: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/swaps", post(register_swap).get(list_swaps))
        .route("/swaps/:tx_hash", get(get_swap))
        .route("/swaps/:tx_hash/signatures", post(submit_signature))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(e.to_string()))?;

    Ok(())
}

/// Maps relayer errors onto HTTP status codes
enum ApiError {
    BadRequest(String),
    Relayer(RelayerError),
}

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        Self::Relayer(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::BadRequest(message) => {
                return (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message }))
                    .into_response();
            }
            ApiError::Relayer(err) => err,
        };

        let status = match &err {
            RelayerError::InvalidBurnEvent(_) | RelayerError::InvalidSignature { .. } => {
                StatusCode::BAD_REQUEST
            }
            RelayerError::UnknownSwap { .. } => StatusCode::NOT_FOUND,
            RelayerError::AlreadyFinalized { .. } | RelayerError::DuplicateSwap { .. } => {
                StatusCode::CONFLICT
            }
            RelayerError::ChainTool(ToolError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            RelayerError::ChainTool(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", err);
        }

        (
            status,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - the store must be reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.coordinator.store().health_check().await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: store_ok,
            store: store_ok,
        }),
    )
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let swaps = state.coordinator.store().stats().await?;
    Ok(Json(StatsResponse {
        threshold: state.threshold,
        swaps,
    }))
}

async fn register_swap(
    State(state): State<AppState>,
    Json(event): Json<BurnEvent>,
) -> Result<Response, ApiError> {
    let response = match state.coordinator.register_swap(&event).await? {
        RegisterOutcome::Registered(swap) => (StatusCode::CREATED, Json(swap)).into_response(),
        RegisterOutcome::Duplicate => (
            StatusCode::OK,
            Json(DuplicateResponse {
                transaction_hash: event.swap_id().to_string(),
                duplicate: true,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

async fn list_swaps(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Swap>>, ApiError> {
    let store = state.coordinator.store();

    let swaps = match params.status {
        Some(status) => {
            let status: SwapStatus = status
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("unknown status {}", status)))?;
            store.list_swaps_by_status(status).await?
        }
        None => {
            let mut all = Vec::new();
            for status in SwapStatus::ALL {
                all.extend(store.list_swaps_by_status(status).await?);
            }
            all.sort_by_key(|s| s.created_at);
            all
        }
    };

    Ok(Json(swaps))
}

async fn get_swap(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Json<SwapDetail>, ApiError> {
    let store = state.coordinator.store();
    let swap = store
        .get_swap(&tx_hash)
        .await?
        .ok_or_else(|| RelayerError::UnknownSwap {
            tx_hash: tx_hash.clone(),
        })?;
    let signers = store
        .list_signatures(&tx_hash)
        .await?
        .into_iter()
        .map(|s| s.user)
        .collect::<Vec<_>>();

    Ok(Json(SwapDetail {
        signature_count: signers.len(),
        signers,
        swap,
    }))
}

async fn submit_signature(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
    Json(req): Json<SignatureRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .coordinator
        .record_signature(&tx_hash, &req.user, &req.signature)
        .await?;

    let (status, count, duplicate) = match outcome {
        SignatureOutcome::Recorded { count } => (StatusCode::ACCEPTED, count, false),
        SignatureOutcome::Duplicate { count } => (StatusCode::OK, count, true),
    };

    Ok((
        status,
        Json(SignatureResponse {
            transaction_hash: tx_hash,
            signature_count: count,
            threshold: state.threshold,
            duplicate,
        }),
    ))
}

// Request and response types

#[derive(Deserialize)]
struct ListParams {
    status: Option<String>,
}

#[derive(Deserialize)]
struct SignatureRequest {
    user: String,
    signature: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    threshold: usize,
    swaps: SwapStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DuplicateResponse {
    transaction_hash: String,
    duplicate: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapDetail {
    #[serde(flatten)]
    swap: Swap,
    signature_count: usize,
    signers: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignatureResponse {
    transaction_hash: String,
    signature_count: usize,
    threshold: usize,
    duplicate: bool,
}
