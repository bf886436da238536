// File: orchestrator/src/web/handlers.rs
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::constants::cleanup;
use crate::errors::OperationError;
use crate::launcher::OperationLauncher;
use crate::network::{NetworkChangeRequest, NetworkPlan, NetworkReconfiguration};
use crate::operation::{Operation, OperationSnapshot};
use crate::scan_queue::{ScanQueueStatus, ScanRequest};
use crate::snapshot::StaticSnapshot;
use crate::storage::{request_scan, DetachHostStorage};
use crate::web::{AppState, PoolHandle};

// Helper type for API responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<()>>)>;

type ApiError = (StatusCode, Json<ApiResponse<()>>);

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

fn api_error(status: StatusCode, message: String) -> ApiError {
    (status, Json(ApiResponse::error(message)))
}

fn operation_error_status(error: &OperationError) -> StatusCode {
    match error {
        OperationError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        OperationError::LocalPrecondition { .. } => StatusCode::BAD_REQUEST,
        OperationError::Cancelled => StatusCode::CONFLICT,
        OperationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        OperationError::RemoteTaskFailure { .. } | OperationError::Session(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

// Query parameters
#[derive(Deserialize)]
pub struct CleanupQuery {
    #[serde(default = "default_cleanup_hours")]
    pub max_hours: i64,
}

fn default_cleanup_hours() -> i64 {
    cleanup::HISTORY_RETENTION_HOURS
}

// Request bodies
#[derive(Deserialize)]
pub struct NetworkChangeBody {
    pub title: Option<String>,
    #[serde(flatten)]
    pub request: NetworkChangeRequest,
}

#[derive(Deserialize)]
pub struct DetachStorageBody {
    pub hosts: Vec<String>,
}

#[derive(Serialize)]
pub struct LaunchedOperation {
    pub operation_id: Uuid,
    pub title: String,
}

impl LaunchedOperation {
    fn from_operation(operation: &Operation) -> Self {
        Self {
            operation_id: operation.id(),
            title: operation.title(),
        }
    }
}

#[derive(Serialize)]
pub struct ScanResponse {
    pub status: &'static str,
    pub operation_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub disruption_expected: bool,
}

fn find_pool<'a>(state: &'a AppState, pool: &str) -> Result<&'a PoolHandle, ApiError> {
    state
        .pools
        .get(pool)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Pool {} not found", pool)))
}

async fn fetch_snapshot(pool_name: &str, pool: &PoolHandle) -> Result<StaticSnapshot, ApiError> {
    pool.snapshots.fetch_snapshot().await.map_err(|e| {
        error!("Failed to fetch snapshot for pool {}: {}", pool_name, e);
        api_error(
            StatusCode::BAD_GATEWAY,
            format!("Failed to fetch snapshot for pool {}: {}", pool_name, e),
        )
    })
}

/// Record the operation and queue it behind anything already running on its
/// connection
async fn launch(state: &AppState, operation: Arc<Operation>) -> Arc<Operation> {
    state.history.register(operation.clone()).await;
    drop(operation.run_serialized());
    operation
}

// === OPERATION HANDLERS ===

pub async fn list_operations(State(state): State<AppState>) -> ApiResult<Vec<OperationSnapshot>> {
    Ok(Json(ApiResponse::success(state.history.list().await)))
}

pub async fn get_operation(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<OperationSnapshot> {
    match state.history.find(id).await {
        Some(operation) => Ok(Json(ApiResponse::success(operation.snapshot()))),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Operation {} not found", id),
        )),
    }
}

pub async fn cancel_operation(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<Value> {
    info!("Operation cancellation requested for: {}", id);

    let operation = state.history.find(id).await.ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Operation {} not found", id),
        )
    })?;

    if operation.cancel() {
        info!("Cancellation requested for operation {}", id);
        Ok(Json(ApiResponse::success(json!({
            "message": format!("Cancellation requested for {}", operation.title()),
            "operation_id": id
        }))))
    } else {
        warn!("Operation {} cannot be cancelled", id);
        Err(api_error(
            StatusCode::CONFLICT,
            format!(
                "Operation {} cannot be cancelled in state {:?}",
                id,
                operation.state()
            ),
        ))
    }
}

pub async fn cleanup_operations(
    Query(query): Query<CleanupQuery>,
    State(state): State<AppState>,
) -> ApiResult<Value> {
    info!(
        "History cleanup requested for operations older than {} hours",
        query.max_hours
    );

    let cleaned_count = state.history.cleanup_finished(query.max_hours).await;

    Ok(Json(ApiResponse::success(json!({
        "message": format!("History cleanup completed: {} operations removed", cleaned_count),
        "cleaned_count": cleaned_count
    }))))
}

// === POOL HANDLERS ===

pub async fn list_pools(State(state): State<AppState>) -> ApiResult<Vec<PoolSummary>> {
    let mut pools: Vec<PoolSummary> = state
        .pools
        .iter()
        .map(|(name, pool)| PoolSummary {
            name: name.clone(),
            disruption_expected: pool.connection.disruption().is_expected(),
        })
        .collect();
    pools.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(ApiResponse::success(pools)))
}

pub async fn reconfigure_network(
    Path(pool_name): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<NetworkChangeBody>,
) -> ApiResult<LaunchedOperation> {
    info!("Network reconfiguration requested for pool {}", pool_name);

    let pool = find_pool(&state, &pool_name)?;
    let snapshot = fetch_snapshot(&pool_name, pool).await?;

    // Reject unresolvable requests before anything is launched
    if let Err(e) = NetworkPlan::resolve(&body.request, &snapshot) {
        warn!("Rejected network change for pool {}: {}", pool_name, e);
        return Err(api_error(operation_error_status(&e), e.to_string()));
    }

    let title = body
        .title
        .unwrap_or_else(|| format!("Reconfiguring network on {}", pool_name));
    let operation = NetworkReconfiguration::new(body.request, Arc::new(snapshot))
        .into_operation(pool.connection.clone(), title)
        .with_poll_settings(state.config.poll_settings());
    let operation = launch(&state, Arc::new(operation)).await;

    info!(
        "Started network reconfiguration {} on pool {}",
        operation.id(),
        pool_name
    );
    Ok(Json(ApiResponse::success(LaunchedOperation::from_operation(
        &operation,
    ))))
}

pub async fn detach_storage(
    Path(pool_name): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<DetachStorageBody>,
) -> ApiResult<LaunchedOperation> {
    info!(
        "Storage detach requested for {} hosts on pool {}",
        body.hosts.len(),
        pool_name
    );

    if body.hosts.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "No hosts given".to_string(),
        ));
    }

    let pool = find_pool(&state, &pool_name)?;
    let snapshot: Arc<StaticSnapshot> = Arc::new(fetch_snapshot(&pool_name, pool).await?);

    let settings = state.config.poll_settings();
    let detaches: Vec<Arc<Operation>> = body
        .hosts
        .iter()
        .map(|host| {
            let operation = DetachHostStorage::new(host.clone(), snapshot.clone())
                .with_refresh(pool.snapshots.clone())
                .into_operation(pool.connection.clone())
                .with_poll_settings(settings);
            Arc::new(operation)
        })
        .collect();

    // Every detach targets the same session, so the launcher runs them in turn
    let operation = OperationLauncher::new(
        format!(
            "Detaching storage from {} hosts on {}",
            detaches.len(),
            pool_name
        ),
        "Detaching storage",
        detaches,
    )
    .build();

    let operation = launch(&state, operation).await;
    Ok(Json(ApiResponse::success(LaunchedOperation::from_operation(
        &operation,
    ))))
}

pub async fn scan_storage(
    Path((pool_name, sr)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult<ScanResponse> {
    let pool = find_pool(&state, &pool_name)?;

    let settings = state.config.poll_settings();
    let response = match request_scan(&state.scans, &pool.connection, &sr, settings).await {
        ScanRequest::Started(op) => ScanResponse {
            status: "started",
            operation_id: Some(op.id()),
        },
        ScanRequest::Queued(op) => ScanResponse {
            status: "queued",
            operation_id: Some(op.id()),
        },
        ScanRequest::Duplicate => ScanResponse {
            status: "duplicate",
            operation_id: None,
        },
    };

    info!("Scan of {} on pool {}: {}", sr, pool_name, response.status);
    Ok(Json(ApiResponse::success(response)))
}

// === SCAN QUEUE HANDLERS ===

pub async fn get_scan_status(State(state): State<AppState>) -> ApiResult<ScanQueueStatus> {
    Ok(Json(ApiResponse::success(state.scans.status().await)))
}
