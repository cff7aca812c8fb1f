//! HTTP surface of the reconciliation server.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

use crate::api::{push_path, CATEGORIES_PATH, HEALTH_PATH, PRODUCTS_PATH};
use crate::models::{CategoriesResponse, ProductsResponse, PushResponse, RecordType};
use crate::server::reconcile::{ReconcileError, Reconciler};

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_id: Option<String>,
}

impl IntoResponse for ReconcileError {
    fn into_response(self) -> axum::response::Response {
        let (status, local_id, message) = match self {
            ReconcileError::Validation { local_id, message } => {
                (StatusCode::UNPROCESSABLE_ENTITY, local_id, message)
            }
            ReconcileError::Storage(message) => {
                error!(error = %message, "Reconciliation storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, None, message)
            }
        };
        let payload = ErrorResponse {
            success: false,
            error: message,
            local_id,
        };
        (status, Json(payload)).into_response()
    }
}

type ApiResult<T> = Result<T, ReconcileError>;

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ProductsQuery {
    branch_id: Option<i64>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(push_path(RecordType::Sale), post(push_sales))
        .route(push_path(RecordType::JobOrder), post(push_job_orders))
        .route(push_path(RecordType::Attendance), post(push_attendance))
        .route(CATEGORIES_PATH, get(categories))
        .route(PRODUCTS_PATH, get(products))
        .with_state(state)
}

async fn health() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

async fn push_sales(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<PushResponse>> {
    push(state, RecordType::Sale, body).await
}

async fn push_job_orders(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<PushResponse>> {
    push(state, RecordType::JobOrder, body).await
}

async fn push_attendance(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<PushResponse>> {
    push(state, RecordType::Attendance, body).await
}

/// Bodies look like `{ "sales": [ { "local_id": ..., ... } ] }`.
async fn push(state: AppState, record_type: RecordType, body: Bytes) -> ApiResult<Json<PushResponse>> {
    let records = extract_records(record_type, &body)?;
    debug!(record_type = %record_type, count = records.len(), "Push received");
    let reconciler = state.reconciler.clone();
    let resp = run_blocking(move || reconciler.push_values(record_type, records)).await?;
    Ok(Json(resp))
}

fn extract_records(record_type: RecordType, body: &[u8]) -> ApiResult<Vec<Value>> {
    let mut payload: Value =
        serde_json::from_slice(body).map_err(|e| ReconcileError::Validation {
            local_id: None,
            message: format!("invalid JSON body: {e}"),
        })?;
    match payload.get_mut(record_type.plural()).map(Value::take) {
        Some(Value::Array(records)) => Ok(records),
        _ => Err(ReconcileError::Validation {
            local_id: None,
            message: format!("request body must contain a `{}` array", record_type.plural()),
        }),
    }
}

async fn categories(State(state): State<AppState>) -> ApiResult<Json<CategoriesResponse>> {
    let reconciler = state.reconciler.clone();
    let categories = run_blocking(move || reconciler.pull_categories()).await?;
    Ok(Json(CategoriesResponse {
        success: true,
        categories,
    }))
}

async fn products(
    State(state): State<AppState>,
    Query(query): Query<ProductsQuery>,
) -> ApiResult<Json<ProductsResponse>> {
    let reconciler = state.reconciler.clone();
    let products = run_blocking(move || reconciler.pull_products(query.branch_id)).await?;
    Ok(Json(ProductsResponse {
        success: true,
        products,
    }))
}

/// SQLite work runs on the blocking pool.
async fn run_blocking<R, F>(f: F) -> ApiResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> ApiResult<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ReconcileError::Storage(format!("reconcile task failed: {e}")))?
}
