//! Reconciliation server API client.
//!
//! [`ReconciliationClient`] is the seam the sync manager talks through;
//! [`HttpClient`] implements it over HTTP with reqwest. Failures are
//! classified into the sync error taxonomy here so the manager never has to
//! parse status codes.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    CategoriesResponse, Category, Product, ProductsResponse, PushResponse, RecordType,
};

/// Timeout used specifically for the lightweight health check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

pub const HEALTH_PATH: &str = "/api/health";
pub const CATEGORIES_PATH: &str = "/api/pos/categories";
pub const PRODUCTS_PATH: &str = "/api/pos/products";

/// Push endpoint for a record type.
pub fn push_path(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Sale => "/api/pos/sales/sync",
        RecordType::JobOrder => "/api/pos/job-orders/sync",
        RecordType::Attendance => "/api/pos/attendance/sync",
    }
}

// ---------------------------------------------------------------------------
// Client seam
// ---------------------------------------------------------------------------

/// Client side of the reconciliation protocol.
pub trait ReconciliationClient: Send + Sync + 'static {
    /// Submit one batch of records of a single type. Each record carries
    /// `local_id`, `branch_id` and the domain fields.
    fn push(
        &self,
        record_type: RecordType,
        records: Vec<Value>,
    ) -> impl Future<Output = SyncResult<PushResponse>> + Send;

    fn pull_categories(&self) -> impl Future<Output = SyncResult<Vec<Category>>> + Send;

    fn pull_products(
        &self,
        branch_id: Option<i64>,
    ) -> impl Future<Output = SyncResult<Vec<Product>>> + Send;

    /// Whether the server is reachable right now.
    fn check_health(&self) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the server URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Every transport-level failure is transient: the record stays queued.
fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    let message = if err.is_connect() {
        format!("Cannot reach sync server at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    SyncError::TransientNetwork(message)
}

/// The server judged the payload itself.
fn is_validation_status(status: StatusCode) -> bool {
    status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY
}

/// Wrong credentials or wrong endpoint: retrying the same request cannot help
/// until the configuration changes.
fn is_refusal_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND
            | StatusCode::METHOD_NOT_ALLOWED
    )
}

/// Classify a non-2xx response. `body` is the raw response text. Anything
/// that is neither a payload rejection nor a refusal is retried.
fn status_error(status: StatusCode, body: &str) -> SyncError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "Unexpected response from sync server".to_string()
            } else {
                trimmed.to_string()
            }
        });
    let detail = format!("{message} (HTTP {})", status.as_u16());

    if is_validation_status(status) {
        SyncError::Validation(detail)
    } else if is_refusal_status(status) {
        SyncError::Refused(detail)
    } else {
        SyncError::TransientNetwork(detail)
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct HttpClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpClient {
    pub fn new(server_url: &str, api_key: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Permanent(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_server_url(server_url),
            api_key,
            client,
        })
    }

    /// Build from persisted settings. Fails when no server URL is configured.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let url = config
            .server_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| SyncError::Permanent("Sync server URL not configured".into()))?;
        Self::new(url, config.api_key.clone(), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform a request and decode the JSON body.
    ///
    /// `path` should include the leading slash, e.g. `/api/pos/sales/sync`.
    async fn fetch<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> SyncResult<R> {
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .client
            .request(method, &full_url)
            .header("Content-Type", "application/json");
        if let Some(key) = self.api_key.as_deref() {
            req = req.header("X-POS-API-Key", key);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !status.is_success() {
            let err = status_error(status, &body_text);
            debug!(path, status = status.as_u16(), error = %err, "Sync server request failed");
            return Err(err);
        }

        serde_json::from_str(&body_text).map_err(|e| {
            SyncError::TransientNetwork(format!("Invalid JSON from sync server: {e}"))
        })
    }
}

impl ReconciliationClient for HttpClient {
    async fn push(&self, record_type: RecordType, records: Vec<Value>) -> SyncResult<PushResponse> {
        let count = records.len();
        let mut body = serde_json::Map::new();
        body.insert(record_type.plural().to_string(), Value::Array(records));
        let body = Value::Object(body);
        let resp: PushResponse = self
            .fetch(Method::POST, push_path(record_type), &[], Some(body))
            .await?;
        if !resp.success {
            return Err(SyncError::Validation(
                resp.error
                    .unwrap_or_else(|| "Sync server reported failure".to_string()),
            ));
        }
        info!(
            record_type = %record_type,
            submitted = count,
            mapped = resp.mappings.len(),
            "Push batch accepted"
        );
        Ok(resp)
    }

    async fn pull_categories(&self) -> SyncResult<Vec<Category>> {
        let resp: CategoriesResponse = self.fetch(Method::GET, CATEGORIES_PATH, &[], None).await?;
        if !resp.success {
            return Err(SyncError::TransientNetwork(
                "Category pull reported failure".into(),
            ));
        }
        Ok(resp.categories)
    }

    async fn pull_products(&self, branch_id: Option<i64>) -> SyncResult<Vec<Product>> {
        let query: Vec<(&str, String)> = branch_id
            .map(|b| vec![("branch_id", b.to_string())])
            .unwrap_or_default();
        let resp: ProductsResponse = self.fetch(Method::GET, PRODUCTS_PATH, &query, None).await?;
        if !resp.success {
            return Err(SyncError::TransientNetwork(
                "Product pull reported failure".into(),
            ));
        }
        Ok(resp.products)
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}{HEALTH_PATH}", self.base_url);
        let start = Instant::now();
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(latency_ms = start.elapsed().as_millis() as u64, "health check passed");
                true
            }
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "health check failed");
                false
            }
            Err(e) => {
                debug!(error = %transport_error(&self.base_url, &e), "health check failed");
                false
            }
        }
    }
}
