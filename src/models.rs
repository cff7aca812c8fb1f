//! Record types, payloads and wire DTOs shared by the client store, the sync
//! manager and the reconciliation server.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Record types and sync status
// ---------------------------------------------------------------------------

/// Client-originated transactional record kinds. Declaration order is the
/// priority tier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Sale,
    JobOrder,
    Attendance,
}

impl RecordType {
    /// Tiers in submission order.
    pub const TIERS: [RecordType; 3] = [
        RecordType::Sale,
        RecordType::JobOrder,
        RecordType::Attendance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Sale => "sale",
            RecordType::JobOrder => "job_order",
            RecordType::Attendance => "attendance",
        }
    }

    /// Collection key used in push request bodies.
    pub fn plural(&self) -> &'static str {
        match self {
            RecordType::Sale => "sales",
            RecordType::JobOrder => "job_orders",
            RecordType::Attendance => "attendance",
        }
    }

    /// Local table holding this record type.
    pub(crate) fn table(&self) -> &'static str {
        match self {
            RecordType::Sale => "local_sales",
            RecordType::JobOrder => "local_job_orders",
            RecordType::Attendance => "local_attendance",
        }
    }

    /// Human label for progress text ("Pushing sales 3/10").
    pub fn label(&self) -> &'static str {
        match self {
            RecordType::Sale => "sales",
            RecordType::JobOrder => "job orders",
            RecordType::Attendance => "attendance",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sale" => Ok(RecordType::Sale),
            "job_order" => Ok(RecordType::JobOrder),
            "attendance" => Ok(RecordType::Attendance),
            other => Err(format!("unknown record type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain payloads
// ---------------------------------------------------------------------------

/// A domain payload that can be stored locally and pushed for reconciliation.
pub trait SyncRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE: RecordType;

    /// Other offline records this payload refers to, with the type each
    /// reference must resolve to.
    fn local_refs(&self) -> Vec<(RecordType, String)> {
        Vec::new()
    }

    /// Fill server ids for local references found in `resolved`.
    fn apply_refs(&mut self, _resolved: &HashMap<String, i64>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    Product,
    Service,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SaleItem {
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
}

impl SaleItem {
    pub fn line_total(&self) -> f64 {
        self.quantity * self.unit_price
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sale {
    pub items: Vec<SaleItem>,
    pub total_amount: f64,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_order_id: Option<i64>,
    /// Sale settling a job order that was itself created offline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_order_local_id: Option<String>,
}

impl SyncRecord for Sale {
    const TYPE: RecordType = RecordType::Sale;

    fn local_refs(&self) -> Vec<(RecordType, String)> {
        self.job_order_local_id
            .iter()
            .map(|id| (RecordType::JobOrder, id.clone()))
            .collect()
    }

    fn apply_refs(&mut self, resolved: &HashMap<String, i64>) {
        if let Some(server_id) = self.job_order_local_id.as_ref().and_then(|id| resolved.get(id)) {
            self.job_order_id = Some(*server_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobOrder {
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    pub vehicle_plate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_model: Option<String>,
    pub labor_description: String,
    pub labor_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanic: Option<String>,
}

impl SyncRecord for JobOrder {
    const TYPE: RecordType = RecordType::JobOrder;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attendance {
    pub staff_id: String,
    pub clock_in: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_out: Option<DateTime<Utc>>,
}

impl SyncRecord for Attendance {
    const TYPE: RecordType = RecordType::Attendance;
}

// ---------------------------------------------------------------------------
// Local records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord<T> {
    pub local_id: String,
    pub server_id: Option<i64>,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    /// `None` once a record is permanently failed or synced.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub branch_id: i64,
    pub created_at: DateTime<Utc>,
    pub payload: T,
}

impl<T: SyncRecord> LocalRecord<T> {
    pub fn record_type(&self) -> RecordType {
        T::TYPE
    }
}

/// Persisted association between a client id and its canonical server id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub local_id: String,
    pub record_type: RecordType,
    pub server_id: i64,
}

// ---------------------------------------------------------------------------
// Reference entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStock {
    pub branch_id: i64,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<i64>,
    pub name: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default)]
    pub stock: Vec<BranchStock>,
}

impl Product {
    pub fn stock_for(&self, branch_id: i64) -> Option<f64> {
        self.stock
            .iter()
            .find(|s| s.branch_id == branch_id)
            .map(|s| s.quantity)
    }
}

/// Cacheable reference collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "rows", rename_all = "snake_case")]
pub enum ReferenceSnapshot {
    Categories(Vec<Category>),
    Products(Vec<Product>),
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

/// One record in a push request: client id, branch and domain fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRecord<T> {
    pub local_id: String,
    pub branch_id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub local_id: String,
    pub server_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub local_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_count: Option<usize>,
    /// Records refused individually under the per-item batch policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoriesResponse {
    pub success: bool,
    #[serde(default)]
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductsResponse {
    pub success: bool,
    #[serde(default)]
    pub products: Vec<Product>,
}
