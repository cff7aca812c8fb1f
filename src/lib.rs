//! Offline-first record synchronisation for The Small POS.
//!
//! Terminals write sales, job orders and attendance into a local SQLite
//! store while offline. [`SyncManager`] pushes them to the reconciliation
//! server in priority order once connectivity returns, retrying transient
//! failures with capped exponential backoff. The server side
//! ([`server::Reconciler`]) reconciles each record exactly once, keyed by its
//! client-generated `local_id`.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod local_store;
pub mod logging;
pub mod models;
pub mod progress;
pub mod server;
pub mod sync;

pub use api::{HttpClient, ReconciliationClient};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use local_store::{LocalStore, StatusSummary, TypeStatusCounts};
pub use models::{
    Attendance, Category, IdMapping, ItemKind, JobOrder, LocalRecord, Product, RecordType,
    Sale, SaleItem, SyncRecord, SyncStatus,
};
pub use progress::{ProgressHub, RunStatus, Subscription, SyncErrorEntry, SyncProgress};
pub use sync::{backoff_delay_ms, PullSummary, SyncManager};
