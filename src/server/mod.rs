//! Reconciliation server: canonical storage, the transactional push/pull
//! service and its HTTP surface.

pub mod db;
pub mod reconcile;
pub mod routes;

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::ReconciliationClient;
use crate::error::{SyncError, SyncResult};
use crate::models::{Category, Product, PushResponse, RecordType};

pub use db::ServerDb;
pub use reconcile::{BatchPolicy, ReconcileError, Reconciler};
pub use routes::{router, AppState};

impl From<ReconcileError> for SyncError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Validation { message, .. } => SyncError::Validation(message),
            // The server's storage is remote from the client's point of view.
            ReconcileError::Storage(message) => SyncError::TransientNetwork(message),
        }
    }
}

/// Calls a [`Reconciler`] directly, without HTTP. Used for embedding the
/// server next to a client and in tests. Can be switched offline to simulate
/// connectivity loss.
#[derive(Clone)]
pub struct InProcessClient {
    reconciler: Arc<Reconciler>,
    online: Arc<AtomicBool>,
}

impl InProcessClient {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::TransientNetwork("sync server offline".into()))
        }
    }

    async fn blocking<R, F>(&self, f: F) -> SyncResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Reconciler) -> Result<R, ReconcileError> + Send + 'static,
    {
        self.ensure_online()?;
        let reconciler = self.reconciler.clone();
        tokio::task::spawn_blocking(move || f(reconciler.as_ref()))
            .await
            .map_err(|e| SyncError::TransientNetwork(format!("reconcile task failed: {e}")))?
            .map_err(SyncError::from)
    }
}

impl ReconciliationClient for InProcessClient {
    async fn push(&self, record_type: RecordType, records: Vec<Value>) -> SyncResult<PushResponse> {
        self.blocking(move |r| r.push_values(record_type, records)).await
    }

    async fn pull_categories(&self) -> SyncResult<Vec<Category>> {
        self.blocking(|r| r.pull_categories()).await
    }

    async fn pull_products(&self, branch_id: Option<i64>) -> SyncResult<Vec<Product>> {
        self.blocking(move |r| r.pull_products(branch_id)).await
    }

    async fn check_health(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
