//! Sync queue manager: pushes offline records to the reconciliation server in
//! priority tiers and reports progress.
//!
//! A run makes passes over the tiers (sales, then job orders, then
//! attendance). Each tier snapshots the eligible set when it starts and is
//! pushed in FIFO batches. Every record is attempted at most once per run;
//! the run ends when a pass finds nothing left to attempt. Records whose
//! local references are not mapped yet are deferred to a later pass without
//! consuming a retry; a reference that can never map fails the record.
//!
//! Only one run is active per manager. Pause and abandon are honoured at
//! batch boundaries; an in-flight batch always completes and its results are
//! applied. A request the server refuses outright ends the run in `error`
//! and hands the claimed records back without spending their retries.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ReconciliationClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::local_store::LocalStore;
use crate::models::{
    Attendance, JobOrder, LocalRecord, PushRecord, PushResponse, RecordType, ReferenceSnapshot,
    Sale, SyncRecord,
};
use crate::progress::{ProgressHub, RunStatus, Subscription, SyncErrorEntry, SyncProgress};

/// Backoff before the next attempt after the `attempt`-th consecutive
/// transient failure: `min(base * 2^attempt, cap)`.
pub fn backoff_delay_ms(attempt: u32, base_ms: i64, cap_ms: i64) -> i64 {
    let factor = 1i64 << attempt.min(62);
    base_ms.max(0).saturating_mul(factor).min(cap_ms.max(0))
}

#[derive(Debug, Default)]
struct RunControl {
    active: bool,
    pause_requested: bool,
    abandon_requested: bool,
}

enum Checkpoint {
    Continue,
    Resumed,
    Abandon,
}

enum TierOutcome {
    Done,
    /// Resumed after a pause: start over from the first tier.
    Restart,
    Abandoned,
}

enum RunEnd {
    Finished,
    Abandoned,
}

enum Prepared<T> {
    Ready(LocalRecord<T>, Value),
    Deferred(Vec<String>),
    Unresolvable(LocalRecord<T>, String),
}

struct RunState {
    progress: SyncProgress,
    attempted: HashSet<(RecordType, String)>,
    attempted_in_pass: usize,
    deferred_in_pass: usize,
}

/// Counts of rows written by [`SyncManager::pull_reference_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullSummary {
    pub categories: usize,
    pub products: usize,
}

/// Releases the run claim however the run future ends.
struct ActiveRun<'a, C: ReconciliationClient> {
    manager: &'a SyncManager<C>,
}

impl<C: ReconciliationClient> Drop for ActiveRun<'_, C> {
    fn drop(&mut self) {
        if let Ok(mut control) = self.manager.control.lock() {
            *control = RunControl::default();
        }
    }
}

pub struct SyncManager<C> {
    store: LocalStore,
    client: Arc<C>,
    config: SyncConfig,
    progress: ProgressHub,
    control: Mutex<RunControl>,
    wake: Notify,
}

impl<C: ReconciliationClient> SyncManager<C> {
    pub fn new(store: LocalStore, client: Arc<C>, config: SyncConfig) -> Self {
        Self {
            store,
            client,
            config: config.sanitized(),
            progress: ProgressHub::new(),
            control: Mutex::new(RunControl::default()),
            wake: Notify::new(),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> SyncProgress {
        self.progress.latest()
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        self.progress.subscribe(observer)
    }

    pub fn watch(&self) -> watch::Receiver<SyncProgress> {
        self.progress.watch()
    }

    pub fn is_running(&self) -> bool {
        self.control.lock().map(|c| c.active).unwrap_or(false)
    }

    // -- Run control --------------------------------------------------------

    fn try_claim(&self) -> bool {
        match self.control.lock() {
            Ok(mut control) if !control.active => {
                *control = RunControl {
                    active: true,
                    ..RunControl::default()
                };
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!("sync control lock poisoned: {e}");
                false
            }
        }
    }

    fn flags(&self) -> (bool, bool) {
        self.control
            .lock()
            .map(|c| (c.pause_requested, c.abandon_requested))
            .unwrap_or((false, true))
    }

    /// Run a sync to completion. When a run is already active no second run
    /// is created and the current snapshot is returned unchanged.
    pub async fn sync_now(&self) -> SyncProgress {
        if !self.try_claim() {
            debug!("Sync already running; returning current progress");
            return self.progress.latest();
        }
        self.run_claimed().await
    }

    /// Start a run in the background. Returns `false` when one is already
    /// active.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.try_claim() {
            debug!("Sync already running; start ignored");
            return false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_claimed().await;
        });
        true
    }

    /// Stop scheduling new batches. The status turns `paused` at once; the
    /// batch in flight still finishes and its results are applied.
    pub fn pause(&self) -> bool {
        let requested = match self.control.lock() {
            Ok(mut control) if control.active && !control.pause_requested => {
                control.pause_requested = true;
                true
            }
            _ => false,
        };
        if requested {
            info!("Sync pause requested");
            self.progress.update_if(|p| {
                if p.status != RunStatus::Syncing {
                    return false;
                }
                p.status = RunStatus::Paused;
                true
            });
        }
        requested
    }

    pub fn resume(&self) -> bool {
        let resumed = match self.control.lock() {
            Ok(mut control) if control.active && control.pause_requested => {
                control.pause_requested = false;
                true
            }
            _ => false,
        };
        if resumed {
            info!("Sync resume requested");
            self.progress.update_if(|p| {
                if p.status != RunStatus::Paused {
                    return false;
                }
                p.status = RunStatus::Syncing;
                true
            });
            self.wake.notify_one();
        }
        resumed
    }

    /// End the active run at the next batch boundary (immediately when
    /// paused). The run finishes with status `idle`.
    pub fn abandon(&self) -> bool {
        let requested = match self.control.lock() {
            Ok(mut control) if control.active => {
                control.abandon_requested = true;
                true
            }
            _ => false,
        };
        if requested {
            info!("Sync abandon requested");
            self.wake.notify_one();
        }
        requested
    }

    // -- Run ----------------------------------------------------------------

    async fn run_claimed(&self) -> SyncProgress {
        let _active = ActiveRun { manager: self };
        let mut run = RunState {
            progress: SyncProgress::started(Utc::now()),
            attempted: HashSet::new(),
            attempted_in_pass: 0,
            deferred_in_pass: 0,
        };
        info!("Sync run started");
        self.progress.publish(run.progress.clone());

        let outcome = self.run_passes(&mut run).await;

        let mut progress = run.progress;
        progress.completed_at = Some(Utc::now());
        match outcome {
            Ok(RunEnd::Finished) => {
                progress.status = RunStatus::Complete;
                progress.current_step = format!(
                    "Sync complete: {} synced, {} failed",
                    progress.completed_items, progress.failed_items
                );
                info!(
                    synced = progress.completed_items,
                    failed = progress.failed_items,
                    permanent = progress.errors.len(),
                    "Sync run complete"
                );
            }
            Ok(RunEnd::Abandoned) => {
                progress.status = RunStatus::Idle;
                progress.current_step = "Sync abandoned".to_string();
                info!(synced = progress.completed_items, "Sync run abandoned");
            }
            Err(e) => {
                error!(error = %e, "Sync run aborted");
                progress.status = RunStatus::Error;
                progress.current_step = "Sync failed".to_string();
                progress.fatal_error = Some(e.to_string());
            }
        }
        self.progress.publish(progress.clone());
        progress
    }

    async fn run_passes(&self, run: &mut RunState) -> SyncResult<RunEnd> {
        let mut pass = 0u32;
        'passes: loop {
            pass += 1;
            run.attempted_in_pass = 0;
            run.deferred_in_pass = 0;

            for record_type in RecordType::TIERS {
                let outcome = match record_type {
                    RecordType::Sale => self.push_tier::<Sale>(run).await?,
                    RecordType::JobOrder => self.push_tier::<JobOrder>(run).await?,
                    RecordType::Attendance => self.push_tier::<Attendance>(run).await?,
                };
                match outcome {
                    TierOutcome::Done => {}
                    TierOutcome::Restart => continue 'passes,
                    TierOutcome::Abandoned => return Ok(RunEnd::Abandoned),
                }
            }

            debug!(
                pass,
                attempted = run.attempted_in_pass,
                deferred = run.deferred_in_pass,
                "Sync pass finished"
            );
            if run.attempted_in_pass == 0 {
                if run.deferred_in_pass > 0 {
                    info!(
                        deferred = run.deferred_in_pass,
                        "Records left pending on unsynced references"
                    );
                }
                return Ok(RunEnd::Finished);
            }
        }
    }

    /// Publish the run's snapshot, reflecting a pause requested while a
    /// batch was in flight.
    fn emit(&self, run: &mut RunState) {
        let (paused, abandoned) = self.flags();
        run.progress.status = if paused && !abandoned {
            RunStatus::Paused
        } else {
            RunStatus::Syncing
        };
        self.progress.publish(run.progress.clone());
    }

    async fn checkpoint(&self, run: &mut RunState) -> Checkpoint {
        let mut waited = false;
        loop {
            let (paused, abandoned) = self.flags();
            if abandoned {
                return Checkpoint::Abandon;
            }
            if !paused {
                if !waited {
                    return Checkpoint::Continue;
                }
                info!("Sync resumed");
                run.progress.status = RunStatus::Syncing;
                run.progress.current_step = "Resuming sync".to_string();
                self.progress.publish(run.progress.clone());
                return Checkpoint::Resumed;
            }
            if !waited {
                waited = true;
                info!("Sync paused");
                run.progress.status = RunStatus::Paused;
                run.progress.current_step = "Paused".to_string();
                self.progress.publish(run.progress.clone());
            }
            self.wake.notified().await;
        }
    }

    async fn push_tier<T: SyncRecord>(&self, run: &mut RunState) -> SyncResult<TierOutcome> {
        let tier_now = Utc::now();
        let total = self.store.count_eligible(T::TYPE, tier_now)?;
        if total == 0 {
            return Ok(TierOutcome::Done);
        }

        let mut cursor = self.store.list_eligible::<T>(tier_now);
        let mut seen = 0usize;
        loop {
            match self.checkpoint(run).await {
                Checkpoint::Continue => {}
                Checkpoint::Resumed => return Ok(TierOutcome::Restart),
                Checkpoint::Abandon => return Ok(TierOutcome::Abandoned),
            }

            let mut batch = Vec::with_capacity(self.config.batch_size);
            while batch.len() < self.config.batch_size {
                let Some(record) = cursor.next() else {
                    break;
                };
                let record = record?;
                seen += 1;
                if run.attempted.contains(&(T::TYPE, record.local_id.clone())) {
                    continue;
                }
                match self.prepare(record)? {
                    Prepared::Ready(record, value) => batch.push((record, value)),
                    Prepared::Deferred(missing) => {
                        run.deferred_in_pass += 1;
                        debug!(record_type = %T::TYPE, ?missing, "Record deferred on unsynced references");
                    }
                    Prepared::Unresolvable(record, reason) => {
                        self.fail_unresolvable(run, &record, &reason)?;
                    }
                }
            }
            if batch.is_empty() {
                return Ok(TierOutcome::Done);
            }

            run.progress.current_step =
                format!("Pushing {} {}/{}", T::TYPE.label(), seen.min(total), total.max(seen));
            self.push_batch(run, batch).await?;
            self.emit(run);
        }
    }

    /// Resolve local references and build the wire record. Defers when a
    /// referenced record may still sync and gives up when it never can.
    fn prepare<T: SyncRecord>(&self, record: LocalRecord<T>) -> SyncResult<Prepared<T>> {
        let mut payload = record.payload.clone();
        let refs = payload.local_refs();
        if !refs.is_empty() {
            let resolved = self.store.resolve_refs(&refs)?;
            let mut missing = Vec::new();
            for (ref_type, ref_id) in refs {
                if resolved.contains_key(&ref_id) {
                    continue;
                }
                if let Some(reason) = self.store.unresolvable_reason(ref_type, &ref_id)? {
                    return Ok(Prepared::Unresolvable(record, reason));
                }
                missing.push(ref_id);
            }
            if !missing.is_empty() {
                return Ok(Prepared::Deferred(missing));
            }
            payload.apply_refs(&resolved);
        }
        let value = serde_json::to_value(PushRecord {
            local_id: record.local_id.clone(),
            branch_id: record.branch_id,
            created_at: record.created_at,
            payload,
        })?;
        Ok(Prepared::Ready(record, value))
    }

    async fn push_batch<T: SyncRecord>(
        &self,
        run: &mut RunState,
        batch: Vec<(LocalRecord<T>, Value)>,
    ) -> SyncResult<()> {
        let ids: Vec<String> = batch.iter().map(|(r, _)| r.local_id.clone()).collect();
        for id in &ids {
            run.attempted.insert((T::TYPE, id.clone()));
        }
        run.attempted_in_pass += ids.len();
        self.store.mark_syncing(T::TYPE, &ids)?;

        let (records, values): (Vec<LocalRecord<T>>, Vec<Value>) = batch.into_iter().unzip();
        match self.client.push(T::TYPE, values.clone()).await {
            Ok(resp) => self.apply_response(run, &records, resp),
            Err(e) if e.is_fatal() => Err(self.release_batch(&records, e)),
            Err(SyncError::Validation(message)) if records.len() > 1 => {
                warn!(
                    record_type = %T::TYPE,
                    size = records.len(),
                    error = %message,
                    "Batch rejected; resubmitting records one at a time"
                );
                for (record, value) in records.iter().zip(values) {
                    let single = std::slice::from_ref(record);
                    match self.client.push(T::TYPE, vec![value]).await {
                        Ok(resp) => self.apply_response(run, single, resp)?,
                        Err(e) if e.is_fatal() => return Err(self.release_batch(&records, e)),
                        Err(e) => self.apply_error(run, single, e)?,
                    }
                }
                Ok(())
            }
            Err(e) => self.apply_error(run, &records, e),
        }
    }

    /// Give back every record of the batch still claimed after a run-ending
    /// failure. Returns the failure for the caller to propagate.
    fn release_batch<T: SyncRecord>(&self, records: &[LocalRecord<T>], err: SyncError) -> SyncError {
        let ids: Vec<String> = records.iter().map(|r| r.local_id.clone()).collect();
        match self.store.release_syncing(T::TYPE, &ids, &err.to_string()) {
            Ok(released) => {
                warn!(record_type = %T::TYPE, released, error = %err, "Push refused; batch released")
            }
            Err(e) => error!(record_type = %T::TYPE, error = %e, "Failed to release batch"),
        }
        err
    }

    fn apply_response<T: SyncRecord>(
        &self,
        run: &mut RunState,
        records: &[LocalRecord<T>],
        resp: PushResponse,
    ) -> SyncResult<()> {
        let mapped: HashMap<&str, i64> = resp
            .mappings
            .iter()
            .map(|m| (m.local_id.as_str(), m.server_id))
            .collect();
        let rejected: HashMap<&str, &str> = resp
            .rejected
            .iter()
            .map(|r| (r.local_id.as_str(), r.error.as_str()))
            .collect();

        for record in records {
            let local_id = record.local_id.as_str();
            if let Some(server_id) = mapped.get(local_id) {
                self.store.mark_synced(T::TYPE, local_id, *server_id)?;
                run.progress.completed_items += 1;
            } else if let Some(message) = rejected.get(local_id) {
                self.fail_permanent(run, T::TYPE, local_id, message)?;
            } else {
                self.fail_transient(
                    run,
                    T::TYPE,
                    local_id,
                    record.retry_count,
                    "server returned no mapping",
                )?;
            }
        }
        Ok(())
    }

    fn apply_error<T: SyncRecord>(
        &self,
        run: &mut RunState,
        records: &[LocalRecord<T>],
        err: SyncError,
    ) -> SyncResult<()> {
        match err {
            SyncError::TransientNetwork(message) => {
                debug!(record_type = %T::TYPE, size = records.len(), error = %message, "Transient push failure");
                for record in records {
                    self.fail_transient(run, T::TYPE, &record.local_id, record.retry_count, &message)?;
                }
                Ok(())
            }
            SyncError::Validation(message) | SyncError::Permanent(message) => {
                for record in records {
                    self.fail_permanent(run, T::TYPE, &record.local_id, &message)?;
                }
                Ok(())
            }
            SyncError::Storage(_) | SyncError::Refused(_) => Err(err),
        }
    }

    /// A record whose reference can never map is claimed and failed without
    /// being pushed.
    fn fail_unresolvable<T: SyncRecord>(
        &self,
        run: &mut RunState,
        record: &LocalRecord<T>,
        reason: &str,
    ) -> SyncResult<()> {
        let ids = [record.local_id.clone()];
        run.attempted.insert((T::TYPE, record.local_id.clone()));
        run.attempted_in_pass += 1;
        self.store.mark_syncing(T::TYPE, &ids)?;
        self.fail_permanent(run, T::TYPE, &record.local_id, reason)
    }

    fn fail_transient(
        &self,
        run: &mut RunState,
        record_type: RecordType,
        local_id: &str,
        retry_count: u32,
        message: &str,
    ) -> SyncResult<()> {
        let attempt = retry_count.saturating_add(1);
        if attempt > self.config.max_retries {
            let message = format!("retries exhausted after {attempt} attempts: {message}");
            return self.fail_permanent(run, record_type, local_id, &message);
        }
        let delay_ms = backoff_delay_ms(attempt, self.config.base_delay_ms, self.config.cap_delay_ms);
        let next_attempt_at = Utc::now() + ChronoDuration::milliseconds(delay_ms);
        self.store
            .mark_failed(record_type, local_id, message, Some(next_attempt_at))?;
        run.progress.failed_items += 1;
        debug!(
            record_type = %record_type,
            local_id,
            attempt,
            delay_ms,
            "Record rescheduled after transient failure"
        );
        Ok(())
    }

    fn fail_permanent(
        &self,
        run: &mut RunState,
        record_type: RecordType,
        local_id: &str,
        message: &str,
    ) -> SyncResult<()> {
        self.store.mark_failed(record_type, local_id, message, None)?;
        run.progress.failed_items += 1;
        run.progress.errors.push(SyncErrorEntry {
            record_type,
            local_id: local_id.to_string(),
            message: message.to_string(),
        });
        warn!(record_type = %record_type, local_id, error = %message, "Record permanently failed");
        Ok(())
    }

    // -- Reference data -----------------------------------------------------

    /// Replace the category and product caches with fresh server snapshots.
    pub async fn pull_reference_data(&self, branch_id: Option<i64>) -> SyncResult<PullSummary> {
        let categories = self.client.pull_categories().await?;
        let products = self.client.pull_products(branch_id).await?;
        let summary = PullSummary {
            categories: self
                .store
                .replace_snapshot(&ReferenceSnapshot::Categories(categories))?,
            products: self
                .store
                .replace_snapshot(&ReferenceSnapshot::Products(products))?,
        };
        info!(
            categories = summary.categories,
            products = summary.products,
            branch_id,
            "Reference data refreshed"
        );
        Ok(summary)
    }

    // -- Background loop ----------------------------------------------------

    /// Every `interval`: health check, reference pull, then a sync run.
    /// Work is skipped while the server is unreachable.
    pub fn spawn_auto_sync(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!("Auto-sync loop started (interval: {}s)", interval.as_secs_f64());
            let mut previous_online: Option<bool> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Auto-sync loop stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                if !this.client.check_health().await {
                    if previous_online != Some(false) {
                        info!("Sync server unreachable; keeping queue pending");
                    }
                    previous_online = Some(false);
                    continue;
                }
                if previous_online == Some(false) {
                    info!("Sync server reachable again; resuming queued sync");
                }
                previous_online = Some(true);

                if let Err(e) = this.pull_reference_data(this.config.branch_id).await {
                    warn!("Reference pull failed: {e}");
                }

                let progress = this.sync_now().await;
                if progress.status == RunStatus::Error {
                    warn!(
                        error = progress.fatal_error.as_deref().unwrap_or("unknown"),
                        "Auto-sync run failed"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemKind, SaleItem, SyncStatus};
    use crate::server::{BatchPolicy, InProcessClient, Reconciler};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process server with scripted failures, a call log and an optional
    /// gate that holds the first push until released.
    struct TestClient {
        inner: InProcessClient,
        calls: Mutex<Vec<(RecordType, Vec<String>, usize)>>,
        failures: Mutex<VecDeque<SyncError>>,
        gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
        health_checks: AtomicUsize,
    }

    impl TestClient {
        fn new() -> Self {
            let reconciler = Reconciler::in_memory(BatchPolicy::AllOrNothing).unwrap();
            Self {
                inner: InProcessClient::new(Arc::new(reconciler)),
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                gate: Mutex::new(None),
                health_checks: AtomicUsize::new(0),
            }
        }

        fn reconciler(&self) -> &Reconciler {
            self.inner.reconciler()
        }

        fn fail_next(&self, err: SyncError) {
            self.failures.lock().unwrap().push_back(err);
        }

        /// Returns (entered, release).
        fn hold_first_push(&self) -> (Arc<Notify>, Arc<Notify>) {
            let entered = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
            (entered, release)
        }

        fn calls(&self) -> Vec<(RecordType, Vec<String>, usize)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ReconciliationClient for TestClient {
        async fn push(&self, record_type: RecordType, records: Vec<Value>) -> SyncResult<PushResponse> {
            let ids: Vec<String> = records
                .iter()
                .filter_map(|r| r["local_id"].as_str().map(str::to_string))
                .collect();
            let gate = self.gate.lock().unwrap().take();
            if let Some((entered, release)) = gate {
                entered.notify_one();
                release.notified().await;
            }
            let scripted = self.failures.lock().unwrap().pop_front();
            let result = match scripted {
                Some(err) => Err(err),
                None => self.inner.push(record_type, records).await,
            };
            let mapped = result.as_ref().map(|r| r.mappings.len()).unwrap_or(0);
            self.calls.lock().unwrap().push((record_type, ids, mapped));
            result
        }

        async fn pull_categories(&self) -> SyncResult<Vec<crate::models::Category>> {
            self.inner.pull_categories().await
        }

        async fn pull_products(&self, branch_id: Option<i64>) -> SyncResult<Vec<crate::models::Product>> {
            self.inner.pull_products(branch_id).await
        }

        async fn check_health(&self) -> bool {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            self.inner.check_health().await
        }
    }

    fn config(batch_size: usize) -> SyncConfig {
        SyncConfig {
            branch_id: Some(1),
            batch_size,
            base_delay_ms: 1_000,
            cap_delay_ms: 60_000,
            max_retries: 3,
            ..SyncConfig::default()
        }
    }

    fn manager(batch_size: usize) -> Arc<SyncManager<TestClient>> {
        manager_with(config(batch_size))
    }

    fn manager_with(config: SyncConfig) -> Arc<SyncManager<TestClient>> {
        let store = LocalStore::in_memory().unwrap();
        Arc::new(SyncManager::new(store, Arc::new(TestClient::new()), config))
    }

    fn service_sale(name: &str) -> Sale {
        Sale {
            items: vec![SaleItem {
                kind: ItemKind::Service,
                name: name.into(),
                quantity: 1.0,
                unit_price: 25.0,
                ..Default::default()
            }],
            total_amount: 25.0,
            ..Default::default()
        }
    }

    fn job(plate: &str) -> JobOrder {
        JobOrder {
            customer_name: "Sam".into(),
            vehicle_plate: plate.into(),
            labor_description: "Tyre rotation".into(),
            labor_cost: 40.0,
            ..Default::default()
        }
    }

    fn shift(staff: &str) -> Attendance {
        Attendance {
            staff_id: staff.into(),
            clock_in: Utc::now(),
            clock_out: None,
        }
    }

    async fn wait_until(
        rx: &mut watch::Receiver<SyncProgress>,
        condition: impl FnMut(&SyncProgress) -> bool,
    ) -> SyncProgress {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
            .await
            .expect("timed out waiting for progress")
            .expect("progress channel closed")
            .clone()
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SyncProgress>,
        status: RunStatus,
    ) -> SyncProgress {
        wait_until(rx, |p| p.status == status).await
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay_ms(1, 5_000, 300_000), 10_000);
        assert_eq!(backoff_delay_ms(2, 5_000, 300_000), 20_000);
        assert_eq!(backoff_delay_ms(6, 5_000, 300_000), 300_000);
        assert_eq!(backoff_delay_ms(200, 5_000, 300_000), 300_000);
        let delays: Vec<i64> = (0..12).map(|k| backoff_delay_ms(k, 700, 90_000)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_tiers_submitted_in_priority_order() {
        let mgr = manager(10);
        let store = mgr.store();
        let a1 = store.create_local(1, &shift("staff-1")).unwrap();
        let j1 = store.create_local(1, &job("J-1")).unwrap();
        let s1 = store.create_local(1, &service_sale("Wash")).unwrap();
        let a2 = store.create_local(1, &shift("staff-2")).unwrap();
        let s2 = store.create_local(1, &service_sale("Polish")).unwrap();

        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        assert_eq!(progress.completed_items, 5);

        let calls = mgr.client().calls();
        let order: Vec<(RecordType, Vec<String>)> =
            calls.into_iter().map(|(t, ids, _)| (t, ids)).collect();
        assert_eq!(
            order,
            vec![
                (RecordType::Sale, vec![s1, s2]),
                (RecordType::JobOrder, vec![j1]),
                (RecordType::Attendance, vec![a1, a2]),
            ]
        );
    }

    #[tokio::test]
    async fn test_batches_preserve_fifo_within_tier() {
        let mgr = manager(2);
        let ids: Vec<String> = (0..5)
            .map(|i| mgr.store().create_local(1, &service_sale(&format!("S{i}"))).unwrap())
            .collect();

        let progress = mgr.sync_now().await;
        assert_eq!(progress.completed_items, 5);

        let batches: Vec<Vec<String>> = mgr.client().calls().into_iter().map(|(_, ids, _)| ids).collect();
        assert_eq!(batches, vec![ids[0..2].to_vec(), ids[2..4].to_vec(), ids[4..5].to_vec()]);
    }

    #[tokio::test]
    async fn test_transient_failure_reschedules_with_backoff() {
        let mgr = manager(1);
        let first = mgr.store().create_local(1, &service_sale("A")).unwrap();
        let second = mgr.store().create_local(1, &service_sale("B")).unwrap();
        mgr.client()
            .fail_next(SyncError::TransientNetwork("HTTP 503".into()));

        let before = Utc::now();
        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        assert_eq!(progress.completed_items, 1);
        assert_eq!(progress.failed_items, 1);
        assert!(progress.errors.is_empty(), "transient failures are not surfaced");

        let failed = mgr.store().get::<Sale>(&first).unwrap().unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        let delay = failed.next_attempt_at.unwrap() - before;
        // stored timestamps are truncated to milliseconds
        assert!(delay >= ChronoDuration::milliseconds(1_999));
        assert!(delay < ChronoDuration::milliseconds(4_000));

        let synced = mgr.store().get::<Sale>(&second).unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_permanent_and_continues() {
        let mut cfg = config(1);
        cfg.base_delay_ms = 0;
        cfg.max_retries = 2;
        let mgr = manager_with(cfg);
        let doomed = mgr.store().create_local(1, &service_sale("A")).unwrap();
        let healthy = mgr.store().create_local(1, &job("OK-1")).unwrap();

        for round in 1..=2 {
            mgr.client()
                .fail_next(SyncError::TransientNetwork("timeout".into()));
            let progress = mgr.sync_now().await;
            assert!(progress.errors.is_empty(), "round {round}");
        }
        let record = mgr.store().get::<Sale>(&doomed).unwrap().unwrap();
        assert_eq!(record.retry_count, 2);
        assert!(record.next_attempt_at.is_some());

        mgr.client()
            .fail_next(SyncError::TransientNetwork("timeout".into()));
        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        assert_eq!(progress.errors.len(), 1);
        assert_eq!(progress.errors[0].local_id, doomed);
        assert!(progress.errors[0].message.starts_with("retries exhausted"));

        let record = mgr.store().get::<Sale>(&doomed).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.next_attempt_at, None);
        let job = mgr.store().get::<JobOrder>(&healthy).unwrap().unwrap();
        assert_eq!(job.sync_status, SyncStatus::Synced);

        let calls_before = mgr.client().calls().len();
        let progress = mgr.sync_now().await;
        assert_eq!(progress.completed_items, 0);
        assert_eq!(mgr.client().calls().len(), calls_before);

        assert!(mgr.store().requeue(RecordType::Sale, &doomed).unwrap());
        let progress = mgr.sync_now().await;
        assert_eq!(progress.completed_items, 1);
    }

    #[tokio::test]
    async fn test_invalid_record_isolated_from_batch() {
        let mgr = manager(10);
        let good_a = mgr.store().create_local(1, &service_sale("A")).unwrap();
        let bad = mgr
            .store()
            .create_local(1, &Sale { items: Vec::new(), ..Default::default() })
            .unwrap();
        let good_b = mgr.store().create_local(1, &service_sale("B")).unwrap();

        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        assert_eq!(progress.completed_items, 2);
        assert_eq!(progress.failed_items, 1);
        assert_eq!(progress.errors.len(), 1);
        assert_eq!(progress.errors[0].local_id, bad);

        let calls = mgr.client().calls();
        assert_eq!(calls.len(), 4, "one batch then three single resubmissions");
        assert_eq!(calls[0].1.len(), 3);

        for id in [&good_a, &good_b] {
            let record = mgr.store().get::<Sale>(id).unwrap().unwrap();
            assert_eq!(record.sync_status, SyncStatus::Synced);
        }
        let record = mgr.store().get::<Sale>(&bad).unwrap().unwrap();
        assert_eq!(record.next_attempt_at, None);
        assert_eq!(mgr.client().reconciler().entity_count(RecordType::Sale).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reference_to_unsynced_job_order_is_deferred() {
        let mgr = manager(10);
        let job_id = mgr.store().create_local(1, &job("REF-1")).unwrap();
        let mut sale = service_sale("Labour");
        sale.job_order_local_id = Some(job_id.clone());
        let sale_id = mgr.store().create_local(1, &sale).unwrap();

        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        assert_eq!(progress.completed_items, 2);

        let calls = mgr.client().calls();
        assert_eq!(calls[0].0, RecordType::JobOrder);
        assert_eq!(calls[1], (RecordType::Sale, vec![sale_id.clone()], 1));

        let record = mgr.store().get::<Sale>(&sale_id).unwrap().unwrap();
        assert_eq!(record.retry_count, 0, "deferral does not consume a retry");
    }

    #[tokio::test]
    async fn test_deferred_record_stays_pending_when_reference_fails() {
        let mgr = manager(10);
        let job_id = mgr.store().create_local(1, &job("REF-2")).unwrap();
        let mut sale = service_sale("Labour");
        sale.job_order_local_id = Some(job_id);
        let sale_id = mgr.store().create_local(1, &sale).unwrap();
        mgr.client()
            .fail_next(SyncError::TransientNetwork("reset".into()));

        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        let record = mgr.store().get::<Sale>(&sale_id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_reference_to_permanently_failed_job_order_fails_sale() {
        let mgr = manager(10);
        let job_id = mgr.store().create_local(1, &job(" ")).unwrap();
        let mut sale = service_sale("Labour");
        sale.job_order_local_id = Some(job_id.clone());
        let sale_id = mgr.store().create_local(1, &sale).unwrap();

        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        let failed: Vec<&str> = progress.errors.iter().map(|e| e.local_id.as_str()).collect();
        assert_eq!(failed, vec![job_id.as_str(), sale_id.as_str()]);
        assert!(progress.errors[1].message.contains("failed permanently"));

        let record = mgr.store().get::<Sale>(&sale_id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.next_attempt_at, None);
        assert!(record.last_error.is_some());
        assert!(
            mgr.client().calls().iter().all(|(t, _, _)| *t == RecordType::JobOrder),
            "the sale is never pushed"
        );

        let again = mgr.sync_now().await;
        assert!(again.errors.is_empty());
        assert_eq!(again.completed_items, 0);
    }

    #[tokio::test]
    async fn test_reference_to_wrong_record_type_fails_without_push() {
        let mgr = manager(10);
        let other_sale = mgr.store().create_local(1, &service_sale("Wash")).unwrap();
        let mut sale = service_sale("Labour");
        sale.job_order_local_id = Some(other_sale.clone());
        let sale_id = mgr.store().create_local(1, &sale).unwrap();

        let progress = mgr.sync_now().await;
        assert_eq!(progress.completed_items, 1);
        assert_eq!(progress.errors.len(), 1);
        assert_eq!(progress.errors[0].local_id, sale_id);
        assert!(progress.errors[0].message.starts_with("references unknown job_order"));
        assert_eq!(mgr.client().calls(), vec![(RecordType::Sale, vec![other_sale], 1)]);
        assert_eq!(mgr.client().reconciler().entity_count(RecordType::Sale).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refused_push_ends_run_and_keeps_retry_budget() {
        let mgr = manager(10);
        let first = mgr.store().create_local(1, &service_sale("A")).unwrap();
        let second = mgr.store().create_local(1, &service_sale("B")).unwrap();
        mgr.store().create_local(1, &job("LATER-1")).unwrap();
        mgr.client()
            .fail_next(SyncError::Refused("invalid API key (HTTP 401)".into()));

        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Error);
        assert!(progress.fatal_error.unwrap().contains("HTTP 401"));
        assert!(progress.errors.is_empty());
        assert_eq!(progress.failed_items, 0);
        assert_eq!(mgr.client().calls().len(), 1, "no further batches after a refusal");
        assert!(!mgr.is_running());

        for id in [&first, &second] {
            let record = mgr.store().get::<Sale>(id).unwrap().unwrap();
            assert_eq!(record.sync_status, SyncStatus::Failed);
            assert_eq!(record.retry_count, 0);
            assert!(record.next_attempt_at.is_some());
        }

        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        assert_eq!(progress.completed_items, 3);
    }

    #[tokio::test]
    async fn test_second_start_while_running_is_rejected() {
        let mgr = manager(1);
        mgr.store().create_local(1, &service_sale("A")).unwrap();
        mgr.store().create_local(1, &service_sale("B")).unwrap();
        let (entered, release) = mgr.client().hold_first_push();

        assert!(mgr.start());
        entered.notified().await;

        let snapshot = mgr.sync_now().await;
        assert_eq!(snapshot.status, RunStatus::Syncing);
        assert!(!mgr.start());
        assert!(mgr.is_running());

        let mut rx = mgr.watch();
        release.notify_one();
        let done = wait_for(&mut rx, RunStatus::Complete).await;
        assert_eq!(done.completed_items, 2);
        assert_eq!(mgr.client().calls().len(), 2);
        assert_eq!(mgr.client().reconciler().entity_count(RecordType::Sale).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pause_lets_in_flight_batch_finish_then_resume() {
        let mgr = manager(1);
        let ids: Vec<String> = (0..3)
            .map(|i| mgr.store().create_local(1, &service_sale(&format!("S{i}"))).unwrap())
            .collect();
        let (entered, release) = mgr.client().hold_first_push();
        let mut rx = mgr.watch();

        assert!(mgr.start());
        entered.notified().await;
        assert!(mgr.pause());
        assert_eq!(mgr.progress().status, RunStatus::Paused);
        assert!(!mgr.pause());
        release.notify_one();

        let paused = wait_until(&mut rx, |p| {
            p.status == RunStatus::Paused && p.current_step == "Paused"
        })
        .await;
        assert_eq!(paused.completed_items, 1);
        // give the run a chance to misbehave
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mgr.client().calls().len(), 1);
        let first = mgr.store().get::<Sale>(&ids[0]).unwrap().unwrap();
        assert_eq!(first.sync_status, SyncStatus::Synced);

        assert!(mgr.resume());
        let done = wait_for(&mut rx, RunStatus::Complete).await;
        assert_eq!(done.completed_items, 3);
        assert_eq!(mgr.client().calls().len(), 3, "nothing pushed twice");
    }

    #[tokio::test]
    async fn test_abandon_ends_run_idle() {
        let mgr = manager(1);
        let first = mgr.store().create_local(1, &service_sale("A")).unwrap();
        let second = mgr.store().create_local(1, &service_sale("B")).unwrap();
        let (entered, release) = mgr.client().hold_first_push();

        assert!(mgr.start());
        entered.notified().await;
        let mut rx = mgr.watch();
        assert!(mgr.abandon());
        release.notify_one();

        let end = wait_for(&mut rx, RunStatus::Idle).await;
        assert_eq!(end.completed_items, 1);
        assert!(end.completed_at.is_some());
        tokio::time::timeout(Duration::from_secs(5), async {
            while mgr.is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let first = mgr.store().get::<Sale>(&first).unwrap().unwrap();
        assert_eq!(first.sync_status, SyncStatus::Synced);
        let second = mgr.store().get::<Sale>(&second).unwrap().unwrap();
        assert_eq!(second.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_storage_failure_ends_run_in_error() {
        let mgr = manager(10);
        mgr.store().create_local(1, &service_sale("A")).unwrap();
        mgr.store()
            .db()
            .conn
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE id_mappings;")
            .unwrap();

        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Error);
        assert!(progress.fatal_error.unwrap().contains("storage failure"));
        assert!(!mgr.is_running());
    }

    #[tokio::test]
    async fn test_offline_then_online_end_to_end() {
        let mgr = manager(10);
        let reconciler = mgr.client().reconciler();
        let product = reconciler.create_product(None, "Brake pads", 60.0, None).unwrap();
        reconciler.set_stock(1, product, 10.0).unwrap();

        for i in 0..3 {
            let sale = Sale {
                items: vec![SaleItem {
                    product_id: Some(product),
                    name: "Brake pads".into(),
                    quantity: 1.0,
                    unit_price: 60.0,
                    ..Default::default()
                }],
                total_amount: 60.0,
                customer_name: Some(format!("Customer {i}")),
                ..Default::default()
            };
            mgr.store().create_local(1, &sale).unwrap();
        }
        mgr.store().create_local(1, &job("E2E-1")).unwrap();

        mgr.client().inner.set_online(false);
        let offline = mgr.sync_now().await;
        assert_eq!(offline.status, RunStatus::Complete);
        assert_eq!(offline.completed_items, 0);
        assert_eq!(offline.failed_items, 4);

        mgr.client().inner.set_online(true);
        {
            // skip the backoff window instead of sleeping through it
            let conn = mgr.store().db().conn.lock().unwrap();
            for record_type in RecordType::TIERS {
                conn.execute(
                    &format!("UPDATE {} SET next_attempt_at = created_at", record_type.table()),
                    [],
                )
                .unwrap();
            }
        }

        let mut observed = Vec::new();
        let progress = mgr.sync_now().await;
        assert_eq!(progress.status, RunStatus::Complete);
        assert_eq!(progress.completed_items, 4);
        for (record_type, _, mapped) in mgr.client().calls() {
            if mapped > 0 {
                observed.push((record_type, mapped));
            }
        }
        assert_eq!(observed, vec![(RecordType::Sale, 3), (RecordType::JobOrder, 1)]);
        assert_eq!(reconciler.entity_count(RecordType::Sale).unwrap(), 3);
        assert_eq!(reconciler.entity_count(RecordType::JobOrder).unwrap(), 1);
        assert_eq!(reconciler.stock_level(1, product).unwrap(), Some(7.0));
        assert_eq!(mgr.store().list::<Sale>(Some(SyncStatus::Synced), Some(1)).unwrap().len(), 3);
        assert_eq!(mgr.store().list::<JobOrder>(Some(SyncStatus::Synced), None).unwrap().len(), 1);

        let again = mgr.sync_now().await;
        assert_eq!(again.completed_items, 0);
        assert_eq!(reconciler.entity_count(RecordType::Sale).unwrap(), 3);
        assert_eq!(reconciler.entity_count(RecordType::JobOrder).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_observer_sees_batch_boundaries() {
        let mgr = manager(2);
        for i in 0..3 {
            mgr.store().create_local(1, &service_sale(&format!("S{i}"))).unwrap();
        }
        let steps = Arc::new(Mutex::new(Vec::new()));
        let sink = steps.clone();
        let _sub = mgr.subscribe(move |p| sink.lock().unwrap().push(p.current_step.clone()));

        mgr.sync_now().await;

        let steps = steps.lock().unwrap();
        assert!(steps.contains(&"Pushing sales 2/3".to_string()), "{steps:?}");
        assert!(steps.contains(&"Pushing sales 3/3".to_string()), "{steps:?}");
        assert_eq!(steps.last().unwrap(), "Sync complete: 3 synced, 0 failed");
    }

    #[tokio::test]
    async fn test_pull_reference_data_replaces_cache() {
        let mgr = manager(10);
        let reconciler = mgr.client().reconciler();
        let category = reconciler.create_category("Fluids", None).unwrap();
        let oil = reconciler.create_product(Some(category), "Engine oil", 30.0, None).unwrap();
        reconciler.set_stock(1, oil, 12.0).unwrap();
        reconciler.set_stock(2, oil, 3.0).unwrap();

        let summary = mgr.pull_reference_data(Some(1)).await.unwrap();
        assert_eq!(summary, PullSummary { categories: 1, products: 1 });

        let products = mgr.store().cached_products(None).unwrap();
        assert_eq!(products[0].stock_for(1), Some(12.0));
        assert_eq!(products[0].stock_for(2), None);
        assert_eq!(mgr.store().cached_categories().unwrap()[0].name, "Fluids");
    }

    #[tokio::test]
    async fn test_auto_sync_skips_while_offline_and_stops_on_cancel() {
        let mgr = manager(10);
        mgr.store().create_local(1, &service_sale("A")).unwrap();
        mgr.client().inner.set_online(false);

        let cancel = CancellationToken::new();
        let mut rx = mgr.watch();
        let handle = mgr.spawn_auto_sync(Duration::from_millis(20), cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mgr.client().health_checks.load(Ordering::SeqCst) >= 1);
        assert!(mgr.client().calls().is_empty());

        mgr.client().inner.set_online(true);
        let done = wait_for(&mut rx, RunStatus::Complete).await;
        assert_eq!(done.completed_items, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
