//! Durable store for offline-created records and cached reference data.
//!
//! Every client-originated record lives in its own per-type table keyed by
//! `local_id`, carrying its sync status, retry bookkeeping and JSON payload.
//! Reference caches (categories, products) are replaced wholesale on pull.
//! The `id_mappings` table is the idempotency index: written once when a
//! record first reconciles, never updated.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{SyncError, SyncResult};
use crate::models::{
    Category, IdMapping, LocalRecord, Product, RecordType, ReferenceSnapshot, SyncRecord,
    SyncStatus,
};

/// Rows fetched per page by the eligible-record cursor.
const ELIGIBLE_PAGE_SIZE: usize = 50;

const RECORD_COLUMNS: &str = "seq, local_id, server_id, sync_status, retry_count, \
     next_attempt_at, last_error, branch_id, payload, created_at";

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamp, so text comparison in SQL orders correctly.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Generate a client id: millisecond timestamp prefix plus random suffix, so
/// ids sort roughly by creation time and never parse as a server integer.
pub fn new_local_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("loc_{millis:013}_{}", &suffix[..12])
}

fn row_to_record<T: SyncRecord>(row: &Row<'_>) -> rusqlite::Result<(i64, LocalRecord<T>)> {
    let seq: i64 = row.get(0)?;
    let status_raw: String = row.get(3)?;
    let sync_status = status_raw.parse::<SyncStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into())
    })?;
    let next_attempt_at = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(parse_ts(5, &raw)?),
        None => None,
    };
    let payload_raw: String = row.get(8)?;
    let payload: T = serde_json::from_str(&payload_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
    let created_raw: String = row.get(9)?;

    Ok((
        seq,
        LocalRecord {
            local_id: row.get(1)?,
            server_id: row.get(2)?,
            sync_status,
            retry_count: row.get::<_, i64>(4)?.max(0) as u32,
            next_attempt_at,
            last_error: row.get(6)?,
            branch_id: row.get(7)?,
            created_at: parse_ts(9, &created_raw)?,
            payload,
        },
    ))
}

/// Storage error for a status change attempted from the wrong state.
fn transition_error(
    conn: &Connection,
    record_type: RecordType,
    local_id: &str,
    target: &str,
) -> SyncResult<SyncError> {
    let current: Option<String> = conn
        .query_row(
            &format!("SELECT sync_status FROM {} WHERE local_id = ?1", record_type.table()),
            params![local_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(SyncError::Storage(match current {
        Some(status) => format!("{record_type} {local_id} cannot move from {status} to {target}"),
        None => format!("unknown {record_type} {local_id}"),
    }))
}

// ---------------------------------------------------------------------------
// Status summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStatusCounts {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    /// Failed and scheduled for another attempt.
    pub failed: i64,
    /// Failed with no further attempt scheduled.
    pub permanently_failed: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub by_type: HashMap<RecordType, TypeStatusCounts>,
    pub oldest_next_attempt_at: Option<DateTime<Utc>>,
}

impl StatusSummary {
    /// Records still waiting to reach the server.
    pub fn outstanding(&self) -> i64 {
        self.by_type
            .values()
            .map(|c| c.pending + c.syncing + c.failed)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LocalStore {
    db: Arc<DbState>,
}

impl LocalStore {
    /// Wrap an already-migrated database and recover rows left mid-sync by a
    /// previous process.
    pub fn new(db: Arc<DbState>) -> SyncResult<Self> {
        let store = Self { db };
        let recovered = store.recover_interrupted()?;
        if recovered > 0 {
            warn!(recovered, "Recovered records interrupted during a previous sync");
        }
        Ok(store)
    }

    /// Open (or create) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> SyncResult<Self> {
        let db = db::init(data_dir).map_err(SyncError::Storage)?;
        Self::new(Arc::new(db))
    }

    pub fn in_memory() -> SyncResult<Self> {
        let db = db::open_in_memory().map_err(SyncError::Storage)?;
        Self::new(Arc::new(db))
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    fn conn(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.db
            .conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("db lock: {e}")))
    }

    // -- Record creation ----------------------------------------------------

    /// Persist a new offline record as `pending` and return its client id.
    pub fn create_local<T: SyncRecord>(&self, branch_id: i64, payload: &T) -> SyncResult<String> {
        let local_id = new_local_id();
        let now = format_ts(Utc::now());
        let payload_json = serde_json::to_string(payload)?;

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (local_id, sync_status, retry_count, next_attempt_at,
                                 branch_id, payload, created_at, updated_at)
                 VALUES (?1, 'pending', 0, ?2, ?3, ?4, ?2, ?2)",
                T::TYPE.table()
            ),
            params![&local_id, &now, branch_id, &payload_json],
        )?;

        info!(local_id = %local_id, record_type = %T::TYPE, branch_id, "Local record created");
        Ok(local_id)
    }

    // -- Queries ------------------------------------------------------------

    pub fn get<T: SyncRecord>(&self, local_id: &str) -> SyncResult<Option<LocalRecord<T>>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE local_id = ?1",
                    T::TYPE.table()
                ),
                params![local_id],
                row_to_record::<T>,
            )
            .optional()?;
        Ok(record.map(|(_, r)| r))
    }

    /// Records of one type, optionally filtered by status and branch, oldest first.
    pub fn list<T: SyncRecord>(
        &self,
        status: Option<SyncStatus>,
        branch_id: Option<i64>,
    ) -> SyncResult<Vec<LocalRecord<T>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {}
             WHERE (?1 IS NULL OR sync_status = ?1)
               AND (?2 IS NULL OR branch_id = ?2)
             ORDER BY seq ASC",
            T::TYPE.table()
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), branch_id],
            row_to_record::<T>,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.1);
        }
        Ok(records)
    }

    /// Lazy cursor over records that are `pending` or `failed` with
    /// `next_attempt_at <= now`, in creation order. Pages are fetched on
    /// demand; the cursor can be restarted from the beginning.
    pub fn list_eligible<T: SyncRecord>(&self, now: DateTime<Utc>) -> Eligible<'_, T> {
        Eligible {
            store: self,
            now,
            after_seq: 0,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    fn eligible_page<T: SyncRecord>(
        &self,
        now: DateTime<Utc>,
        after_seq: i64,
        limit: usize,
    ) -> SyncResult<Vec<(i64, LocalRecord<T>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {}
             WHERE sync_status IN ('pending', 'failed')
               AND next_attempt_at IS NOT NULL
               AND next_attempt_at <= ?1
               AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
            T::TYPE.table()
        ))?;
        let rows = stmt.query_map(
            params![format_ts(now), after_seq, limit as i64],
            row_to_record::<T>,
        )?;
        let mut page = Vec::new();
        for row in rows {
            page.push(row?);
        }
        Ok(page)
    }

    /// Number of records [`list_eligible`](Self::list_eligible) would yield at `now`.
    pub fn count_eligible(&self, record_type: RecordType, now: DateTime<Utc>) -> SyncResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {}
                 WHERE sync_status IN ('pending', 'failed')
                   AND next_attempt_at IS NOT NULL
                   AND next_attempt_at <= ?1",
                record_type.table()
            ),
            params![format_ts(now)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    // -- Status transitions -------------------------------------------------

    /// pending|failed -> syncing. Returns the number of rows claimed.
    pub fn mark_syncing(&self, record_type: RecordType, local_ids: &[String]) -> SyncResult<usize> {
        let now = format_ts(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut claimed = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE {} SET sync_status = 'syncing', updated_at = ?1
                 WHERE local_id = ?2 AND sync_status IN ('pending', 'failed')",
                record_type.table()
            ))?;
            for local_id in local_ids {
                claimed += stmt.execute(params![&now, local_id])?;
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Record a successful reconciliation: `syncing` -> `synced`, server id
    /// set and the id mapping written, all in one transaction. Any other
    /// starting status is a storage error.
    pub fn mark_synced(
        &self,
        record_type: RecordType,
        local_id: &str,
        server_id: i64,
    ) -> SyncResult<()> {
        let now = format_ts(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT server_id FROM id_mappings WHERE local_id = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .optional()?;
        let server_id = match existing {
            Some(mapped) if mapped != server_id => {
                warn!(
                    local_id,
                    mapped, returned = server_id,
                    "Server returned a different id for an already mapped record; keeping the original"
                );
                mapped
            }
            _ => server_id,
        };

        let updated = tx.execute(
            &format!(
                "UPDATE {} SET sync_status = 'synced', server_id = ?1, next_attempt_at = NULL,
                               last_error = NULL, updated_at = ?2
                 WHERE local_id = ?3 AND sync_status = 'syncing'",
                record_type.table()
            ),
            params![server_id, &now, local_id],
        )?;
        if updated == 0 {
            return Err(transition_error(&tx, record_type, local_id, "synced")?);
        }

        tx.execute(
            "INSERT OR IGNORE INTO id_mappings (local_id, record_type, server_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![local_id, record_type.as_str(), server_id, &now],
        )?;
        tx.commit()?;

        debug!(local_id, server_id, record_type = %record_type, "Record marked synced");
        Ok(())
    }

    /// Record a failed attempt (`syncing` -> `failed`): increments
    /// `retry_count`, stores the error and schedules the next attempt
    /// (`None` = never, permanently failed). Returns the new retry count.
    pub fn mark_failed(
        &self,
        record_type: RecordType,
        local_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> SyncResult<u32> {
        let now = format_ts(Utc::now());
        let conn = self.conn()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET sync_status = 'failed', retry_count = retry_count + 1,
                               last_error = ?1, next_attempt_at = ?2, updated_at = ?3
                 WHERE local_id = ?4 AND sync_status = 'syncing'",
                record_type.table()
            ),
            params![error, next_attempt_at.map(format_ts), &now, local_id],
        )?;
        if updated == 0 {
            return Err(transition_error(&conn, record_type, local_id, "failed")?);
        }
        let retry_count: i64 = conn.query_row(
            &format!("SELECT retry_count FROM {} WHERE local_id = ?1", record_type.table()),
            params![local_id],
            |row| row.get(0),
        )?;
        Ok(retry_count.max(0) as u32)
    }

    /// Hand claimed records back after an attempt that never reached a
    /// verdict: `syncing` -> `failed`, immediately eligible, retry count
    /// unchanged. Returns the number of rows released.
    pub fn release_syncing(
        &self,
        record_type: RecordType,
        local_ids: &[String],
        error: &str,
    ) -> SyncResult<usize> {
        let now = format_ts(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut released = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE {} SET sync_status = 'failed', last_error = ?1,
                               next_attempt_at = ?2, updated_at = ?2
                 WHERE local_id = ?3 AND sync_status = 'syncing'",
                record_type.table()
            ))?;
            for local_id in local_ids {
                released += stmt.execute(params![error, &now, local_id])?;
            }
        }
        tx.commit()?;
        Ok(released)
    }

    /// Move rows stuck in `syncing` (process died mid-batch) to `failed`,
    /// immediately eligible, without consuming a retry.
    pub fn recover_interrupted(&self) -> SyncResult<usize> {
        let now = format_ts(Utc::now());
        let conn = self.conn()?;
        let mut recovered = 0;
        for record_type in RecordType::TIERS {
            recovered += conn.execute(
                &format!(
                    "UPDATE {} SET sync_status = 'failed', last_error = 'interrupted',
                                   next_attempt_at = ?1, updated_at = ?1
                     WHERE sync_status = 'syncing'",
                    record_type.table()
                ),
                params![&now],
            )?;
        }
        Ok(recovered)
    }

    /// Give a permanently failed record a fresh retry budget.
    pub fn requeue(&self, record_type: RecordType, local_id: &str) -> SyncResult<bool> {
        let now = format_ts(Utc::now());
        let conn = self.conn()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET retry_count = 0, next_attempt_at = ?1, updated_at = ?1
                 WHERE local_id = ?2 AND sync_status = 'failed'",
                record_type.table()
            ),
            params![&now, local_id],
        )?;
        if updated > 0 {
            info!(local_id, record_type = %record_type, "Failed record requeued");
        }
        Ok(updated > 0)
    }

    // -- Id mappings --------------------------------------------------------

    pub fn lookup_mapping(&self, local_id: &str) -> SyncResult<Option<IdMapping>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT local_id, record_type, server_id FROM id_mappings WHERE local_id = ?1",
                params![local_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((local_id, raw_type, server_id)) => {
                let record_type = raw_type.parse::<RecordType>().map_err(SyncError::Storage)?;
                Ok(Some(IdMapping {
                    local_id,
                    record_type,
                    server_id,
                }))
            }
            None => Ok(None),
        }
    }

    /// Server ids for the given typed references; references without a
    /// mapping of the expected type are absent.
    pub fn resolve_refs(&self, refs: &[(RecordType, String)]) -> SyncResult<HashMap<String, i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT server_id FROM id_mappings WHERE local_id = ?1 AND record_type = ?2",
        )?;
        let mut resolved = HashMap::new();
        for (record_type, local_id) in refs {
            if let Some(server_id) = stmt
                .query_row(params![local_id, record_type.as_str()], |row| row.get::<_, i64>(0))
                .optional()?
            {
                resolved.insert(local_id.clone(), server_id);
            }
        }
        Ok(resolved)
    }

    /// Why an unmapped reference can never resolve: no local record of that
    /// type, or one that failed permanently. `None` while it may still sync.
    pub fn unresolvable_reason(
        &self,
        record_type: RecordType,
        local_id: &str,
    ) -> SyncResult<Option<String>> {
        let conn = self.conn()?;
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                &format!(
                    "SELECT sync_status, next_attempt_at FROM {} WHERE local_id = ?1",
                    record_type.table()
                ),
                params![local_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            None => Some(format!("references unknown {record_type} {local_id}")),
            Some((status, None)) if status == SyncStatus::Failed.as_str() => Some(format!(
                "referenced {record_type} {local_id} failed permanently"
            )),
            Some(_) => None,
        })
    }

    // -- Reference caches ---------------------------------------------------

    /// Replace a reference cache wholesale. Returns the number of rows cached.
    pub fn replace_snapshot(&self, snapshot: &ReferenceSnapshot) -> SyncResult<usize> {
        let now = format_ts(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let count = match snapshot {
            ReferenceSnapshot::Categories(rows) => {
                tx.execute("DELETE FROM category_cache", [])?;
                let mut stmt = tx.prepare(
                    "INSERT INTO category_cache (id, name, data, cached_at) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for category in rows {
                    let data = serde_json::to_string(category)?;
                    stmt.execute(params![category.id, &category.name, data, &now])?;
                }
                rows.len()
            }
            ReferenceSnapshot::Products(rows) => {
                tx.execute("DELETE FROM product_cache", [])?;
                let mut stmt = tx.prepare(
                    "INSERT INTO product_cache (id, category_id, name, price, data, cached_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for product in rows {
                    let data = serde_json::to_string(product)?;
                    stmt.execute(params![
                        product.id,
                        product.category_id,
                        &product.name,
                        product.price,
                        data,
                        &now
                    ])?;
                }
                rows.len()
            }
        };
        tx.commit()?;
        Ok(count)
    }

    pub fn cached_categories(&self) -> SyncResult<Vec<Category>> {
        self.read_cache("SELECT data FROM category_cache ORDER BY name, id")
    }

    /// Cached products. With a branch, stock entries are narrowed to it.
    pub fn cached_products(&self, branch_id: Option<i64>) -> SyncResult<Vec<Product>> {
        let mut products: Vec<Product> =
            self.read_cache("SELECT data FROM product_cache ORDER BY name, id")?;
        if let Some(branch) = branch_id {
            for product in &mut products {
                product.stock.retain(|s| s.branch_id == branch);
            }
        }
        Ok(products)
    }

    fn read_cache<R: serde::de::DeserializeOwned>(&self, sql: &str) -> SyncResult<Vec<R>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    // -- Summary ------------------------------------------------------------

    pub fn status_counts(&self) -> SyncResult<StatusSummary> {
        let conn = self.conn()?;
        let mut summary = StatusSummary::default();
        let mut oldest: Option<String> = None;

        for record_type in RecordType::TIERS {
            let table = record_type.table();
            let counts = conn.query_row(
                &format!(
                    "SELECT
                        COALESCE(SUM(sync_status = 'pending'), 0),
                        COALESCE(SUM(sync_status = 'syncing'), 0),
                        COALESCE(SUM(sync_status = 'synced'), 0),
                        COALESCE(SUM(sync_status = 'failed' AND next_attempt_at IS NOT NULL), 0),
                        COALESCE(SUM(sync_status = 'failed' AND next_attempt_at IS NULL), 0)
                     FROM {table}"
                ),
                [],
                |row| {
                    Ok(TypeStatusCounts {
                        pending: row.get(0)?,
                        syncing: row.get(1)?,
                        synced: row.get(2)?,
                        failed: row.get(3)?,
                        permanently_failed: row.get(4)?,
                    })
                },
            )?;
            summary.by_type.insert(record_type, counts);

            let type_oldest: Option<String> = conn.query_row(
                &format!(
                    "SELECT MIN(next_attempt_at) FROM {table}
                     WHERE sync_status IN ('pending', 'failed') AND next_attempt_at IS NOT NULL"
                ),
                [],
                |row| row.get(0),
            )?;
            oldest = match (oldest, type_oldest) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        summary.oldest_next_attempt_at = match oldest {
            Some(raw) => Some(parse_ts(0, &raw)?),
            None => None,
        };
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Eligible cursor
// ---------------------------------------------------------------------------

/// Keyset-paged iterator returned by [`LocalStore::list_eligible`].
pub struct Eligible<'a, T> {
    store: &'a LocalStore,
    now: DateTime<Utc>,
    after_seq: i64,
    page: VecDeque<(i64, LocalRecord<T>)>,
    exhausted: bool,
}

impl<T: SyncRecord> Eligible<'_, T> {
    /// Rewind to the first eligible record.
    pub fn restart(&mut self) {
        self.after_seq = 0;
        self.page.clear();
        self.exhausted = false;
    }

    /// Pull up to `n` records.
    pub fn next_batch(&mut self, n: usize) -> SyncResult<Vec<LocalRecord<T>>> {
        let mut batch = Vec::with_capacity(n);
        while batch.len() < n {
            match self.next() {
                Some(record) => batch.push(record?),
                None => break,
            }
        }
        Ok(batch)
    }
}

impl<T: SyncRecord> Iterator for Eligible<'_, T> {
    type Item = SyncResult<LocalRecord<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self
                .store
                .eligible_page::<T>(self.now, self.after_seq, ELIGIBLE_PAGE_SIZE)
            {
                Ok(page) => {
                    if page.len() < ELIGIBLE_PAGE_SIZE {
                        self.exhausted = true;
                    }
                    self.page.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let (seq, record) = self.page.pop_front()?;
        self.after_seq = seq;
        Some(Ok(record))
    }
}
