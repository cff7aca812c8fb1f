//! Idempotent ingestion of client records and snapshot pulls of reference
//! data.
//!
//! Each push call runs inside one SQLite transaction. A record whose
//! `local_id` is already in `idempotency_keys` is answered with its existing
//! id and never touched again. New records get their display number from an
//! atomic per-branch per-day counter and apply their side effects (stock
//! deduction) in the same transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::MutexGuard;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::local_store::format_ts;
use crate::models::{
    Attendance, BranchStock, Category, ItemKind, JobOrder, Mapping, Product, PushRecord,
    PushResponse, RecordType, Rejection, Sale, SaleItem, SyncRecord,
};
use crate::server::db::ServerDb;

// ---------------------------------------------------------------------------
// Errors and policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Malformed or rule-breaking record; nothing from the batch is kept
    /// under the all-or-nothing policy.
    #[error("{message}")]
    Validation {
        local_id: Option<String>,
        message: String,
    },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl ReconcileError {
    fn validation(local_id: &str, message: impl Into<String>) -> Self {
        ReconcileError::Validation {
            local_id: Some(local_id.to_string()),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for ReconcileError {
    fn from(err: rusqlite::Error) -> Self {
        ReconcileError::Storage(err.to_string())
    }
}

/// What happens to the valid records of a batch when one record is invalid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchPolicy {
    /// One invalid record rolls back every new record in the call.
    #[default]
    AllOrNothing,
    /// Valid records commit; invalid ones come back in `rejected`.
    PerItem,
}

impl fmt::Display for BatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPolicy::AllOrNothing => f.write_str("all-or-nothing"),
            BatchPolicy::PerItem => f.write_str("per-item"),
        }
    }
}

impl FromStr for BatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all-or-nothing" | "all_or_nothing" | "atomic" => Ok(BatchPolicy::AllOrNothing),
            "per-item" | "per_item" => Ok(BatchPolicy::PerItem),
            other => Err(format!("unknown batch policy: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-type ingestion
// ---------------------------------------------------------------------------

trait Ingest: SyncRecord {
    fn validate(&self) -> Result<(), String>;

    /// Insert the entity under the normalised `local_id` and apply its side
    /// effects. Returns the new id.
    fn create(
        conn: &Connection,
        local_id: &str,
        record: &PushRecord<Self>,
    ) -> Result<i64, ReconcileError>;
}

fn finite_non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Server id already issued for `key`. A key issued for another entity type
/// is a validation error attributed to `local_id`.
fn lookup_key(
    conn: &Connection,
    local_id: &str,
    key: &str,
    entity_type: RecordType,
) -> Result<Option<i64>, ReconcileError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT entity_type, server_id FROM idempotency_keys WHERE local_id = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((found, server_id)) if found == entity_type.as_str() => Ok(Some(server_id)),
        Some((found, _)) => Err(ReconcileError::validation(
            local_id,
            format!("{key} identifies a {found}, not a {entity_type}"),
        )),
        None => Ok(None),
    }
}

fn entity_exists(conn: &Connection, table: &str, id: i64) -> Result<bool, ReconcileError> {
    Ok(conn
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE id = ?1"),
            params![id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Next display number from the atomic per-branch per-day counter, e.g.
/// `SAL-20261017-B1-00003`.
fn next_number(
    conn: &Connection,
    prefix: &str,
    kind: &str,
    branch_id: i64,
    created_at: DateTime<Utc>,
) -> Result<String, ReconcileError> {
    let day = created_at.format("%Y%m%d").to_string();
    let value: i64 = conn.query_row(
        "INSERT INTO daily_sequences (branch_id, day, kind, value) VALUES (?1, ?2, ?3, 1)
         ON CONFLICT(branch_id, day, kind) DO UPDATE SET value = daily_sequences.value + 1
         RETURNING value",
        params![branch_id, &day, kind],
        |row| row.get(0),
    )?;
    Ok(format!("{prefix}-{day}-B{branch_id}-{value:05}"))
}

fn resolve_product(
    conn: &Connection,
    local_id: &str,
    item: &SaleItem,
) -> Result<Option<i64>, ReconcileError> {
    let Some(product_id) = item.product_id else {
        return Ok(None);
    };
    if !entity_exists(conn, "products", product_id)? {
        return Err(ReconcileError::validation(
            local_id,
            format!("unknown product {product_id}"),
        ));
    }
    Ok(Some(product_id))
}

/// Stock may go negative: the goods already left the shop while offline.
fn deduct_stock(
    conn: &Connection,
    branch_id: i64,
    product_id: i64,
    quantity: f64,
) -> Result<(), ReconcileError> {
    let updated = conn.execute(
        "UPDATE product_stock SET quantity = quantity - ?3, updated_at = datetime('now')
         WHERE branch_id = ?1 AND product_id = ?2",
        params![branch_id, product_id, quantity],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO product_stock (branch_id, product_id, quantity) VALUES (?1, ?2, ?3)",
            params![branch_id, product_id, -quantity],
        )?;
    }
    Ok(())
}

impl Ingest for Sale {
    fn validate(&self) -> Result<(), String> {
        if self.items.is_empty() {
            return Err("sale has no items".into());
        }
        for (idx, item) in self.items.iter().enumerate() {
            if item.name.trim().is_empty() {
                return Err(format!("item {idx} has no name"));
            }
            if !(item.quantity.is_finite() && item.quantity > 0.0) {
                return Err(format!("item {idx} has invalid quantity {}", item.quantity));
            }
            if !finite_non_negative(item.unit_price) {
                return Err(format!("item {idx} has invalid unit price {}", item.unit_price));
            }
            if item.kind == ItemKind::Product && item.product_id.is_none() {
                return Err(format!("product item {idx} has no product reference"));
            }
        }
        if !finite_non_negative(self.total_amount) {
            return Err(format!("invalid total amount {}", self.total_amount));
        }
        if !finite_non_negative(self.discount_amount) {
            return Err(format!("invalid discount amount {}", self.discount_amount));
        }
        Ok(())
    }

    fn create(
        conn: &Connection,
        local_id: &str,
        record: &PushRecord<Self>,
    ) -> Result<i64, ReconcileError> {
        let sale = &record.payload;

        let job_order_id = match (sale.job_order_id, sale.job_order_local_id.as_deref()) {
            (Some(id), _) => Some(id),
            (None, Some(job_ref)) => Some(
                lookup_key(conn, local_id, job_ref.trim(), RecordType::JobOrder)?.ok_or_else(
                    || {
                        ReconcileError::validation(
                            local_id,
                            format!("unknown job order reference {job_ref}"),
                        )
                    },
                )?,
            ),
            (None, None) => None,
        };
        if let Some(id) = job_order_id {
            if !entity_exists(conn, "job_orders", id)? {
                return Err(ReconcileError::validation(
                    local_id,
                    format!("unknown job order {id}"),
                ));
            }
        }

        let sale_number = next_number(conn, "SAL", "sale", record.branch_id, record.created_at)?;
        conn.execute(
            "INSERT INTO sales (local_id, branch_id, sale_number, total_amount, discount_amount,
                                payment_method, customer_name, job_order_id, client_created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                local_id,
                record.branch_id,
                &sale_number,
                sale.total_amount,
                sale.discount_amount,
                &sale.payment_method,
                &sale.customer_name,
                job_order_id,
                format_ts(record.created_at),
            ],
        )?;
        let sale_id = conn.last_insert_rowid();

        for item in &sale.items {
            let product_id = resolve_product(conn, local_id, item)?;
            let kind = match item.kind {
                ItemKind::Product => "product",
                ItemKind::Service => "service",
            };
            if let (ItemKind::Product, Some(pid)) = (item.kind, product_id) {
                deduct_stock(conn, record.branch_id, pid, item.quantity)?;
            }
            conn.execute(
                "INSERT INTO sale_items (sale_id, kind, product_id, name, quantity, unit_price, line_total)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sale_id,
                    kind,
                    product_id,
                    &item.name,
                    item.quantity,
                    item.unit_price,
                    item.line_total(),
                ],
            )?;
        }

        debug!(local_id, sale_id, sale_number = %sale_number, "Sale created");
        Ok(sale_id)
    }
}

impl Ingest for JobOrder {
    fn validate(&self) -> Result<(), String> {
        if self.customer_name.trim().is_empty() {
            return Err("job order has no customer name".into());
        }
        if self.vehicle_plate.trim().is_empty() {
            return Err("job order has no vehicle plate".into());
        }
        if self.labor_description.trim().is_empty() {
            return Err("job order has no labor description".into());
        }
        if !finite_non_negative(self.labor_cost) {
            return Err(format!("invalid labor cost {}", self.labor_cost));
        }
        Ok(())
    }

    fn create(
        conn: &Connection,
        local_id: &str,
        record: &PushRecord<Self>,
    ) -> Result<i64, ReconcileError> {
        let job = &record.payload;
        let job_number = next_number(conn, "JOB", "job_order", record.branch_id, record.created_at)?;
        conn.execute(
            "INSERT INTO job_orders (local_id, branch_id, job_number, customer_name, customer_phone,
                                     vehicle_plate, vehicle_model, labor_description, labor_cost,
                                     mechanic, client_created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                local_id,
                record.branch_id,
                &job_number,
                job.customer_name.trim(),
                &job.customer_phone,
                job.vehicle_plate.trim().to_uppercase(),
                &job.vehicle_model,
                &job.labor_description,
                job.labor_cost,
                &job.mechanic,
                format_ts(record.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl Ingest for Attendance {
    fn validate(&self) -> Result<(), String> {
        if self.staff_id.trim().is_empty() {
            return Err("attendance has no staff id".into());
        }
        if let Some(clock_out) = self.clock_out {
            if clock_out < self.clock_in {
                return Err("clock-out precedes clock-in".into());
            }
        }
        Ok(())
    }

    fn create(
        conn: &Connection,
        local_id: &str,
        record: &PushRecord<Self>,
    ) -> Result<i64, ReconcileError> {
        let entry = &record.payload;
        conn.execute(
            "INSERT INTO attendance (local_id, branch_id, staff_id, clock_in, clock_out)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                local_id,
                record.branch_id,
                entry.staff_id.trim(),
                format_ts(entry.clock_in),
                entry.clock_out.map(format_ts),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

/// Existing id for an already reconciled record, otherwise validate and
/// create it. The second value is `true` when a new entity was created.
fn reconcile_one<T: Ingest>(
    conn: &Connection,
    record: &PushRecord<T>,
) -> Result<(i64, bool), ReconcileError> {
    let local_id = record.local_id.trim();
    if local_id.is_empty() {
        return Err(ReconcileError::Validation {
            local_id: None,
            message: "record has no local_id".into(),
        });
    }
    if let Some(server_id) = lookup_key(conn, local_id, local_id, T::TYPE)? {
        return Ok((server_id, false));
    }
    if local_id.parse::<i64>().is_ok() {
        return Err(ReconcileError::validation(
            local_id,
            "local_id must not be a numeric server id",
        ));
    }
    record
        .payload
        .validate()
        .map_err(|message| ReconcileError::validation(local_id, message))?;

    let server_id = T::create(conn, local_id, record)?;
    conn.execute(
        "INSERT INTO idempotency_keys (local_id, entity_type, server_id) VALUES (?1, ?2, ?3)",
        params![local_id, T::TYPE.as_str(), server_id],
    )?;
    Ok((server_id, true))
}

fn decode<T: Ingest>(records: Vec<Value>) -> Result<Vec<PushRecord<T>>, ReconcileError> {
    records
        .into_iter()
        .map(|value| {
            let local_id = value
                .get("local_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            serde_json::from_value::<PushRecord<T>>(value).map_err(|e| {
                ReconcileError::Validation {
                    local_id,
                    message: format!("malformed {} record: {e}", T::TYPE),
                }
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    db: ServerDb,
    policy: BatchPolicy,
}

impl Reconciler {
    pub fn new(db: ServerDb, policy: BatchPolicy) -> Self {
        Self { db, policy }
    }

    pub fn in_memory(policy: BatchPolicy) -> Result<Self, String> {
        Ok(Self::new(ServerDb::open_in_memory()?, policy))
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ReconcileError> {
        self.db
            .conn
            .lock()
            .map_err(|e| ReconcileError::Storage(format!("db lock: {e}")))
    }

    pub fn push_sales(&self, records: Vec<PushRecord<Sale>>) -> Result<PushResponse, ReconcileError> {
        self.push(records)
    }

    pub fn push_job_orders(
        &self,
        records: Vec<PushRecord<JobOrder>>,
    ) -> Result<PushResponse, ReconcileError> {
        self.push(records)
    }

    pub fn push_attendance(
        &self,
        records: Vec<PushRecord<Attendance>>,
    ) -> Result<PushResponse, ReconcileError> {
        self.push(records)
    }

    /// Push untyped records as received on the wire. A record that does not
    /// decode fails the whole call before any mutation.
    pub fn push_values(
        &self,
        record_type: RecordType,
        records: Vec<Value>,
    ) -> Result<PushResponse, ReconcileError> {
        match record_type {
            RecordType::Sale => self.push_sales(decode(records)?),
            RecordType::JobOrder => self.push_job_orders(decode(records)?),
            RecordType::Attendance => self.push_attendance(decode(records)?),
        }
    }

    fn push<T: Ingest>(&self, records: Vec<PushRecord<T>>) -> Result<PushResponse, ReconcileError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;
        let mut mappings = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        let mut created = 0usize;
        let mut deduplicated = 0usize;

        for record in &records {
            let outcome = match self.policy {
                BatchPolicy::AllOrNothing => reconcile_one(&tx, record).map_err(|e| {
                    warn!(
                        record_type = %T::TYPE,
                        local_id = %record.local_id,
                        error = %e,
                        "Push batch rejected, rolling back"
                    );
                    e
                })?,
                BatchPolicy::PerItem => {
                    let sp = tx.savepoint()?;
                    match reconcile_one(&sp, record) {
                        Ok(outcome) => {
                            sp.commit()?;
                            outcome
                        }
                        Err(ReconcileError::Validation { message, .. }) => {
                            warn!(
                                record_type = %T::TYPE,
                                local_id = %record.local_id,
                                error = %message,
                                "Push record rejected"
                            );
                            rejected.push(Rejection {
                                local_id: record.local_id.clone(),
                                error: message,
                            });
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            let (server_id, was_created) = outcome;
            if was_created {
                created += 1;
            } else {
                deduplicated += 1;
            }
            mappings.push(Mapping {
                local_id: record.local_id.clone(),
                server_id,
            });
        }

        tx.commit()?;

        info!(
            record_type = %T::TYPE,
            received = records.len(),
            created,
            deduplicated,
            rejected = rejected.len(),
            "Push reconciled"
        );

        Ok(PushResponse {
            success: true,
            mappings,
            synced_count: Some(created),
            rejected,
            error: None,
        })
    }

    // -- Pulls --------------------------------------------------------------

    pub fn pull_categories(&self) -> Result<Vec<Category>, ReconcileError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, description FROM categories ORDER BY name, id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Category {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
            })
        })?;
        let mut categories = Vec::new();
        for row in rows {
            categories.push(row?);
        }
        Ok(categories)
    }

    /// Full product list with per-branch stock; narrowed to one branch when
    /// `branch_id` is given.
    pub fn pull_products(&self, branch_id: Option<i64>) -> Result<Vec<Product>, ReconcileError> {
        let conn = self.conn()?;

        let mut stock: HashMap<i64, Vec<BranchStock>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT product_id, branch_id, quantity FROM product_stock
                 WHERE (?1 IS NULL OR branch_id = ?1)
                 ORDER BY branch_id",
            )?;
            let rows = stmt.query_map(params![branch_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    BranchStock {
                        branch_id: row.get(1)?,
                        quantity: row.get(2)?,
                    },
                ))
            })?;
            for row in rows {
                let (product_id, entry) = row?;
                stock.entry(product_id).or_default().push(entry);
            }
        }

        let mut stmt =
            conn.prepare("SELECT id, category_id, name, price, sku FROM products ORDER BY name, id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Product {
                id: row.get(0)?,
                category_id: row.get(1)?,
                name: row.get(2)?,
                price: row.get(3)?,
                sku: row.get(4)?,
                stock: Vec::new(),
            })
        })?;
        let mut products = Vec::new();
        for row in rows {
            let mut product = row?;
            product.stock = stock.remove(&product.id).unwrap_or_default();
            products.push(product);
        }
        Ok(products)
    }

    // -- Reference administration -------------------------------------------

    pub fn create_category(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<i64, ReconcileError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO categories (name, description) VALUES (?1, ?2)",
            params![name, description],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_product(
        &self,
        category_id: Option<i64>,
        name: &str,
        price: f64,
        sku: Option<&str>,
    ) -> Result<i64, ReconcileError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO products (category_id, name, price, sku) VALUES (?1, ?2, ?3, ?4)",
            params![category_id, name, price, sku],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_stock(
        &self,
        branch_id: i64,
        product_id: i64,
        quantity: f64,
    ) -> Result<(), ReconcileError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO product_stock (branch_id, product_id, quantity) VALUES (?1, ?2, ?3)
             ON CONFLICT(branch_id, product_id) DO UPDATE SET
                quantity = excluded.quantity, updated_at = datetime('now')",
            params![branch_id, product_id, quantity],
        )?;
        Ok(())
    }

    // -- Inspection ---------------------------------------------------------

    /// Number of canonical entities of a type.
    pub fn entity_count(&self, record_type: RecordType) -> Result<i64, ReconcileError> {
        let table = match record_type {
            RecordType::Sale => "sales",
            RecordType::JobOrder => "job_orders",
            RecordType::Attendance => "attendance",
        };
        let conn = self.conn()?;
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?)
    }

    pub fn stock_level(&self, branch_id: i64, product_id: i64) -> Result<Option<f64>, ReconcileError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT quantity FROM product_stock WHERE branch_id = ?1 AND product_id = ?2",
                params![branch_id, product_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn sale_number(&self, sale_id: i64) -> Result<Option<String>, ReconcileError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT sale_number FROM sales WHERE id = ?1",
                params![sale_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}
