//! Server-side SQLite schema holding the canonical records.
//!
//! `idempotency_keys` maps every client `local_id` ever reconciled to the
//! entity it created; `daily_sequences` holds the per-branch per-day
//! counters behind display numbers.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

pub struct ServerDb {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

const CURRENT_SCHEMA_VERSION: i32 = 1;

impl ServerDb {
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create data dir: {e}"))?;
        }
        let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| format!("pragma setup: {e}"))?;
        run_migrations(&conn)?;
        info!("Server database ready at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| format!("pragma setup: {e}"))?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }
}

fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category_id INTEGER REFERENCES categories(id),
            name TEXT NOT NULL,
            price REAL NOT NULL DEFAULT 0,
            sku TEXT
        );

        CREATE TABLE IF NOT EXISTS product_stock (
            branch_id INTEGER NOT NULL,
            product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
            quantity REAL NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (branch_id, product_id)
        );

        CREATE TABLE IF NOT EXISTS job_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            local_id TEXT NOT NULL UNIQUE,
            branch_id INTEGER NOT NULL,
            job_number TEXT NOT NULL UNIQUE,
            customer_name TEXT NOT NULL,
            customer_phone TEXT,
            vehicle_plate TEXT NOT NULL,
            vehicle_model TEXT,
            labor_description TEXT NOT NULL,
            labor_cost REAL NOT NULL DEFAULT 0,
            mechanic TEXT,
            client_created_at TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sales (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            local_id TEXT NOT NULL UNIQUE,
            branch_id INTEGER NOT NULL,
            sale_number TEXT NOT NULL UNIQUE,
            total_amount REAL NOT NULL,
            discount_amount REAL NOT NULL DEFAULT 0,
            payment_method TEXT,
            customer_name TEXT,
            job_order_id INTEGER REFERENCES job_orders(id),
            client_created_at TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sale_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sale_id INTEGER NOT NULL REFERENCES sales(id) ON DELETE CASCADE,
            kind TEXT NOT NULL CHECK (kind IN ('product', 'service')),
            product_id INTEGER REFERENCES products(id),
            name TEXT NOT NULL,
            quantity REAL NOT NULL,
            unit_price REAL NOT NULL,
            line_total REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attendance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            local_id TEXT NOT NULL UNIQUE,
            branch_id INTEGER NOT NULL,
            staff_id TEXT NOT NULL,
            clock_in TEXT NOT NULL,
            clock_out TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS idempotency_keys (
            local_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            server_id INTEGER NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS daily_sequences (
            branch_id INTEGER NOT NULL,
            day TEXT NOT NULL,
            kind TEXT NOT NULL,
            value INTEGER NOT NULL,
            PRIMARY KEY (branch_id, day, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_sales_branch ON sales(branch_id, client_created_at);
        CREATE INDEX IF NOT EXISTS idx_sale_items_sale ON sale_items(sale_id);
        CREATE INDEX IF NOT EXISTS idx_job_orders_branch ON job_orders(branch_id);
        CREATE INDEX IF NOT EXISTS idx_attendance_staff ON attendance(staff_id, clock_in);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Server migration v1 failed: {e}");
        format!("server migration v1: {e}")
    })?;
    info!("Applied server migration v1 (schema v{CURRENT_SCHEMA_VERSION})");
    Ok(())
}
