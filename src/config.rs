//! Sync engine tunables, persisted in `local_settings` under the `sync`
//! category.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::db::{self, DbState};

const SETTINGS_CATEGORY: &str = "sync";

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_BASE_DELAY_MS: i64 = 5_000;
pub const DEFAULT_CAP_DELAY_MS: i64 = 300_000;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_AUTO_SYNC_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the reconciliation server.
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    /// Branch used when pulling branch-scoped products.
    pub branch_id: Option<i64>,
    pub batch_size: usize,
    pub base_delay_ms: i64,
    pub cap_delay_ms: i64,
    pub max_retries: u32,
    pub auto_sync_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            branch_id: None,
            batch_size: DEFAULT_BATCH_SIZE,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            cap_delay_ms: DEFAULT_CAP_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            auto_sync_interval_secs: DEFAULT_AUTO_SYNC_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

fn parsed_setting<T: FromStr>(conn: &Connection, key: &str, default: T) -> T {
    match db::get_setting(conn, SETTINGS_CATEGORY, key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparseable sync setting");
                default
            }
        },
        None => default,
    }
}

fn text_setting(conn: &Connection, key: &str) -> Option<String> {
    db::get_setting(conn, SETTINGS_CATEGORY, key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SyncConfig {
    /// Load from `local_settings`, falling back to defaults per key.
    pub fn load(db: &DbState) -> Result<Self, String> {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        Ok(Self::load_from(&conn))
    }

    fn load_from(conn: &Connection) -> Self {
        let defaults = Self::default();
        let config = Self {
            server_url: text_setting(conn, "server_url"),
            api_key: text_setting(conn, "api_key"),
            branch_id: text_setting(conn, "branch_id").and_then(|v| v.parse().ok()),
            batch_size: parsed_setting(conn, "batch_size", defaults.batch_size),
            base_delay_ms: parsed_setting(conn, "base_delay_ms", defaults.base_delay_ms),
            cap_delay_ms: parsed_setting(conn, "cap_delay_ms", defaults.cap_delay_ms),
            max_retries: parsed_setting(conn, "max_retries", defaults.max_retries),
            auto_sync_interval_secs: parsed_setting(
                conn,
                "auto_sync_interval_secs",
                defaults.auto_sync_interval_secs,
            ),
            request_timeout_secs: parsed_setting(
                conn,
                "request_timeout_secs",
                defaults.request_timeout_secs,
            ),
        };
        config.sanitized()
    }

    /// Persist every field to `local_settings`.
    pub fn save(&self, db: &DbState) -> Result<(), String> {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let optional = [
            ("server_url", self.server_url.clone()),
            ("api_key", self.api_key.clone()),
            ("branch_id", self.branch_id.map(|v| v.to_string())),
        ];
        for (key, value) in optional {
            match value {
                Some(v) => db::set_setting(&conn, SETTINGS_CATEGORY, key, &v)?,
                None => db::delete_setting(&conn, SETTINGS_CATEGORY, key)?,
            }
        }
        let numeric = [
            ("batch_size", self.batch_size.to_string()),
            ("base_delay_ms", self.base_delay_ms.to_string()),
            ("cap_delay_ms", self.cap_delay_ms.to_string()),
            ("max_retries", self.max_retries.to_string()),
            ("auto_sync_interval_secs", self.auto_sync_interval_secs.to_string()),
            ("request_timeout_secs", self.request_timeout_secs.to_string()),
        ];
        for (key, value) in numeric {
            db::set_setting(&conn, SETTINGS_CATEGORY, key, &value)?;
        }
        Ok(())
    }

    /// Clamp values that would stall or break the sync loop.
    pub fn sanitized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.base_delay_ms = self.base_delay_ms.max(0);
        self.cap_delay_ms = self.cap_delay_ms.max(self.base_delay_ms);
        self.auto_sync_interval_secs = self.auto_sync_interval_secs.max(1);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults_when_unset() {
        let db = db::open_in_memory().unwrap();
        let config = SyncConfig::load(&db).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let db = db::open_in_memory().unwrap();
        let config = SyncConfig {
            server_url: Some("http://localhost:8787".into()),
            branch_id: Some(3),
            batch_size: 7,
            max_retries: 2,
            ..SyncConfig::default()
        };
        config.save(&db).unwrap();
        assert_eq!(SyncConfig::load(&db).unwrap(), config);
    }

    #[test]
    fn test_unparseable_value_falls_back() {
        let db = db::open_in_memory().unwrap();
        {
            let conn = db.conn.lock().unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "batch_size", "lots").unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "cap_delay_ms", "10").unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "base_delay_ms", "50").unwrap();
        }
        let config = SyncConfig::load(&db).unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        // cap is never below base
        assert_eq!(config.cap_delay_ms, 50);
    }
}
