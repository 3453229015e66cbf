//! Durable lease store backed by SQLite.
//!
//! One row per client identity; the allocator relies on the single
//! `Mutex<Connection>` for read-then-write atomicity within this process.

use crate::error::BrokerError;
use chrono::{DateTime, Utc};
use common::Lease;
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    identity TEXT PRIMARY KEY,
    container_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    ttl_seconds INTEGER NOT NULL
);
"#;

/// Get the default database path (~/.boxbroker/state.db)
pub fn default_db_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".boxbroker")
        .join("state.db")
}

#[derive(Clone)]
pub struct LeaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl LeaseStore {
    /// Open (or create) the store at the given path, creating the parent
    /// directory if needed.
    pub fn open(path: &Path) -> Result<Self, BrokerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self, BrokerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn get(&self, identity: &str) -> Result<Option<Lease>, BrokerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT identity, container_id, created_at, ttl_seconds FROM leases WHERE identity = ?1",
        )?;
        let mut rows = stmt.query_map(params![identity], row_to_lease)?;
        match rows.next() {
            Some(lease) => Ok(Some(lease?)),
            None => Ok(None),
        }
    }

    /// Write a lease, replacing any previous lease for the same identity.
    pub fn put(&self, lease: &Lease) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO leases (identity, container_id, created_at, ttl_seconds) VALUES (?1, ?2, ?3, ?4)",
            params![
                lease.identity,
                lease.container_id,
                lease.created_at.to_rfc3339(),
                lease.ttl_seconds,
            ],
        )?;
        Ok(())
    }

    /// Delete a lease. Deleting an absent identity is a no-op success.
    pub fn delete(&self, identity: &str) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM leases WHERE identity = ?1", params![identity])?;
        Ok(())
    }

    /// Snapshot of every lease currently in the store.
    pub fn scan_all(&self) -> Result<Vec<Lease>, BrokerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT identity, container_id, created_at, ttl_seconds FROM leases")?;
        let rows = stmt.query_map([], row_to_lease)?;
        let mut leases = Vec::new();
        for lease in rows {
            leases.push(lease?);
        }
        Ok(leases)
    }
}

#[cfg(test)]
impl LeaseStore {
    /// Run raw SQL against the backing database, for shaping failure
    /// scenarios in tests.
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), BrokerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        Ok(())
    }
}

fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    let identity: String = row.get(0)?;
    let container_id: String = row.get(1)?;
    let created_at_str: String = row.get(2)?;
    let ttl_seconds: u64 = row.get(3)?;

    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Lease {
        identity,
        container_id,
        created_at,
        ttl_seconds,
    })
}
