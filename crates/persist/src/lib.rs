//! Rampart persistence: a small SQLite store for entities reported by sensors.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

/// Byte-level entity storage keyed by `(kind, id)` and attributed to a cluster.
pub trait Store: Send + Sync {
    /// Insert or replace. Last writer wins.
    fn upsert_raw(&self, kind: &str, id: &str, cluster_id: &str, body: &[u8]) -> Result<()>;
    /// Returns whether a row was removed.
    fn remove(&self, kind: &str, id: &str) -> Result<bool>;
    fn get_raw(&self, kind: &str, id: &str) -> Result<Option<Vec<u8>>>;
    fn ids_for_cluster(&self, kind: &str, cluster_id: &str) -> Result<Vec<String>>;
}

/// Typed helpers over any [`Store`], serializing entities as JSON.
pub trait StoreExt: Store {
    fn upsert<T: Serialize>(&self, kind: &str, id: &str, cluster_id: &str, entity: &T) -> Result<()> {
        let body = serde_json::to_vec(entity).with_context(|| format!("serializing {} {}", kind, id))?;
        self.upsert_raw(kind, id, cluster_id, &body)
    }

    fn get<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>> {
        match self.get_raw(kind, id)? {
            Some(body) => Ok(Some(serde_json::from_slice(&body).with_context(|| format!("decoding {} {}", kind, id))?)),
            None => Ok(None),
        }
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// SQLite-backed store. Simple, synchronous.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("RAMPART_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        debug!(path, "opened sqlite store");
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        let started = std::time::Instant::now();
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                kind       TEXT NOT NULL,
                id         TEXT NOT NULL,
                cluster_id TEXT NOT NULL,
                ts         INTEGER NOT NULL,
                body       BLOB NOT NULL,
                PRIMARY KEY (kind, id)
            )",
            [],
        )
        .context("creating entities table")?;
        if let Err(e) = db.execute("CREATE INDEX IF NOT EXISTS idx_entities_cluster ON entities(kind, cluster_id)", []) {
            warn!(error = %e, "creating cluster index failed; reconciliation lookups will scan");
        }
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }
}

impl Store for SqliteStore {
    fn upsert_raw(&self, kind: &str, id: &str, cluster_id: &str, body: &[u8]) -> Result<()> {
        let started = std::time::Instant::now();
        self.conn()?
            .execute(
                "INSERT INTO entities(kind, id, cluster_id, ts, body) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(kind, id) DO UPDATE SET
                    cluster_id = excluded.cluster_id, ts = excluded.ts, body = excluded.body",
                (kind, id, cluster_id, now_ts(), body),
            )
            .with_context(|| format!("upserting {} {}", kind, id))?;
        histogram!("persist_upsert_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_upsert_total", 1u64);
        Ok(())
    }

    fn remove(&self, kind: &str, id: &str) -> Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM entities WHERE kind = ?1 AND id = ?2", (kind, id))
            .with_context(|| format!("removing {} {}", kind, id))?;
        counter!("persist_remove_total", 1u64);
        Ok(n > 0)
    }

    fn get_raw(&self, kind: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT body FROM entities WHERE kind = ?1 AND id = ?2")?;
        let mut rows = stmt.query((kind, id))?;
        let body = match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        };
        Ok(body)
    }

    fn ids_for_cluster(&self, kind: &str, cluster_id: &str) -> Result<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT id FROM entities WHERE kind = ?1 AND cluster_id = ?2 ORDER BY id")?;
        let mut rows = stmt.query((kind, cluster_id))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".rampart");
        let _ = std::fs::create_dir_all(&p);
        p.push("rampart.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "rampart.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("rampart-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Thing {
        name: String,
        replicas: u32,
    }

    #[test]
    fn upsert_get_remove() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        s.upsert("deployment", "d1", "c1", &Thing { name: "a".into(), replicas: 1 }).unwrap();
        s.upsert("deployment", "d1", "c1", &Thing { name: "a".into(), replicas: 3 }).unwrap();
        let got: Thing = s.get("deployment", "d1").unwrap().unwrap();
        assert_eq!(got.replicas, 3);

        assert!(s.remove("deployment", "d1").unwrap());
        assert!(!s.remove("deployment", "d1").unwrap());
        assert!(s.get::<Thing>("deployment", "d1").unwrap().is_none());
    }

    #[test]
    fn ids_are_scoped_by_kind_and_cluster() {
        let s = SqliteStore::open_in_memory().unwrap();
        s.upsert_raw("secret", "s2", "c1", b"{}").unwrap();
        s.upsert_raw("secret", "s1", "c1", b"{}").unwrap();
        s.upsert_raw("secret", "s3", "c2", b"{}").unwrap();
        s.upsert_raw("namespace", "n1", "c1", b"{}").unwrap();
        assert_eq!(s.ids_for_cluster("secret", "c1").unwrap(), vec!["s1", "s2"]);
        assert_eq!(s.ids_for_cluster("secret", "c2").unwrap(), vec!["s3"]);
        assert_eq!(s.ids_for_cluster("namespace", "c2").unwrap(), Vec::<String>::new());
    }
}
