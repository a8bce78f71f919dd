//! SQLite access through a dedicated thread and mpsc channel.
//!
//! Every operation is a message carrying a `oneshot` reply. The thread handles
//! messages one at a time, which gives single-writer semantics for every key and
//! read-after-write consistency for callers in this process. SQL failures are
//! logged inside the thread and answered with a neutral default, so callers
//! never see a persistence error.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::schema::create_tables;
use super::types::{from_unix, CircuitStateRecord, OddsSnapshot, PurgeStats};

/// Messages sent to the storage thread.
pub enum StorageMessage {
    IsSeen {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    MarkSeen {
        key: String,
        entity_id: String,
        at: i64,
        reply: oneshot::Sender<bool>,
    },
    SeenCount {
        entity_id: String,
        reply: oneshot::Sender<usize>,
    },
    GetCircuitState {
        entity_id: String,
        reply: oneshot::Sender<Option<CircuitStateRecord>>,
    },
    UpsertCircuitState {
        record: CircuitStateRecord,
        reply: oneshot::Sender<bool>,
    },
    GetSnapshot {
        key: String,
        reply: oneshot::Sender<Option<OddsSnapshot>>,
    },
    UpsertSnapshot {
        key: String,
        odds: f64,
        previous_odds: Option<f64>,
        at: i64,
        reply: oneshot::Sender<bool>,
    },
    SetLatch {
        key: String,
        sent: bool,
        reply: oneshot::Sender<bool>,
    },
    Purge {
        cutoff: i64,
        reply: oneshot::Sender<PurgeStats>,
    },
    /// Graceful shutdown
    Shutdown,
}

/// Cloneable handle to the storage thread.
#[derive(Clone)]
pub struct Storage {
    tx: Sender<StorageMessage>,
}

/// Open (or create) the database at `db_path` and spawn the storage thread.
pub fn open_storage(db_path: &str) -> Result<Storage> {
    if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database at {}", db_path))?;
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .context("enabling WAL journal")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;

    info!("[STORAGE] Database opened at {} (journal_mode={})", db_path, mode);
    spawn_writer(conn)
}

/// Private in-memory database, used by tests and dry runs.
pub fn open_storage_in_memory() -> Result<Storage> {
    let conn = Connection::open_in_memory().context("opening in-memory database")?;
    spawn_writer(conn)
}

fn spawn_writer(conn: Connection) -> Result<Storage> {
    create_tables(&conn).context("creating tables")?;

    let (tx, rx) = mpsc::channel();

    // Dedicated thread keeps blocking SQLite calls off the async runtime
    thread::Builder::new()
        .name("storage-writer".into())
        .spawn(move || storage_writer_loop(rx, conn))
        .context("spawning storage thread")?;

    Ok(Storage { tx })
}

impl Storage {
    /// Send a request and wait for the answer; `None` if the thread is gone.
    async fn request<T>(
        &self,
        op: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> StorageMessage,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(build(reply)).is_err() {
            error!("[STORAGE] Writer unavailable for {}", op);
            return None;
        }
        match rx.await {
            Ok(value) => Some(value),
            Err(_) => {
                error!("[STORAGE] Writer dropped reply for {}", op);
                None
            }
        }
    }

    /// Whether `key` was already processed. Unknown on failure, reported as unseen.
    pub async fn is_seen(&self, key: &str) -> bool {
        let key = key.to_string();
        self.request("is_seen", |reply| StorageMessage::IsSeen { key, reply })
            .await
            .unwrap_or(false)
    }

    /// Insert-if-absent. Returns false only when the key already existed;
    /// failures count as a fresh insert so the record stays eligible.
    pub async fn mark_seen(&self, key: &str, entity_id: &str, at: DateTime<Utc>) -> bool {
        let (key, entity_id) = (key.to_string(), entity_id.to_string());
        self.request("mark_seen", |reply| StorageMessage::MarkSeen {
            key,
            entity_id,
            at: at.timestamp(),
            reply,
        })
        .await
        .unwrap_or(true)
    }

    /// Number of keys recorded for an entity
    pub async fn seen_count_for(&self, entity_id: &str) -> usize {
        let entity_id = entity_id.to_string();
        self.request("seen_count_for", |reply| StorageMessage::SeenCount { entity_id, reply })
            .await
            .unwrap_or(0)
    }

    /// Returns `(failures, paused_until)`; an unknown entity is `(0, None)`.
    pub async fn get_circuit_state(&self, entity_id: &str) -> (u32, Option<DateTime<Utc>>) {
        let entity_id = entity_id.to_string();
        self.request("get_circuit_state", |reply| StorageMessage::GetCircuitState {
            entity_id,
            reply,
        })
        .await
        .flatten()
        .map(|r| (r.failures, r.paused_until))
        .unwrap_or((0, None))
    }

    pub async fn upsert_circuit_state(
        &self,
        entity_id: &str,
        failures: u32,
        paused_until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> bool {
        let record = CircuitStateRecord {
            entity_id: entity_id.to_string(),
            failures,
            paused_until,
            updated_at: at,
        };
        self.request("upsert_circuit_state", |reply| StorageMessage::UpsertCircuitState {
            record,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn get_snapshot(&self, key: &str) -> Option<OddsSnapshot> {
        let key = key.to_string();
        self.request("get_snapshot", |reply| StorageMessage::GetSnapshot { key, reply })
            .await
            .flatten()
    }

    /// Store `odds` as the new reference. The latch of an existing row is preserved.
    pub async fn upsert_snapshot(
        &self,
        key: &str,
        odds: f64,
        previous_odds: Option<f64>,
        at: DateTime<Utc>,
    ) -> bool {
        let key = key.to_string();
        self.request("upsert_snapshot", |reply| StorageMessage::UpsertSnapshot {
            key,
            odds,
            previous_odds,
            at: at.timestamp(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn set_latch(&self, key: &str, sent: bool) -> bool {
        let key = key.to_string();
        self.request("set_latch", |reply| StorageMessage::SetLatch { key, sent, reply })
            .await
            .unwrap_or(false)
    }

    /// Delete seen keys and snapshots strictly older than `cutoff`.
    /// Circuit-breaker state is never purged.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> PurgeStats {
        let cutoff = cutoff.timestamp();
        self.request("purge_older_than", |reply| StorageMessage::Purge { cutoff, reply })
            .await
            .unwrap_or_default()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.tx.send(StorageMessage::Shutdown);
    }
}

/// Main loop running in the storage thread.
fn storage_writer_loop(rx: Receiver<StorageMessage>, conn: Connection) {
    // A dropped reply receiver means the caller went away; nothing to do.
    for msg in rx.iter() {
        match msg {
            StorageMessage::IsSeen { key, reply } => {
                let _ = reply.send(is_seen(&conn, &key));
            }
            StorageMessage::MarkSeen { key, entity_id, at, reply } => {
                let _ = reply.send(insert_seen(&conn, &key, &entity_id, at));
            }
            StorageMessage::SeenCount { entity_id, reply } => {
                let _ = reply.send(seen_count(&conn, &entity_id));
            }
            StorageMessage::GetCircuitState { entity_id, reply } => {
                let _ = reply.send(select_circuit_state(&conn, &entity_id));
            }
            StorageMessage::UpsertCircuitState { record, reply } => {
                let _ = reply.send(upsert_circuit_state(&conn, &record));
            }
            StorageMessage::GetSnapshot { key, reply } => {
                let _ = reply.send(select_snapshot(&conn, &key));
            }
            StorageMessage::UpsertSnapshot { key, odds, previous_odds, at, reply } => {
                let _ = reply.send(upsert_snapshot(&conn, &key, odds, previous_odds, at));
            }
            StorageMessage::SetLatch { key, sent, reply } => {
                let _ = reply.send(set_latch(&conn, &key, sent));
            }
            StorageMessage::Purge { cutoff, reply } => {
                let _ = reply.send(purge(&conn, cutoff));
            }
            StorageMessage::Shutdown => {
                info!("[STORAGE] Writer shutdown complete");
                return;
            }
        }
    }
    info!("[STORAGE] Channel disconnected, writer exiting");
}

fn is_seen(conn: &Connection, key: &str) -> bool {
    match conn
        .query_row("SELECT 1 FROM seen_keys WHERE key = ?1", [key], |_| Ok(()))
        .optional()
    {
        Ok(row) => row.is_some(),
        Err(e) => {
            warn!("[STORAGE] Failed to check seen key {}: {}", key, e);
            false
        }
    }
}

fn insert_seen(conn: &Connection, key: &str, entity_id: &str, at: i64) -> bool {
    match conn.execute(
        "INSERT OR IGNORE INTO seen_keys (key, entity_id, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![key, entity_id, at],
    ) {
        Ok(rows) => rows > 0,
        Err(e) => {
            warn!("[STORAGE] Failed to insert seen key {}: {}", key, e);
            true
        }
    }
}

fn seen_count(conn: &Connection, entity_id: &str) -> usize {
    conn.query_row(
        "SELECT COUNT(*) FROM seen_keys WHERE entity_id = ?1",
        [entity_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n.max(0) as usize)
    .unwrap_or_else(|e| {
        warn!("[STORAGE] Failed to count seen keys for {}: {}", entity_id, e);
        0
    })
}

fn select_circuit_state(conn: &Connection, entity_id: &str) -> Option<CircuitStateRecord> {
    conn.query_row(
        "SELECT failures, paused_until, updated_at FROM entity_status WHERE entity_id = ?1",
        [entity_id],
        |row| {
            Ok(CircuitStateRecord {
                entity_id: entity_id.to_string(),
                failures: row.get(0)?,
                paused_until: row.get::<_, Option<i64>>(1)?.map(from_unix),
                updated_at: from_unix(row.get(2)?),
            })
        },
    )
    .optional()
    .unwrap_or_else(|e| {
        warn!("[STORAGE] Failed to read status for {}: {}", entity_id, e);
        None
    })
}

fn upsert_circuit_state(conn: &Connection, record: &CircuitStateRecord) -> bool {
    let result = conn.execute(
        "INSERT INTO entity_status (entity_id, failures, paused_until, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(entity_id) DO UPDATE SET
            failures = excluded.failures,
            paused_until = excluded.paused_until,
            updated_at = excluded.updated_at",
        rusqlite::params![
            record.entity_id,
            record.failures,
            record.paused_until.map(|t| t.timestamp()),
            record.updated_at.timestamp(),
        ],
    );
    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("[STORAGE] Failed to write status for {}: {}", record.entity_id, e);
            false
        }
    }
}

fn select_snapshot(conn: &Connection, key: &str) -> Option<OddsSnapshot> {
    conn.query_row(
        "SELECT odds, previous_odds, updated_at, alert_sent FROM odds_snapshot WHERE key = ?1",
        [key],
        |row| {
            Ok(OddsSnapshot {
                key: key.to_string(),
                odds: row.get(0)?,
                previous_odds: row.get(1)?,
                updated_at: from_unix(row.get(2)?),
                alert_sent: row.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()
    .unwrap_or_else(|e| {
        warn!("[STORAGE] Failed to read odds snapshot {}: {}", key, e);
        None
    })
}

fn upsert_snapshot(conn: &Connection, key: &str, odds: f64, previous_odds: Option<f64>, at: i64) -> bool {
    let result = conn.execute(
        "INSERT INTO odds_snapshot (key, odds, previous_odds, updated_at, alert_sent)
         VALUES (?1, ?2, ?3, ?4, 0)
         ON CONFLICT(key) DO UPDATE SET
            odds = excluded.odds,
            previous_odds = excluded.previous_odds,
            updated_at = excluded.updated_at",
        rusqlite::params![key, odds, previous_odds, at],
    );
    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("[STORAGE] Failed to upsert odds snapshot {}: {}", key, e);
            false
        }
    }
}

fn set_latch(conn: &Connection, key: &str, sent: bool) -> bool {
    match conn.execute(
        "UPDATE odds_snapshot SET alert_sent = ?1 WHERE key = ?2",
        rusqlite::params![sent as i32, key],
    ) {
        Ok(rows) => rows > 0,
        Err(e) => {
            warn!("[STORAGE] Failed to set alert latch {}: {}", key, e);
            false
        }
    }
}

fn purge(conn: &Connection, cutoff: i64) -> PurgeStats {
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => {
            error!("[STORAGE] Failed to start purge transaction: {}", e);
            return PurgeStats::default();
        }
    };

    let seen_keys = tx
        .execute("DELETE FROM seen_keys WHERE created_at < ?1", [cutoff])
        .unwrap_or_else(|e| {
            warn!("[STORAGE] Failed to purge seen keys: {}", e);
            0
        });
    let snapshots = tx
        .execute("DELETE FROM odds_snapshot WHERE updated_at < ?1", [cutoff])
        .unwrap_or_else(|e| {
            warn!("[STORAGE] Failed to purge odds snapshots: {}", e);
            0
        });

    if let Err(e) = tx.commit() {
        error!("[STORAGE] Failed to commit purge: {}", e);
        return PurgeStats::default();
    }

    PurgeStats { seen_keys, snapshots }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_mark_seen_is_idempotent() {
        let storage = open_storage_in_memory().unwrap();
        let now = Utc::now();

        assert!(!storage.is_seen("bet-1").await);
        assert!(storage.mark_seen("bet-1", "user-1", now).await);
        assert!(storage.is_seen("bet-1").await);

        // Second insert is a no-op
        assert!(!storage.mark_seen("bet-1", "user-1", now).await);
        assert!(storage.is_seen("bet-1").await);
        assert_eq!(storage.seen_count_for("user-1").await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_mark_seen_claims_once() {
        let storage = open_storage_in_memory().unwrap();
        let now = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let s = storage.clone();
                tokio::spawn(async move { s.mark_seen("shared", "user-1", now).await })
            })
            .collect();

        let mut inserted = 0;
        for h in handles {
            if h.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_circuit_state_roundtrip() {
        let storage = open_storage_in_memory().unwrap();
        let now = Utc::now();

        assert_eq!(storage.get_circuit_state("user-1").await, (0, None));

        let until = now + Duration::minutes(30);
        assert!(storage.upsert_circuit_state("user-1", 3, Some(until), now).await);
        let (failures, paused) = storage.get_circuit_state("user-1").await;
        assert_eq!(failures, 3);
        assert_eq!(paused.map(|t| t.timestamp()), Some(until.timestamp()));

        assert!(storage.upsert_circuit_state("user-1", 0, None, now).await);
        assert_eq!(storage.get_circuit_state("user-1").await, (0, None));
    }

    #[tokio::test]
    async fn test_snapshot_upsert_preserves_latch() {
        let storage = open_storage_in_memory().unwrap();
        let now = Utc::now();

        assert!(storage.get_snapshot("bet-1").await.is_none());
        assert!(!storage.set_latch("bet-1", true).await, "no row to latch yet");

        storage.upsert_snapshot("bet-1", 1.80, None, now).await;
        assert!(storage.set_latch("bet-1", true).await);
        storage.upsert_snapshot("bet-1", 2.10, Some(1.80), now).await;

        let snap = storage.get_snapshot("bet-1").await.unwrap();
        assert_eq!(snap.odds, 2.10);
        assert_eq!(snap.previous_odds, Some(1.80));
        assert!(snap.alert_sent);

        storage.set_latch("bet-1", false).await;
        assert!(!storage.get_snapshot("bet-1").await.unwrap().alert_sent);
    }

    #[tokio::test]
    async fn test_purge_removes_only_strictly_older_rows() {
        let storage = open_storage_in_memory().unwrap();
        let now = Utc::now();
        let cutoff = now - Duration::days(30);

        storage.mark_seen("old", "u", cutoff - Duration::seconds(1)).await;
        storage.mark_seen("edge", "u", cutoff).await;
        storage.mark_seen("fresh", "u", now).await;
        storage.upsert_snapshot("old", 2.0, None, cutoff - Duration::days(1)).await;
        storage.upsert_snapshot("fresh", 2.0, None, now).await;
        storage
            .upsert_circuit_state("u", 2, None, cutoff - Duration::days(10))
            .await;

        let stats = storage.purge_older_than(cutoff).await;
        assert_eq!(stats, PurgeStats { seen_keys: 1, snapshots: 1 });

        assert!(!storage.is_seen("old").await);
        assert!(storage.is_seen("edge").await);
        assert!(storage.is_seen("fresh").await);
        assert!(storage.get_snapshot("old").await.is_none());
        assert!(storage.get_snapshot("fresh").await.is_some());
        // Circuit-breaker state is not subject to retention
        assert_eq!(storage.get_circuit_state("u").await.0, 2);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("monitor.db");
        let path = path.to_str().unwrap();

        let storage = open_storage(path).unwrap();
        storage.mark_seen("bet-1", "u", Utc::now()).await;
        storage.shutdown();
        drop(storage);

        let reopened = open_storage(path).unwrap();
        assert!(reopened.is_seen("bet-1").await);
    }

    #[tokio::test]
    async fn test_calls_fail_open_after_shutdown() {
        let storage = open_storage_in_memory().unwrap();
        storage.shutdown();
        // Give the thread a moment to exit
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!storage.is_seen("x").await);
        assert!(storage.mark_seen("x", "u", Utc::now()).await);
        assert_eq!(storage.get_circuit_state("u").await, (0, None));
        assert_eq!(storage.purge_older_than(Utc::now()).await, PurgeStats::default());
    }
}
