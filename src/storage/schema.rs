//! Database schema creation and migrations.

use rusqlite::{Connection, Result};

/// Create all database tables and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Idempotency keys of every record already processed
    conn.execute(
        "CREATE TABLE IF NOT EXISTS seen_keys (
            key TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Per-entity failure counter and pause window
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entity_status (
            entity_id TEXT PRIMARY KEY,
            failures INTEGER NOT NULL DEFAULT 0,
            paused_until INTEGER,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Rolling odds reference per record key
    conn.execute(
        "CREATE TABLE IF NOT EXISTS odds_snapshot (
            key TEXT PRIMARY KEY,
            odds REAL NOT NULL,
            previous_odds REAL,
            updated_at INTEGER NOT NULL,
            alert_sent INTEGER NOT NULL DEFAULT 0
        ) WITHOUT ROWID",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_seen_entity ON seen_keys(entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_seen_created ON seen_keys(created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_odds_updated ON odds_snapshot(updated_at)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(tables, vec!["entity_status", "odds_snapshot", "seen_keys"]);
    }
}
