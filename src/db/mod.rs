use crate::config::Config;
use crate::indexer::partial::PartialIndex;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

mod migrations;

/// Snapshot store: one row per translation unit holding its last merged
/// partial index, so a restart can replay the links without re-reading
/// event files.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db directory {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db at {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(Config::get().db_busy_timeout_secs))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        migrations::migrate(&conn)?;
        debug!(path = %db_path.display(), "database ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the stored snapshot of `index.path`.
    pub fn save_unit(&self, index: &PartialIndex, pass: u64) -> Result<()> {
        let data = serde_json::to_string(index)
            .with_context(|| format!("serialize unit {}", index.path))?;
        let updated = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.conn()
            .execute(
                "INSERT INTO units (unit, pass, source, source_hash, data, updated)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(unit) DO UPDATE SET
                    pass = excluded.pass,
                    source = excluded.source,
                    source_hash = excluded.source_hash,
                    data = excluded.data,
                    updated = excluded.updated",
                params![
                    index.path,
                    pass as i64,
                    index.source,
                    index.source_hash,
                    data,
                    updated
                ],
            )
            .with_context(|| format!("save unit {}", index.path))?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_unit(&self, unit: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM units WHERE unit = ?", params![unit])
            .with_context(|| format!("delete unit {unit}"))?;
        Ok(removed > 0)
    }

    /// All stored units in pass order. Rows whose payload no longer decodes
    /// are logged and skipped; their units are rebuilt on the next reindex.
    pub fn load_units(&self) -> Result<Vec<(u64, PartialIndex)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT unit, pass, data FROM units ORDER BY pass, unit")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut units = Vec::new();
        for row in rows {
            let (unit, pass, data) = row?;
            match serde_json::from_str::<PartialIndex>(&data) {
                Ok(index) => units.push((pass.max(0) as u64, index)),
                Err(err) => warn!(unit = %unit, "skipping unreadable snapshot: {err}"),
            }
        }
        Ok(units)
    }
}
