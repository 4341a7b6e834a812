use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 1;

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS units (
            unit TEXT PRIMARY KEY,
            pass INTEGER NOT NULL,
            source TEXT,
            source_hash TEXT,
            data TEXT NOT NULL,
            updated INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_units_pass ON units(pass);
        CREATE INDEX IF NOT EXISTS idx_units_source ON units(source);
        COMMIT;
        ",
    )?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let existing = existing
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);

    if existing > SCHEMA_VERSION {
        anyhow::bail!(
            "database schema version {existing} is newer than supported version {SCHEMA_VERSION}"
        );
    }

    if existing < SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_VERSION.to_string()],
        )?;
    }

    Ok(())
}
