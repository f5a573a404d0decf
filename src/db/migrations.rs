use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const SCHEMA_VERSION: i64 = 1;

pub fn migrate(conn: &Connection, db_path: &Path) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(stored) = stored {
        let found = stored.trim().parse::<i64>().unwrap_or(-1);
        if found != SCHEMA_VERSION {
            return Err(Error::IncompatibleSchema {
                path: db_path.to_path_buf(),
                found,
                supported: SCHEMA_VERSION,
            });
        }
    }

    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS index_runs (
            id INTEGER PRIMARY KEY,
            root TEXT NOT NULL,
            started INTEGER NOT NULL,
            finished INTEGER NOT NULL,
            files_scanned INTEGER NOT NULL DEFAULT 0,
            files_indexed INTEGER NOT NULL DEFAULT 0,
            files_removed INTEGER NOT NULL DEFAULT 0,
            parse_errors INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS run_fingerprints (
            run_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            hash TEXT NOT NULL,
            PRIMARY KEY(run_id, path),
            FOREIGN KEY(run_id) REFERENCES index_runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            parse_error TEXT,
            shadowed INTEGER NOT NULL DEFAULT 0,
            run_id INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS symbols (
            id INTEGER PRIMARY KEY,
            file_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            qualname TEXT NOT NULL UNIQUE,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            start_byte INTEGER NOT NULL,
            end_byte INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            docstring TEXT,
            comment TEXT,
            complexity INTEGER NOT NULL,
            FOREIGN KEY(file_id) REFERENCES files(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
        CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_id);

        CREATE TABLE IF NOT EXISTS edges (
            id INTEGER PRIMARY KEY,
            file_id INTEGER NOT NULL,
            caller_symbol_id INTEGER NOT NULL,
            callee_symbol_id INTEGER,
            callee_qualname TEXT,
            raw_callee TEXT NOT NULL,
            line INTEGER NOT NULL,
            provenance TEXT NOT NULL DEFAULT 'static',
            FOREIGN KEY(file_id) REFERENCES files(id) ON DELETE CASCADE,
            FOREIGN KEY(caller_symbol_id) REFERENCES symbols(id) ON DELETE CASCADE,
            FOREIGN KEY(callee_symbol_id) REFERENCES symbols(id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS idx_edges_caller ON edges(caller_symbol_id);
        CREATE INDEX IF NOT EXISTS idx_edges_callee ON edges(callee_symbol_id);
        CREATE INDEX IF NOT EXISTS idx_edges_callee_qualname ON edges(callee_qualname);
        CREATE INDEX IF NOT EXISTS idx_edges_file ON edges(file_id);

        CREATE TABLE IF NOT EXISTS hotspots (
            symbol_id INTEGER PRIMARY KEY,
            complexity INTEGER NOT NULL,
            churn INTEGER NOT NULL,
            score REAL NOT NULL,
            rank INTEGER NOT NULL,
            FOREIGN KEY(symbol_id) REFERENCES symbols(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_hotspots_rank ON hotspots(rank);

        CREATE TABLE IF NOT EXISTS trace_runs (
            id INTEGER PRIMARY KEY,
            entry TEXT NOT NULL,
            args TEXT NOT NULL,
            started INTEGER NOT NULL,
            finished INTEGER,
            status TEXT NOT NULL,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS trace_events (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            caller_symbol_id INTEGER,
            caller_qualname TEXT,
            callee_symbol_id INTEGER NOT NULL,
            callee_qualname TEXT NOT NULL,
            depth INTEGER NOT NULL,
            offset_ns INTEGER NOT NULL,
            UNIQUE(run_id, seq),
            FOREIGN KEY(run_id) REFERENCES trace_runs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_trace_events_caller ON trace_events(caller_qualname);
        CREATE INDEX IF NOT EXISTS idx_trace_events_callee ON trace_events(callee_qualname);
        COMMIT;
        ",
    )?;

    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite");
        let conn = Connection::open(&path).unwrap();
        migrate(&conn, &path).unwrap();
        migrate(&conn, &path).unwrap();
        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, "1");
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite");
        let conn = Connection::open(&path).unwrap();
        migrate(&conn, &path).unwrap();
        conn.execute("UPDATE meta SET value = '99' WHERE key = 'schema_version'", [])
            .unwrap();
        let err = migrate(&conn, &path).unwrap_err();
        assert!(matches!(
            err,
            Error::IncompatibleSchema { found: 99, supported: 1, .. }
        ));
    }
}
