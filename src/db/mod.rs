use crate::config::Config;
use crate::error::{Error, Result};
use crate::hotspot::HotspotRow;
use crate::indexer::extract::SymbolInput;
use crate::indexer::resolve::{Resolution, ResolvedEdge};
use crate::model::{
    CallEdge, Callee, FileIssue, HotspotScore, Provenance, Symbol, SymbolKind, SymbolRef,
    TraceEvent, TraceRun, TraceStatus,
};
use crate::util;
use blake3::Hasher;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

mod migrations;

pub use migrations::SCHEMA_VERSION;

/// Rows per statement batch when persisting trace events.
const TRACE_EVENT_BATCH: usize = 500;

#[derive(Debug)]
struct ConnectionCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        Ok(())
    }

    fn on_release(&self, _conn: Connection) {}
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub hash: String,
    pub size: i64,
    pub parse_error: Option<String>,
    /// Symbols of this file dropped because another file owns the qualname.
    pub shadowed: i64,
}

/// Symbol row reduced to what the resolver and span lookups need.
#[derive(Debug, Clone)]
pub struct StoredSymbol {
    pub id: i64,
    pub file_path: String,
    pub kind: SymbolKind,
    pub qualname: String,
    pub name: String,
    pub start_line: i64,
    pub end_line: i64,
    pub fingerprint: String,
    pub complexity: i64,
}

/// Static edge as stored, keyed by file for dependency checks.
#[derive(Debug, Clone)]
pub struct StoredEdge {
    pub file_path: String,
    pub callee_qualname: Option<String>,
    pub raw_callee: String,
}

/// One file whose rows are replaced by this run.
#[derive(Debug, Clone)]
pub struct FileWrite {
    pub path: String,
    pub hash: String,
    pub size: i64,
    pub parse_error: Option<String>,
    pub shadowed: i64,
    pub symbols: Vec<SymbolInput>,
    pub edges: Vec<ResolvedEdge>,
}

/// Unchanged file whose outgoing edges were re-resolved.
#[derive(Debug, Clone)]
pub struct EdgeRewrite {
    pub path: String,
    pub edges: Vec<ResolvedEdge>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    pub root: String,
    pub started: i64,
    pub removed: Vec<String>,
    pub files: Vec<FileWrite>,
    pub edge_rewrites: Vec<EdgeRewrite>,
    pub hotspots: Vec<HotspotRow>,
    /// Every scanned path with its content hash, sorted by path.
    pub fingerprints: Vec<(String, String)>,
    pub parse_errors: usize,
}

impl IndexBatch {
    fn changes_graph(&self) -> bool {
        !self.removed.is_empty() || !self.files.is_empty() || !self.edge_rewrites.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRunRecord {
    pub id: i64,
    pub root: String,
    pub started: i64,
    pub finished: i64,
    pub files_scanned: i64,
    pub files_indexed: i64,
    pub files_removed: i64,
    pub parse_errors: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub files: usize,
    pub symbols: usize,
    pub edges: usize,
    pub unresolved_edges: usize,
    pub hotspots: usize,
    pub trace_runs: usize,
}

/// Trace event ready to persist; symbol ids are looked up by qualname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEventInput {
    pub seq: i64,
    pub caller_qualname: Option<String>,
    pub callee_qualname: String,
    pub depth: i64,
    pub offset_ns: i64,
}

/// Keyword-index document source.
#[derive(Debug, Clone)]
pub struct SymbolDocument {
    pub symbol: SymbolRef,
    pub kind: SymbolKind,
    pub name: String,
    pub docstring: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDigest {
    pub rows: usize,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbDigest {
    pub files: TableDigest,
    pub symbols: TableDigest,
    pub edges: TableDigest,
    pub hotspots: TableDigest,
}

/// Writer held from the start of an index run until its batch commits.
pub struct IndexLease<'a> {
    db: &'a Db,
    conn: MutexGuard<'a, Connection>,
    base_run: Option<i64>,
}

impl IndexLease<'_> {
    /// Commit `batch`. Fails with `StoreConcurrency`, changing nothing, when
    /// another writer committed a run after the lease was taken.
    pub fn apply(mut self, batch: &IndexBatch) -> Result<i64> {
        let db = self.db;
        let tx = db.immediate(&mut self.conn)?;
        let current = latest_run_id(&tx).map_err(|err| db.map_busy(err))?;
        if current != self.base_run {
            tracing::warn!(
                "index run committed by another writer since this run started ({:?} -> {:?})",
                self.base_run,
                current
            );
            return Err(db.concurrency_error());
        }
        let run_id = write_index_run(&tx, batch).map_err(|err| match err {
            Error::Sqlite(inner) => db.map_busy(inner),
            other => other,
        })?;
        tx.commit().map_err(|err| db.map_busy(err))?;
        Ok(run_id)
    }
}

fn latest_run_id(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT MAX(id) FROM index_runs", [], |row| row.get(0))
}

pub struct Db {
    root: PathBuf,
    db_path: PathBuf,
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
}

impl Db {
    /// Open (creating if needed) the store at `db_path` for the repository at `root`.
    pub fn open(root: &Path, db_path: &Path) -> Result<Self> {
        util::ensure_parent_dir(db_path)?;

        let config = Config::get();
        tracing::debug!(
            "initializing connection pool (size: {}, min_idle: {})",
            config.pool_size,
            config.pool_min_idle
        );

        let write_conn = Connection::open(db_path)?;
        write_conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        write_conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        migrations::migrate(&write_conn, db_path).map_err(|err| match err {
            Error::Sqlite(inner) if is_busy(&inner) => Error::StoreConcurrency {
                root: root.to_path_buf(),
            },
            other => other,
        })?;

        let write_conn = Arc::new(Mutex::new(write_conn));

        let manager = SqliteConnectionManager::file(db_path);
        let read_pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(config.pool_min_idle.min(config.pool_size)))
            .connection_timeout(Duration::from_secs(30))
            .connection_customizer(Box::new(ConnectionCustomizer))
            .build(manager)?;

        Ok(Self {
            root: root.to_path_buf(),
            db_path: db_path.to_path_buf(),
            write_conn,
            read_pool,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn read_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.read_pool.get()?)
    }

    /// Exclusive writer lease. Fails fast instead of queueing behind
    /// another write in this process.
    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        match self.write_conn.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(self.concurrency_error()),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Writer used by trace persistence, which waits its turn.
    fn writer_blocking(&self) -> MutexGuard<'_, Connection> {
        match self.write_conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn concurrency_error(&self) -> Error {
        Error::StoreConcurrency {
            root: self.root.clone(),
        }
    }

    fn immediate<'c>(&self, conn: &'c mut Connection) -> Result<Transaction<'c>> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| self.map_busy(err))
    }

    fn map_busy(&self, err: rusqlite::Error) -> Error {
        if is_busy(&err) {
            self.concurrency_error()
        } else {
            Error::Sqlite(err)
        }
    }

    /// Take the writer for a whole index run, before the working tree and
    /// the stored state are read. The lease remembers the latest run so a
    /// run committed meanwhile by another process is detected at apply time.
    pub fn begin_index(&self) -> Result<IndexLease<'_>> {
        let conn = self.writer()?;
        let base_run = latest_run_id(&conn).map_err(|err| self.map_busy(err))?;
        Ok(IndexLease {
            db: self,
            conn,
            base_run,
        })
    }

    /// Apply one re-index atomically: a failure anywhere leaves the
    /// previous state untouched. Returns the new run id.
    pub fn apply_index_run(&self, batch: &IndexBatch) -> Result<i64> {
        self.begin_index()?.apply(batch)
    }

    pub fn generation(&self) -> Result<i64> {
        Ok(self.get_meta_i64("generation")?.unwrap_or(0))
    }

    pub fn get_meta_i64(&self, key: &str) -> Result<Option<i64>> {
        let value: Option<String> = self
            .read_conn()?
            .query_row(
                "SELECT value FROM meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse::<i64>().ok()))
    }

    pub fn latest_run(&self) -> Result<Option<IndexRunRecord>> {
        let conn = self.read_conn()?;
        let run = conn
            .query_row(
                "SELECT id, root, started, finished, files_scanned, files_indexed,
                        files_removed, parse_errors
                 FROM index_runs
                 ORDER BY id DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok(IndexRunRecord {
                        id: row.get(0)?,
                        root: row.get(1)?,
                        started: row.get(2)?,
                        finished: row.get(3)?,
                        files_scanned: row.get(4)?,
                        files_indexed: row.get(5)?,
                        files_removed: row.get(6)?,
                        parse_errors: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(run)
    }

    /// Path -> content hash as recorded by the latest run.
    pub fn latest_fingerprints(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT path, hash
             FROM run_fingerprints
             WHERE run_id = (SELECT MAX(id) FROM index_runs)
             ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut fingerprints = BTreeMap::new();
        for row in rows {
            let (path, hash): (String, String) = row?;
            fingerprints.insert(path, hash);
        }
        Ok(fingerprints)
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, path, hash, size, parse_error, shadowed
             FROM files
             ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FileRecord {
                id: row.get(0)?,
                path: row.get(1)?,
                hash: row.get(2)?,
                size: row.get(3)?,
                parse_error: row.get(4)?,
                shadowed: row.get(5)?,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    pub fn parse_errors(&self) -> Result<Vec<FileIssue>> {
        Ok(self
            .list_files()?
            .into_iter()
            .filter_map(|file| {
                file.parse_error.map(|message| FileIssue {
                    path: file.path,
                    message,
                })
            })
            .collect())
    }

    pub fn list_stored_symbols(&self) -> Result<Vec<StoredSymbol>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, f.path, s.kind, s.qualname, s.name, s.start_line, s.end_line, s.fingerprint,
                    s.complexity
             FROM symbols s
             JOIN files f ON f.id = s.file_id
             ORDER BY f.path, s.start_line, s.qualname",
        )?;
        let rows = stmt.query_map([], stored_symbol_from_row)?;
        let mut symbols = Vec::new();
        for row in rows {
            symbols.push(row?);
        }
        Ok(symbols)
    }

    pub fn symbols_for_path(&self, path: &str) -> Result<Vec<StoredSymbol>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, f.path, s.kind, s.qualname, s.name, s.start_line, s.end_line, s.fingerprint,
                    s.complexity
             FROM symbols s
             JOIN files f ON f.id = s.file_id
             WHERE f.path = ?
             ORDER BY s.start_line, s.qualname",
        )?;
        let rows = stmt.query_map(params![path], stored_symbol_from_row)?;
        let mut symbols = Vec::new();
        for row in rows {
            symbols.push(row?);
        }
        Ok(symbols)
    }

    pub fn list_stored_edges(&self) -> Result<Vec<StoredEdge>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT f.path, e.callee_qualname, e.raw_callee
             FROM edges e
             JOIN files f ON f.id = e.file_id
             ORDER BY f.path, e.line",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredEdge {
                file_path: row.get(0)?,
                callee_qualname: row.get(1)?,
                raw_callee: row.get(2)?,
            })
        })?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    pub fn get_symbol(&self, qualname: &str) -> Result<Option<Symbol>> {
        let conn = self.read_conn()?;
        let symbol = conn
            .query_row(
                &format!("{SYMBOL_SELECT} WHERE s.qualname = ?"),
                params![qualname],
                symbol_from_row,
            )
            .optional()?;
        Ok(symbol)
    }

    /// Exact qualname first; otherwise symbols whose short name or
    /// `Scope.name` suffix matches.
    pub fn find_symbols(&self, needle: &str) -> Result<Vec<Symbol>> {
        if let Some(symbol) = self.get_symbol(needle)? {
            return Ok(vec![symbol]);
        }
        let conn = self.read_conn()?;
        let (sql, arg) = if needle.contains('.') || needle.contains(':') {
            (
                format!("{SYMBOL_SELECT} WHERE s.qualname LIKE ? ESCAPE '\\' ORDER BY s.qualname"),
                format!("%:{}", escape_like(needle)),
            )
        } else {
            (
                format!("{SYMBOL_SELECT} WHERE s.name = ? AND s.kind != 'module' ORDER BY s.qualname"),
                needle.to_string(),
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![arg], symbol_from_row)?;
        let mut symbols = Vec::new();
        for row in rows {
            symbols.push(row?);
        }
        Ok(symbols)
    }

    pub fn static_callers(&self, symbol_id: i64) -> Result<Vec<CallEdge>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT caller.id, caller.qualname, cf.path, caller.start_line,
                    callee.id, callee.qualname, tf.path, callee.start_line, e.line
             FROM edges e
             JOIN symbols caller ON caller.id = e.caller_symbol_id
             JOIN files cf ON cf.id = caller.file_id
             JOIN symbols callee ON callee.id = e.callee_symbol_id
             JOIN files tf ON tf.id = callee.file_id
             WHERE e.callee_symbol_id = ?
             ORDER BY caller.qualname, e.line",
        )?;
        let rows = stmt.query_map(params![symbol_id], |row| {
            Ok(CallEdge {
                caller: Some(symbol_ref_at(row, 0)?),
                callee: Callee::Resolved {
                    symbol: symbol_ref_at(row, 4)?,
                },
                provenance: Provenance::Static,
                line: Some(row.get(8)?),
                observed: None,
            })
        })?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    pub fn static_callees(&self, symbol_id: i64) -> Result<Vec<CallEdge>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT caller.id, caller.qualname, cf.path, caller.start_line,
                    callee.id, callee.qualname, tf.path, callee.start_line,
                    e.line, e.raw_callee
             FROM edges e
             JOIN symbols caller ON caller.id = e.caller_symbol_id
             JOIN files cf ON cf.id = caller.file_id
             LEFT JOIN symbols callee ON callee.id = e.callee_symbol_id
             LEFT JOIN files tf ON tf.id = callee.file_id
             WHERE e.caller_symbol_id = ?
             ORDER BY e.line, COALESCE(callee.qualname, e.raw_callee)",
        )?;
        let rows = stmt.query_map(params![symbol_id], |row| {
            let callee_id: Option<i64> = row.get(4)?;
            let callee = match callee_id {
                Some(_) => Callee::Resolved {
                    symbol: symbol_ref_at(row, 4)?,
                },
                None => Callee::Unresolved { raw: row.get(9)? },
            };
            Ok(CallEdge {
                caller: Some(symbol_ref_at(row, 0)?),
                callee,
                provenance: Provenance::Static,
                line: Some(row.get(8)?),
                observed: None,
            })
        })?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    /// Distinct traced callers of `qualname`, joined to current symbols.
    /// Calls made by the trace entry point have no caller.
    pub fn dynamic_callers(&self, qualname: &str) -> Result<Vec<CallEdge>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT caller.id, t.caller_qualname, cf.path, caller.start_line,
                    callee.id, callee.qualname, tf.path, callee.start_line,
                    COUNT(*)
             FROM trace_events t
             JOIN symbols callee ON callee.qualname = t.callee_qualname
             JOIN files tf ON tf.id = callee.file_id
             LEFT JOIN symbols caller ON caller.qualname = t.caller_qualname
             LEFT JOIN files cf ON cf.id = caller.file_id
             WHERE t.callee_qualname = ?
               AND (t.caller_qualname IS NULL OR caller.id IS NOT NULL)
             GROUP BY t.caller_qualname
             ORDER BY COALESCE(t.caller_qualname, '')",
        )?;
        let rows = stmt.query_map(params![qualname], dynamic_edge_from_row)?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    /// Distinct traced callees of `qualname`, joined to current symbols.
    pub fn dynamic_callees(&self, qualname: &str) -> Result<Vec<CallEdge>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT caller.id, t.caller_qualname, cf.path, caller.start_line,
                    callee.id, callee.qualname, tf.path, callee.start_line,
                    COUNT(*)
             FROM trace_events t
             JOIN symbols caller ON caller.qualname = t.caller_qualname
             JOIN files cf ON cf.id = caller.file_id
             JOIN symbols callee ON callee.qualname = t.callee_qualname
             JOIN files tf ON tf.id = callee.file_id
             WHERE t.caller_qualname = ?
             GROUP BY t.callee_qualname
             ORDER BY t.callee_qualname",
        )?;
        let rows = stmt.query_map(params![qualname], dynamic_edge_from_row)?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    pub fn hotspots(&self, limit: usize) -> Result<Vec<HotspotScore>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.qualname, f.path, s.start_line, h.complexity, h.churn, h.score, h.rank
             FROM hotspots h
             JOIN symbols s ON s.id = h.symbol_id
             JOIN files f ON f.id = s.file_id
             ORDER BY h.rank
             LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(HotspotScore {
                symbol: symbol_ref_at(row, 0)?,
                complexity: row.get(4)?,
                churn: row.get(5)?,
                score: row.get(6)?,
                rank: row.get(7)?,
            })
        })?;
        let mut hotspots = Vec::new();
        for row in rows {
            hotspots.push(row?);
        }
        Ok(hotspots)
    }

    pub fn hotspot_ranks(&self) -> Result<HashMap<String, i64>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.qualname, h.rank
             FROM hotspots h
             JOIN symbols s ON s.id = h.symbol_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut ranks = HashMap::new();
        for row in rows {
            let (qualname, rank): (String, i64) = row?;
            ranks.insert(qualname, rank);
        }
        Ok(ranks)
    }

    pub fn symbol_documents(&self) -> Result<Vec<SymbolDocument>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.qualname, f.path, s.start_line, s.kind, s.name, s.docstring, s.comment
             FROM symbols s
             JOIN files f ON f.id = s.file_id
             WHERE s.kind IN ('class', 'function', 'method')
             ORDER BY s.qualname",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SymbolDocument {
                symbol: symbol_ref_at(row, 0)?,
                kind: kind_at(row, 4)?,
                name: row.get(5)?,
                docstring: row.get(6)?,
                comment: row.get(7)?,
            })
        })?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.read_conn()?;
        let count = |sql: &str| -> Result<usize> {
            let value: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(value as usize)
        };
        Ok(StoreCounts {
            files: count("SELECT COUNT(*) FROM files")?,
            symbols: count("SELECT COUNT(*) FROM symbols")?,
            edges: count("SELECT COUNT(*) FROM edges")?,
            unresolved_edges: count("SELECT COUNT(*) FROM edges WHERE callee_symbol_id IS NULL")?,
            hotspots: count("SELECT COUNT(*) FROM hotspots")?,
            trace_runs: count("SELECT COUNT(*) FROM trace_runs")?,
        })
    }

    pub fn begin_trace_run(&self, entry: &str, args: &[String], started: i64) -> Result<i64> {
        let args = serde_json::to_string(args)?;
        let conn = self.writer_blocking();
        conn.execute(
            "INSERT INTO trace_runs (entry, args, started, status) VALUES (?, ?, ?, 'running')",
            params![entry, args, started],
        )
        .map_err(|err| self.map_busy(err))?;
        Ok(conn.last_insert_rowid())
    }

    /// Append events in chunks so a long trace does not hold the writer
    /// for its whole duration.
    pub fn insert_trace_events(&self, run_id: i64, events: &[TraceEventInput]) -> Result<usize> {
        let mut written = 0;
        for chunk in events.chunks(TRACE_EVENT_BATCH) {
            let mut conn = self.writer_blocking();
            let tx = self.immediate(&mut conn)?;
            {
                let mut lookup = tx.prepare_cached("SELECT id FROM symbols WHERE qualname = ?")?;
                let mut insert = tx.prepare_cached(
                    "INSERT INTO trace_events
                     (run_id, seq, caller_symbol_id, caller_qualname, callee_symbol_id,
                      callee_qualname, depth, offset_ns)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for event in chunk {
                    let Some(callee_id) = lookup
                        .query_row(params![event.callee_qualname], |row| row.get::<_, i64>(0))
                        .optional()?
                    else {
                        continue;
                    };
                    let caller_id = match &event.caller_qualname {
                        Some(caller) => lookup
                            .query_row(params![caller], |row| row.get::<_, i64>(0))
                            .optional()?,
                        None => None,
                    };
                    insert.execute(params![
                        run_id,
                        event.seq,
                        caller_id,
                        event.caller_qualname,
                        callee_id,
                        event.callee_qualname,
                        event.depth,
                        event.offset_ns,
                    ])?;
                    written += 1;
                }
            }
            tx.commit().map_err(|err| self.map_busy(err))?;
        }
        Ok(written)
    }

    pub fn finish_trace_run(
        &self,
        run_id: i64,
        status: TraceStatus,
        error: Option<&str>,
        finished: i64,
    ) -> Result<()> {
        let conn = self.writer_blocking();
        conn.execute(
            "UPDATE trace_runs SET status = ?, error = ?, finished = ? WHERE id = ?",
            params![status.as_str(), error, finished, run_id],
        )
        .map_err(|err| self.map_busy(err))?;
        Ok(())
    }

    pub fn list_trace_runs(&self, limit: usize) -> Result<Vec<TraceRun>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.id, r.entry, r.args, r.started, COALESCE(r.finished, r.started), r.status, r.error,
                    (SELECT COUNT(*) FROM trace_events t WHERE t.run_id = r.id)
             FROM trace_runs r
             ORDER BY r.id DESC
             LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], trace_run_from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    pub fn get_trace_run(&self, run_id: i64) -> Result<Option<TraceRun>> {
        let conn = self.read_conn()?;
        let run = conn
            .query_row(
                "SELECT r.id, r.entry, r.args, r.started, COALESCE(r.finished, r.started), r.status, r.error,
                        (SELECT COUNT(*) FROM trace_events t WHERE t.run_id = r.id)
                 FROM trace_runs r
                 WHERE r.id = ?",
                params![run_id],
                trace_run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn trace_events(&self, run_id: i64, limit: usize) -> Result<Vec<TraceEvent>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, seq, caller_symbol_id, caller_qualname, callee_symbol_id,
                    callee_qualname, depth, offset_ns
             FROM trace_events
             WHERE run_id = ?
             ORDER BY seq
             LIMIT ?",
        )?;
        let rows = stmt.query_map(params![run_id, limit as i64], |row| {
            Ok(TraceEvent {
                run_id: row.get(0)?,
                seq: row.get(1)?,
                caller_id: row.get(2)?,
                caller: row.get(3)?,
                callee_id: row.get(4)?,
                callee: row.get(5)?,
                depth: row.get(6)?,
                offset_ns: row.get(7)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Content digest of the graph tables, independent of row ids and run
    /// history. Equal digests mean equal indexed state.
    pub fn digest(&self) -> Result<DbDigest> {
        let conn = self.read_conn()?;
        let digest = |sql: &str, width: usize| -> Result<TableDigest> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    let value: rusqlite::types::Value = row.get(idx)?;
                    values.push(match value {
                        rusqlite::types::Value::Null => serde_json::Value::Null,
                        rusqlite::types::Value::Integer(v) => json!(v),
                        rusqlite::types::Value::Real(v) => json!(format!("{v:.6}")),
                        rusqlite::types::Value::Text(v) => json!(v),
                        rusqlite::types::Value::Blob(v) => json!(util::content_hash(&v)),
                    });
                }
                Ok(serde_json::Value::Array(values).to_string())
            })?;
            digest_rows(rows)
        };
        Ok(DbDigest {
            files: digest(
                "SELECT path, hash, size, parse_error, shadowed FROM files ORDER BY path",
                5,
            )?,
            symbols: digest(
                "SELECT f.path, s.kind, s.name, s.qualname, s.start_line, s.end_line,
                        s.start_byte, s.end_byte, s.fingerprint, s.docstring, s.comment, s.complexity
                 FROM symbols s
                 JOIN files f ON f.id = s.file_id
                 ORDER BY s.qualname",
                12,
            )?,
            edges: digest(
                "SELECT f.path, caller.qualname, callee.qualname, e.raw_callee, e.line, e.provenance
                 FROM edges e
                 JOIN files f ON f.id = e.file_id
                 JOIN symbols caller ON caller.id = e.caller_symbol_id
                 LEFT JOIN symbols callee ON callee.id = e.callee_symbol_id
                 ORDER BY caller.qualname, e.line, COALESCE(callee.qualname, ''), e.raw_callee",
                6,
            )?,
            hotspots: digest(
                "SELECT s.qualname, h.complexity, h.churn, h.score, h.rank
                 FROM hotspots h
                 JOIN symbols s ON s.id = h.symbol_id
                 ORDER BY h.rank",
                5,
            )?,
        })
    }
}

fn write_index_run(tx: &Transaction<'_>, batch: &IndexBatch) -> Result<i64> {
    let finished = util::now_secs();
    tx.execute(
        "INSERT INTO index_runs
         (root, started, finished, files_scanned, files_indexed, files_removed, parse_errors)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            batch.root,
            batch.started,
            finished,
            batch.fingerprints.len() as i64,
            batch.files.len() as i64,
            batch.removed.len() as i64,
            batch.parse_errors as i64,
        ],
    )?;
    let run_id = tx.last_insert_rowid();

    for path in &batch.removed {
        tx.execute("DELETE FROM files WHERE path = ?", params![path])?;
    }

    // Clear every rewritten file first so qualnames moving between files
    // never collide with rows that are about to go away.
    let mut file_ids: HashMap<&str, i64> = HashMap::new();
    for file in &batch.files {
        tx.execute(
            "INSERT INTO files (path, hash, size, parse_error, shadowed, run_id)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                size = excluded.size,
                parse_error = excluded.parse_error,
                shadowed = excluded.shadowed,
                run_id = excluded.run_id",
            params![file.path, file.hash, file.size, file.parse_error, file.shadowed, run_id],
        )?;
        let file_id: i64 = tx.query_row(
            "SELECT id FROM files WHERE path = ?",
            params![file.path],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM edges WHERE file_id = ?", params![file_id])?;
        tx.execute("DELETE FROM symbols WHERE file_id = ?", params![file_id])?;
        file_ids.insert(file.path.as_str(), file_id);
    }

    {
        let mut insert = tx.prepare_cached(
            "INSERT INTO symbols
             (file_id, kind, name, qualname, start_line, end_line, start_byte, end_byte,
              fingerprint, docstring, comment, complexity)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for file in &batch.files {
            let Some(file_id) = file_ids.get(file.path.as_str()) else {
                continue;
            };
            for symbol in &file.symbols {
                insert.execute(params![
                    file_id,
                    symbol.kind.as_str(),
                    symbol.name,
                    symbol.qualname,
                    symbol.start_line,
                    symbol.end_line,
                    symbol.start_byte,
                    symbol.end_byte,
                    symbol.fingerprint,
                    symbol.docstring,
                    symbol.comment,
                    symbol.complexity,
                ])?;
            }
        }
    }

    for file in &batch.files {
        if let Some(file_id) = file_ids.get(file.path.as_str()) {
            insert_edges(tx, *file_id, &file.edges)?;
        }
    }
    for rewrite in &batch.edge_rewrites {
        let file_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM files WHERE path = ?",
                params![rewrite.path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(file_id) = file_id else {
            continue;
        };
        tx.execute("DELETE FROM edges WHERE file_id = ?", params![file_id])?;
        insert_edges(tx, file_id, &rewrite.edges)?;
    }

    // Relink resolved edges by name; a target that no longer exists turns
    // the edge back into an unresolved one.
    tx.execute(
        "UPDATE edges
         SET callee_symbol_id = (SELECT s.id FROM symbols s WHERE s.qualname = edges.callee_qualname)
         WHERE callee_qualname IS NOT NULL",
        [],
    )?;
    tx.execute(
        "UPDATE edges SET callee_qualname = NULL
         WHERE callee_symbol_id IS NULL AND callee_qualname IS NOT NULL",
        [],
    )?;

    tx.execute("DELETE FROM hotspots", [])?;
    {
        let mut insert = tx.prepare_cached(
            "INSERT INTO hotspots (symbol_id, complexity, churn, score, rank)
             SELECT id, ?, ?, ?, ? FROM symbols WHERE qualname = ?",
        )?;
        for row in &batch.hotspots {
            insert.execute(params![row.complexity, row.churn, row.score, row.rank, row.qualname])?;
        }
    }

    {
        let mut insert = tx.prepare_cached(
            "INSERT INTO run_fingerprints (run_id, path, hash) VALUES (?, ?, ?)",
        )?;
        for (path, hash) in &batch.fingerprints {
            insert.execute(params![run_id, path, hash])?;
        }
    }
    tx.execute(
        "DELETE FROM run_fingerprints WHERE run_id < ?",
        params![run_id],
    )?;

    set_meta_i64(tx, "last_indexed", finished)?;
    if batch.changes_graph() {
        let generation: Option<String> = tx
            .query_row(
                "SELECT value FROM meta WHERE key = 'generation'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let next = generation.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) + 1;
        set_meta_i64(tx, "generation", next)?;
    }
    Ok(run_id)
}

fn insert_edges(tx: &Transaction<'_>, file_id: i64, edges: &[ResolvedEdge]) -> Result<()> {
    let mut lookup = tx.prepare_cached("SELECT id FROM symbols WHERE qualname = ?")?;
    let mut insert = tx.prepare_cached(
        "INSERT INTO edges
         (file_id, caller_symbol_id, callee_symbol_id, callee_qualname, raw_callee, line, provenance)
         VALUES (?, ?, NULL, ?, ?, ?, 'static')",
    )?;
    for edge in edges {
        let caller_id: Option<i64> = lookup
            .query_row(params![edge.caller], |row| row.get(0))
            .optional()?;
        let Some(caller_id) = caller_id else {
            tracing::debug!("dropping edge from unknown caller {}", edge.caller);
            continue;
        };
        let callee_qualname = match &edge.resolution {
            Resolution::Resolved(qualname) => Some(qualname.as_str()),
            Resolution::Unresolved(_) => None,
        };
        insert.execute(params![file_id, caller_id, callee_qualname, edge.raw, edge.line])?;
    }
    Ok(())
}

fn set_meta_i64(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value.to_string()],
    )?;
    Ok(())
}

const SYMBOL_SELECT: &str = "SELECT s.id, f.path, s.kind, s.name, s.qualname, s.start_line, s.end_line,
        s.fingerprint, s.docstring, s.comment, s.complexity
 FROM symbols s
 JOIN files f ON f.id = s.file_id";

fn symbol_from_row(row: &Row<'_>) -> rusqlite::Result<Symbol> {
    Ok(Symbol {
        id: row.get(0)?,
        file_path: row.get(1)?,
        kind: kind_at(row, 2)?,
        name: row.get(3)?,
        qualname: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        fingerprint: row.get(7)?,
        docstring: row.get(8)?,
        comment: row.get(9)?,
        complexity: row.get(10)?,
    })
}

fn stored_symbol_from_row(row: &Row<'_>) -> rusqlite::Result<StoredSymbol> {
    Ok(StoredSymbol {
        id: row.get(0)?,
        file_path: row.get(1)?,
        kind: kind_at(row, 2)?,
        qualname: row.get(3)?,
        name: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        fingerprint: row.get(7)?,
        complexity: row.get(8)?,
    })
}

fn kind_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<SymbolKind> {
    let raw: String = row.get(idx)?;
    SymbolKind::parse(&raw).ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        raw,
        Type::Text,
    ))
}

/// Reads (id, qualname, path, start_line) starting at column `idx`.
fn symbol_ref_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<SymbolRef> {
    Ok(SymbolRef {
        id: row.get(idx)?,
        qualname: row.get(idx + 1)?,
        file_path: row.get(idx + 2)?,
        start_line: row.get(idx + 3)?,
    })
}

fn dynamic_edge_from_row(row: &Row<'_>) -> rusqlite::Result<CallEdge> {
    let caller_id: Option<i64> = row.get(0)?;
    let caller = match caller_id {
        Some(_) => Some(symbol_ref_at(row, 0)?),
        None => None,
    };
    Ok(CallEdge {
        caller,
        callee: Callee::Resolved {
            symbol: symbol_ref_at(row, 4)?,
        },
        provenance: Provenance::Dynamic,
        line: None,
        observed: Some(row.get(8)?),
    })
}

fn trace_run_from_row(row: &Row<'_>) -> rusqlite::Result<TraceRun> {
    let args: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(TraceRun {
        id: row.get(0)?,
        entry: row.get(1)?,
        args: serde_json::from_str(&args).unwrap_or_default(),
        started: row.get(3)?,
        finished: row.get(4)?,
        status: TraceStatus::parse(&status),
        error: row.get(6)?,
        events: row.get(7)?,
    })
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn digest_rows<I>(rows: I) -> Result<TableDigest>
where
    I: Iterator<Item = rusqlite::Result<String>>,
{
    let mut hasher = Hasher::new();
    let mut count = 0;
    for row in rows {
        let row = row?;
        hasher.update(row.as_bytes());
        hasher.update(b"\n");
        count += 1;
    }
    Ok(TableDigest {
        rows: count,
        hash: hasher.finalize().to_hex().to_string(),
    })
}
