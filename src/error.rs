use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot scan root {}: {reason}", root.display())]
    Scan { root: PathBuf, reason: String },

    #[error("another writer holds the store for {}; retry once it finishes", root.display())]
    StoreConcurrency { root: PathBuf },

    #[error("incompatible store schema at {}: found version {found}, supported {supported}", path.display())]
    IncompatibleSchema {
        path: PathBuf,
        found: i64,
        supported: i64,
    },

    #[error("trace target {entry} failed: {message}")]
    TraceTarget { entry: String, message: String },

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("symbol name {name} is ambiguous: {}", candidates.join(", "))]
    AmbiguousSymbol {
        name: String,
        candidates: Vec<String>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn scan(root: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Scan {
            root: root.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that leave the store untouched and may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreConcurrency { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
