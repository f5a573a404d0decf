//! Index a Python repository into a queryable model: symbols, call edges,
//! hotspots, traced calls and a keyword index over symbol text.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod git_mining;
pub mod hotspot;
pub mod indexer;
pub mod metrics;
pub mod model;
pub mod search;
pub mod trace;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use model::{
    CallEdge, Callee, EdgeFilter, HotspotScore, IndexStats, Provenance, SearchHit, Symbol,
    SymbolKind, SymbolRef, TraceEvent, TraceRun, TraceStatus,
};
pub use trace::{StopHandle, TraceEntry, TraceTarget};
pub use workspace::{Workspace, WorkspaceOptions};
