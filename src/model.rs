use serde::Serialize;
use std::fmt;

/// Placeholder shown in place of a callee that could not be resolved.
pub const UNRESOLVED: &str = "<unresolved>";

/// Caller shown for trace events that originate outside any known symbol.
pub const ROOT_SENTINEL: &str = "<root>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Module,
    Class,
    Function,
    Method,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Module => "module",
            SymbolKind::Class => "class",
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "module" => Some(SymbolKind::Module),
            "class" => Some(SymbolKind::Class),
            "function" => Some(SymbolKind::Function),
            "method" => Some(SymbolKind::Method),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, SymbolKind::Function | SymbolKind::Method)
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Symbol {
    pub id: i64,
    pub file_path: String,
    pub kind: SymbolKind,
    pub name: String,
    pub qualname: String,
    pub start_line: i64,
    pub end_line: i64,
    pub fingerprint: String,
    pub docstring: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub complexity: i64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct SymbolRef {
    pub id: i64,
    pub qualname: String,
    pub file_path: String,
    pub start_line: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Static,
    Dynamic,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Static => "static",
            Provenance::Dynamic => "dynamic",
        }
    }
}

/// Which edge sets a caller/callee query should draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeFilter {
    Static,
    Dynamic,
    #[default]
    All,
}

impl EdgeFilter {
    pub fn includes(&self, provenance: Provenance) -> bool {
        match self {
            EdgeFilter::All => true,
            EdgeFilter::Static => provenance == Provenance::Static,
            EdgeFilter::Dynamic => provenance == Provenance::Dynamic,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Callee {
    Resolved { symbol: SymbolRef },
    Unresolved { raw: String },
}

impl Callee {
    pub fn symbol(&self) -> Option<&SymbolRef> {
        match self {
            Callee::Resolved { symbol } => Some(symbol),
            Callee::Unresolved { .. } => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Callee::Resolved { symbol } => &symbol.qualname,
            Callee::Unresolved { raw } => raw,
        }
    }
}

/// One row of the merged call graph view.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct CallEdge {
    /// `None` only for dynamic edges whose caller is the trace entry point.
    pub caller: Option<SymbolRef>,
    pub callee: Callee,
    pub provenance: Provenance,
    /// Call-site line for static edges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    /// Number of trace events collapsed into a dynamic edge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<i64>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct HotspotScore {
    pub symbol: SymbolRef,
    pub complexity: i64,
    pub churn: i64,
    pub score: f64,
    pub rank: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Completed,
    Failed,
    Cancelled,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Completed => "completed",
            TraceStatus::Failed => "failed",
            TraceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "completed" => TraceStatus::Completed,
            "cancelled" => TraceStatus::Cancelled,
            _ => TraceStatus::Failed,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct TraceRun {
    pub id: i64,
    pub entry: String,
    pub args: Vec<String>,
    pub started: i64,
    pub finished: i64,
    pub status: TraceStatus,
    pub error: Option<String>,
    pub events: i64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub run_id: i64,
    pub seq: i64,
    /// `None` is the root sentinel: the entry point or an unmapped in-root frame.
    pub caller_id: Option<i64>,
    pub caller: Option<String>,
    pub callee_id: i64,
    pub callee: String,
    pub depth: i64,
    pub offset_ns: i64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct FileIssue {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct IndexStats {
    pub run_id: i64,
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub removed: usize,
    pub reresolved: usize,
    pub symbols: usize,
    pub edges: usize,
    pub unresolved_calls: usize,
    pub ambiguous_calls: usize,
    pub hotspots: usize,
    pub vcs_available: bool,
    pub parse_errors: Vec<FileIssue>,
    pub warnings: Vec<FileIssue>,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SearchHit {
    pub symbol: SymbolRef,
    pub kind: SymbolKind,
    pub score: f64,
    pub hotspot_rank: Option<i64>,
}
