use crate::db::DbDigest;
use crate::model::{
    CallEdge, EdgeFilter, HotspotScore, IndexStats, SearchHit, TraceEvent, TraceRun,
    ROOT_SENTINEL,
};
use crate::workspace::WorkspaceOptions;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "ttmm",
    version,
    about = "Build a mental model of a Python repository",
    after_help = r#"Examples:
  ttmm index --repo .
  ttmm hotspots --limit 10
  ttmm callers parse_config
  ttmm callees 'app.server:Server.handle' --edges static
  ttmm trace --module app.cli:main -- --verbose
  ttmm trace --script scripts/run.py
  ttmm answer how are users saved
  ttmm runs
  ttmm events 3 --json
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RepoArgs {
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,
    /// Store location, defaults to <repo>/.ttmm/ttmm.sqlite.
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Print JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

impl RepoArgs {
    pub fn options(&self) -> WorkspaceOptions {
        WorkspaceOptions {
            db_path: self.db.clone(),
            ..WorkspaceOptions::default()
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Scan, parse and resolve the repository; only changed files are re-parsed.
    Index {
        #[command(flatten)]
        repo: RepoArgs,
        /// Include files ignored by .gitignore.
        #[arg(long)]
        no_ignore: bool,
        /// Churn lookback in days, 0 for all history.
        #[arg(long)]
        churn_days: Option<u32>,
    },
    /// List the highest ranked hotspots.
    Hotspots {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show who calls a symbol.
    Callers {
        #[command(flatten)]
        repo: RepoArgs,
        /// Qualified name, `Class.method` or unique short name.
        symbol: String,
        #[arg(long, value_enum, default_value_t = EdgeKind::All)]
        edges: EdgeKind,
    },
    /// Show what a symbol calls.
    Callees {
        #[command(flatten)]
        repo: RepoArgs,
        /// Qualified name, `Class.method` or unique short name.
        symbol: String,
        #[arg(long, value_enum, default_value_t = EdgeKind::All)]
        edges: EdgeKind,
    },
    /// Run an entry point under the tracer and record in-repository calls.
    Trace {
        #[command(flatten)]
        repo: RepoArgs,
        /// `pkg.mod:func` or `pkg.mod`.
        #[arg(long, conflicts_with = "script", required_unless_present = "script")]
        module: Option<String>,
        /// Script path relative to the repository.
        #[arg(long)]
        script: Option<String>,
        /// Interpreter to run, overrides TTMM_PYTHON.
        #[arg(long)]
        python: Option<String>,
        /// Stop the target after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Arguments passed to the target.
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Rank symbols by relevance to a free-text question.
    Answer {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(required = true)]
        question: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// List recorded trace runs, newest first.
    Runs {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the events of one trace run.
    Events {
        #[command(flatten)]
        repo: RepoArgs,
        run_id: i64,
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },
    /// Print a content digest of the indexed graph.
    Digest {
        #[command(flatten)]
        repo: RepoArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EdgeKind {
    Static,
    Dynamic,
    All,
}

impl From<EdgeKind> for EdgeFilter {
    fn from(kind: EdgeKind) -> Self {
        match kind {
            EdgeKind::Static => EdgeFilter::Static,
            EdgeKind::Dynamic => EdgeFilter::Dynamic,
            EdgeKind::All => EdgeFilter::All,
        }
    }
}

pub fn trace_timeout(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|secs| *secs > 0).map(Duration::from_secs)
}

/// Render `value` as pretty JSON or through `text`.
pub fn render<T: Serialize + ?Sized>(
    json: bool,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> serde_json::Result<String> {
    if json {
        serde_json::to_string_pretty(value)
    } else {
        Ok(text(value))
    }
}

pub fn format_stats(stats: &IndexStats) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "run {}: {} scanned, {} indexed, {} unchanged, {} removed, {} re-resolved",
        stats.run_id, stats.scanned, stats.indexed, stats.skipped, stats.removed, stats.reresolved
    );
    let _ = writeln!(
        out,
        "{} symbols, {} edges ({} unresolved, {} ambiguous), {} hotspots",
        stats.symbols, stats.edges, stats.unresolved_calls, stats.ambiguous_calls, stats.hotspots
    );
    if !stats.vcs_available {
        let _ = writeln!(out, "version control unavailable: churn is 0 for every file");
    }
    for issue in &stats.parse_errors {
        let _ = writeln!(out, "parse error: {}: {}", issue.path, issue.message);
    }
    for issue in &stats.warnings {
        let _ = writeln!(out, "warning: {}: {}", issue.path, issue.message);
    }
    let _ = write!(out, "done in {} ms", stats.duration_ms);
    out
}

pub fn format_hotspots(hotspots: &[HotspotScore]) -> String {
    if hotspots.is_empty() {
        return "no hotspots; run `ttmm index` first".to_string();
    }
    let mut lines = Vec::with_capacity(hotspots.len());
    for hotspot in hotspots {
        lines.push(format!(
            "{:>4}  {:>9.2}  cc={:<3} churn={:<4} {}  ({}:{})",
            hotspot.rank,
            hotspot.score,
            hotspot.complexity,
            hotspot.churn,
            hotspot.symbol.qualname,
            hotspot.symbol.file_path,
            hotspot.symbol.start_line
        ));
    }
    lines.join("\n")
}

pub fn format_edges(edges: &[CallEdge]) -> String {
    if edges.is_empty() {
        return "no edges".to_string();
    }
    let mut lines = Vec::with_capacity(edges.len());
    for edge in edges {
        let caller = edge
            .caller
            .as_ref()
            .map(|caller| caller.qualname.as_str())
            .unwrap_or(ROOT_SENTINEL);
        let mut line = format!(
            "{:<7} {} -> {}",
            edge.provenance.as_str(),
            caller,
            edge.callee.label()
        );
        if let Some(at) = edge.line {
            let _ = write!(line, "  (line {at})");
        }
        if let Some(observed) = edge.observed {
            let _ = write!(line, "  (seen {observed}x)");
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "no matching symbols".to_string();
    }
    let mut lines = Vec::with_capacity(hits.len());
    for hit in hits {
        let mut line = format!(
            "{:.3}  {:<8} {}  ({}:{})",
            hit.score,
            hit.kind.as_str(),
            hit.symbol.qualname,
            hit.symbol.file_path,
            hit.symbol.start_line
        );
        if let Some(rank) = hit.hotspot_rank {
            let _ = write!(line, "  hotspot #{rank}");
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub fn format_run(run: &TraceRun) -> String {
    let mut line = format!(
        "run {} [{}] {} {}: {} events",
        run.id,
        run.status.as_str(),
        run.entry,
        run.args.join(" "),
        run.events
    );
    if let Some(error) = &run.error {
        let _ = write!(line, " ({error})");
    }
    line
}

pub fn format_runs(runs: &[TraceRun]) -> String {
    if runs.is_empty() {
        return "no trace runs".to_string();
    }
    runs.iter().map(format_run).collect::<Vec<_>>().join("\n")
}

pub fn format_events(events: &[TraceEvent]) -> String {
    if events.is_empty() {
        return "no events".to_string();
    }
    let mut lines = Vec::with_capacity(events.len());
    for event in events {
        lines.push(format!(
            "{:>6} {:>12}ns {}{} -> {}",
            event.seq,
            event.offset_ns,
            "  ".repeat(event.depth.max(0) as usize),
            event.caller.as_deref().unwrap_or(ROOT_SENTINEL),
            event.callee
        ));
    }
    lines.join("\n")
}

pub fn format_digest(digest: &DbDigest) -> String {
    [
        ("files", &digest.files),
        ("symbols", &digest.symbols),
        ("edges", &digest.edges),
        ("hotspots", &digest.hotspots),
    ]
    .iter()
    .map(|(table, digest)| format!("{table:<9} {:>6} rows  {}", digest.rows, digest.hash))
    .collect::<Vec<_>>()
    .join("\n")
}
