use crate::config::Config;
use crate::db::{Db, DbDigest};
use crate::error::{Error, Result};
use crate::git_mining::{ChurnSource, ChurnWindow, GitChurn};
use crate::indexer::Indexer;
use crate::indexer::scan::ScanOptions;
use crate::model::{
    CallEdge, EdgeFilter, HotspotScore, IndexStats, Provenance, SearchHit, Symbol, TraceEvent,
    TraceRun,
};
use crate::search::KeywordIndex;
use crate::trace::{PythonTarget, StopHandle, TraceEntry, TraceTarget, Tracer};
use crate::util;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STORE_DIR: &str = ".ttmm";
const STORE_FILE: &str = "ttmm.sqlite";

pub fn default_db_path(root: &Path) -> PathBuf {
    root.join(STORE_DIR).join(STORE_FILE)
}

/// Per-invocation overrides. `None` falls back to [`Config`].
#[derive(Debug, Clone, Default)]
pub struct WorkspaceOptions {
    pub db_path: Option<PathBuf>,
    pub no_ignore: bool,
    pub churn_days: Option<u32>,
    pub python: Option<String>,
    pub trace_timeout: Option<Duration>,
}

/// Query surface over one indexed root.
pub struct Workspace {
    root: PathBuf,
    db: Arc<Db>,
    indexer: Indexer,
    python: String,
    trace_timeout: Option<Duration>,
    keywords: Mutex<Option<(i64, Arc<KeywordIndex>)>>,
}

impl Workspace {
    pub fn open(root: &Path) -> Result<Self> {
        Self::open_with(root, WorkspaceOptions::default())
    }

    pub fn open_with(root: &Path, options: WorkspaceOptions) -> Result<Self> {
        let config = Config::get();
        let root = util::canonical_root(root)?;
        let window = ChurnWindow::from_days(options.churn_days.unwrap_or(config.churn_days));
        let churn: Arc<dyn ChurnSource> = Arc::new(GitChurn::new(&root, window));
        Self::open_with_churn(&root, options, churn)
    }

    /// Open with an explicit churn collaborator instead of git.
    pub fn open_with_churn(
        root: &Path,
        options: WorkspaceOptions,
        churn: Arc<dyn ChurnSource>,
    ) -> Result<Self> {
        let config = Config::get();
        let root = util::canonical_root(root)?;
        let db_path = options
            .db_path
            .clone()
            .unwrap_or_else(|| default_db_path(&root));
        let db = Arc::new(Db::open(&root, &db_path)?);
        let indexer = Indexer::with_parts(
            root.clone(),
            Arc::clone(&db),
            ScanOptions::new(options.no_ignore),
            churn,
        );
        let trace_timeout = options.trace_timeout.or_else(|| {
            (config.trace_timeout_secs > 0).then(|| Duration::from_secs(config.trace_timeout_secs))
        });
        Ok(Self {
            root,
            db,
            indexer,
            python: options.python.unwrap_or_else(|| config.python.clone()),
            trace_timeout,
            keywords: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn index(&mut self) -> Result<IndexStats> {
        self.indexer.reindex()
    }

    pub fn hotspots(&self, limit: usize) -> Result<Vec<HotspotScore>> {
        self.db.hotspots(limit)
    }

    /// Accepts a qualified name, a `Scope.name` suffix or a bare name,
    /// provided it names exactly one symbol.
    pub fn symbol(&self, name: &str) -> Result<Symbol> {
        let mut matches = self.db.find_symbols(name)?;
        match matches.len() {
            0 => Err(Error::SymbolNotFound(name.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::AmbiguousSymbol {
                name: name.to_string(),
                candidates: matches.into_iter().map(|symbol| symbol.qualname).collect(),
            }),
        }
    }

    /// Static edges first, then traced ones.
    pub fn callers(&self, name: &str, filter: EdgeFilter) -> Result<Vec<CallEdge>> {
        let symbol = self.symbol(name)?;
        let mut edges = Vec::new();
        if filter.includes(Provenance::Static) {
            edges.extend(self.db.static_callers(symbol.id)?);
        }
        if filter.includes(Provenance::Dynamic) {
            edges.extend(self.db.dynamic_callers(&symbol.qualname)?);
        }
        Ok(edges)
    }

    /// Unresolved static call sites appear with their raw expression.
    pub fn callees(&self, name: &str, filter: EdgeFilter) -> Result<Vec<CallEdge>> {
        let symbol = self.symbol(name)?;
        let mut edges = Vec::new();
        if filter.includes(Provenance::Static) {
            edges.extend(self.db.static_callees(symbol.id)?);
        }
        if filter.includes(Provenance::Dynamic) {
            edges.extend(self.db.dynamic_callees(&symbol.qualname)?);
        }
        Ok(edges)
    }

    /// Run `entry` under the Python tracer with the configured interpreter.
    pub fn trace(&self, entry: &TraceEntry, args: &[String], stop: &StopHandle) -> Result<TraceRun> {
        let events_dir = self
            .db
            .db_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join(STORE_DIR));
        let mut target = PythonTarget::new(self.python.clone(), &events_dir);
        match self.trace_timeout {
            Some(timeout) => {
                let stop = stop.clone().with_timeout(Some(timeout));
                self.trace_with(&mut target, entry, args, &stop)
            }
            None => self.trace_with(&mut target, entry, args, stop),
        }
    }

    pub fn trace_with(
        &self,
        target: &mut dyn TraceTarget,
        entry: &TraceEntry,
        args: &[String],
        stop: &StopHandle,
    ) -> Result<TraceRun> {
        Tracer::new(&self.db, &self.root).trace(target, entry, args, stop)
    }

    /// Symbols most relevant to `question`. The keyword index is rebuilt
    /// only when the store generation moved since the last build.
    pub fn answer(&self, question: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let index = self.keyword_index()?;
        let ranks = self.db.hotspot_ranks()?;
        Ok(index.search(question, limit, &ranks))
    }

    fn keyword_index(&self) -> Result<Arc<KeywordIndex>> {
        let generation = self.db.generation()?;
        let mut cached = match self.keywords.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((built_at, index)) = cached.as_ref() {
            if *built_at == generation {
                return Ok(Arc::clone(index));
            }
        }
        let index = Arc::new(KeywordIndex::build(self.db.symbol_documents()?));
        tracing::debug!(
            "keyword index rebuilt at generation {generation}: {} documents",
            index.len()
        );
        *cached = Some((generation, Arc::clone(&index)));
        Ok(index)
    }

    pub fn runs(&self, limit: usize) -> Result<Vec<TraceRun>> {
        self.db.list_trace_runs(limit)
    }

    /// Events of one run in sequence order; empty for an unknown run.
    pub fn events(&self, run_id: i64, limit: usize) -> Result<Vec<TraceEvent>> {
        self.db.trace_events(run_id, limit)
    }

    pub fn digest(&self) -> Result<DbDigest> {
        self.db.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_mining::StaticChurn;

    fn workspace(dir: &Path) -> Workspace {
        let churn: Arc<dyn ChurnSource> = Arc::new(StaticChurn::default());
        Workspace::open_with_churn(dir, WorkspaceOptions::default(), churn).unwrap()
    }

    #[test]
    fn keyword_index_follows_generation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def save_user():\n    pass\n").unwrap();
        let mut ws = workspace(dir.path());
        assert!(ws.answer("save user", 5).unwrap().is_empty());

        ws.index().unwrap();
        let hits = ws.answer("save user", 5).unwrap();
        assert_eq!(hits[0].symbol.qualname, "a:save_user");

        std::fs::write(dir.path().join("b.py"), "def save_order():\n    pass\n").unwrap();
        ws.index().unwrap();
        let hits = ws.answer("order", 5).unwrap();
        assert_eq!(hits[0].symbol.qualname, "b:save_order");
    }

    #[test]
    fn ambiguous_short_name_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def run():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "def run():\n    pass\n").unwrap();
        let mut ws = workspace(dir.path());
        ws.index().unwrap();
        match ws.symbol("run") {
            Err(Error::AmbiguousSymbol { candidates, .. }) => {
                assert_eq!(candidates, vec!["a:run".to_string(), "b:run".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(ws.symbol("a:run").unwrap().qualname, "a:run");
        assert!(matches!(ws.symbol("missing"), Err(Error::SymbolNotFound(_))));
    }
}
