use crate::config::Config;
use crate::db::{Db, EdgeRewrite, FileWrite, IndexBatch, StoredSymbol};
use crate::error::Result;
use crate::git_mining::{ChurnSource, ChurnWindow, GitChurn};
use crate::hotspot::{self, HotspotCandidate};
use crate::indexer::differ::{FileDiff, compute_file_diff, compute_symbol_diff};
use crate::indexer::extract::{ExtractedFile, ParseFailure};
use crate::indexer::python::PythonExtractor;
use crate::indexer::resolve::{SymbolTable, raw_tail, resolve_file, short_name};
use crate::indexer::scan::{ScanOptions, ScannedFile};
use crate::model::{FileIssue, IndexStats, SymbolKind};
use crate::util;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub mod differ;
pub mod extract;
pub mod python;
pub mod resolve;
pub mod scan;

/// Result of reading and parsing one file.
enum FileOutcome {
    Parsed(ExtractedFile),
    Failed(ParseFailure),
}

struct Extraction {
    file: ScannedFile,
    outcome: FileOutcome,
}

/// Owner of one qualified name in the merged symbol table.
#[derive(Debug, Clone)]
struct Owner {
    path: String,
    kind: SymbolKind,
    complexity: i64,
}

pub struct Indexer {
    repo_root: PathBuf,
    db: Arc<Db>,
    scan_options: ScanOptions,
    churn: Arc<dyn ChurnSource>,
}

impl Indexer {
    pub fn new(repo_root: PathBuf, db_path: PathBuf) -> Result<Self> {
        let repo_root = util::canonical_root(&repo_root)?;
        let db = Arc::new(Db::open(&repo_root, &db_path)?);
        let window = ChurnWindow::from_days(Config::get().churn_days);
        let churn: Arc<dyn ChurnSource> = Arc::new(GitChurn::new(&repo_root, window));
        Ok(Self::with_parts(repo_root, db, ScanOptions::default(), churn))
    }

    pub fn with_parts(
        repo_root: PathBuf,
        db: Arc<Db>,
        scan_options: ScanOptions,
        churn: Arc<dyn ChurnSource>,
    ) -> Self {
        Self {
            repo_root,
            db,
            scan_options,
            churn,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Bring the store in line with the working tree. Only changed files are
    /// parsed; unchanged files keep their rows unless a change elsewhere
    /// invalidated one of their call edges. The writer is held from before the
    /// scan until the single commit.
    pub fn reindex(&mut self) -> Result<IndexStats> {
        let start = Instant::now();
        let started = util::now_secs();
        let lease = self.db.begin_index()?;
        let churn = self.churn.collect();
        let scan = scan::scan_repo_with_options(&self.repo_root, self.scan_options)?;
        let previous = self.db.latest_fingerprints()?;
        let diff = compute_file_diff(&previous, &scan.files);
        let mut stats = IndexStats {
            scanned: scan.files.len(),
            skipped: diff.unchanged.len(),
            removed: diff.removed.len(),
            vcs_available: churn.available(),
            warnings: scan.warnings.clone(),
            ..Default::default()
        };
        tracing::info!(
            "scanned {} files: {} added, {} modified, {} removed, {} unchanged",
            scan.files.len(),
            diff.added.len(),
            diff.modified.len(),
            diff.removed.len(),
            diff.unchanged.len()
        );

        let scanned: BTreeMap<&str, &ScannedFile> = scan
            .files
            .iter()
            .map(|file| (file.rel_path.as_str(), file))
            .collect();
        let stored_files = self.db.list_files()?;
        let stored_symbols = self.db.list_stored_symbols()?;

        // Files parsed this run: everything changed, plus unchanged files that
        // lost a qualname collision before and may now win it.
        let mut pending: BTreeSet<String> = diff.changed().cloned().collect();
        if !diff.is_noop() {
            for record in &stored_files {
                if record.shadowed > 0 && scanned.contains_key(record.path.as_str()) {
                    pending.insert(record.path.clone());
                }
            }
        }

        let mut extracted: BTreeMap<String, Extraction> = BTreeMap::new();
        let (owners, shadowed) = loop {
            let batch: Vec<&ScannedFile> = pending
                .iter()
                .filter(|path| !extracted.contains_key(*path))
                .filter_map(|path| scanned.get(path.as_str()).copied())
                .collect();
            for extraction in extract_files(&batch)? {
                extracted.insert(extraction.file.rel_path.clone(), extraction);
            }
            let (owners, shadowed) =
                assign_owners(&stored_symbols, &extracted, &diff.removed);
            // An untouched file that now loses a qualname must be rewritten.
            let losers: Vec<String> = shadowed
                .keys()
                .filter(|path| !extracted.contains_key(*path) && !pending.contains(*path))
                .filter(|path| scanned.contains_key(path.as_str()))
                .cloned()
                .collect();
            if losers.is_empty() {
                break (owners, shadowed);
            }
            pending.extend(losers);
        };

        let mut table = SymbolTable::new();
        for (qualname, owner) in &owners {
            table.insert(qualname.clone(), owner.kind);
        }

        let mut files = Vec::new();
        let mut kept_new_symbols = Vec::new();
        for (path, extraction) in &mut extracted {
            let dropped = shadowed.get(path).cloned().unwrap_or_default();
            for qualname in &dropped {
                let message = format!(
                    "symbol {qualname} is also defined in {}; keeping that definition",
                    owners.get(qualname).map(|o| o.path.as_str()).unwrap_or("?")
                );
                tracing::warn!("{path}: {message}");
                stats.warnings.push(FileIssue {
                    path: path.clone(),
                    message,
                });
            }
            match &mut extraction.outcome {
                FileOutcome::Parsed(file) => {
                    drop_symbols(file, &dropped);
                    let (edges, resolve_stats) = resolve_file(file, &table);
                    stats.ambiguous_calls += resolve_stats.ambiguous;
                    if diff.added.contains(path) || diff.modified.contains(path) {
                        stats.indexed += 1;
                    }
                    kept_new_symbols.extend(file.symbols.iter().cloned());
                    files.push(FileWrite {
                        path: path.clone(),
                        hash: extraction.file.hash.clone(),
                        size: extraction.file.size,
                        parse_error: None,
                        shadowed: dropped.len() as i64,
                        symbols: file.symbols.clone(),
                        edges,
                    });
                }
                FileOutcome::Failed(failure) => {
                    tracing::warn!("{path}: parse error at {failure}");
                    files.push(FileWrite {
                        path: path.clone(),
                        hash: extraction.file.hash.clone(),
                        size: extraction.file.size,
                        parse_error: Some(failure.to_string()),
                        shadowed: 0,
                        symbols: Vec::new(),
                        edges: Vec::new(),
                    });
                }
            }
        }

        let rewrites = self.reresolve_dependents(
            &diff,
            &extracted,
            &stored_symbols,
            &kept_new_symbols,
            &table,
            &scanned,
        )?;
        stats.reresolved = rewrites.len();

        let candidates: Vec<HotspotCandidate> = owners
            .iter()
            .map(|(qualname, owner)| HotspotCandidate {
                qualname: qualname.clone(),
                file_path: owner.path.clone(),
                kind: owner.kind,
                complexity: owner.complexity,
            })
            .collect();
        let hotspots = hotspot::compute_hotspots(&candidates, &churn);
        stats.hotspots = hotspots.len();

        let parse_errors = files.iter().filter(|f| f.parse_error.is_some()).count();
        let batch = IndexBatch {
            root: self.repo_root.display().to_string(),
            started,
            removed: diff.removed.clone(),
            files,
            edge_rewrites: rewrites,
            hotspots,
            fingerprints: scan
                .files
                .iter()
                .map(|file| (file.rel_path.clone(), file.hash.clone()))
                .collect(),
            parse_errors,
        };
        stats.run_id = lease.apply(&batch)?;

        let counts = self.db.counts()?;
        stats.symbols = counts.symbols;
        stats.edges = counts.edges;
        stats.unresolved_calls = counts.unresolved_edges;
        stats.parse_errors = self.db.parse_errors()?;
        stats.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "index run {} complete: {} indexed, {} re-resolved, {} symbols, {} edges ({} unresolved) in {}ms",
            stats.run_id,
            stats.indexed,
            stats.reresolved,
            stats.symbols,
            stats.edges,
            stats.unresolved_calls,
            stats.duration_ms
        );
        Ok(stats)
    }

    /// Unchanged files whose stored edges point at vanished symbols, or whose
    /// unresolved calls may match a newly added name, get their edges
    /// resolved again against the new table.
    fn reresolve_dependents(
        &self,
        diff: &FileDiff,
        extracted: &BTreeMap<String, Extraction>,
        stored_symbols: &[StoredSymbol],
        kept_new_symbols: &[extract::SymbolInput],
        table: &SymbolTable,
        scanned: &BTreeMap<&str, &ScannedFile>,
    ) -> Result<Vec<EdgeRewrite>> {
        let touched: HashSet<&str> = extracted
            .keys()
            .map(String::as_str)
            .chain(diff.removed.iter().map(String::as_str))
            .collect();
        let old_fingerprints: BTreeMap<String, String> = stored_symbols
            .iter()
            .filter(|symbol| touched.contains(symbol.file_path.as_str()))
            .map(|symbol| (symbol.qualname.clone(), symbol.fingerprint.clone()))
            .collect();
        let symbol_diff = compute_symbol_diff(&old_fingerprints, kept_new_symbols.iter());
        if symbol_diff.added.is_empty() && symbol_diff.deleted.is_empty() {
            return Ok(Vec::new());
        }
        let added_names: HashSet<&str> =
            symbol_diff.added.iter().map(|q| short_name(q)).collect();
        let changed_names: HashSet<&str> = symbol_diff
            .added
            .iter()
            .chain(symbol_diff.deleted.iter())
            .map(|q| short_name(q))
            .collect();

        let mut dependents = BTreeSet::new();
        for edge in self.db.list_stored_edges()? {
            if touched.contains(edge.file_path.as_str()) {
                continue;
            }
            // Name-based bindings move when a same-named definition comes or goes.
            let stale = match &edge.callee_qualname {
                Some(target) => {
                    !table.contains(target) || added_names.contains(short_name(target))
                }
                None => changed_names.contains(raw_tail(&edge.raw_callee)),
            };
            if stale {
                dependents.insert(edge.file_path);
            }
        }
        if dependents.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!("re-resolving edges of {} dependent files", dependents.len());

        let files: Vec<&ScannedFile> = dependents
            .iter()
            .filter_map(|path| scanned.get(path.as_str()).copied())
            .collect();
        let mut rewrites = Vec::new();
        for extraction in extract_files(&files)? {
            let FileOutcome::Parsed(mut file) = extraction.outcome else {
                continue;
            };
            let stored: HashSet<&str> = stored_symbols
                .iter()
                .filter(|symbol| symbol.file_path == extraction.file.rel_path)
                .map(|symbol| symbol.qualname.as_str())
                .collect();
            let dropped: BTreeSet<String> = file
                .symbols
                .iter()
                .filter(|symbol| !stored.contains(symbol.qualname.as_str()))
                .map(|symbol| symbol.qualname.clone())
                .collect();
            drop_symbols(&mut file, &dropped);
            let (edges, _) = resolve_file(&file, table);
            rewrites.push(EdgeRewrite {
                path: extraction.file.rel_path,
                edges,
            });
        }
        Ok(rewrites)
    }
}

/// Parse files in parallel, one extractor per worker.
fn extract_files(files: &[&ScannedFile]) -> Result<Vec<Extraction>> {
    if files.is_empty() {
        return Ok(Vec::new());
    }
    let results: Vec<Result<Extraction>> = files
        .par_iter()
        .map_init(PythonExtractor::new, |extractor, file| {
            let extractor = match extractor {
                Ok(extractor) => extractor,
                Err(err) => {
                    return Err(crate::error::Error::Config(format!(
                        "python extractor unavailable: {err}"
                    )));
                }
            };
            let outcome = match util::read_to_string(&file.abs_path) {
                Ok(source) => match extractor.extract(&source, &file.rel_path) {
                    Ok(extracted) => FileOutcome::Parsed(extracted),
                    Err(failure) => FileOutcome::Failed(failure),
                },
                Err(err) => FileOutcome::Failed(ParseFailure {
                    line: 0,
                    message: format!("unreadable: {err}"),
                }),
            };
            Ok(Extraction {
                file: (*file).clone(),
                outcome,
            })
        })
        .collect();
    let mut out = Vec::with_capacity(results.len());
    for result in results {
        out.push(result?);
    }
    Ok(out)
}

/// Merge stored symbols of untouched files with fresh extractions. When two
/// files define the same qualified name, the lexicographically first path
/// owns it. Returns the owners and, per path, the qualnames it lost.
fn assign_owners(
    stored_symbols: &[StoredSymbol],
    extracted: &BTreeMap<String, Extraction>,
    removed: &[String],
) -> (BTreeMap<String, Owner>, BTreeMap<String, BTreeSet<String>>) {
    let removed: HashSet<&str> = removed.iter().map(String::as_str).collect();
    let mut claims: BTreeMap<String, Vec<Owner>> = BTreeMap::new();
    for symbol in stored_symbols {
        if extracted.contains_key(&symbol.file_path) || removed.contains(symbol.file_path.as_str()) {
            continue;
        }
        claims.entry(symbol.qualname.clone()).or_default().push(Owner {
            path: symbol.file_path.clone(),
            kind: symbol.kind,
            complexity: symbol.complexity,
        });
    }
    for (path, extraction) in extracted {
        let FileOutcome::Parsed(file) = &extraction.outcome else {
            continue;
        };
        for symbol in &file.symbols {
            claims.entry(symbol.qualname.clone()).or_default().push(Owner {
                path: path.clone(),
                kind: symbol.kind,
                complexity: symbol.complexity,
            });
        }
    }

    let mut owners = BTreeMap::new();
    let mut shadowed: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (qualname, mut candidates) in claims {
        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        let mut candidates = candidates.into_iter();
        let Some(winner) = candidates.next() else {
            continue;
        };
        for loser in candidates {
            if loser.path != winner.path {
                shadowed
                    .entry(loser.path)
                    .or_default()
                    .insert(qualname.clone());
            }
        }
        owners.insert(qualname, winner);
    }
    (owners, shadowed)
}

/// Remove symbols owned by another file, along with calls made from them.
fn drop_symbols(file: &mut ExtractedFile, dropped: &BTreeSet<String>) {
    if dropped.is_empty() {
        return;
    }
    file.symbols.retain(|symbol| !dropped.contains(&symbol.qualname));
    file.calls.retain(|call| !dropped.contains(&call.caller));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SymbolKind;

    fn stored(path: &str, qualname: &str) -> StoredSymbol {
        StoredSymbol {
            id: 1,
            file_path: path.to_string(),
            kind: SymbolKind::Function,
            qualname: qualname.to_string(),
            name: short_name(qualname).to_string(),
            start_line: 1,
            end_line: 1,
            fingerprint: String::new(),
            complexity: 1,
        }
    }

    #[test]
    fn first_path_wins_qualname_collisions() {
        let (owners, shadowed) = assign_owners(
            &[stored("m.pyi", "m:f"), stored("m.py", "m:f"), stored("a.py", "a:g")],
            &BTreeMap::new(),
            &[],
        );
        assert_eq!(owners.get("m:f").unwrap().path, "m.py");
        assert!(shadowed.get("m.pyi").unwrap().contains("m:f"));
        assert!(!shadowed.contains_key("a.py"));
    }

    #[test]
    fn removed_files_release_their_symbols() {
        let (owners, _) = assign_owners(
            &[stored("gone.py", "gone:f")],
            &BTreeMap::new(),
            &["gone.py".to_string()],
        );
        assert!(owners.is_empty());
    }
}
