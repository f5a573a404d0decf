use crate::indexer::extract::SymbolInput;
use crate::indexer::scan::ScannedFile;
use std::collections::{BTreeMap, BTreeSet};

/// Result of comparing the fingerprints recorded by the last run against a
/// fresh scan. All lists are sorted by path.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Paths not seen by the last run.
    pub added: Vec<String>,
    /// Paths whose content hash changed.
    pub modified: Vec<String>,
    /// Paths recorded by the last run that are gone from disk.
    pub removed: Vec<String>,
    /// Paths with identical content; their rows are left untouched.
    pub unchanged: Vec<String>,
}

impl FileDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Files that must be parsed again.
    pub fn changed(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }
}

/// Compare `previous` (path -> content hash) with the scanned files.
pub fn compute_file_diff(previous: &BTreeMap<String, String>, scanned: &[ScannedFile]) -> FileDiff {
    let mut diff = FileDiff::default();
    let mut seen = BTreeSet::new();
    for file in scanned {
        seen.insert(file.rel_path.as_str());
        match previous.get(&file.rel_path) {
            None => diff.added.push(file.rel_path.clone()),
            Some(hash) if *hash != file.hash => diff.modified.push(file.rel_path.clone()),
            Some(_) => diff.unchanged.push(file.rel_path.clone()),
        }
    }
    for path in previous.keys() {
        if !seen.contains(path.as_str()) {
            diff.removed.push(path.clone());
        }
    }
    diff.added.sort();
    diff.modified.sort();
    diff.unchanged.sort();
    diff
}

/// Qualified-name level changes across the files that were re-parsed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SymbolDiff {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

/// `old` maps qualname -> fingerprint for the symbols previously stored for
/// the changed and removed files.
pub fn compute_symbol_diff<'a>(
    old: &BTreeMap<String, String>,
    new_symbols: impl IntoIterator<Item = &'a SymbolInput>,
) -> SymbolDiff {
    let mut diff = SymbolDiff::default();
    let mut seen = BTreeSet::new();
    for symbol in new_symbols {
        seen.insert(symbol.qualname.clone());
        match old.get(&symbol.qualname) {
            None => {
                diff.added.insert(symbol.qualname.clone());
            }
            Some(fingerprint) if *fingerprint != symbol.fingerprint => {
                diff.modified.insert(symbol.qualname.clone());
            }
            Some(_) => {}
        }
    }
    for qualname in old.keys() {
        if !seen.contains(qualname) {
            diff.deleted.insert(qualname.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SymbolKind;
    use std::path::PathBuf;

    fn scanned(path: &str, hash: &str) -> ScannedFile {
        ScannedFile {
            rel_path: path.to_string(),
            abs_path: PathBuf::from(path),
            hash: hash.to_string(),
            size: 1,
        }
    }

    fn symbol(qualname: &str, fingerprint: &str) -> SymbolInput {
        SymbolInput {
            kind: SymbolKind::Function,
            name: qualname.to_string(),
            qualname: qualname.to_string(),
            start_line: 1,
            end_line: 1,
            start_byte: 0,
            end_byte: 0,
            fingerprint: fingerprint.to_string(),
            docstring: None,
            comment: None,
            complexity: 1,
        }
    }

    #[test]
    fn file_diff_classifies_each_path() {
        let previous: BTreeMap<String, String> = [
            ("a.py".to_string(), "1".to_string()),
            ("b.py".to_string(), "2".to_string()),
            ("c.py".to_string(), "3".to_string()),
        ]
        .into_iter()
        .collect();
        let diff = compute_file_diff(
            &previous,
            &[scanned("a.py", "1"), scanned("b.py", "changed"), scanned("d.py", "4")],
        );
        assert_eq!(diff.unchanged, vec!["a.py"]);
        assert_eq!(diff.modified, vec!["b.py"]);
        assert_eq!(diff.added, vec!["d.py"]);
        assert_eq!(diff.removed, vec!["c.py"]);
        assert!(!diff.is_noop());
    }

    #[test]
    fn identical_scan_is_noop() {
        let previous: BTreeMap<String, String> =
            [("a.py".to_string(), "1".to_string())].into_iter().collect();
        let diff = compute_file_diff(&previous, &[scanned("a.py", "1")]);
        assert!(diff.is_noop());
    }

    #[test]
    fn symbol_diff_tracks_fingerprints() {
        let old: BTreeMap<String, String> = [
            ("m:keep".to_string(), "k".to_string()),
            ("m:edit".to_string(), "e".to_string()),
            ("m:gone".to_string(), "g".to_string()),
        ]
        .into_iter()
        .collect();
        let new = [symbol("m:keep", "k"), symbol("m:edit", "e2"), symbol("m:new", "n")];
        let diff = compute_symbol_diff(&old, new.iter());
        assert!(diff.added.contains("m:new"));
        assert!(diff.modified.contains("m:edit"));
        assert!(diff.deleted.contains("m:gone"));
        assert_eq!(diff.added.len() + diff.modified.len() + diff.deleted.len(), 3);
    }
}
