//! Git churn mining
//!
//! Counts how many commits touched each file. Churn feeds the hotspot
//! score; it is file-level and shared by every symbol in the file.
//!
//! ## Algorithm
//!
//! 1. Check that the root sits inside a git work tree
//! 2. Run one `git log --numstat` scoped to the root (`--relative`)
//! 3. Count distinct commits per path
//!
//! When git is missing or the root is not tracked, every file has churn 0.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Supplies per-file commit counts to the hotspot scorer.
pub trait ChurnSource: Send + Sync {
    /// Reads history as it stands now. Called once per index run.
    fn collect(&self) -> ChurnSnapshot;
}

/// Commit counts read for one index run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChurnSnapshot {
    counts: Option<HashMap<String, i64>>,
}

impl ChurnSnapshot {
    pub fn from_counts(counts: HashMap<String, i64>) -> Self {
        Self {
            counts: Some(counts),
        }
    }

    /// History could not be read; every file has churn 0.
    pub fn unavailable() -> Self {
        Self { counts: None }
    }

    /// Commits that touched `rel_path` inside the window; 0 when unknown.
    pub fn churn(&self, rel_path: &str) -> i64 {
        self.counts
            .as_ref()
            .and_then(|counts| counts.get(rel_path).copied())
            .unwrap_or(0)
    }

    pub fn available(&self) -> bool {
        self.counts.is_some()
    }
}

/// How far back history is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChurnWindow {
    #[default]
    All,
    Days(u32),
}

impl ChurnWindow {
    pub fn from_days(days: u32) -> Self {
        if days == 0 {
            ChurnWindow::All
        } else {
            ChurnWindow::Days(days)
        }
    }
}

/// Mines `git log` afresh on every collection.
pub struct GitChurn {
    root: PathBuf,
    window: ChurnWindow,
}

impl GitChurn {
    pub fn new(root: &Path, window: ChurnWindow) -> Self {
        Self {
            root: root.to_path_buf(),
            window,
        }
    }
}

impl ChurnSource for GitChurn {
    fn collect(&self) -> ChurnSnapshot {
        match mine_churn(&self.root, self.window) {
            Ok(counts) => ChurnSnapshot::from_counts(counts),
            Err(reason) => {
                tracing::warn!(
                    "churn unavailable for {}: {reason}; using 0 for every file",
                    self.root.display()
                );
                ChurnSnapshot::unavailable()
            }
        }
    }
}

/// Fixed churn table, for callers that already know the history.
#[derive(Debug, Clone, Default)]
pub struct StaticChurn {
    counts: HashMap<String, i64>,
}

impl StaticChurn {
    pub fn new<I, S>(counts: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        Self {
            counts: counts.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl ChurnSource for StaticChurn {
    fn collect(&self) -> ChurnSnapshot {
        ChurnSnapshot::from_counts(self.counts.clone())
    }
}

fn mine_churn(root: &Path, window: ChurnWindow) -> Result<HashMap<String, i64>, String> {
    let probe = Command::new("git")
        .arg("rev-parse")
        .arg("--is-inside-work-tree")
        .current_dir(root)
        .output()
        .map_err(|err| format!("failed to run git: {err}"))?;
    if !probe.status.success() || String::from_utf8_lossy(&probe.stdout).trim() != "true" {
        return Err("not a git work tree".to_string());
    }

    let mut command = Command::new("git");
    command
        .args(["-c", "core.quotePath=false"])
        .arg("log")
        .arg("--numstat")
        .arg("--format=%H %at")
        .arg("--no-merges")
        .arg("--no-renames")
        .arg("--relative");
    if let ChurnWindow::Days(days) = window {
        command.arg(format!("--since={days} days ago"));
    }
    let output = command
        .current_dir(root)
        .output()
        .map_err(|err| format!("failed to run git log: {err}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // A fresh repository with no commits has no history to count.
        if stderr.contains("does not have any commits") {
            return Ok(HashMap::new());
        }
        return Err(format!("git log failed: {}", stderr.trim()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(count_commits_per_file(&parse_git_log(&stdout)))
}

/// Parsed git commit information
#[derive(Debug)]
struct GitCommit {
    sha: String,
    files: Vec<String>,
}

fn is_commit_header(parts: &[&str]) -> bool {
    parts.len() == 2
        && matches!(parts[0].len(), 40 | 64)
        && parts[0].chars().all(|ch| ch.is_ascii_hexdigit())
        && parts[1].parse::<i64>().is_ok()
}

/// Parse `git log --numstat --format='%H %at'` output.
///
/// Format:
/// ```text
/// HASH TIMESTAMP
///
/// N1\tN2\tfile_path
/// N1\tN2\tfile_path
/// ```
fn parse_git_log(output: &str) -> Vec<GitCommit> {
    let mut commits = Vec::new();
    let mut current: Option<GitCommit> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if is_commit_header(&parts) {
            if let Some(commit) = current.take() {
                commits.push(commit);
            }
            current = Some(GitCommit {
                sha: parts[0].to_string(),
                files: Vec::new(),
            });
        } else if line.contains('\t') {
            let fields: Vec<&str> = line.splitn(3, '\t').collect();
            if let (Some(commit), Some(path)) = (current.as_mut(), fields.get(2)) {
                commit.files.push(unquote_path(path.trim()));
            }
        }
    }
    if let Some(commit) = current {
        commits.push(commit);
    }
    commits
}

/// Undoes git's C-style quoting of paths with special bytes, e.g.
/// `"caf\303\251.py"`. Unquoted paths pass through.
fn unquote_path(path: &str) -> String {
    let Some(inner) = path
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return path.to_string();
    };
    let bytes = inner.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] != b'\\' || idx + 1 == bytes.len() {
            out.push(bytes[idx]);
            idx += 1;
            continue;
        }
        let escaped = bytes[idx + 1];
        match escaped {
            b'0'..=b'7' => {
                let digits = bytes[idx + 1..]
                    .iter()
                    .take(3)
                    .take_while(|b| matches!(**b, b'0'..=b'7'))
                    .count();
                let value = bytes[idx + 1..idx + 1 + digits]
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                out.push(value as u8);
                idx += 1 + digits;
                continue;
            }
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            other => out.push(other),
        }
        idx += 2;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn count_commits_per_file(commits: &[GitCommit]) -> HashMap<String, i64> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for commit in commits {
        let mut files: Vec<&String> = commit.files.iter().collect();
        files.sort();
        files.dedup();
        for file in files {
            *counts.entry(file.clone()).or_insert(0) += 1;
        }
    }
    tracing::debug!("churn mined from {} commits", commits.len());
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_git_log_basic() {
        let output = "\
abc1234567890123456789012345678901234567 1234567890

1\t2\tsrc/main.py
3\t4\tsrc/lib.py

def4567890123456789012345678901234567890 1234567900

5\t6\tsrc/main.py
";

        let commits = parse_git_log(output);
        assert_eq!(commits.len(), 2, "Expected 2 commits");
        assert_eq!(commits[0].sha, "abc1234567890123456789012345678901234567");
        assert_eq!(commits[0].files.len(), 2);
        assert_eq!(commits[1].files.len(), 1);

        let counts = count_commits_per_file(&commits);
        assert_eq!(counts.get("src/main.py"), Some(&2));
        assert_eq!(counts.get("src/lib.py"), Some(&1));
    }

    #[test]
    fn test_commit_without_files_counts_nothing() {
        let output = "abc1234567890123456789012345678901234567 1234567890\n";
        let commits = parse_git_log(output);
        assert_eq!(commits.len(), 1);
        assert!(count_commits_per_file(&commits).is_empty());
    }

    #[test]
    fn test_untracked_directory_has_zero_churn() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = GitChurn::new(dir.path(), ChurnWindow::All).collect();
        assert_eq!(snapshot.churn("a.py"), 0);
        assert!(!snapshot.available());
    }

    #[test]
    fn test_static_churn_snapshot() {
        let snapshot = StaticChurn::new([("a.py", 3)]).collect();
        assert!(snapshot.available());
        assert_eq!(snapshot.churn("a.py"), 3);
        assert_eq!(snapshot.churn("b.py"), 0);
    }

    #[test]
    fn test_quoted_paths_are_unquoted() {
        assert_eq!(unquote_path("\"caf\\303\\251.py\""), "café.py");
        assert_eq!(unquote_path("\"a\\tb\\\"c\\\\.py\""), "a\tb\"c\\.py");
        assert_eq!(unquote_path("plain/path.py"), "plain/path.py");

        let output = "abc1234567890123456789012345678901234567 1234567890\n\n1\t0\t\"pkg/\\303\\274ber.py\"\n";
        let counts = count_commits_per_file(&parse_git_log(output));
        assert_eq!(counts.get("pkg/über.py"), Some(&1));
    }

    #[test]
    fn test_window_from_days() {
        assert_eq!(ChurnWindow::from_days(0), ChurnWindow::All);
        assert_eq!(ChurnWindow::from_days(30), ChurnWindow::Days(30));
    }
}
