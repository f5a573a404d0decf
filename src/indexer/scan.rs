use crate::error::{Error, Result};
use crate::model::FileIssue;
use crate::util;
use ignore::WalkBuilder;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub hash: String,
    pub size: i64,
}

#[derive(Debug, Default)]
pub struct ScanOutput {
    pub files: Vec<ScannedFile>,
    pub warnings: Vec<FileIssue>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub no_ignore: bool,
}

impl ScanOptions {
    pub fn new(no_ignore: bool) -> Self {
        Self { no_ignore }
    }
}

pub const SOURCE_EXTENSIONS: &[&str] = &["py", "pyi"];

/// Directory names never descended into, regardless of ignore files.
static IGNORED_DIRS: &[&str] = &[
    "__pycache__",
    "node_modules",
    "site-packages",
    "venv",
    "env",
    "build",
    "dist",
];

pub fn scan_repo(repo_root: &Path) -> Result<ScanOutput> {
    scan_repo_with_options(repo_root, ScanOptions::default())
}

pub fn scan_repo_with_options(repo_root: &Path, options: ScanOptions) -> Result<ScanOutput> {
    fs::read_dir(repo_root).map_err(|err| Error::scan(repo_root, err))?;

    let mut output = ScanOutput::default();
    let mut builder = WalkBuilder::new(repo_root);
    if options.no_ignore {
        builder
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false);
    } else {
        builder
            .ignore(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .parents(true)
            .require_git(false);
    }
    let walker = builder
        .hidden(false)
        .filter_entry(|entry| !is_ignored_entry(entry))
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("walk error under {}: {err}", repo_root.display());
                output.warnings.push(FileIssue {
                    path: repo_root.display().to_string(),
                    message: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if !is_source_file(path) {
            continue;
        }
        let Some(rel_path) = util::normalize_rel_path(repo_root, path) else {
            continue;
        };
        match fingerprint_file(path) {
            Ok((hash, size)) => output.files.push(ScannedFile {
                rel_path,
                abs_path: path.to_path_buf(),
                hash,
                size,
            }),
            Err(err) => {
                tracing::warn!("skipping unreadable file {rel_path}: {err}");
                output.warnings.push(FileIssue {
                    path: rel_path,
                    message: format!("unreadable: {err}"),
                });
            }
        }
    }
    output.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    output.files.dedup_by(|a, b| a.rel_path == b.rel_path);
    Ok(output)
}

fn is_ignored_entry(entry: &ignore::DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
    if !is_dir {
        return false;
    }
    let Some(name) = entry.file_name().to_str() else {
        return false;
    };
    is_ignored_dir_name(name)
}

pub fn is_ignored_dir_name(name: &str) -> bool {
    if name.starts_with('.') {
        // hidden dirs: .git, .ttmm, .venv, .tox, .eggs, ...
        return true;
    }
    if name.ends_with(".egg-info") {
        return true;
    }
    IGNORED_DIRS.contains(&name)
}

pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

fn fingerprint_file(path: &Path) -> std::io::Result<(String, i64)> {
    let data = fs::read(path)?;
    Ok((util::content_hash(&data), data.len() as i64))
}
