use crate::error::{Error, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub fn read_to_string(path: &Path) -> std::io::Result<String> {
    fs::read_to_string(path)
}

pub fn normalize_rel_path(repo_root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(repo_root).ok()?;
    Some(normalize_path(rel))
}

pub fn normalize_path(path: &Path) -> String {
    let mut parts = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(os) => parts.push(os.to_string_lossy().to_string()),
            Component::ParentDir => parts.push("..".to_string()),
            Component::CurDir => {}
            _ => {}
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

pub fn slice_bytes(content: &str, start_byte: usize, end_byte: usize) -> &str {
    if end_byte <= start_byte || start_byte >= content.len() {
        return "";
    }
    let end = end_byte.min(content.len());
    content.get(start_byte..end).unwrap_or("")
}

pub fn truncate_str_bytes(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes.min(value.len());
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Collapse whitespace runs so call expressions spanning lines stay readable.
pub fn squash_whitespace(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_space = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    hasher.finalize().to_hex().to_string()
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Canonical root used as the store key; fails when the root is missing.
pub fn canonical_root(root: &Path) -> Result<PathBuf> {
    let meta = fs::metadata(root).map_err(|err| Error::scan(root, err))?;
    if !meta.is_dir() {
        return Err(Error::scan(root, "not a directory"));
    }
    fs::canonicalize(root).map_err(|err| Error::scan(root, err))
}

pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_drops_cur_dir() {
        assert_eq!(normalize_path(Path::new("./pkg/mod.py")), "pkg/mod.py");
        assert_eq!(normalize_path(Path::new("")), ".");
    }

    #[test]
    fn squash_whitespace_collapses_newlines() {
        assert_eq!(squash_whitespace("foo(\n    a,\n    b)"), "foo( a, b)");
    }

    #[test]
    fn slice_bytes_clamps_to_len() {
        assert_eq!(slice_bytes("abcdef", 2, 100), "cdef");
        assert_eq!(slice_bytes("abc", 5, 6), "");
    }
}
