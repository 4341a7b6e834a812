use crate::indexer::stable_id;
use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Extensions of event files produced by the analysis front end.
pub const EVENT_EXTENSIONS: &[&str] = &["jsonl", "ndjson"];

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub hash: String,
    pub size: i64,
    pub modified: i64,
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

/// Walks `root` for event files, honouring ignore files unless told not to.
/// Results are sorted by relative path so indexing order is deterministic.
pub fn scan_events_with_options(root: &Path, options: ScanOptions) -> Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    let mut builder = WalkBuilder::new(root);
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
                warn!("walk error: {err}");
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if !is_event_file(path) {
            continue;
        }
        let rel_path = crate::util::normalize_rel_path(root, path)?;
        files.push(scan_file(path, rel_path)?);
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

/// Scans a single event file. Returns `None` when the path is not one.
pub fn scan_path(root: &Path, path: &Path) -> Result<Option<ScannedFile>> {
    if !path.is_file() || !is_event_file(path) {
        return Ok(None);
    }
    let rel_path = match crate::util::normalize_rel_path(root, path) {
        Ok(value) => value,
        Err(_) => crate::util::normalize_path(path),
    };
    scan_file(path, rel_path).map(Some)
}

fn scan_file(path: &Path, rel_path: String) -> Result<ScannedFile> {
    let metadata = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let size = metadata.len() as i64;
    let hash = hash_file(path).with_context(|| format!("hash {}", path.display()))?;
    Ok(ScannedFile {
        rel_path,
        abs_path: path.to_path_buf(),
        hash,
        size,
        modified,
    })
}

fn is_ignored_entry(entry: &ignore::DirEntry) -> bool {
    match entry.file_name() {
        name if name == OsStr::new(".cxref") => true,
        name if name == OsStr::new(".git") => true,
        _ => false,
    }
}

pub fn is_event_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EVENT_EXTENSIONS.contains(&ext))
}

pub fn hash_file(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    Ok(stable_id::content_hash(&data))
}
