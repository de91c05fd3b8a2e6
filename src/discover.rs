//! Archive discovery, filtering, and priority ordering.
//!
//! Discovery is a pure function of the filesystem and the processed-set at
//! the moment of the scan. The only mutation it performs is relocating
//! already-processed staging files back to the originals directory, so the
//! staging subtree drains even when a file reappears after a crash.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::processed::ProcessedSet;
use crate::stream::{sniff_tar, sniff_zip};

static I_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^I(\d{4})").unwrap());
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})").unwrap());

static STAGING_GLOBS: LazyLock<GlobSet> = LazyLock::new(|| {
    let mut builder = GlobSetBuilder::new();
    for pattern in ["*.ZIP", "*.zip", "*.tar", "*.tar.gz", "*SUPP*.ZIP"] {
        builder.add(Glob::new(pattern).unwrap());
    }
    builder.build().unwrap()
});

/// Year hint parsed from an archive basename (`I20160526.tar`,
/// `20030313A.ZIP`, ...).
pub fn year_of(basename: &str) -> Option<i32> {
    let caps = I_YEAR_RE
        .captures(basename)
        .or_else(|| YEAR_RE.captures(basename))?;
    caps[1].parse().ok()
}

/// Applies the candidate classification rules to one directory entry.
///
/// In order: known archive extensions, `SUPP` supplement zips, then
/// extensionless files at least `min_bytes` long whose magic bytes sniff
/// as ZIP or TAR.
pub fn is_candidate(path: &Path, size: u64, min_bytes: u64) -> bool {
    let name = match path.file_name() {
        Some(n) => n.to_string_lossy().into_owned(),
        None => return false,
    };
    let lower = name.to_lowercase();
    if lower.ends_with(".zip")
        || lower.ends_with(".tar")
        || lower.ends_with(".tgz")
        || lower.ends_with(".tar.gz")
    {
        return true;
    }
    let upper = name.to_uppercase();
    if upper.contains("SUPP") && upper.ends_with(".ZIP") {
        return true;
    }
    if !name.contains('.') && size >= min_bytes {
        return sniff_zip(path) || sniff_tar(path);
    }
    false
}

/// Walks the configured root and returns the ordered work set.
///
/// Paths present in the processed-set are dropped (unless reprocess mode
/// is on); in staging mode an already-processed file is first moved back
/// to the originals directory. When a priority year window is configured,
/// archives whose filename year falls inside it run first, newest first;
/// the rest follow oldest first so old cohorts are not starved.
pub fn discover(config: &Config, processed: &ProcessedSet) -> Result<Vec<PathBuf>> {
    let mut archives: Vec<PathBuf> = Vec::new();

    if config.scan_new {
        let staging = config.staging_dir();
        let entries = std::fs::read_dir(&staging)
            .with_context(|| format!("read staging directory {}", staging.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !STAGING_GLOBS.is_match(&name) {
                continue;
            }
            if !config.reprocess && processed.contains(&path) {
                info!(file = %name, "already processed staging file, moving to originals");
                if let Err(err) = move_to_originals(&config.files_root, &path) {
                    warn!(file = %name, %err, "failed to relocate processed staging file");
                }
                continue;
            }
            archives.push(path);
        }
    } else {
        let min_bytes = config.min_archive_size_mb * 1024 * 1024;
        let depth = if config.recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(&config.files_root).max_depth(depth) {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(%err, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if !is_candidate(entry.path(), size, min_bytes) {
                continue;
            }
            if config.reprocess || !processed.contains(entry.path()) {
                archives.push(entry.path().to_path_buf());
            }
        }
    }

    if config.priority_min_year > 0 && config.priority_max_year >= config.priority_min_year {
        archives = prioritize(
            archives,
            config.priority_min_year,
            config.priority_max_year,
        );
    }

    info!(
        count = archives.len(),
        root = %config.files_root.display(),
        "discovered unprocessed archives"
    );
    Ok(archives)
}

/// Splits the work set on the year window and orders each half.
fn prioritize(archives: Vec<PathBuf>, min_year: i32, max_year: i32) -> Vec<PathBuf> {
    let mut priority: Vec<PathBuf> = Vec::new();
    let mut rest: Vec<PathBuf> = Vec::new();
    for path in archives {
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match year_of(&base) {
            Some(y) if y >= min_year && y <= max_year => priority.push(path),
            _ => rest.push(path),
        }
    }
    let base_of = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    // Latest priority cohorts first, everything else oldest first.
    priority.sort_by(|a, b| base_of(b).cmp(&base_of(a)));
    rest.sort_by(|a, b| base_of(a).cmp(&base_of(b)));
    info!(
        window = format!("{min_year}-{max_year}"),
        priority = priority.len(),
        rest = rest.len(),
        "priority window applied"
    );
    priority.extend(rest);
    priority
}

/// Moves a consumed staging file back under the files root.
///
/// No-op for paths outside the staging subtree. On a name collision the
/// destination gets a seconds-since-epoch suffix.
pub fn move_to_originals(files_root: &Path, archive: &Path) -> Result<Option<PathBuf>> {
    let staging = files_root.join("NewFiles");
    if !archive.starts_with(&staging) {
        return Ok(None);
    }
    let base = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut dest = files_root.join(&base);
    if dest.exists() {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        dest = files_root.join(format!("{base}.{epoch}"));
    }
    std::fs::rename(archive, &dest)
        .with_context(|| format!("move {} to {}", archive.display(), dest.display()))?;
    info!(file = %base, dest = %dest.display(), "moved staging file back to originals");
    Ok(Some(dest))
}
