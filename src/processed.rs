//! Durable processed-archive tracking.
//!
//! The processed-set is the crash-recovery anchor: an archive path appears
//! here only after its records have been committed at least once, so a
//! rerun after a crash re-extracts exactly the archives whose workers
//! never reached the append step. Persistence is an append-only UTF-8 text
//! file, one absolute path per line; the in-memory mirror is a hash set
//! behind a read/write lock.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

pub struct ProcessedSet {
    log_path: PathBuf,
    inner: RwLock<HashSet<String>>,
}

impl ProcessedSet {
    /// Loads the set from `log_path`. A missing file is an empty set, not
    /// an error. Blank lines are ignored.
    pub fn load(log_path: &Path) -> Result<Self> {
        let mut set = HashSet::new();
        match std::fs::read_to_string(log_path) {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if !line.is_empty() {
                        set.insert(line.to_string());
                    }
                }
                info!(count = set.len(), "loaded processed archives");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", log_path.display()));
            }
        }
        Ok(ProcessedSet {
            log_path: log_path.to_path_buf(),
            inner: RwLock::new(set),
        })
    }

    /// Exact-string membership test on the archive's path.
    pub fn contains(&self, archive: &Path) -> bool {
        let set = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        set.contains(&archive.to_string_lossy().into_owned())
    }

    /// Marks an archive processed: set insert plus one appended line,
    /// both under the write lock.
    pub fn mark(&self, archive: &Path) -> Result<()> {
        let key = archive.to_string_lossy().into_owned();
        let mut set = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("open {}", self.log_path.display()))?;
        writeln!(file, "{key}").with_context(|| format!("append {}", self.log_path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
