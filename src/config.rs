//! Runtime configuration.
//!
//! Every knob is a CLI flag with an environment-variable fallback, layered
//! the same way the deployment scripts expect: env first, flag wins. The
//! bundle is built once at startup, validated, and passed read-only to the
//! components; nothing reads the environment after that.

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::PathBuf;

/// Ceiling on the configurable UPSERT batch size.
pub const MAX_BATCH_SIZE: usize = 2_000;

/// Shared flags for every subcommand that touches the store or the
/// filesystem.
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Postgres host.
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Postgres port.
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Database name.
    #[arg(long, env = "DB_NAME", default_value = "patents_db")]
    pub db_name: String,

    /// Database user.
    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// Database password.
    #[arg(long, env = "DB_PASSWORD", default_value = "", hide_env_values = true)]
    pub db_password: String,

    /// Number of extraction workers.
    #[arg(long, env = "WORKERS", default_value_t = 8)]
    pub workers: usize,

    /// UPSERT batch size (records per transaction).
    #[arg(long, env = "BATCH_SIZE", default_value_t = 500)]
    pub batch_size: usize,

    /// Root directory holding the per-year archive tree.
    #[arg(long, env = "FILES_ROOT", default_value = "/mnt/patents/data")]
    pub files_root: PathBuf,

    /// Restrict the scan to the NewFiles staging subtree.
    #[arg(long, env = "SCAN_NEW", default_value_t = false)]
    pub scan_new: bool,

    /// Recurse into year subdirectories.
    #[arg(long, env = "RECURSIVE", default_value_t = true, action = clap::ArgAction::Set)]
    pub recursive: bool,

    /// Minimum size in MB before an extensionless file is sniffed for
    /// archive magic bytes.
    #[arg(long, env = "MIN_ARCHIVE_SIZE_MB", default_value_t = 1)]
    pub min_archive_size_mb: u64,

    /// Ignore the processed-set and reprocess everything found.
    #[arg(long, env = "REPROCESS_ALL", default_value_t = false)]
    pub reprocess: bool,

    /// Force-overwrite merge mode: unconditionally refresh description and
    /// claims text on conflict. Metadata stays fill-only.
    #[arg(long, env = "FORCE_OVERWRITE", default_value_t = false)]
    pub force: bool,

    /// Lower bound of the priority year window (0 disables).
    #[arg(long, env = "PRIORITY_MIN_YEAR", default_value_t = 0)]
    pub priority_min_year: i32,

    /// Upper bound of the priority year window (0 disables).
    #[arg(long, env = "PRIORITY_MAX_YEAR", default_value_t = 0)]
    pub priority_max_year: i32,

    /// Durable processed-set file, one absolute archive path per line.
    #[arg(long, env = "PROCESSED_LOG", default_value = "processed_archives.txt")]
    pub processed_log: PathBuf,

    /// Per-record failure log (timestamp, class, pub number, detail).
    #[arg(long, env = "FAILURES_LOG", default_value = "extract_failures.log")]
    pub failures_log: PathBuf,
}

/// Validated configuration bundle handed to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub workers: usize,
    pub batch_size: usize,
    pub files_root: PathBuf,
    pub scan_new: bool,
    pub recursive: bool,
    pub min_archive_size_mb: u64,
    pub reprocess: bool,
    pub force: bool,
    pub priority_min_year: i32,
    pub priority_max_year: i32,
    pub processed_log: PathBuf,
    pub failures_log: PathBuf,
}

impl ConfigArgs {
    /// Validates the raw flags into a [`Config`].
    ///
    /// Worker count is clamped to `[1, cpu_count * 2]` and batch size to
    /// `[1, MAX_BATCH_SIZE]`; an empty database name is fatal.
    pub fn resolve(self) -> Result<Config> {
        if self.db_name.is_empty() {
            bail!("db-name must not be empty");
        }
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(16);
        let workers = self.workers.clamp(1, max_workers);
        let batch_size = self.batch_size.clamp(1, MAX_BATCH_SIZE);

        Ok(Config {
            db_host: self.db_host,
            db_port: self.db_port,
            db_name: self.db_name,
            db_user: self.db_user,
            db_password: self.db_password,
            workers,
            batch_size,
            files_root: self.files_root,
            scan_new: self.scan_new,
            recursive: self.recursive,
            min_archive_size_mb: self.min_archive_size_mb,
            reprocess: self.reprocess,
            force: self.force,
            priority_min_year: self.priority_min_year,
            priority_max_year: self.priority_max_year,
            processed_log: self.processed_log,
            failures_log: self.failures_log,
        })
    }
}

impl Config {
    /// The `NewFiles` staging subtree under the files root.
    pub fn staging_dir(&self) -> PathBuf {
        self.files_root.join("NewFiles")
    }

    /// Grant pipeline processed-set, kept separate from the publication
    /// one so the two pipelines resume independently.
    pub fn grant_processed_log(&self) -> PathBuf {
        match self.processed_log.parent() {
            Some(parent) => parent.join("processed_grant_archives.txt"),
            None => PathBuf::from("processed_grant_archives.txt"),
        }
    }

    /// Fails fast when the files root is missing; creates the staging
    /// subtree so relocation always has a target.
    pub fn ensure_layout(&self) -> Result<()> {
        if !self.files_root.is_dir() {
            bail!("files root does not exist: {}", self.files_root.display());
        }
        std::fs::create_dir_all(self.staging_dir())
            .with_context(|| format!("create {}", self.staging_dir().display()))?;
        Ok(())
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Config {
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_name: "patents_test".to_string(),
            db_user: "postgres".to_string(),
            db_password: String::new(),
            workers: 2,
            batch_size: 500,
            files_root: PathBuf::from("."),
            scan_new: false,
            recursive: true,
            min_archive_size_mb: 1,
            reprocess: false,
            force: false,
            priority_min_year: 0,
            priority_max_year: 0,
            processed_log: PathBuf::from("processed_archives.txt"),
            failures_log: PathBuf::from("extract_failures.log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: ConfigArgs,
    }

    #[test]
    fn defaults_resolve() {
        let cli = Harness::parse_from(["patx"]);
        let cfg = cli.config.resolve().unwrap();
        assert_eq!(cfg.db_port, 5432);
        assert_eq!(cfg.batch_size, 500);
        assert!(cfg.recursive);
        assert!(!cfg.force);
    }

    #[test]
    fn batch_size_is_clamped_to_ceiling() {
        let cli = Harness::parse_from(["patx", "--batch-size", "50000"]);
        let cfg = cli.config.resolve().unwrap();
        assert_eq!(cfg.batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn workers_never_drop_to_zero() {
        let cli = Harness::parse_from(["patx", "--workers", "0"]);
        let cfg = cli.config.resolve().unwrap();
        assert!(cfg.workers >= 1);
    }

    #[test]
    fn recursive_flag_accepts_explicit_value() {
        let cli = Harness::parse_from(["patx", "--recursive", "false"]);
        let cfg = cli.config.resolve().unwrap();
        assert!(!cfg.recursive);
    }

    #[test]
    fn grant_processed_log_is_a_sibling_file() {
        let mut cfg = Config::test_defaults();
        cfg.processed_log = PathBuf::from("/var/lib/patx/processed_archives.txt");
        assert_eq!(
            cfg.grant_processed_log(),
            PathBuf::from("/var/lib/patx/processed_grant_archives.txt")
        );
    }
}
