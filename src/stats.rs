//! Rolling pipeline statistics.
//!
//! Monotonic counters shared across workers and the inserter, emitted as a
//! block every 30 seconds by the orchestrator's ticker and once more at
//! shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

pub struct Stats {
    archives_processed: AtomicU64,
    records_extracted: AtomicU64,
    records_inserted: AtomicU64,
    errors: AtomicU64,
    start: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            archives_processed: AtomicU64::new(0),
            records_extracted: AtomicU64::new(0),
            records_inserted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn add_archives(&self, n: u64) {
        self.archives_processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_extracted(&self, n: u64) {
        self.records_extracted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_inserted(&self, n: u64) {
        self.records_inserted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            archives_processed: self.archives_processed.load(Ordering::Relaxed),
            records_extracted: self.records_extracted.load(Ordering::Relaxed),
            records_inserted: self.records_inserted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed_hours: self.start.elapsed().as_secs_f64() / 3600.0,
        }
    }

    /// Emits the statistics block, optionally with the store's current row
    /// count.
    pub fn log_block(&self, stored_rows: Option<i64>) {
        let snap = self.snapshot();
        let rate = if snap.elapsed_hours > 0.0 {
            snap.records_extracted as f64 / snap.elapsed_hours
        } else {
            0.0
        };
        info!("========== STATISTICS ==========");
        info!("Archives processed: {}", snap.archives_processed);
        info!("Records extracted:  {}", snap.records_extracted);
        info!("Records inserted:   {}", snap.records_inserted);
        info!("Errors:             {}", snap.errors);
        info!("Time elapsed:       {:.2} hours", snap.elapsed_hours);
        info!("Rate:               {:.0} records/hour", rate);
        if let Some(rows) = stored_rows {
            info!("Stored rows:        {}", rows);
        }
        info!("================================");
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub archives_processed: u64,
    pub records_extracted: u64,
    pub records_inserted: u64,
    pub errors: u64,
    pub elapsed_hours: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let stats = Stats::new();
        stats.add_archives(1);
        stats.add_extracted(250);
        stats.add_extracted(250);
        stats.add_inserted(499);
        stats.add_error();

        let snap = stats.snapshot();
        assert_eq!(snap.archives_processed, 1);
        assert_eq!(snap.records_extracted, 500);
        assert_eq!(snap.records_inserted, 499);
        assert_eq!(snap.errors, 1);
    }
}
