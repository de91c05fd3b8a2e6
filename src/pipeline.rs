//! Publication pipeline orchestration.
//!
//! Wires discovery → streamer → parser → upsert sink through bounded
//! queues: a feeder fills the work queue, W workers each stream one
//! archive at a time and push per-archive record batches to the results
//! queue, and a single inserter drains results into batched transactions.
//! Back-pressure propagates naturally through the queue capacities.
//!
//! # Crash safety
//!
//! A worker appends an archive to the processed-set (and relocates it out
//! of staging) only after the archive's records have been handed to the
//! results queue. The UPSERT is idempotent under fill-only merge, so a
//! rerun after a crash re-extracts only the archives whose workers never
//! reached the append step, and re-inserted records are no-ops.
//!
//! # Shutdown
//!
//! A single ctrl-c broadcast is observed by the feeder and by every worker
//! between archives; workers finish the archive in hand, append it to the
//! processed-set, and exit. Closing the queues then drains the inserter.

use anyhow::Result;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::discover;
use crate::models::PatentRecord;
use crate::parse;
use crate::processed::ProcessedSet;
use crate::sink::UpsertSink;
use crate::stats::Stats;
use crate::stream;

const WORK_QUEUE_CAPACITY: usize = 100;
const RESULT_QUEUE_CAPACITY: usize = 100;
const TICKER_INTERVAL: Duration = Duration::from_secs(30);

/// Runs the full extraction pipeline to completion (or until ctrl-c).
pub async fn run(config: Config) -> Result<()> {
    config.ensure_layout()?;
    let pool = db::connect(&config).await?;
    let processed = Arc::new(ProcessedSet::load(&config.processed_log)?);
    let stats = Arc::new(Stats::new());
    let sink = Arc::new(UpsertSink::new(
        pool.clone(),
        config.force,
        config.failures_log.clone(),
    ));
    let config = Arc::new(config);

    let archives = discover::discover(&config, &processed)?;
    let initial_rows = stored_row_count(&pool).await;
    info!(
        archives = archives.len(),
        stored_rows = initial_rows.unwrap_or(-1),
        workers = config.workers,
        "starting extraction"
    );

    let (work_tx, work_rx) = mpsc::channel::<PathBuf>(WORK_QUEUE_CAPACITY);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<Vec<PatentRecord>>(RESULT_QUEUE_CAPACITY);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received; workers will finish their current archive");
            let _ = shutdown_tx.send(true);
        }
    });

    let feeder_shutdown = shutdown_rx.clone();
    let feeder = tokio::spawn(async move {
        for archive in archives {
            if *feeder_shutdown.borrow() {
                break;
            }
            if work_tx.send(archive).await.is_err() {
                break;
            }
        }
        // Dropping the sender closes the work queue.
    });

    let mut workers = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let work_rx = Arc::clone(&work_rx);
        let result_tx = result_tx.clone();
        let processed = Arc::clone(&processed);
        let stats = Arc::clone(&stats);
        let config = Arc::clone(&config);
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            worker_loop(
                worker_id, work_rx, result_tx, processed, stats, config, shutdown,
            )
            .await;
        }));
    }
    drop(result_tx);

    let ticker_stats = Arc::clone(&stats);
    let ticker_pool = pool.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICKER_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let rows = stored_row_count(&ticker_pool).await;
            ticker_stats.log_block(rows);
        }
    });

    // Inserter: the single consumer of the results queue.
    while let Some(batch) = result_rx.recv().await {
        for chunk in batch.chunks(config.batch_size) {
            match sink.insert_batch(chunk).await {
                Ok(n) => stats.add_inserted(n),
                Err(err) => {
                    error!(%err, "batch transaction failed");
                    stats.add_error();
                }
            }
        }
    }

    let _ = feeder.await;
    for worker in workers {
        let _ = worker.await;
    }
    ticker.abort();

    let final_rows = stored_row_count(&pool).await;
    info!("Extraction complete");
    if let (Some(before), Some(after)) = (initial_rows, final_rows) {
        info!(before, after, added = after - before, "stored row delta");
    }
    stats.log_block(final_rows);

    let breakdown = sink.failure_breakdown();
    if !breakdown.is_empty() {
        info!("Failure breakdown:");
        for (class, count) in breakdown {
            info!("  {class}: {count}");
        }
    }

    pool.close().await;
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    work_rx: Arc<Mutex<mpsc::Receiver<PathBuf>>>,
    result_tx: mpsc::Sender<Vec<PatentRecord>>,
    processed: Arc<ProcessedSet>,
    stats: Arc<Stats>,
    config: Arc<Config>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let archive = {
            let mut rx = work_rx.lock().await;
            rx.recv().await
        };
        let Some(archive) = archive else { break };
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(worker = worker_id, archive = %name, "processing archive");

        let path = archive.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_archive(&path)).await;
        match extracted {
            Ok(Ok(records)) => {
                info!(
                    worker = worker_id,
                    archive = %name,
                    records = records.len(),
                    "archive extracted"
                );
                stats.add_extracted(records.len() as u64);
                if !records.is_empty() && result_tx.send(records).await.is_err() {
                    break;
                }
                if let Err(err) = processed.mark(&archive) {
                    warn!(archive = %name, %err, "could not append to processed-set");
                }
                if let Err(err) = discover::move_to_originals(&config.files_root, &archive) {
                    warn!(archive = %name, %err, "could not relocate staging file");
                }
                stats.add_archives(1);
            }
            Ok(Err(err)) => {
                // Not marked processed: the archive is retried next run.
                error!(worker = worker_id, archive = %name, %err, "archive failed");
                stats.add_error();
            }
            Err(err) => {
                error!(worker = worker_id, archive = %name, %err, "extraction task panicked");
                stats.add_error();
            }
        }
    }
}

/// Streams one archive and parses every XML document it yields.
fn extract_archive(path: &Path) -> Result<Vec<PatentRecord>> {
    let mut records = Vec::new();
    stream::stream_archive(path, &mut |xml_path, data| {
        if let Some(record) = parse::parse_publication(&data, &xml_path) {
            records.push(record);
        }
    })?;
    Ok(records)
}

async fn stored_row_count(pool: &PgPool) -> Option<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM patent_data_unified")
        .fetch_one(pool)
        .await
        .ok()
}
