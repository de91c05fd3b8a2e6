//! Application-number backfill over split archives and extracted trees.
//!
//! Early vintages (2001-2004, 2010) shipped before the extractor captured
//! application numbers, and their packaging is the most irregular of the
//! corpus: dates split across `A`/`B` archives, 2010 weeks with an `I`
//! prefix, and late-2010 TARs pre-expanded into `xml_extracted/`
//! directory trees. This pass re-opens the original bytes for every row
//! missing a number, using the stored `raw_xml_path` as the map back in.
//!
//! For one date the candidate set is `D.ZIP` (or `ID.ZIP` for 2010),
//! `DA.ZIP`, `DB.ZIP`, and their `NewFiles/` mirrors; every candidate
//! that exists is loaded and tried in turn, first non-empty extraction
//! wins. Archives for one date group are dropped before the next group
//! loads so the resident set stays bounded; nothing is cached across
//! dates.

use anyhow::{Context, Result};
use regex::Regex;
use sqlx::PgPool;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::textutil::extract_application_number;

static PUB_DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-(\d{8})").unwrap());

const PROGRESS_EVERY: u64 = 10_000;

/// A stored row missing its application number.
#[derive(Debug, Clone)]
struct MissingRow {
    pub_number: String,
    raw_path: String,
}

/// A recovered number ready to be written back.
#[derive(Debug, Clone)]
struct NumberFix {
    pub_number: String,
    application_number: String,
}

#[derive(Default)]
struct BackfillTotals {
    processed: AtomicU64,
    updated: AtomicU64,
    archives_loaded: AtomicU64,
    errors: AtomicU64,
}

/// Runs the backfill over every row missing an application number in the
/// irregular vintages.
pub async fn run(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let totals = Arc::new(BackfillTotals::default());

    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT pub_number, raw_xml_path
        FROM patent_data_unified
        WHERE (application_number IS NULL OR application_number = '')
          AND raw_xml_path IS NOT NULL
          AND raw_xml_path <> ''
          AND year IN (2001, 2002, 2003, 2004, 2010)
        ORDER BY year, pub_number
        "#,
    )
    .fetch_all(&pool)
    .await
    .context("load rows missing application numbers")?;
    info!(rows = rows.len(), "loaded patents missing application numbers");

    let (work_tx, work_rx) = mpsc::channel::<Vec<MissingRow>>(100);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (fix_tx, mut fix_rx) = mpsc::channel::<Vec<NumberFix>>(100);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received; finishing current batches");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut workers = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        let work_rx = Arc::clone(&work_rx);
        let fix_tx = fix_tx.clone();
        let totals = Arc::clone(&totals);
        let files_root = config.files_root.clone();
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let batch = {
                    let mut rx = work_rx.lock().await;
                    rx.recv().await
                };
                let Some(batch) = batch else { break };
                let root = files_root.clone();
                let totals_ref = Arc::clone(&totals);
                let fixes = tokio::task::spawn_blocking(move || {
                    process_batch(&root, &batch, &totals_ref)
                })
                .await
                .unwrap_or_default();
                if !fixes.is_empty() && fix_tx.send(fixes).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(fix_tx);

    let feeder_shutdown = shutdown_rx.clone();
    let batch_size = config.batch_size;
    let feeder = tokio::spawn(async move {
        let mut batch: Vec<MissingRow> = Vec::with_capacity(batch_size);
        for (pub_number, raw_path) in rows {
            if *feeder_shutdown.borrow() {
                break;
            }
            batch.push(MissingRow {
                pub_number,
                raw_path,
            });
            if batch.len() >= batch_size {
                if work_tx.send(std::mem::take(&mut batch)).await.is_err() {
                    return;
                }
            }
        }
        if !batch.is_empty() {
            let _ = work_tx.send(batch).await;
        }
    });

    // Single writer: accumulate fixes and flush in batch-size transactions.
    let mut pending: Vec<NumberFix> = Vec::with_capacity(config.batch_size);
    while let Some(fixes) = fix_rx.recv().await {
        for fix in fixes {
            pending.push(fix);
            if pending.len() >= config.batch_size {
                apply_fixes(&pool, &pending, &totals).await;
                pending.clear();
            }
        }
    }
    if !pending.is_empty() {
        apply_fixes(&pool, &pending, &totals).await;
    }

    let _ = feeder.await;
    for worker in workers {
        let _ = worker.await;
    }

    info!("=== Backfill complete ===");
    info!("Patents processed: {}", totals.processed.load(Ordering::Relaxed));
    info!("Patents updated:   {}", totals.updated.load(Ordering::Relaxed));
    info!("Archives loaded:   {}", totals.archives_loaded.load(Ordering::Relaxed));
    info!("Errors:            {}", totals.errors.load(Ordering::Relaxed));

    pool.close().await;
    Ok(())
}

/// Groups a batch by archive date, loads each date's split-archive
/// candidates once, and tries every loaded archive per patent.
fn process_batch(files_root: &Path, batch: &[MissingRow], totals: &BackfillTotals) -> Vec<NumberFix> {
    let mut fixes = Vec::new();

    let mut groups: HashMap<String, Vec<&MissingRow>> = HashMap::new();
    for row in batch {
        let Some(date) = pub_date_of(&row.raw_path) else {
            continue;
        };
        groups.entry(date).or_default().push(row);
    }

    for (date, group) in groups {
        let archive_name = archive_name_for(&date);
        let base = archive_name.trim_end_matches(".ZIP");
        let candidates = [
            files_root.join(&archive_name),
            files_root.join("NewFiles").join(&archive_name),
            files_root.join(format!("{base}A.ZIP")),
            files_root.join(format!("{base}B.ZIP")),
            files_root.join("NewFiles").join(format!("{base}A.ZIP")),
            files_root.join("NewFiles").join(format!("{base}B.ZIP")),
        ];

        let mut loaded: Vec<Vec<u8>> = Vec::new();
        for candidate in &candidates {
            if let Ok(data) = std::fs::read(candidate) {
                totals.archives_loaded.fetch_add(1, Ordering::Relaxed);
                loaded.push(data);
            }
        }

        for row in group {
            let mut app_number = String::new();
            for archive in &loaded {
                app_number = extract_from_archive(archive, &row.raw_path);
                if !app_number.is_empty() {
                    break;
                }
            }
            if app_number.is_empty() {
                app_number = extract_from_directory(files_root, &date, &row.raw_path);
            }
            if !app_number.is_empty() {
                fixes.push(NumberFix {
                    pub_number: row.pub_number.clone(),
                    application_number: app_number,
                });
            }
            let processed = totals.processed.fetch_add(1, Ordering::Relaxed) + 1;
            if processed % PROGRESS_EVERY == 0 {
                info!(
                    processed,
                    updated = totals.updated.load(Ordering::Relaxed),
                    "backfill progress"
                );
            }
        }
        // One date group's archives are released before the next loads.
        drop(loaded);
    }

    fixes
}

fn pub_date_of(raw_path: &str) -> Option<String> {
    PUB_DATE_RE
        .captures(raw_path)
        .map(|c| c[1].to_string())
}

/// 2010 weeks carry an `I` prefix on disk.
fn archive_name_for(date: &str) -> String {
    if date.starts_with("2010") {
        format!("I{date}.ZIP")
    } else {
        format!("{date}.ZIP")
    }
}

/// Suffix-matches the nested ZIP for the target publication inside one
/// loaded outer archive, then the target XML inside it.
fn extract_from_archive(archive: &[u8], raw_path: &str) -> String {
    let Ok(mut zip) = zip::ZipArchive::new(Cursor::new(archive)) else {
        return String::new();
    };

    let target_file = file_part(raw_path);
    let target_zip = format!("{}.ZIP", dir_part(raw_path)).to_uppercase();

    for i in 0..zip.len() {
        let nested_data = {
            let Ok(mut entry) = zip.by_index(i) else {
                continue;
            };
            if !entry.name().to_uppercase().ends_with(&target_zip) {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            if entry.read_to_end(&mut data).is_err() {
                continue;
            }
            data
        };

        let Ok(mut nested) = zip::ZipArchive::new(Cursor::new(nested_data.as_slice())) else {
            continue;
        };
        for j in 0..nested.len() {
            let Ok(mut inner) = nested.by_index(j) else {
                continue;
            };
            if !inner.name().ends_with(&target_file) {
                continue;
            }
            let mut xml = Vec::with_capacity(inner.size() as usize);
            if inner.read_to_end(&mut xml).is_err() {
                continue;
            }
            return extract_application_number(&String::from_utf8_lossy(&xml));
        }
    }

    String::new()
}

/// Falls back to the pre-expanded `xml_extracted/` tree: expected layout
/// first, then a recursive filename search that also covers the
/// `PG-PUB-2` legacy packaging.
fn extract_from_directory(files_root: &Path, date: &str, raw_path: &str) -> String {
    let mut extracted_dir = files_root.join("xml_extracted").join(format!("I{date}"));
    if !extracted_dir.is_dir() {
        extracted_dir = files_root.join("xml_extracted").join(date);
        if !extracted_dir.is_dir() {
            return String::new();
        }
    }

    let target_file = file_part(raw_path);
    let patent_dir = extracted_dir.join(dir_part(raw_path));
    if patent_dir.is_dir() {
        if let Ok(entries) = std::fs::read_dir(&patent_dir) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let candidate = entry.path().join(&target_file);
                if let Ok(xml) = std::fs::read(&candidate) {
                    return extract_application_number(&String::from_utf8_lossy(&xml));
                }
            }
        }
    }

    recursive_search(&extracted_dir, &target_file)
}

/// Walks the tree for any leaf matching the target filename; the first
/// readable hit wins.
fn recursive_search(root: &Path, target_file: &str) -> String {
    for entry in WalkDir::new(root).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy() != target_file {
            continue;
        }
        if let Ok(xml) = std::fs::read(entry.path()) {
            return extract_application_number(&String::from_utf8_lossy(&xml));
        }
    }
    String::new()
}

fn dir_part(raw_path: &str) -> String {
    match raw_path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

fn file_part(raw_path: &str) -> String {
    match raw_path.rsplit_once('/') {
        Some((_, file)) => file.to_string(),
        None => raw_path.to_string(),
    }
}

/// Writes one batch of recovered numbers in a single transaction.
async fn apply_fixes(pool: &PgPool, fixes: &[NumberFix], totals: &BackfillTotals) {
    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!(%err, "could not begin backfill transaction");
            totals.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let mut updated = 0u64;
    for fix in fixes {
        let result = sqlx::query(
            "UPDATE patent_data_unified SET application_number = $1 WHERE pub_number = $2",
        )
        .bind(&fix.application_number)
        .bind(&fix.pub_number)
        .execute(&mut *tx)
        .await;
        if let Ok(done) = result {
            if done.rows_affected() > 0 {
                updated += 1;
            }
        }
    }

    if let Err(err) = tx.commit().await {
        error!(%err, "backfill commit failed");
        totals.errors.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if updated > 0 {
        let total = totals.updated.fetch_add(updated, Ordering::Relaxed) + updated;
        info!(updated, total, "applied application numbers");
    }
}
