//! Content-preserving UPSERT sink.
//!
//! Records land in `patent_data_unified` through batched transactions with
//! fill-null-only merge semantics: on conflict a column is written only
//! when the stored value is null or blank, so a rerun can never overwrite
//! good data with empty data. The force-overwrite toggle relaxes exactly
//! three columns (`description_text`, `claims_text`, `description_body`)
//! so a later parser improvement can refresh bulk text without touching
//! metadata.
//!
//! Each record runs under its own savepoint inside the batch transaction:
//! a rejected record (oversized value, bad JSON) is rolled back, logged,
//! classified, and skipped without aborting the batch.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, warn};

use crate::describe::storage_split;
use crate::models::PatentRecord;

/// Fill-only merge arms for the three bulk-text columns.
const DESC_ARMS_FILL_ONLY: &str = "\
    description_text = CASE WHEN patent_data_unified.description_text IS NULL OR btrim(patent_data_unified.description_text) = '' THEN EXCLUDED.description_text ELSE patent_data_unified.description_text END,\n\
    claims_text = CASE WHEN patent_data_unified.claims_text IS NULL OR btrim(patent_data_unified.claims_text) = '' THEN EXCLUDED.claims_text ELSE patent_data_unified.claims_text END,\n\
    description_body = CASE WHEN patent_data_unified.description_body IS NULL OR btrim(patent_data_unified.description_body) = '' THEN EXCLUDED.description_body ELSE patent_data_unified.description_body END,";

/// Force-overwrite arms: the refresh path for bulk text only.
const DESC_ARMS_FORCE: &str = "\
    description_text = EXCLUDED.description_text,\n\
    claims_text = EXCLUDED.claims_text,\n\
    description_body = EXCLUDED.description_body,";

/// Builds the UPSERT statement for the configured merge mode.
pub fn upsert_sql(force: bool) -> String {
    let desc_arms = if force {
        DESC_ARMS_FORCE
    } else {
        DESC_ARMS_FILL_ONLY
    };
    format!(
        r#"
        INSERT INTO patent_data_unified (
            pub_number, kind, title, abstract_text, description_text,
            claims_text, description_body, filing_date, pub_date,
            inventors, assignees, raw_xml_path, year, application_number
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::jsonb, $11::jsonb, $12, $13, $14)
        ON CONFLICT (pub_number) DO UPDATE SET
            kind = CASE WHEN patent_data_unified.kind IS NULL OR btrim(patent_data_unified.kind) = '' THEN EXCLUDED.kind ELSE patent_data_unified.kind END,
            title = CASE WHEN patent_data_unified.title IS NULL OR btrim(patent_data_unified.title) = '' THEN EXCLUDED.title ELSE patent_data_unified.title END,
            abstract_text = CASE WHEN patent_data_unified.abstract_text IS NULL OR btrim(patent_data_unified.abstract_text) = '' THEN EXCLUDED.abstract_text ELSE patent_data_unified.abstract_text END,
            {desc_arms}
            inventors = CASE WHEN patent_data_unified.inventors IS NULL THEN EXCLUDED.inventors ELSE patent_data_unified.inventors END,
            assignees = CASE WHEN patent_data_unified.assignees IS NULL THEN EXCLUDED.assignees ELSE patent_data_unified.assignees END,
            raw_xml_path = COALESCE(patent_data_unified.raw_xml_path, EXCLUDED.raw_xml_path),
            filing_date = CASE WHEN patent_data_unified.filing_date IS NULL THEN EXCLUDED.filing_date ELSE patent_data_unified.filing_date END,
            pub_date = CASE WHEN patent_data_unified.pub_date IS NULL THEN EXCLUDED.pub_date ELSE patent_data_unified.pub_date END,
            year = CASE WHEN patent_data_unified.year IS NULL THEN EXCLUDED.year ELSE patent_data_unified.year END,
            application_number = CASE WHEN patent_data_unified.application_number IS NULL OR btrim(patent_data_unified.application_number) = '' THEN EXCLUDED.application_number ELSE patent_data_unified.application_number END
        "#
    )
}

/// Maps a store error message onto a diagnostic class.
pub fn classify_db_error(message: &str) -> &'static str {
    if message.contains("invalid input syntax for type json") {
        "invalid-json"
    } else if message.contains("duplicate key") {
        "duplicate"
    } else if message.contains("violates foreign key") {
        "foreign-key"
    } else if message.contains("value too long") {
        "value-too-long"
    } else {
        "other"
    }
}

pub struct UpsertSink {
    pool: PgPool,
    sql: String,
    failures_log: PathBuf,
    tally: Mutex<HashMap<&'static str, u64>>,
}

impl UpsertSink {
    pub fn new(pool: PgPool, force: bool, failures_log: PathBuf) -> Self {
        UpsertSink {
            pool,
            sql: upsert_sql(force),
            failures_log,
            tally: Mutex::new(HashMap::new()),
        }
    }

    /// Upserts one batch inside a single transaction.
    ///
    /// Returns the number of records that went through. Record-level
    /// failures are skipped under a savepoint; a failed begin or commit
    /// fails the whole batch.
    pub async fn insert_batch(&self, records: &[PatentRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("begin batch transaction")?;
        let mut inserted = 0u64;

        for record in records {
            let (claims_text, description_body) = storage_split(record);
            let inventors_json = parties_json(&record.inventors);
            let assignees_json = parties_json(&record.assignees);

            sqlx::query("SAVEPOINT record_sp")
                .execute(&mut *tx)
                .await
                .context("set savepoint")?;

            let result = sqlx::query(&self.sql)
                .bind(&record.pub_number)
                .bind(&record.kind)
                .bind(&record.title)
                .bind(&record.abstract_text)
                .bind(&record.description_text)
                .bind(&claims_text)
                .bind(&description_body)
                .bind(record.filing_date)
                .bind(record.pub_date)
                .bind(&inventors_json)
                .bind(&assignees_json)
                .bind(&record.raw_xml_path)
                .bind(record.year)
                .bind(&record.application_number)
                .execute(&mut *tx)
                .await;

            match result {
                Ok(_) => inserted += 1,
                Err(err) => {
                    let message = err.to_string();
                    let class = classify_db_error(&message);
                    warn!(pub_number = %record.pub_number, class, %message, "record rejected");
                    self.record_failure(class, &record.pub_number, &message);
                    sqlx::query("ROLLBACK TO SAVEPOINT record_sp")
                        .execute(&mut *tx)
                        .await
                        .context("roll back record savepoint")?;
                }
            }
        }

        tx.commit().await.context("commit batch transaction")?;
        Ok(inserted)
    }

    /// Appends the failure to the tally and the dedicated failures log.
    fn record_failure(&self, class: &'static str, pub_number: &str, detail: &str) {
        {
            let mut tally = self
                .tally
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *tally.entry(class).or_insert(0) += 1;
        }
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            class,
            pub_number,
            detail
        );
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failures_log)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(err) = appended {
            error!(%err, "could not append to failures log");
        }
    }

    /// Failure counts per class, for the shutdown report.
    pub fn failure_breakdown(&self) -> Vec<(&'static str, u64)> {
        let tally = self
            .tally
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut classes: Vec<(&'static str, u64)> = tally.iter().map(|(k, v)| (*k, *v)).collect();
        classes.sort_by(|a, b| b.1.cmp(&a.1));
        classes
    }
}

/// Serializes a party list for the JSONB column; empty lists become NULL.
fn parties_json(parties: &[crate::models::Party]) -> Option<String> {
    if parties.is_empty() {
        return None;
    }
    serde_json::to_string(parties).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Party, PartyKind};

    #[test]
    fn fill_only_sql_guards_every_text_column() {
        let sql = upsert_sql(false);
        assert!(sql.contains("ON CONFLICT (pub_number) DO UPDATE"));
        assert!(sql.contains(
            "description_text = CASE WHEN patent_data_unified.description_text IS NULL"
        ));
        assert!(sql.contains("btrim(patent_data_unified.title) = ''"));
        assert!(sql.contains("COALESCE(patent_data_unified.raw_xml_path, EXCLUDED.raw_xml_path)"));
    }

    #[test]
    fn force_mode_overwrites_only_the_three_bulk_columns() {
        let sql = upsert_sql(true);
        assert!(sql.contains("description_text = EXCLUDED.description_text"));
        assert!(sql.contains("claims_text = EXCLUDED.claims_text"));
        assert!(sql.contains("description_body = EXCLUDED.description_body"));
        // Metadata stays fill-only even when forcing.
        assert!(sql.contains("title = CASE WHEN patent_data_unified.title IS NULL"));
        assert!(sql.contains("inventors = CASE WHEN patent_data_unified.inventors IS NULL"));
    }

    #[test]
    fn error_classes_match_store_messages() {
        assert_eq!(
            classify_db_error("ERROR: duplicate key value violates unique constraint"),
            "duplicate"
        );
        assert_eq!(
            classify_db_error("invalid input syntax for type json"),
            "invalid-json"
        );
        assert_eq!(
            classify_db_error("value too long for type character varying(20)"),
            "value-too-long"
        );
        assert_eq!(
            classify_db_error("insert or update violates foreign key constraint"),
            "foreign-key"
        );
        assert_eq!(classify_db_error("connection reset by peer"), "other");
    }

    #[test]
    fn empty_party_lists_bind_as_null() {
        assert_eq!(parties_json(&[]), None);
        let one = vec![Party {
            name: "Acme".to_string(),
            kind: PartyKind::Organization,
            address: None,
        }];
        let json = parties_json(&one).unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains(r#""type":"organization""#));
    }
}
