//! Database schema bootstrap.
//!
//! Creates the two record tables and their indexes. All statements are
//! `IF NOT EXISTS`; running `patx init` repeatedly is safe.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `patent_data_unified` | Publications: full normalized metadata plus combined/split description text |
//! | `patent_grants` | Grants: metadata only; bulk content is re-read from `raw_xml_source` on demand |
//!
//! Bulk content (citations, NPL references, figure data) is deliberately
//! not stored; consumers re-open the archive at the stored locator.

use anyhow::{Context, Result};
use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS patent_data_unified (
        pub_number VARCHAR(30) PRIMARY KEY,
        kind VARCHAR(5),
        title TEXT,
        abstract_text TEXT,
        description_text TEXT,
        claims_text TEXT,
        description_body TEXT,
        filing_date DATE,
        pub_date DATE,
        year INTEGER,
        application_number VARCHAR(20),
        inventors JSONB,
        assignees JSONB,
        raw_xml_path TEXT,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_patents_year ON patent_data_unified(year)",
    "CREATE INDEX IF NOT EXISTS idx_patents_app_number ON patent_data_unified(application_number)",
    "CREATE INDEX IF NOT EXISTS idx_patents_pub_date ON patent_data_unified(pub_date)",
    "CREATE INDEX IF NOT EXISTS idx_patents_filing_date ON patent_data_unified(filing_date)",
    r#"
    CREATE TABLE IF NOT EXISTS patent_grants (
        id SERIAL PRIMARY KEY,
        grant_number VARCHAR(20) NOT NULL UNIQUE,
        kind VARCHAR(5),
        title TEXT,
        grant_date DATE,
        application_number VARCHAR(20),
        application_date DATE,
        abstract_text TEXT,
        year INTEGER,
        raw_xml_source VARCHAR(255),
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_grants_number ON patent_grants(grant_number)",
    "CREATE INDEX IF NOT EXISTS idx_grants_year ON patent_grants(year)",
    "CREATE INDEX IF NOT EXISTS idx_grants_app_number ON patent_grants(application_number)",
];

/// Runs all schema statements. Safe to call multiple times.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("run migration: {}", statement.trim().lines().next().unwrap_or("")))?;
    }
    Ok(())
}
