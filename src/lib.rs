//! # patx
//!
//! **USPTO bulk-data extraction pipeline.**
//!
//! patx ingests the USPTO weekly bulk-data corpus (multi-gigabyte
//! compound archives holding tens of millions of publication and grant XML
//! documents across four incompatible schema generations) and populates a
//! relational patent store with normalized metadata plus locators back
//! into the original archives.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────┐   ┌─────────┐   ┌───────────┐
//! │ Discovery   │──▶│ Streamer  │──▶│ Parser  │──▶│ Upsert    │
//! │ + priority  │   │ ZIP/TAR   │   │ 4 gens  │   │ sink (PG) │
//! └────────────┘   └───────────┘   └─────────┘   └───────────┘
//!        ▲                                              │
//!        └───────────── processed-set ◀─────────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. **Discovery** ([`discover`]) walks the files root, classifies
//!    candidates by extension and magic bytes, filters against the durable
//!    [`processed`] set, and orders work so a configured year window runs
//!    first.
//! 2. The **container streamer** ([`stream`]) decomposes nested archives
//!    (ZIP-in-ZIP, TAR, TAR-GZIP) into `(synthetic path, xml bytes)`
//!    pairs.
//! 3. The **schema-adaptive parser** ([`parse`], [`fallback`],
//!    [`describe`]) normalizes all four USPTO generations into one
//!    [`models::PatentRecord`], synthesizing paragraph-numbered
//!    description text where the source lacks it.
//! 4. The **upsert sink** ([`sink`]) batches records into Postgres
//!    transactions with fill-null-only merge semantics, so reruns never
//!    overwrite good data with empty data.
//! 5. The **orchestrator** ([`pipeline`]) wires it together through a
//!    worker pool with bounded queues, durable resume, staging-file
//!    relocation, and rolling statistics ([`stats`]).
//!
//! Two sibling pipelines reuse the same pieces: [`grants`] ingests weekly
//! `ipg*.zip` grant bundles (metadata only), and [`backfill`] recovers
//! missing application numbers through the split-archive and
//! extracted-directory packagings of the early vintages.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Flag/env configuration bundle and validation |
//! | [`models`] | Canonical record types and field ceilings |
//! | [`discover`] | Archive discovery, classification, prioritization |
//! | [`stream`] | Nested-container streaming (ZIP, TAR, TAR-GZIP) |
//! | [`parse`] | Structured new-schema parser and generation selection |
//! | [`fallback`] | Tolerant regex parser for legacy generations |
//! | [`describe`] | Paragraph-numbered description synthesis |
//! | [`textutil`] | Text sanitizer, date and number parsers |
//! | [`processed`] | Durable append-only processed-archive set |
//! | [`sink`] | Fill-only / force-overwrite UPSERT sink |
//! | [`pipeline`] | Worker-pool orchestration, shutdown, ticker |
//! | [`grants`] | Weekly grant bundle pipeline |
//! | [`backfill`] | Application-number backfill |
//! | [`stats`] | Rolling counters |
//! | [`db`] | Postgres pool construction |
//! | [`migrate`] | Idempotent schema bootstrap |

pub mod backfill;
pub mod config;
pub mod db;
pub mod describe;
pub mod discover;
pub mod fallback;
pub mod grants;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod processed;
pub mod sink;
pub mod stats;
pub mod stream;
pub mod textutil;
