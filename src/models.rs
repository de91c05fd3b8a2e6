//! Canonical record types flowing through the extraction pipeline.
//!
//! Every USPTO XML generation, four of them with incompatible tag
//! spellings and nesting, normalizes into one [`PatentRecord`]. The data
//! lifecycle is:
//!
//! ```text
//! Discovery → archive path → Streamer → (synthetic path, xml bytes)
//!                                             ↓
//!                                        Parser → PatentRecord
//!                                             ↓
//!                                        Upsert sink → Postgres row
//! ```
//!
//! # Field ceilings
//!
//! Bounded fields are truncated by byte count at the limits below;
//! truncation is silent but consistent, and always lands on a UTF-8
//! boundary. Inventors, assignees, and claims are capped by element count.

use chrono::NaiveDate;
use serde::Serialize;

/// Byte ceiling for `title`.
pub const MAX_TITLE_BYTES: usize = 500;
/// Byte ceiling for `abstract_text`.
pub const MAX_ABSTRACT_BYTES: usize = 5_000;
/// Byte ceiling for the combined description text.
pub const MAX_DESCRIPTION_BYTES: usize = 150_000;
/// Retained claims per record.
pub const MAX_CLAIMS: usize = 50;
/// Claims exposed in the combined description block.
pub const CLAIMS_IN_DESCRIPTION: usize = 10;
/// Retained inventors or assignees per record.
pub const MAX_PARTIES: usize = 50;

/// One normalized publication or grant.
///
/// | Field | Notes |
/// |-------|-------|
/// | `pub_number` | Publication or grant number; the unique key |
/// | `kind` | Document kind code, e.g. `A1`/`B2`/`D`/`S` |
/// | `description_text` | Combined `CLAIMS:` + first-10-claims + `DESCRIPTION:` + paragraph-numbered body |
/// | `year` | `pub_date.year`, else the first four digits of `pub_number` when in `[2000, 2100]`; `None` when unknown |
/// | `raw_xml_path` | `<archive-basename>/<path-inside-archive>`; the round-trip locator |
///
/// A record is emitted only when `pub_number` is non-empty; every other
/// field is optional.
#[derive(Debug, Clone, Default)]
pub struct PatentRecord {
    pub pub_number: String,
    pub kind: String,
    pub title: String,
    pub abstract_text: String,
    /// Cleaned claim texts, at most [`MAX_CLAIMS`].
    pub claims: Vec<String>,
    /// Combined description; see [`crate::describe`].
    pub description_text: String,
    pub filing_date: Option<NaiveDate>,
    pub pub_date: Option<NaiveDate>,
    pub year: Option<i32>,
    /// Digits-only application number, possibly empty.
    pub application_number: String,
    pub inventors: Vec<Party>,
    pub assignees: Vec<Party>,
    pub raw_xml_path: String,
}

impl PatentRecord {
    /// Derives `year` from `pub_date`, falling back to the leading four
    /// digits of the publication number when they form a plausible year.
    pub fn derive_year(&mut self) {
        if let Some(d) = self.pub_date {
            use chrono::Datelike;
            self.year = Some(d.year());
            return;
        }
        if let Some(prefix) = self.pub_number.get(..4) {
            if let Ok(y) = prefix.parse::<i32>() {
                if (2000..=2100).contains(&y) {
                    self.year = Some(y);
                }
            }
        }
    }
}

/// An inventor or assignee.
///
/// Serialized into the store's small `inventors` / `assignees` JSONB
/// arrays; the wire shape is `{"name", "type", "address"?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Party {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PartyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyKind {
    Individual,
    Organization,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Address {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl Address {
    /// `None` unless at least one component is present.
    pub fn from_parts(city: Option<String>, country: Option<String>) -> Option<Self> {
        if city.is_none() && country.is_none() {
            return None;
        }
        Some(Address { city, country })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_prefers_pub_date() {
        let mut rec = PatentRecord {
            pub_number: "20030050000".to_string(),
            pub_date: NaiveDate::from_ymd_opt(2004, 6, 1),
            ..Default::default()
        };
        rec.derive_year();
        assert_eq!(rec.year, Some(2004));
    }

    #[test]
    fn year_falls_back_to_pub_number_prefix() {
        let mut rec = PatentRecord {
            pub_number: "20030050000".to_string(),
            ..Default::default()
        };
        rec.derive_year();
        assert_eq!(rec.year, Some(2003));
    }

    #[test]
    fn year_is_none_when_unknown() {
        let mut rec = PatentRecord {
            pub_number: "7654321".to_string(),
            ..Default::default()
        };
        rec.derive_year();
        assert_eq!(rec.year, None);
    }

    #[test]
    fn party_serializes_with_lowercase_type_and_optional_address() {
        let p = Party {
            name: "Jane Doe".to_string(),
            kind: PartyKind::Individual,
            address: Address::from_parts(Some("Austin".to_string()), None),
        };
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(
            json,
            r#"{"name":"Jane Doe","type":"individual","address":{"city":"Austin"}}"#
        );

        let org = Party {
            name: "Acme Corp".to_string(),
            kind: PartyKind::Organization,
            address: None,
        };
        assert_eq!(
            serde_json::to_string(&org).unwrap(),
            r#"{"name":"Acme Corp","type":"organization"}"#
        );
    }
}
