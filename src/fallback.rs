//! Tolerant regex parser for the legacy USPTO generations.
//!
//! The 2001-2004 PAP and early US-PGPUB layouts predate the structured
//! schema: titles live in `<title-of-invention>`, abstracts in
//! `<subdoc-abstract>`, parties in `<name-1>`/`<name-2>` pairs. This
//! parser is namespace-agnostic, case-insensitive, and multi-line; it is
//! selected whenever the structured decoder errors out or finds no
//! publication number.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{
    Address, Party, PartyKind, PatentRecord, MAX_ABSTRACT_BYTES, MAX_CLAIMS, MAX_PARTIES,
    MAX_TITLE_BYTES,
};
use crate::textutil::{clean_text, parse_date, truncate_bytes};

static DOC_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<doc-number>([^<]+)</doc-number>").unwrap());
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<invention-title[^>]*>([^<]+)</invention-title>").unwrap());
static LEGACY_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<title-of-invention[^>]*>([^<]+)</title-of-invention>").unwrap()
});
static ABSTRACT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<abstract[^>]*>(.*?)</abstract>").unwrap());
static LEGACY_ABSTRACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<subdoc-abstract[^>]*>(.*?)</subdoc-abstract>").unwrap()
});
static CLAIM_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<claim-text[^>]*>(.*?)</claim-text>").unwrap());
static DOCUMENT_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<document-date>(\d{8})</document-date>").unwrap());
static PUB_KIND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<publication-reference[^>]*>.*?<kind[^>]*>([^<]+)</kind>").unwrap()
});

static INVENTOR_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<inventor[^>]*>(.*?)</inventor>").unwrap());
static ASSIGNEE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<assignee[^>]*>(.*?)</assignee>").unwrap());
static GIVEN_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<given-name[^>]*>([^<]+)</given-name>").unwrap());
static FAMILY_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<family-name[^>]*>([^<]+)</family-name>").unwrap());
static NAME_1_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<name-1[^>]*>([^<]+)</name-1>").unwrap());
static NAME_2_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<name-2[^>]*>([^<]+)</name-2>").unwrap());
static ORGNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<orgname[^>]*>([^<]+)</orgname>").unwrap());
static CITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<city[^>]*>([^<]+)</city>").unwrap());
static COUNTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<country[^>]*>([^<]+)</country>").unwrap());

/// Parses a document the structured decoder could not handle.
///
/// The returned record's `pub_number` stays empty when the document
/// carries no `<doc-number>`; the caller may still supply an identity
/// recovered from the synthetic path, and drops the record otherwise.
/// Description synthesis and application-number extraction are shared
/// finishing steps in [`crate::parse`].
pub fn parse(xml: &str) -> PatentRecord {
    let mut rec = PatentRecord::default();

    if let Some(c) = DOC_NUMBER_RE.captures(xml) {
        rec.pub_number = c[1].trim().to_string();
    }

    if let Some(c) = TITLE_RE
        .captures(xml)
        .or_else(|| LEGACY_TITLE_RE.captures(xml))
    {
        rec.title = truncate_bytes(clean_text(&c[1]), MAX_TITLE_BYTES);
    }

    if let Some(c) = ABSTRACT_RE
        .captures(xml)
        .or_else(|| LEGACY_ABSTRACT_RE.captures(xml))
    {
        rec.abstract_text = truncate_bytes(clean_text(&c[1]), MAX_ABSTRACT_BYTES);
    }

    for c in CLAIM_TEXT_RE.captures_iter(xml) {
        let claim = clean_text(&c[1]);
        if !claim.is_empty() {
            rec.claims.push(claim);
        }
        if rec.claims.len() >= MAX_CLAIMS {
            break;
        }
    }

    if let Some(c) = DOCUMENT_DATE_RE.captures(xml) {
        rec.pub_date = parse_date(&c[1]);
    }

    if let Some(c) = PUB_KIND_RE.captures(xml) {
        rec.kind = clean_text(&c[1]);
    }

    rec.inventors = parse_inventors(xml);
    rec.assignees = parse_assignees(xml);
    rec
}

fn block_name(seg: &str) -> Option<String> {
    if let (Some(g), Some(f)) = (GIVEN_NAME_RE.captures(seg), FAMILY_NAME_RE.captures(seg)) {
        return Some(format!("{} {}", g[1].trim(), f[1].trim()));
    }
    legacy_name(seg)
}

fn legacy_name(seg: &str) -> Option<String> {
    let n1 = NAME_1_RE.captures(seg);
    let n2 = NAME_2_RE.captures(seg);
    if n1.is_none() && n2.is_none() {
        return None;
    }
    let mut parts: Vec<String> = Vec::with_capacity(2);
    if let Some(c) = n1 {
        parts.push(c[1].to_string());
    }
    if let Some(c) = n2 {
        parts.push(c[1].to_string());
    }
    Some(parts.join(" ").trim().to_string())
}

fn block_address(seg: &str) -> Option<Address> {
    let city = CITY_RE.captures(seg).map(|c| c[1].trim().to_string());
    let country = COUNTRY_RE.captures(seg).map(|c| c[1].trim().to_string());
    Address::from_parts(city, country)
}

fn parse_inventors(xml: &str) -> Vec<Party> {
    let mut inventors = Vec::new();
    for blk in INVENTOR_BLOCK_RE.captures_iter(xml) {
        let seg = &blk[1];
        if let Some(name) = block_name(seg) {
            if !name.is_empty() {
                inventors.push(Party {
                    name: clean_text(&name),
                    kind: PartyKind::Individual,
                    address: block_address(seg),
                });
            }
        }
        if inventors.len() >= MAX_PARTIES {
            break;
        }
    }
    inventors
}

fn parse_assignees(xml: &str) -> Vec<Party> {
    let mut assignees = Vec::new();
    for blk in ASSIGNEE_BLOCK_RE.captures_iter(xml) {
        let seg = &blk[1];
        let (name, kind) = if let Some(c) = ORGNAME_RE.captures(seg) {
            (Some(c[1].trim().to_string()), PartyKind::Organization)
        } else {
            (block_name(seg), PartyKind::Individual)
        };
        if let Some(name) = name {
            if !name.is_empty() {
                assignees.push(Party {
                    name: clean_text(&name),
                    kind,
                    address: block_address(seg),
                });
            }
        }
        if assignees.len() >= MAX_PARTIES {
            break;
        }
    }
    assignees
}
