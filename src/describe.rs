//! Paragraph-numbered description synthesis and storage-field derivation.
//!
//! USPTO description markup drifted across vintages: PAP-era
//! `<paragraph>`, ST.36-era `<p>`, occasional `<para>`, and some 2002
//! documents with no paragraph elements at all. This module always
//! produces text of the form `[0001] ...\n\n[0002] ...` regardless of the
//! source, keeping paragraph numbers from `id`/`num` attributes when
//! present and assigning a running counter otherwise.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{PatentRecord, CLAIMS_IN_DESCRIPTION, MAX_DESCRIPTION_BYTES};
use crate::textutil::{clean_text, truncate_bytes};

const NS: &str = r"(?:[A-Za-z0-9_-]+:)?";

static SUBDOC_DESC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?is)<{NS}subdoc-description[^>]*>(.*?)</{NS}subdoc-description>"
    ))
    .unwrap()
});
static DESC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?is)<{NS}description[^>]*>(.*?)</{NS}description>")).unwrap()
});

static PARAGRAPH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?is)<{NS}paragraph([^>]*)>(.*?)</{NS}paragraph>")).unwrap()
});
static P_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?is)<{NS}p([^>]*)>(.*?)</{NS}p>")).unwrap());
static PARA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?is)<{NS}para([^>]*)>(.*?)</{NS}para>")).unwrap());

static ID_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)id\s*=\s*"[^"]*?(\d{3,5})""#).unwrap());
static NUM_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bnum\s*=\s*"(\d{3,5})""#).unwrap());

static NUMBER_NODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?is)<{NS}number[^>]*>.*?</{NS}number>")).unwrap()
});
static NUM_NODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?is)<{NS}num[^>]*>.*?</{NS}num>")).unwrap());

static ANY_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<[^>]+>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(\s+)([A-Z0-9])").unwrap());
static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").unwrap());

struct ParaSeg<'a> {
    attrs: &'a str,
    content: &'a str,
}

/// Builds a bracket-numbered description body from any USPTO vintage.
///
/// Locates the description block (`<subdoc-description>` first, then
/// `<description>`, namespace-tolerant), segments it into paragraphs, and
/// formats each as `[%04d] text` joined by blank lines. Returns the empty
/// string when no description block exists.
pub fn synthesize_description(xml: &str) -> String {
    let block = match SUBDOC_DESC_RE
        .captures(xml)
        .or_else(|| DESC_RE.captures(xml))
    {
        Some(c) => c.get(1).map(|m| m.as_str()).unwrap_or(""),
        None => return String::new(),
    };
    if block.is_empty() {
        return String::new();
    }

    let mut segments: Vec<ParaSeg> = Vec::new();
    for re in [&*PARAGRAPH_RE, &*P_RE, &*PARA_RE] {
        for c in re.captures_iter(block) {
            segments.push(ParaSeg {
                attrs: c.get(1).map(|m| m.as_str()).unwrap_or(""),
                content: c.get(2).map(|m| m.as_str()).unwrap_or(""),
            });
        }
        if !segments.is_empty() {
            break;
        }
    }

    // No tagged paragraphs: segment heuristically on sentence boundaries.
    let heuristic;
    if segments.is_empty() {
        let mut txt = block.to_string();
        for t in ["</p>", "</paragraph>", "<br>", "<br/>", "</br>", "</para>"] {
            txt = txt.replace(t, "\n\n");
        }
        let txt = ANY_TAG_RE.replace_all(&txt, " ");
        let txt = WS_RE.replace_all(&txt, " ");
        heuristic = SENTENCE_RE.replace_all(&txt, ".\n\n${2}").into_owned();
        for chunk in BLANK_LINES_RE.split(&heuristic) {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                continue;
            }
            segments.push(ParaSeg {
                attrs: "",
                content: chunk,
            });
        }
    }

    if segments.is_empty() {
        return format!("[0001] {}", clean_text(block));
    }

    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    let mut seq = 1u32;
    for seg in &segments {
        let mut n = 0u32;
        if let Some(c) = ID_ATTR_RE.captures(seg.attrs) {
            n = c[1].parse().unwrap_or(0);
        } else if let Some(c) = NUM_ATTR_RE.captures(seg.attrs) {
            n = c[1].parse().unwrap_or(0);
        }
        if n == 0 {
            n = seq;
        }
        seq += 1;

        // <number>/<num> children duplicate the bracket tag.
        let content = NUMBER_NODE_RE.replace_all(seg.content, "");
        let content = NUM_NODE_RE.replace_all(&content, "");
        let txt = clean_text(&content);
        if txt.is_empty() {
            continue;
        }
        out.push(format!("[{:04}] {}", n, txt));
    }

    out.join("\n\n")
}

/// Combines claims and the synthesized description into the stored
/// `description_text` shape, truncated at the description ceiling.
///
/// With claims present the text starts `CLAIMS:\n` followed by the first
/// ten claims separated by blank lines; a non-empty description then
/// appends `DESCRIPTION:\n` and the paragraph-numbered body. Without
/// claims the body stands alone, unmarked.
pub fn build_combined(claims: &[String], description: &str) -> String {
    let mut combined = String::new();
    if !claims.is_empty() {
        combined.push_str("CLAIMS:\n");
        for claim in claims.iter().take(CLAIMS_IN_DESCRIPTION) {
            combined.push_str(claim);
            combined.push_str("\n\n");
        }
    }
    if !description.is_empty() {
        if !combined.is_empty() {
            combined.push_str("DESCRIPTION:\n");
        }
        combined.push_str(description);
    }
    truncate_bytes(combined, MAX_DESCRIPTION_BYTES)
}

const DESCRIPTION_MARKER: &str = "\n\nDESCRIPTION:";

/// Splits the combined description into the stored `claims_text` and
/// `description_body` columns.
///
/// With retained claims, `claims_text` is the first ten non-empty claims
/// and the body is everything after the `DESCRIPTION:` marker. Without
/// them, a leading `CLAIMS:` block is split on the marker; absent any
/// marker the whole combined text is the body.
pub fn storage_split(record: &PatentRecord) -> (String, String) {
    let combined = &record.description_text;
    let mut claims_text = String::new();
    let mut description_body = combined.clone();

    if !record.claims.is_empty() {
        let mut parts: Vec<&str> = Vec::new();
        for claim in record.claims.iter().take(CLAIMS_IN_DESCRIPTION) {
            let c = claim.trim();
            if !c.is_empty() {
                parts.push(c);
            }
        }
        claims_text = parts.join("\n\n");
        if let Some(idx) = combined.find(DESCRIPTION_MARKER) {
            if idx > 0 {
                description_body = combined[idx + DESCRIPTION_MARKER.len()..].to_string();
            }
        }
    } else if let Some(rest) = combined.strip_prefix("CLAIMS:") {
        if let Some(idx) = combined.find(DESCRIPTION_MARKER) {
            claims_text = combined["CLAIMS:".len()..idx].trim().to_string();
            description_body = combined[idx + DESCRIPTION_MARKER.len()..].to_string();
        } else {
            claims_text = rest.trim().to_string();
        }
    }

    (claims_text, description_body)
}
