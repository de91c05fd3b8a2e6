//! Text sanitation and small field parsers shared by both parser generations.
//!
//! Every text field that reaches the store passes through [`clean_text`]
//! before its length cap is applied. The cleaner strips markup, removes NUL
//! and control bytes (Postgres JSONB rejects NUL inside strings), decodes
//! standard entities, and collapses whitespace.

use chrono::NaiveDate;
use quick_xml::escape::unescape;
use regex::Regex;
use std::sync::LazyLock;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static APP_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<application-reference[^>]*>(.*?)</application-reference>").unwrap()
});
static DOMESTIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<domestic-filing-data[^>]*>(.*?)</domestic-filing-data>").unwrap()
});
static APP_NUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<application-number[^>]*>(.*?)</application-number>").unwrap()
});
static DOC_NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<doc-number[^>]*>([^<]+)</doc-number>").unwrap());

/// Strips markup and normalizes a raw XML text fragment to clean plain text.
///
/// Steps, in order: tags become spaces, NUL bytes are dropped, standard
/// entities are decoded, control characters other than newline and tab are
/// dropped, whitespace runs collapse to a single space, and the result is
/// trimmed.
pub fn clean_text(raw: &str) -> String {
    let s = TAG_RE.replace_all(raw, " ");
    let s = s.replace('\0', "");
    let s = match unescape(&s) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s,
    };
    let s: String = s
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || c as u32 >= 32)
        .collect();
    WS_RE.replace_all(&s, " ").trim().to_string()
}

/// Truncates a string to at most `max` bytes, backing off to the nearest
/// UTF-8 boundary so a cap never splits a code point.
pub fn truncate_bytes(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut s = s;
    s.truncate(end);
    s
}

/// Parses the date spellings seen across USPTO vintages.
///
/// Accepts `YYYYMMDD`, `YYYY-MM-DD`, `MM/DD/YYYY`, and a bare `YYYY`
/// (mapped to January 1st). First successful parse wins.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    for fmt in ["%Y%m%d", "%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    if s.len() == 4 {
        if let Ok(y) = s.parse::<i32>() {
            return NaiveDate::from_ymd_opt(y, 1, 1);
        }
    }
    None
}

/// Keeps only ASCII digits; application and document numbers are stored in
/// this normalized form.
pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Extracts the application number from a patent document, digits only.
///
/// The new layout (2005+) carries it as the first `<doc-number>` inside
/// `<application-reference>`; the old layout (2001-2004) nests it under
/// `<domestic-filing-data><application-number>`. Returns the empty string
/// when neither is present.
pub fn extract_application_number(xml: &str) -> String {
    if let Some(block) = APP_REF_RE.captures(xml) {
        if let Some(m) = DOC_NUM_RE.captures(&block[1]) {
            return digits_only(&m[1]);
        }
    }
    if let Some(block) = DOMESTIC_RE.captures(xml) {
        if let Some(inner) = APP_NUM_RE.captures(&block[1]) {
            if let Some(m) = DOC_NUM_RE.captures(&inner[1]) {
                return digits_only(&m[1]);
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_strips_tags_and_collapses_whitespace() {
        assert_eq!(
            clean_text("<b>A   method</b>\n\n of <i>doing</i>   things"),
            "A method of doing things"
        );
    }

    #[test]
    fn clean_text_removes_nul_and_control_bytes() {
        let cleaned = clean_text("abc\u{0}def\u{1}ghi");
        assert!(!cleaned.contains('\u{0}'));
        assert!(!cleaned.contains('\u{1}'));
        assert_eq!(cleaned, "abcdefghi");
    }

    #[test]
    fn clean_text_decodes_entities() {
        assert_eq!(clean_text("AT&amp;T &lt;patents&gt;"), "AT&T <patents>");
        assert_eq!(clean_text("&#65;&#x42;"), "AB");
    }

    #[test]
    fn truncate_bytes_respects_char_boundaries() {
        assert_eq!(truncate_bytes("hello".to_string(), 500), "hello");
        assert_eq!(truncate_bytes("hello".to_string(), 3), "hel");
        // e-acute is two bytes; a cap in the middle backs off.
        let s = "ab\u{e9}cd".to_string();
        assert_eq!(truncate_bytes(s, 3), "ab");
    }

    #[test]
    fn parse_date_accepts_all_vintage_formats() {
        let expect = NaiveDate::from_ymd_opt(2003, 3, 13).unwrap();
        assert_eq!(parse_date("20030313"), Some(expect));
        assert_eq!(parse_date("2003-03-13"), Some(expect));
        assert_eq!(parse_date("03/13/2003"), Some(expect));
        assert_eq!(
            parse_date("2003"),
            NaiveDate::from_ymd_opt(2003, 1, 1)
        );
        assert_eq!(parse_date("not a date"), None);
    }

    #[test]
    fn application_number_prefers_application_reference() {
        let xml = r#"
            <application-reference appl-type="utility">
              <document-id><country>US</country><doc-number>10/713,342</doc-number></document-id>
            </application-reference>
            <domestic-filing-data>
              <application-number><doc-number>99999999</doc-number></application-number>
            </domestic-filing-data>"#;
        assert_eq!(extract_application_number(xml), "10713342");
    }

    #[test]
    fn application_number_falls_back_to_domestic_filing_data() {
        let xml = r#"
            <domestic-filing-data>
              <application-number><doc-number>09987654</doc-number></application-number>
              <filing-date>20030313</filing-date>
            </domestic-filing-data>"#;
        assert_eq!(extract_application_number(xml), "09987654");
    }

    #[test]
    fn application_number_is_digits_only_or_empty() {
        assert_eq!(extract_application_number("<p>nothing here</p>"), "");
        let xml = "<application-reference><doc-number>US 10-713.342</doc-number></application-reference>";
        assert!(extract_application_number(xml)
            .chars()
            .all(|c| c.is_ascii_digit()));
    }
}
