//! Schema-adaptive publication parser.
//!
//! Two parser generations cover four USPTO schema vintages. The structured
//! decoder here walks the new-schema layout with a streaming XML reader;
//! when it errors out or finds no publication number, the tolerant regex
//! generation in [`crate::fallback`] takes over. Selection is by result,
//! never by document type, so a structured parse failure is never silently
//! masked.
//!
//! Identity resolution order for `pub_number`:
//! 1. the first `US(\d+)` match in the synthetic path,
//! 2. the structured `publication-reference/document-id/doc-number`,
//! 3. any `<doc-number>` found by the fallback regexes.
//!
//! A record with no identity from any source is dropped.

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::sync::LazyLock;

use crate::describe;
use crate::fallback;
use crate::models::{
    Address, Party, PartyKind, PatentRecord, MAX_ABSTRACT_BYTES, MAX_CLAIMS, MAX_PARTIES,
    MAX_TITLE_BYTES,
};
use crate::textutil::{clean_text, extract_application_number, parse_date, truncate_bytes};

static PATH_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"US(\d+)").unwrap());

/// Normalizes one publication XML document into a [`PatentRecord`].
///
/// `xml_path` is the synthetic locator (`<archive-basename>/<entry-path>`)
/// the record will carry in `raw_xml_path`. Returns `None` when no
/// publication number can be recovered from the path, the structured
/// decoder, or the fallback regexes.
pub fn parse_publication(data: &[u8], xml_path: &str) -> Option<PatentRecord> {
    let text = String::from_utf8_lossy(data);

    let mut rec = match structured_parse(&text) {
        Some(doc) if !doc.doc_number.is_empty() => doc.into_record(),
        _ => fallback::parse(&text),
    };

    if let Some(c) = PATH_ID_RE.captures(xml_path) {
        rec.pub_number = c[1].to_string();
    }
    if rec.pub_number.is_empty() {
        return None;
    }

    rec.raw_xml_path = xml_path.to_string();
    rec.application_number = extract_application_number(&text);

    let description = describe::synthesize_description(&text);
    rec.description_text = describe::build_combined(&rec.claims, &description);

    rec.title = truncate_bytes(rec.title, MAX_TITLE_BYTES);
    rec.abstract_text = truncate_bytes(rec.abstract_text, MAX_ABSTRACT_BYTES);
    rec.claims.truncate(MAX_CLAIMS);
    rec.inventors.truncate(MAX_PARTIES);
    rec.assignees.truncate(MAX_PARTIES);
    rec.derive_year();

    Some(rec)
}

#[derive(Default)]
struct StructuredDoc {
    doc_number: String,
    kind: String,
    pub_date_raw: String,
    filing_date_raw: String,
    title: String,
    abstract_text: String,
    claims: Vec<String>,
    inventors: Vec<Party>,
    assignees: Vec<Party>,
}

impl StructuredDoc {
    fn into_record(self) -> PatentRecord {
        let mut rec = PatentRecord {
            pub_number: self.doc_number,
            kind: self.kind,
            title: clean_text(&self.title),
            abstract_text: clean_text(&self.abstract_text),
            claims: self.claims,
            inventors: self.inventors,
            assignees: self.assignees,
            ..Default::default()
        };
        rec.pub_date = parse_date(&self.pub_date_raw);
        rec.filing_date = parse_date(&self.filing_date_raw);
        rec
    }
}

#[derive(Clone, Copy, PartialEq)]
enum PartyCtx {
    None,
    Inventor,
    Assignee,
}

#[derive(Default)]
struct PartyDraft {
    given: String,
    family: String,
    orgname: String,
    city: String,
    country: String,
}

impl PartyDraft {
    fn finish(self, ctx: PartyCtx) -> Option<Party> {
        let address = Address::from_parts(
            (!self.city.is_empty()).then_some(self.city),
            (!self.country.is_empty()).then_some(self.country),
        );
        match ctx {
            PartyCtx::Inventor => {
                if self.given.is_empty() || self.family.is_empty() {
                    return None;
                }
                Some(Party {
                    name: format!("{} {}", self.given, self.family),
                    kind: PartyKind::Individual,
                    address,
                })
            }
            PartyCtx::Assignee => {
                if !self.orgname.is_empty() {
                    Some(Party {
                        name: self.orgname,
                        kind: PartyKind::Organization,
                        address,
                    })
                } else if !self.given.is_empty() && !self.family.is_empty() {
                    Some(Party {
                        name: format!("{} {}", self.given, self.family),
                        kind: PartyKind::Individual,
                        address,
                    })
                } else {
                    None
                }
            }
            PartyCtx::None => None,
        }
    }
}

fn append_text(buf: &mut String, piece: &str) {
    let piece = piece.trim();
    if piece.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(piece);
}

/// Streams the document once, collecting the new-schema fields by element
/// context. Returns `None` on any XML error; the caller then selects the
/// fallback generation.
fn structured_parse(xml: &str) -> Option<StructuredDoc> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut doc = StructuredDoc::default();
    let mut stack: Vec<String> = Vec::new();
    let mut in_pub_ref = false;
    let mut in_app_ref = false;
    let mut in_doc_id = false;
    let mut in_abstract = false;
    let mut in_title = false;
    let mut claim_buf: Option<String> = None;
    let mut party_ctx = PartyCtx::None;
    let mut draft = PartyDraft::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "publication-reference" => in_pub_ref = true,
                    "application-reference" => in_app_ref = true,
                    "document-id" => in_doc_id = true,
                    "abstract" => in_abstract = true,
                    "invention-title" => in_title = true,
                    "claim" => claim_buf = Some(String::new()),
                    "inventor" => {
                        party_ctx = PartyCtx::Inventor;
                        draft = PartyDraft::default();
                    }
                    "assignee" => {
                        party_ctx = PartyCtx::Assignee;
                        draft = PartyDraft::default();
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "publication-reference" => in_pub_ref = false,
                    "application-reference" => in_app_ref = false,
                    "document-id" => in_doc_id = false,
                    "abstract" => in_abstract = false,
                    "invention-title" => in_title = false,
                    "claim" => {
                        if let Some(buf) = claim_buf.take() {
                            let claim = clean_text(&buf);
                            if !claim.is_empty() && doc.claims.len() < MAX_CLAIMS {
                                doc.claims.push(claim);
                            }
                        }
                    }
                    "inventor" | "assignee" => {
                        let finished = std::mem::take(&mut draft).finish(party_ctx);
                        match party_ctx {
                            PartyCtx::Inventor => {
                                if let Some(p) = finished {
                                    if doc.inventors.len() < MAX_PARTIES {
                                        doc.inventors.push(p);
                                    }
                                }
                            }
                            PartyCtx::Assignee => {
                                if let Some(p) = finished {
                                    if doc.assignees.len() < MAX_PARTIES {
                                        doc.assignees.push(p);
                                    }
                                }
                            }
                            PartyCtx::None => {}
                        }
                        party_ctx = PartyCtx::None;
                    }
                    _ => {}
                }
                stack.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default();
                let leaf = stack.last().map(String::as_str).unwrap_or("");
                if let Some(buf) = claim_buf.as_mut() {
                    append_text(buf, &text);
                } else if in_title {
                    append_text(&mut doc.title, &text);
                } else if in_abstract {
                    append_text(&mut doc.abstract_text, &text);
                } else if in_doc_id && in_pub_ref {
                    match leaf {
                        "doc-number" if doc.doc_number.is_empty() => {
                            doc.doc_number = text.trim().to_string();
                        }
                        "kind" if doc.kind.is_empty() => {
                            doc.kind = text.trim().to_string();
                        }
                        "date" if doc.pub_date_raw.is_empty() => {
                            doc.pub_date_raw = text.trim().to_string();
                        }
                        _ => {}
                    }
                } else if in_doc_id && in_app_ref {
                    if leaf == "date" && doc.filing_date_raw.is_empty() {
                        doc.filing_date_raw = text.trim().to_string();
                    }
                } else if party_ctx != PartyCtx::None {
                    let target = match leaf {
                        "given-name" => Some(&mut draft.given),
                        "family-name" => Some(&mut draft.family),
                        "orgname" => Some(&mut draft.orgname),
                        "city" => Some(&mut draft.city),
                        "country" => Some(&mut draft.country),
                        _ => None,
                    };
                    if let Some(field) = target {
                        if field.is_empty() {
                            *field = clean_text(&text);
                        }
                    }
                }
            }
            Ok(Event::CData(e)) => {
                let raw = e.into_inner();
                let text = String::from_utf8_lossy(&raw);
                if let Some(buf) = claim_buf.as_mut() {
                    append_text(buf, &text);
                } else if in_abstract {
                    append_text(&mut doc.abstract_text, &text);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    Some(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEW_SCHEMA_DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<us-patent-application-publication>
  <us-bibliographic-data-application>
    <publication-reference>
      <document-id>
        <country>US</country>
        <doc-number>20160148332</doc-number>
        <kind>A1</kind>
        <date>20160526</date>
      </document-id>
    </publication-reference>
    <application-reference appl-type="utility">
      <document-id>
        <country>US</country>
        <doc-number>14/949,525</doc-number>
        <date>20151123</date>
      </document-id>
    </application-reference>
    <invention-title id="d2e53">Systems for scoring loan applications</invention-title>
    <inventors>
      <inventor sequence="001">
        <name><given-name>Wei</given-name><family-name>Chen</family-name></name>
        <address><city>San Jose</city><country>US</country></address>
      </inventor>
    </inventors>
    <assignees>
      <assignee>
        <orgname>Lendify Inc.</orgname>
        <address><city>Oakland</city><country>US</country></address>
      </assignee>
    </assignees>
  </us-bibliographic-data-application>
  <abstract id="abstract"><p id="p-0001">A loan scoring system is disclosed.</p></abstract>
  <description id="description">
    <p id="p-0001" num="0001">The present disclosure relates to lending.</p>
    <p id="p-0002" num="0002">Embodiments score applications.</p>
  </description>
  <claims id="claims">
    <claim id="CLM-00001" num="00001"><claim-text>A system comprising a processor.</claim-text></claim>
    <claim id="CLM-00002" num="00002"><claim-text>The system of claim 1.</claim-text></claim>
  </claims>
</us-patent-application-publication>"#;

    #[test]
    fn structured_parse_reads_new_schema_fields() {
        let rec = parse_publication(
            NEW_SCHEMA_DOC.as_bytes(),
            "I20160526.tar/US20160148332A1-20160526.XML",
        )
        .unwrap();
        assert_eq!(rec.pub_number, "20160148332");
        assert_eq!(rec.kind, "A1");
        assert_eq!(rec.title, "Systems for scoring loan applications");
        assert_eq!(rec.abstract_text, "A loan scoring system is disclosed.");
        assert_eq!(rec.claims.len(), 2);
        assert_eq!(rec.application_number, "14949525");
        assert_eq!(rec.pub_date, chrono::NaiveDate::from_ymd_opt(2016, 5, 26));
        assert_eq!(rec.filing_date, chrono::NaiveDate::from_ymd_opt(2015, 11, 23));
        assert_eq!(rec.year, Some(2016));
        assert_eq!(rec.raw_xml_path, "I20160526.tar/US20160148332A1-20160526.XML");
    }

    #[test]
    fn structured_parse_collects_parties() {
        let rec = parse_publication(NEW_SCHEMA_DOC.as_bytes(), "direct.zip/entry.XML").unwrap();
        assert_eq!(rec.inventors.len(), 1);
        assert_eq!(rec.inventors[0].name, "Wei Chen");
        assert_eq!(rec.inventors[0].kind, PartyKind::Individual);
        assert_eq!(
            rec.inventors[0].address.as_ref().unwrap().city.as_deref(),
            Some("San Jose")
        );
        assert_eq!(rec.assignees.len(), 1);
        assert_eq!(rec.assignees[0].name, "Lendify Inc.");
        assert_eq!(rec.assignees[0].kind, PartyKind::Organization);
    }

    #[test]
    fn combined_description_has_claims_then_numbered_paragraphs() {
        let rec = parse_publication(NEW_SCHEMA_DOC.as_bytes(), "direct.zip/entry.XML").unwrap();
        assert!(rec.description_text.starts_with("CLAIMS:\n"));
        assert!(rec.description_text.contains("DESCRIPTION:\n[0001] "));
        assert!(rec
            .description_text
            .contains("[0002] Embodiments score applications."));
    }

    #[test]
    fn path_identity_wins_over_document_identity() {
        let rec = parse_publication(
            NEW_SCHEMA_DOC.as_bytes(),
            "20160526.ZIP/US20169999999A1-20160526.XML",
        )
        .unwrap();
        assert_eq!(rec.pub_number, "20169999999");
    }

    #[test]
    fn legacy_documents_select_the_fallback_generation() {
        let legacy = r#"<?xml version="1.0"?>
<patent-application-publication>
  <subdoc-bibliographic-information>
    <document-id><doc-number>20030050000</doc-number></document-id>
    <document-date>20030313</document-date>
    <title-of-invention>Widget coupling</title-of-invention>
  </subdoc-bibliographic-information>
  <subdoc-abstract><paragraph id="A-0001">A widget coupling.</paragraph></subdoc-abstract>
</patent-application-publication>"#;
        let rec = parse_publication(legacy.as_bytes(), "20030313A.ZIP/no-us-prefix.XML").unwrap();
        assert_eq!(rec.pub_number, "20030050000");
        assert_eq!(rec.title, "Widget coupling");
        assert_eq!(rec.year, Some(2003));
    }

    #[test]
    fn documents_without_any_identity_are_dropped() {
        assert!(parse_publication(b"<doc><p>anonymous</p></doc>", "weird.zip/entry.XML").is_none());
    }

    #[test]
    fn malformed_xml_still_parses_through_the_fallback() {
        let broken = "<doc-number>20040012345</doc-number><invention-title>Unclosed";
        let rec = parse_publication(broken.as_bytes(), "20040101.ZIP/inner.XML").unwrap();
        assert_eq!(rec.pub_number, "20040012345");
    }
}
