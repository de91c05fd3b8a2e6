//! End-to-end extraction scenarios over fabricated archives.
//!
//! Each test builds a real archive on disk in the packaging of one USPTO
//! vintage, then runs discovery, streaming, and parsing against it the way
//! the pipeline workers do. Nothing here touches a database; the records
//! are asserted directly.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use patx::config::Config;
use patx::discover;
use patx::models::PatentRecord;
use patx::parse;
use patx::processed::ProcessedSet;
use patx::stream;

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, data) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, *name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn legacy_publication(pub_number: &str, app_number: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<patent-application-publication>
  <subdoc-bibliographic-information>
    <document-id><doc-number>US{pub_number}A1</doc-number></document-id>
    <document-date>20030313</document-date>
    <title-of-invention>Adjustable fastener</title-of-invention>
    <domestic-filing-data>
      <application-number><doc-number>{app_number}</doc-number></application-number>
      <filing-date>20020315</filing-date>
    </domestic-filing-data>
  </subdoc-bibliographic-information>
  <subdoc-abstract><paragraph id="A-0001">A fastener that adjusts.</paragraph></subdoc-abstract>
  <subdoc-description>
    <paragraph id="P-0001"><number>1</number>Field of the invention.</paragraph>
    <paragraph id="P-0002"><number>2</number>Background of the invention.</paragraph>
  </subdoc-description>
</patent-application-publication>"#
    )
}

fn new_schema_publication(pub_number: &str, app_number: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<us-patent-application-publication>
  <us-bibliographic-data-application>
    <publication-reference>
      <document-id>
        <country>US</country><doc-number>{pub_number}</doc-number><kind>A1</kind><date>20160526</date>
      </document-id>
    </publication-reference>
    <application-reference appl-type="utility">
      <document-id>
        <country>US</country><doc-number>{app_number}</doc-number><date>20141121</date>
      </document-id>
    </application-reference>
    <invention-title id="d0e71">Streaming archive processor</invention-title>
  </us-bibliographic-data-application>
  <abstract id="abstract"><p id="p-0001">Processes archives as streams.</p></abstract>
  <description id="description">
    <p id="p-0001" num="0001">Archives are large.</p>
    <p id="p-0002" num="0002">Streaming keeps memory flat.</p>
  </description>
  <claims id="claims">
    <claim id="CLM-00001" num="00001"><claim-text>A processor for archives.</claim-text></claim>
  </claims>
</us-patent-application-publication>"#
    )
}

/// Streams one archive through the parser exactly like a pipeline worker.
fn extract(path: &Path) -> Vec<PatentRecord> {
    let mut records = Vec::new();
    stream::stream_archive(path, &mut |xml_path, data| {
        if let Some(record) = parse::parse_publication(&data, &xml_path) {
            records.push(record);
        }
    })
    .unwrap();
    records
}

fn config_for(root: &Path) -> Config {
    Config {
        db_host: "localhost".to_string(),
        db_port: 5432,
        db_name: "patents_test".to_string(),
        db_user: "postgres".to_string(),
        db_password: String::new(),
        workers: 2,
        batch_size: 500,
        files_root: root.to_path_buf(),
        scan_new: false,
        recursive: true,
        min_archive_size_mb: 1,
        reprocess: false,
        force: false,
        priority_min_year: 0,
        priority_max_year: 0,
        processed_log: root.join("processed_archives.txt"),
        failures_log: root.join("extract_failures.log"),
    }
}

/// Vintage-2003 split archive: the same date spans `A` and `B` files, each
/// with the nested per-publication ZIP layout and `<domestic-filing-data>`
/// application numbers.
#[test]
fn s1_vintage_2003_split_archive() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let xml_a = legacy_publication("20030050000", "10/050,111");
    let inner_a = build_zip(&[("US20030050000A1-20030313.XML", xml_a.as_bytes())]);
    let archive_a = build_zip(&[(
        "20030313/UTIL0050/US20030050000A1-20030313.ZIP",
        inner_a.as_slice(),
    )]);
    fs::write(root.join("20030313A.ZIP"), archive_a).unwrap();

    let xml_b = legacy_publication("20030046754", "09/944,532");
    let inner_b = build_zip(&[("US20030046754A1-20030313.XML", xml_b.as_bytes())]);
    let archive_b = build_zip(&[(
        "20030313/UTIL0046/US20030046754A1-20030313.ZIP",
        inner_b.as_slice(),
    )]);
    fs::write(root.join("20030313B.ZIP"), archive_b).unwrap();

    let a = extract(&root.join("20030313A.ZIP"));
    let b = extract(&root.join("20030313B.ZIP"));
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);

    assert_eq!(a[0].pub_number, "20030050000");
    assert_eq!(b[0].pub_number, "20030046754");
    assert_eq!(a[0].application_number, "10050111");
    assert_eq!(b[0].application_number, "09944532");
    assert!(a[0].raw_xml_path.starts_with("20030313A.ZIP/"));
    assert!(b[0].raw_xml_path.starts_with("20030313B.ZIP/"));
    assert_eq!(a[0].year, Some(2003));
    assert_eq!(b[0].year, Some(2003));
    assert_eq!(a[0].title, "Adjustable fastener");
    assert!(a[0]
        .description_text
        .contains("[0001] Field of the invention."));
}

/// Vintage-2016 TAR: per-publication ZIPs inside a weekly TAR, new schema.
#[test]
fn s2_vintage_2016_tar() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let xml = new_schema_publication("20160148332", "14/949,525");
    let inner = build_zip(&[("US20160148332A1-20160526.XML", xml.as_bytes())]);
    let tar = build_tar(&[(
        "I20160526/UTIL0148/US20160148332A1-20160526.ZIP",
        inner.as_slice(),
    )]);
    fs::write(root.join("I20160526.tar"), tar).unwrap();

    let records = extract(&root.join("I20160526.tar"));
    assert_eq!(records.len(), 1);
    let rec = &records[0];
    assert_eq!(rec.pub_number, "20160148332");
    assert_eq!(rec.application_number, "14949525");
    assert!(rec.raw_xml_path.starts_with("I20160526.tar/"));
    assert_eq!(rec.kind, "A1");
    assert_eq!(rec.year, Some(2016));
    assert!(rec.description_text.starts_with("CLAIMS:\n"));
    assert!(rec
        .description_text
        .contains("DESCRIPTION:\n[0001] Archives are large."));
}

/// Vintage-2011+ ZIP: `.XML` entries directly, no nesting.
#[test]
fn s3_direct_xml_zip() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let xml_1 = new_schema_publication("20110000001", "12/111,111");
    let xml_2 = new_schema_publication("20110000002", "12/222,222");
    let archive = build_zip(&[
        ("US20110000001A1-20110106.XML", xml_1.as_bytes()),
        ("US20110000002A1-20110106.XML", xml_2.as_bytes()),
    ]);
    fs::write(root.join("20110106.ZIP"), archive).unwrap();

    let records = extract(&root.join("20110106.ZIP"));
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0].raw_xml_path,
        "20110106.ZIP/US20110000001A1-20110106.XML"
    );
    assert_eq!(
        records[1].raw_xml_path,
        "20110106.ZIP/US20110000002A1-20110106.XML"
    );
    assert_eq!(records[0].pub_number, "20110000001");
    assert_eq!(records[1].pub_number, "20110000002");
}

/// Re-opening the archive at the stored locator yields bytes that parse to
/// the same publication number (the round-trip property behind
/// `raw_xml_path`).
#[test]
fn raw_xml_path_round_trips() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let xml = new_schema_publication("20110000777", "12/777,777");
    let archive = build_zip(&[("US20110000777A1-20110106.XML", xml.as_bytes())]);
    fs::write(root.join("20110106.ZIP"), archive).unwrap();

    let records = extract(&root.join("20110106.ZIP"));
    let locator = &records[0].raw_xml_path;

    let (archive_base, entry_path) = locator.split_once('/').unwrap();
    let reopened = root.join(archive_base);
    assert!(reopened.is_file());

    let mut matched = Vec::new();
    stream::stream_archive(&reopened, &mut |xml_path, data| {
        if xml_path.ends_with(entry_path) {
            matched.push(parse::parse_publication(&data, &xml_path).unwrap());
        }
    })
    .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].pub_number, records[0].pub_number);
}

/// Staging semantics: a processed staging file leaves `NewFiles/` (moved
/// back to the originals directory), and a second discovery pass excludes
/// it.
#[test]
fn staging_files_are_consumed_and_relocated() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    let staging = root.join("NewFiles");
    fs::create_dir_all(&staging).unwrap();

    let xml = new_schema_publication("20240100001", "18/100,001");
    let archive = build_zip(&[("US20240100001A1-20240104.XML", xml.as_bytes())]);
    fs::write(staging.join("20240104.ZIP"), archive).unwrap();

    let mut cfg = config_for(root);
    cfg.scan_new = true;
    let processed = ProcessedSet::load(&cfg.processed_log).unwrap();

    let work = discover::discover(&cfg, &processed).unwrap();
    assert_eq!(work.len(), 1);

    // What a worker does on completion: records out, mark, relocate.
    let records = extract(&work[0]);
    assert_eq!(records.len(), 1);
    processed.mark(&work[0]).unwrap();
    discover::move_to_originals(&cfg.files_root, &work[0]).unwrap();

    assert!(!staging.join("20240104.ZIP").exists());
    assert!(root.join("20240104.ZIP").exists());

    // The relocated original is excluded by the processed-set only under
    // its staging path; a rescan of the staging tree finds nothing.
    let rescan = discover::discover(&cfg, &processed).unwrap();
    assert!(rescan.is_empty());
}

/// Idempotent restart: losing processed-set entries re-lists exactly the
/// forgotten archives, and re-extraction yields identical records.
#[test]
fn s5_processed_set_crash_recovery() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let xml = legacy_publication("20030050000", "10/050,111");
    let inner = build_zip(&[("US20030050000A1-20030313.XML", xml.as_bytes())]);
    let archive = build_zip(&[(
        "20030313/UTIL0050/US20030050000A1-20030313.ZIP",
        inner.as_slice(),
    )]);
    fs::write(root.join("20030313A.ZIP"), &archive).unwrap();
    fs::write(root.join("20030320.ZIP"), &archive).unwrap();

    let cfg = config_for(root);
    let processed = ProcessedSet::load(&cfg.processed_log).unwrap();
    let first_pass = discover::discover(&cfg, &processed).unwrap();
    assert_eq!(first_pass.len(), 2);

    let baseline = extract(&first_pass[0]);
    for archive in &first_pass {
        processed.mark(archive).unwrap();
    }
    assert!(discover::discover(&cfg, &processed).unwrap().is_empty());

    // Simulate a crash that lost half the processed-set.
    let kept: Vec<String> = fs::read_to_string(&cfg.processed_log)
        .unwrap()
        .lines()
        .take(1)
        .map(String::from)
        .collect();
    fs::write(&cfg.processed_log, kept.join("\n") + "\n").unwrap();

    let reloaded = ProcessedSet::load(&cfg.processed_log).unwrap();
    let second_pass = discover::discover(&cfg, &reloaded).unwrap();
    assert_eq!(second_pass.len(), 1);

    // Re-extraction is deterministic, so the UPSERT merge is a no-op.
    let again = extract(&first_pass[0]);
    assert_eq!(again.len(), baseline.len());
    assert_eq!(again[0].pub_number, baseline[0].pub_number);
    assert_eq!(again[0].description_text, baseline[0].description_text);
}

/// Weekly grant bundle: one record per `<us-patent-grant>` element,
/// metadata only, locator pointing back into the bundle.
#[test]
fn s4_weekly_grant_bundle() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let grant = |number: &str, kind: &str| {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<us-patent-grant lang="EN" file="US{number}-20250107.XML">
  <us-bibliographic-data-grant>
    <publication-reference>
      <document-id>
        <country>US</country><doc-number>{number}</doc-number><kind>{kind}</kind><date>20250107</date>
      </document-id>
    </publication-reference>
    <application-reference appl-type="utility">
      <document-id><country>US</country><doc-number>17/900,123</doc-number><date>20220901</date></document-id>
    </application-reference>
    <invention-title>Grant number {number}</invention-title>
  </us-bibliographic-data-grant>
  <abstract><p>Abstract for {number}.</p></abstract>
  <claims><claim><claim-text>Never stored.</claim-text></claim></claims>
</us-patent-grant>"#
        )
    };
    let bundle = format!("{}\n{}", grant("12000001", "B2"), grant("12000002", "B1"));
    let archive = build_zip(&[("ipg250107.xml", bundle.as_bytes())]);
    fs::write(root.join("ipg250107.zip"), archive).unwrap();

    // Read the bundle back the way the grant pipeline does.
    let file = fs::File::open(root.join("ipg250107.zip")).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let mut xml = String::new();
    std::io::Read::read_to_string(&mut zip.by_index(0).unwrap(), &mut xml).unwrap();

    let grants = patx::grants::parse_grant_bundle(&xml, "ipg250107.zip/ipg250107.xml");
    assert_eq!(grants.len(), 2);
    assert_eq!(grants[0].pub_number, "12000001");
    assert_eq!(grants[0].kind, "B2");
    assert_eq!(grants[0].raw_xml_path, "ipg250107.zip/ipg250107.xml");
    assert_eq!(grants[0].abstract_text, "Abstract for 12000001.");
    assert_eq!(grants[0].application_number, "17900123");
    assert_eq!(grants[0].year, Some(2025));
    assert!(grants[0].claims.is_empty());
    assert!(grants[1].pub_number == "12000002");
}

/// Bounded fields obey their ceilings end to end.
#[test]
fn field_ceilings_hold() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let long_title = "T".repeat(900);
    let xml = format!(
        r#"<us-patent-application-publication>
  <us-bibliographic-data-application>
    <publication-reference>
      <document-id><doc-number>20160111222</doc-number><kind>A1</kind><date>20160526</date></document-id>
    </publication-reference>
    <invention-title>{long_title}</invention-title>
  </us-bibliographic-data-application>
</us-patent-application-publication>"#
    );
    let archive = build_zip(&[("US20160111222A1-20160526.XML", xml.as_bytes())]);
    let path: PathBuf = root.join("20160526.ZIP");
    fs::write(&path, archive).unwrap();

    let records = extract(&path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].title.len(), 500);
    assert!(records[0].claims.len() <= 50);
}
