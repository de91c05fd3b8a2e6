//! Nested-container streaming over USPTO weekly archives.
//!
//! Archive packaging drifted with the schema generations:
//!
//! - vintage <= 2010 ZIPs nest one inner ZIP per publication
//!   (`20030313.ZIP/20030313/UTIL0050/US20030050000A1-20030313.ZIP/...XML`),
//! - vintage >= 2011 ZIPs carry `.XML` entries directly,
//! - vintage >= 2013 weeks ship as TARs whose entries are per-publication
//!   ZIPs, occasionally gzipped.
//!
//! The streamer yields `(synthetic_path, xml_bytes)` pairs through a
//! callback. The synthetic path is always the archive basename plus the
//! innermost entry path, so any consumer can re-open the original bytes.
//! One unreadable entry never aborts an archive: it is logged at debug
//! level and skipped. Only a top-level open failure aborts the archive.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

/// Container family of a work item, decided by name and magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

/// True when the file's first bytes carry a ZIP `PK` signature.
pub fn sniff_zip(path: &Path) -> bool {
    let mut buf = [0u8; 4];
    match File::open(path).and_then(|mut f| f.read_exact(&mut buf).map(|_| buf)) {
        Ok(buf) => buf[0] == b'P' && buf[1] == b'K',
        Err(_) => false,
    }
}

/// True when bytes 257..262 equal the `ustar` TAR magic.
pub fn sniff_tar(path: &Path) -> bool {
    use std::io::Seek;
    let mut buf = [0u8; 5];
    let ok = File::open(path).and_then(|mut f| {
        f.seek(std::io::SeekFrom::Start(257))?;
        f.read_exact(&mut buf)
    });
    ok.is_ok() && &buf == b"ustar"
}

/// Classifies an archive by extension, falling back to magic bytes.
pub fn detect_kind(path: &Path) -> Option<ArchiveKind> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return Some(ArchiveKind::TarGz);
    }
    if name.ends_with(".zip") {
        return Some(ArchiveKind::Zip);
    }
    if name.contains(".tar") {
        return Some(ArchiveKind::Tar);
    }
    if sniff_zip(path) {
        return Some(ArchiveKind::Zip);
    }
    if sniff_tar(path) {
        return Some(ArchiveKind::Tar);
    }
    None
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_xml(name: &str) -> bool {
    name.to_uppercase().ends_with(".XML")
}

fn is_zip(name: &str) -> bool {
    name.to_uppercase().ends_with(".ZIP")
}

/// Streams every XML document in the archive through `on_xml`.
///
/// `on_xml` receives the synthetic path and the raw bytes. Errors on
/// individual entries are skipped; an error opening the archive itself is
/// returned.
pub fn stream_archive(path: &Path, on_xml: &mut dyn FnMut(String, Vec<u8>)) -> Result<()> {
    match detect_kind(path) {
        Some(ArchiveKind::Zip) => stream_zip(path, on_xml),
        Some(ArchiveKind::Tar) => stream_tar(path, false, on_xml),
        Some(ArchiveKind::TarGz) => stream_tar(path, true, on_xml),
        None => bail!("unrecognized archive type: {}", path.display()),
    }
}

/// ZIP dispatch: a first-pass scan decides between the nested-ZIP layout
/// (vintage <= 2010) and the direct-XML layout (vintage >= 2011).
fn stream_zip(path: &Path, on_xml: &mut dyn FnMut(String, Vec<u8>)) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("read zip {}", path.display()))?;
    let base = basename(path);

    let has_nested = archive.file_names().any(is_zip);

    if has_nested {
        for i in 0..archive.len() {
            let (inner_name, data) = {
                let mut entry = match archive.by_index(i) {
                    Ok(e) => e,
                    Err(err) => {
                        debug!(archive = %base, index = i, %err, "skipping unreadable entry");
                        continue;
                    }
                };
                let name = entry.name().to_string();
                if !is_zip(&name) {
                    continue;
                }
                // DTDS / ENTITIES zips carry schema payload, not documents.
                if name.contains("DTDS") || name.contains("ENTITIES") {
                    continue;
                }
                let mut data = Vec::with_capacity(entry.size() as usize);
                if let Err(err) = entry.read_to_end(&mut data) {
                    debug!(archive = %base, entry = %name, %err, "skipping unreadable nested zip");
                    continue;
                }
                (name, data)
            };
            if let Err(err) = stream_inner_zip(&base, &data, on_xml) {
                debug!(archive = %base, entry = %inner_name, %err, "skipping bad nested zip");
            }
        }
    } else {
        for i in 0..archive.len() {
            let mut entry = match archive.by_index(i) {
                Ok(e) => e,
                Err(err) => {
                    debug!(archive = %base, index = i, %err, "skipping unreadable entry");
                    continue;
                }
            };
            let name = entry.name().to_string();
            if !is_xml(&name) {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            if let Err(err) = entry.read_to_end(&mut data) {
                debug!(archive = %base, entry = %name, %err, "skipping unreadable xml");
                continue;
            }
            on_xml(format!("{}/{}", base, name), data);
        }
    }
    Ok(())
}

/// Streams the `.XML` entries of one in-memory nested ZIP.
fn stream_inner_zip(
    base: &str,
    data: &[u8],
    on_xml: &mut dyn FnMut(String, Vec<u8>),
) -> Result<()> {
    let mut inner = ZipArchive::new(Cursor::new(data))?;
    for i in 0..inner.len() {
        let mut entry = match inner.by_index(i) {
            Ok(e) => e,
            Err(err) => {
                debug!(archive = %base, index = i, %err, "skipping unreadable inner entry");
                continue;
            }
        };
        let name = entry.name().to_string();
        if !is_xml(&name) {
            continue;
        }
        let mut xml = Vec::with_capacity(entry.size() as usize);
        if let Err(err) = entry.read_to_end(&mut xml) {
            debug!(archive = %base, entry = %name, %err, "skipping unreadable inner xml");
            continue;
        }
        on_xml(format!("{}/{}", base, name), xml);
    }
    Ok(())
}

/// TAR / TAR-GZIP: entries are processed sequentially and never fully
/// materialized; only nested per-publication ZIPs are buffered, one at a
/// time.
fn stream_tar(path: &Path, gzipped: bool, on_xml: &mut dyn FnMut(String, Vec<u8>)) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let base = basename(path);
    if gzipped {
        stream_tar_entries(&base, tar::Archive::new(GzDecoder::new(file)), on_xml)
    } else {
        stream_tar_entries(&base, tar::Archive::new(file), on_xml)
    }
}

fn stream_tar_entries<R: Read>(
    base: &str,
    mut archive: tar::Archive<R>,
    on_xml: &mut dyn FnMut(String, Vec<u8>),
) -> Result<()> {
    for entry in archive.entries().context("read tar entries")? {
        let mut entry = match entry {
            Ok(e) => e,
            Err(err) => {
                debug!(archive = %base, %err, "skipping unreadable tar entry");
                continue;
            }
        };
        let name = entry
            .path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        if is_xml(&name) {
            let mut data = Vec::new();
            if let Err(err) = entry.read_to_end(&mut data) {
                debug!(archive = %base, entry = %name, %err, "skipping unreadable xml");
                continue;
            }
            on_xml(format!("{}/{}", base, name), data);
        } else if is_zip(&name) {
            let mut data = Vec::new();
            if let Err(err) = entry.read_to_end(&mut data) {
                debug!(archive = %base, entry = %name, %err, "skipping unreadable nested zip");
                continue;
            }
            if let Err(err) = stream_inner_zip(base, &data, on_xml) {
                debug!(archive = %base, entry = %name, %err, "skipping bad nested zip");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

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

    fn collect(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        stream_archive(path, &mut |p, b| out.push((p, b))).unwrap();
        out
    }

    #[test]
    fn nested_zip_layout_yields_inner_xml() {
        let inner = build_zip(&[("US20030050000A1-20030313.XML", b"<doc/>")]);
        let outer = build_zip(&[
            ("20030313/UTIL0050/US20030050000A1-20030313.ZIP", &inner),
            ("20030313/DTDS/dtds.ZIP", b"not read"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20030313A.ZIP");
        std::fs::write(&path, outer).unwrap();

        let got = collect(&path);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "20030313A.ZIP/US20030050000A1-20030313.XML");
        assert_eq!(got[0].1, b"<doc/>");
    }

    #[test]
    fn direct_xml_layout_yields_entries_as_is() {
        let outer = build_zip(&[
            ("US20110000001A1.XML", b"<a/>"),
            ("US20110000002A1.XML", b"<b/>"),
            ("readme.txt", b"skip me"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipa110106.zip");
        std::fs::write(&path, outer).unwrap();

        let got = collect(&path);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, "ipa110106.zip/US20110000001A1.XML");
        assert_eq!(got[1].0, "ipa110106.zip/US20110000002A1.XML");
    }

    #[test]
    fn tar_streams_xml_and_nested_zip_entries() {
        let inner = build_zip(&[("US20160148332A1-20160526.XML", b"<tarred/>")]);
        let mut builder = tar::Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_size(inner.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                "I20160526/UTIL0148/US20160148332A1-20160526.ZIP",
                inner.as_slice(),
            )
            .unwrap();

        let loose = b"<loose/>";
        let mut header = tar::Header::new_gnu();
        header.set_size(loose.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "I20160526/LOOSE/USLOOSE.XML", loose.as_slice())
            .unwrap();

        let bytes = builder.into_inner().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("I20160526.tar");
        std::fs::write(&path, bytes).unwrap();

        let got = collect(&path);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, "I20160526.tar/US20160148332A1-20160526.XML");
        assert_eq!(got[0].1, b"<tarred/>");
        assert_eq!(got[1].0, "I20160526.tar/I20160526/LOOSE/USLOOSE.XML");
    }

    #[test]
    fn gzipped_tar_is_transparent() {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"<gz/>";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "inner/US123.XML", data.as_slice())
            .unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        let gz_bytes = gz.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weekly.tar.gz");
        std::fs::write(&path, gz_bytes).unwrap();

        let got = collect(&path);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "weekly.tar.gz/inner/US123.XML");
    }

    #[test]
    fn corrupt_archive_open_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.zip");
        std::fs::write(&path, b"PK but not really a zip").unwrap();
        assert!(stream_archive(&path, &mut |_, _| {}).is_err());
    }

    #[test]
    fn one_bad_nested_zip_does_not_abort_the_archive() {
        let good_inner = build_zip(&[("US20030099999A1.XML", b"<ok/>")]);
        let outer = build_zip(&[
            ("20030313/UTIL0001/BROKEN.ZIP", b"garbage, not a zip"),
            ("20030313/UTIL0002/US20030099999A1-20030313.ZIP", &good_inner),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20030313.ZIP");
        std::fs::write(&path, outer).unwrap();

        let got = collect(&path);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "20030313.ZIP/US20030099999A1.XML");
    }

    #[test]
    fn kind_detection_by_name_and_magic() {
        let dir = tempfile::tempdir().unwrap();

        let zip_path = dir.path().join("sniffme");
        std::fs::write(&zip_path, build_zip(&[("a.XML", b"<a/>")])).unwrap();
        assert_eq!(detect_kind(&zip_path), Some(ArchiveKind::Zip));

        assert_eq!(
            detect_kind(Path::new("20030313.ZIP")),
            Some(ArchiveKind::Zip)
        );
        assert_eq!(
            detect_kind(Path::new("I20160526.tar")),
            Some(ArchiveKind::Tar)
        );
        assert_eq!(
            detect_kind(Path::new("bundle.tar.gz")),
            Some(ArchiveKind::TarGz)
        );

        let junk = dir.path().join("junkfile");
        std::fs::write(&junk, b"neither zip nor tar").unwrap();
        assert_eq!(detect_kind(&junk), None);
    }
}
