//! End-to-end sanitization checks over real archives.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use metascrub::core::envelope;
use metascrub::core::{
    create_stripper, ArchivePolicy, ChildFactory, Metadata, SourceFile, StripOptions, Stripper,
    ZipStripper, CHILD_FACTORY,
};

const DIRTY_DATE: (u16, u8, u8, u8, u8, u8) = (2024, 6, 1, 13, 37, 0);

fn dirty_datetime() -> zip::DateTime {
    let (y, mo, d, h, mi, s) = DIRTY_DATE;
    zip::DateTime::from_date_and_time(y, mo, d, h, mi, s).expect("valid fixture date")
}

/// Writes a ZIP with the given entries; `dirty` adds an archive comment and
/// a non-epoch modification date to every entry.
fn write_zip(path: &Path, entries: &[(&str, &[u8])], dirty: bool) {
    let file = File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    if dirty {
        writer.set_comment("hello");
    }
    for (name, payload) in entries {
        let mut options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        if dirty {
            options = options.last_modified_time(dirty_datetime());
        }
        writer.start_file(*name, options).unwrap();
        writer.write_all(payload).unwrap();
    }
    writer.finish().unwrap();
}

/// Writes an OpenDocument-shaped ZIP: stored `mimetype` first, so magic
/// detection identifies the document format.
fn write_odt(path: &Path, with_meta: bool) {
    let file = File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    writer
        .start_file(
            "mimetype",
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
        )
        .unwrap();
    writer
        .write_all(b"application/vnd.oasis.opendocument.text")
        .unwrap();
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file("content.xml", deflated).unwrap();
    writer
        .write_all(b"<office:document-content>body</office:document-content>")
        .unwrap();
    if with_meta {
        writer.start_file("meta.xml", deflated).unwrap();
        writer
            .write_all(
                b"<office:meta><meta:initial-creator>Jane Doe</meta:initial-creator>\
                  <dc:date>2024-06-01T13:37:00</dc:date></office:meta>",
            )
            .unwrap();
    }
    writer.finish().unwrap();
}

fn write_docx(path: &Path) {
    let file = File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file("[Content_Types].xml", deflated).unwrap();
    writer.write_all(b"<Types/>").unwrap();
    writer.start_file("word/document.xml", deflated).unwrap();
    writer.write_all(b"<w:document>text</w:document>").unwrap();
    writer
        .start_file("word/_rels/document.xml.rels", deflated)
        .unwrap();
    writer.write_all(b"<Relationships/>").unwrap();
    writer.start_file("docProps/core.xml", deflated).unwrap();
    writer
        .write_all(b"<cp:coreProperties><dc:creator>Jane Doe</dc:creator></cp:coreProperties>")
        .unwrap();
    writer.start_file("docProps/app.xml", deflated).unwrap();
    writer
        .write_all(b"<Properties><Company>ACME</Company></Properties>")
        .unwrap();
    writer.finish().unwrap();
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

fn png_chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut checked = kind.to_vec();
    checked.extend_from_slice(data);
    out.extend_from_slice(&crc32(&checked).to_be_bytes());
    out
}

/// A 1x1 PNG with an authorship text chunk.
fn dirty_png() -> Vec<u8> {
    let mut png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    png.extend(png_chunk(
        b"IHDR",
        &[0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0],
    ));
    png.extend(png_chunk(b"tEXt", b"Author\0Jane Doe"));
    png.extend(png_chunk(
        b"IDAT",
        &[0x78, 0x9c, 0x62, 0x60, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01],
    ));
    png.extend(png_chunk(b"IEND", &[]));
    png
}

/// Writes a gzipped tar holding one file entry with dirty ownership fields.
fn write_dirty_tar_gz(path: &Path, entry_name: &str, payload: &[u8]) {
    let file = File::create(path).unwrap();
    let encoder = GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut header = tar::Header::new_gnu();
    header.set_path(entry_name).unwrap();
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_700_000_000);
    header.set_uid(1000);
    header.set_gid(1000);
    header.set_username("joe").unwrap();
    header.set_groupname("users").unwrap();
    header.set_cksum();
    builder.append(&header, payload).unwrap();

    builder.into_inner().unwrap().finish().unwrap();
}

fn zip_entry_names(path: &Path) -> Vec<String> {
    let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}

fn zip_entry_bytes(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).unwrap();
    bytes
}

fn scrub(path: &Path, options: &StripOptions) -> bool {
    let mut stripper = create_stripper(path, true, options).expect("format should be supported");
    stripper.remove_all()
}

fn fixture(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

// ============================================================
// ZIP engine
// ============================================================

#[test]
fn dirty_zip_is_normalized_and_payload_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "dirty.zip");
    write_zip(&path, &[("readme.txt", b"hello world")], true);

    assert!(scrub(&path, &StripOptions::default()));

    let archive = envelope::inspect(&path).unwrap();
    assert_eq!(archive.comment_len, 0);
    assert_eq!(archive.entries.len(), 1);
    for entry in &archive.entries {
        assert!(entry.is_normalized(), "entry {} not normalized", entry.name);
        assert_eq!(entry.modified(), "1980-01-01 00:00:00");
        assert_eq!(entry.comment_len, 0);
    }
    assert_eq!(zip_entry_bytes(&path, "readme.txt"), b"hello world");
}

#[test]
fn sanitized_zip_reports_clean() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "dirty.zip");
    write_zip(&path, &[("readme.txt", b"hello world")], true);

    let options = StripOptions::default();
    let mut stripper = create_stripper(&path, true, &options).unwrap();
    assert!(!stripper.is_clean());
    assert!(stripper.remove_all());
    drop(stripper);

    let mut rescan = create_stripper(&path, false, &options).unwrap();
    assert!(rescan.is_clean());
}

#[test]
fn scrubbing_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "dirty.zip");
    write_zip(&path, &[("a.txt", b"alpha"), ("b.txt", b"beta")], true);

    assert!(scrub(&path, &StripOptions::default()));
    let first = fs::read(&path).unwrap();
    assert!(scrub(&path, &StripOptions::default()));
    let second = fs::read(&path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn get_meta_reports_comment_and_dirty_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "dirty.zip");
    write_zip(&path, &[("readme.txt", b"hello")], true);

    let options = StripOptions::default();
    let mut stripper = create_stripper(&path, false, &options).unwrap();
    let metadata: Metadata = stripper.get_meta();
    assert_eq!(metadata.get("comment").map(String::as_str), Some("hello"));
    let envelope_report = metadata.get("readme.txt's envelope").unwrap();
    assert!(envelope_report.contains("2024-06-01 13:37:00"));
}

#[test]
fn backup_keeps_the_original_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "dirty.zip");
    write_zip(&path, &[("readme.txt", b"hello")], true);
    let original = fs::read(&path).unwrap();

    let options = StripOptions::default().with_backup(true);
    assert!(scrub(&path, &options));

    let backup = dir.path().join("dirty.zip.bak");
    assert_eq!(fs::read(&backup).unwrap(), original);
    assert_ne!(fs::read(&path).unwrap(), original);
}

// ============================================================
// Nested containers and policy hooks
// ============================================================

#[test]
fn nested_zip_is_recursed_and_unsupported_entry_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let inner = fixture(&dir, "inner.zip");
    write_zip(&inner, &[("note.txt", b"inner note")], true);

    let outer = fixture(&dir, "outer.zip");
    let inner_bytes = fs::read(&inner).unwrap();
    write_zip(
        &outer,
        &[
            ("inner.zip", inner_bytes.as_slice()),
            ("blob.bin", b"BINDATA-0123"),
        ],
        true,
    );

    assert!(scrub(&outer, &StripOptions::default()));

    let names = zip_entry_names(&outer);
    assert!(names.contains(&"inner.zip".to_string()));
    assert!(!names.contains(&"blob.bin".to_string()));

    // The nested archive was sanitized, not copied through.
    let sanitized_inner = zip_entry_bytes(&outer, "inner.zip");
    let inner_copy = fixture(&dir, "inner-copy.zip");
    fs::write(&inner_copy, &sanitized_inner).unwrap();
    let inner_envelope = envelope::inspect(&inner_copy).unwrap();
    assert_eq!(inner_envelope.comment_len, 0);
    assert!(inner_envelope.entries.iter().all(|e| e.is_normalized()));
}

#[test]
fn add2archive_keeps_unsupported_entries_reenveloped() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "bundle.zip");
    write_zip(&path, &[("blob.bin", b"BINDATA-0123")], true);

    let options = StripOptions::default().with_add2archive(true);
    assert!(scrub(&path, &options));

    assert_eq!(zip_entry_bytes(&path, "blob.bin"), b"BINDATA-0123");
    let archive = envelope::inspect(&path).unwrap();
    assert!(archive.entries.iter().all(|e| e.is_normalized()));
}

#[test]
fn content_preservation_matches_isolated_sanitization() {
    let dir = tempfile::tempdir().unwrap();

    // Sanitize a PNG in isolation.
    let alone = fixture(&dir, "alone.png");
    fs::write(&alone, dirty_png()).unwrap();
    assert!(scrub(&alone, &StripOptions::default()));
    let expected = fs::read(&alone).unwrap();

    // The same PNG inside an archive comes out with the same bytes.
    let outer = fixture(&dir, "outer.zip");
    write_zip(&outer, &[("photo.png", dirty_png().as_slice())], true);
    assert!(scrub(&outer, &StripOptions::default()));
    assert_eq!(zip_entry_bytes(&outer, "photo.png"), expected);
}

#[test]
fn blacklists_and_whitelist_drive_entry_selection() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "bundle.zip");
    write_zip(
        &path,
        &[
            ("secrets/key.bin", b"private"),
            ("trace.log", b"log line"),
            ("keep.bin", b"wanted"),
            ("notes.txt", b"notes"),
        ],
        true,
    );

    let source = SourceFile::create(&path, "application/zip", true, false).unwrap();
    let policy = ArchivePolicy {
        whitelist: vec!["keep.bin".to_string()],
        beginning_blacklist: vec!["secrets/".to_string()],
        ending_blacklist: vec![".log".to_string()],
        terminal: false,
    };
    let mut stripper =
        ZipStripper::new(source, StripOptions::default(), policy, CHILD_FACTORY).unwrap();
    assert!(stripper.remove_all());
    drop(stripper);

    let names = zip_entry_names(&path);
    assert_eq!(names, vec!["keep.bin".to_string(), "notes.txt".to_string()]);
}

#[test]
fn terminal_archives_do_not_recurse_into_containers() {
    let dir = tempfile::tempdir().unwrap();
    let inner = fixture(&dir, "inner.zip");
    write_zip(&inner, &[("note.txt", b"inner note")], false);

    let path = fixture(&dir, "terminal.zip");
    let inner_bytes = fs::read(&inner).unwrap();
    write_zip(
        &path,
        &[
            ("nested.zip", inner_bytes.as_slice()),
            ("body.xml", b"<body/>"),
        ],
        false,
    );

    let source = SourceFile::create(&path, "application/zip", true, false).unwrap();
    let policy = ArchivePolicy {
        terminal: true,
        ..ArchivePolicy::default()
    };
    let mut stripper =
        ZipStripper::new(source, StripOptions::default(), policy, CHILD_FACTORY).unwrap();
    assert!(stripper.remove_all());
    drop(stripper);

    // The nested archive counts as unsupported and is dropped.
    assert_eq!(zip_entry_names(&path), vec!["body.xml".to_string()]);
}

// ============================================================
// Office formats
// ============================================================

#[test]
fn odt_loses_its_meta_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "report.odt");
    write_odt(&path, true);

    let options = StripOptions::default();
    let mut stripper = create_stripper(&path, true, &options).unwrap();
    let metadata = stripper.get_meta();
    assert_eq!(
        metadata.get("initial-creator").map(String::as_str),
        Some("Jane Doe")
    );
    assert!(!stripper.is_clean());
    assert!(stripper.remove_all());
    drop(stripper);

    let names = zip_entry_names(&path);
    assert!(!names.contains(&"meta.xml".to_string()));
    assert!(names.contains(&"content.xml".to_string()));

    let mut rescan = create_stripper(&path, false, &options).unwrap();
    assert!(rescan.is_clean());
}

#[test]
fn docx_loses_docprops_and_keeps_relationships() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "report.docx");
    write_docx(&path);

    let options = StripOptions::default();
    let mut stripper = create_stripper(&path, true, &options).unwrap();
    let metadata = stripper.get_meta();
    assert_eq!(
        metadata.get("docProps/core.xml").map(String::as_str),
        Some("harmful content")
    );
    assert!(!stripper.is_clean());
    assert!(stripper.remove_all());
    drop(stripper);

    let names = zip_entry_names(&path);
    assert!(!names.iter().any(|name| name.starts_with("docProps/")));
    assert!(names.contains(&"word/document.xml".to_string()));
    assert!(names.contains(&"word/_rels/document.xml.rels".to_string()));

    let mut rescan = create_stripper(&path, false, &options).unwrap();
    assert!(rescan.is_clean());
}

// ============================================================
// TAR engine
// ============================================================

#[test]
fn tar_gz_zeroes_headers_and_sanitizes_nested_png() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "photos.tar.gz");
    write_dirty_tar_gz(&path, "photo.png", &dirty_png());

    assert!(scrub(&path, &StripOptions::default()));

    let mut archive = tar::Archive::new(GzDecoder::new(File::open(&path).unwrap()));
    let mut seen = 0;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        seen += 1;
        let header = entry.header();
        assert_eq!(header.mtime().unwrap(), 0);
        assert_eq!(header.uid().unwrap(), 0);
        assert_eq!(header.gid().unwrap(), 0);
        assert!(matches!(header.username(), Ok(None) | Ok(Some(""))));
        assert!(matches!(header.groupname(), Ok(None) | Ok(Some(""))));
        assert_eq!(header.mode().unwrap(), 0o644);

        let mut payload = Vec::new();
        entry.read_to_end(&mut payload).unwrap();
        // The nested PNG lost its text chunk.
        assert!(!payload
            .windows(4)
            .any(|window| window == b"tEXt"));
        assert!(payload.starts_with(&[0x89, b'P', b'N', b'G']));
    }
    assert_eq!(seen, 1);
}

#[test]
fn sanitized_tar_gz_reports_clean_and_stays_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "photos.tar.gz");
    write_dirty_tar_gz(&path, "photo.png", &dirty_png());

    let options = StripOptions::default();
    let mut stripper = create_stripper(&path, true, &options).unwrap();
    assert!(!stripper.is_clean());
    assert!(stripper.remove_all());
    drop(stripper);

    let first = fs::read(&path).unwrap();
    let mut rescan = create_stripper(&path, true, &options).unwrap();
    assert!(rescan.is_clean());
    assert!(rescan.remove_all());
    drop(rescan);
    assert_eq!(fs::read(&path).unwrap(), first);
}

#[test]
fn tar_unsupported_entry_is_dropped_without_add2archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "bundle.tar.gz");
    write_dirty_tar_gz(&path, "blob.bin", b"BINDATA-0123");

    let options = StripOptions::default();
    let mut stripper = create_stripper(&path, true, &options).unwrap();
    assert_eq!(stripper.is_clean_listing(), vec!["blob.bin".to_string()]);
    assert!(stripper.remove_all());
    drop(stripper);

    let mut archive = tar::Archive::new(GzDecoder::new(File::open(&path).unwrap()));
    assert_eq!(archive.entries().unwrap().count(), 0);
}

// ============================================================
// Failure semantics
// ============================================================

struct FailingStripper;

impl Stripper for FailingStripper {
    fn get_meta(&mut self) -> Metadata {
        Metadata::new()
    }

    fn is_clean(&mut self) -> bool {
        false
    }

    fn is_clean_listing(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn remove_all(&mut self) -> bool {
        false
    }
}

fn failing_create(
    _path: &Path,
    _writable: bool,
    _options: &StripOptions,
) -> Option<Box<dyn Stripper>> {
    Some(Box::new(FailingStripper))
}

fn never_container(_path: &Path) -> bool {
    false
}

#[test]
fn nested_failure_leaves_the_source_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "dirty.zip");
    write_zip(&path, &[("readme.txt", b"hello")], true);
    let original = fs::read(&path).unwrap();

    let source = SourceFile::create(&path, "application/zip", true, false).unwrap();
    let factory = ChildFactory {
        create: failing_create,
        is_container: never_container,
    };
    let mut stripper = ZipStripper::new(
        source,
        StripOptions::default(),
        ArchivePolicy::default(),
        factory,
    )
    .unwrap();

    assert!(!stripper.remove_all());
    drop(stripper);

    assert_eq!(fs::read(&path).unwrap(), original);
    assert!(!dir.path().join("dirty.zip.bak").exists());
}

#[test]
fn corrupt_archive_fails_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "broken.zip");
    // A ZIP local-header signature with garbage behind it.
    fs::write(&path, b"PK\x03\x04 this is not a real archive").unwrap();
    let original = fs::read(&path).unwrap();

    let options = StripOptions::default();
    if let Some(mut stripper) = create_stripper(&path, true, &options) {
        assert!(!stripper.remove_all());
        assert!(!stripper.is_clean());
    }
    assert_eq!(fs::read(&path).unwrap(), original);
}
