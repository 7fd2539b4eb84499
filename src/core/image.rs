//! Leaf strippers for raster image formats.
//!
//! PNG metadata travels in dedicated ancillary chunks, JPEG metadata in
//! application segments; both can be filtered out without touching the
//! pixel data, so the sanitized output stays decodable by any reader.

use std::fs;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use tracing::{debug, error, info};

use super::error::{StripError, StripResult};
use super::stripper::{Metadata, SourceFile, Stripper};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Ancillary chunk types that carry metadata and are dropped wholesale.
const PNG_METADATA_CHUNKS: [&[u8; 4]; 5] = [b"tEXt", b"zTXt", b"iTXt", b"tIME", b"eXIf"];

/// One PNG chunk: its type, payload, and the raw bytes (length word through
/// CRC) so retained chunks can be copied verbatim.
struct PngChunk {
    kind: [u8; 4],
    data: Vec<u8>,
    raw: Vec<u8>,
}

impl PngChunk {
    fn is_metadata(&self) -> bool {
        PNG_METADATA_CHUNKS.contains(&&self.kind)
    }
}

/// A PNG image being sanitized.
pub struct PngStripper {
    source: SourceFile,
}

impl PngStripper {
    pub fn new(source: SourceFile) -> Self {
        Self { source }
    }

    fn read_chunks(&self) -> StripResult<Vec<PngChunk>> {
        let data = fs::read(self.source.path())?;
        if !data.starts_with(&PNG_SIGNATURE) {
            return Err(StripError::container(
                self.source.path(),
                "missing png signature",
            ));
        }
        let mut chunks = Vec::new();
        let mut offset = PNG_SIGNATURE.len();
        loop {
            if offset + 8 > data.len() {
                return Err(StripError::container(
                    self.source.path(),
                    "truncated chunk header",
                ));
            }
            let length = (&data[offset..]).read_u32::<BigEndian>()? as usize;
            let mut kind = [0u8; 4];
            kind.copy_from_slice(&data[offset + 4..offset + 8]);
            let end = offset + 12 + length;
            if end > data.len() {
                return Err(StripError::container(
                    self.source.path(),
                    "truncated chunk payload",
                ));
            }
            chunks.push(PngChunk {
                kind,
                data: data[offset + 8..offset + 8 + length].to_vec(),
                raw: data[offset..end].to_vec(),
            });
            if &kind == b"IEND" {
                // Anything after IEND is undeclared payload; drop it.
                if end < data.len() {
                    debug!(
                        path = %self.source.path().display(),
                        trailing = data.len() - end,
                        "bytes after IEND will be dropped"
                    );
                }
                return Ok(chunks);
            }
            offset = end;
        }
    }

    fn try_remove_all(&mut self) -> StripResult<()> {
        self.source.ensure_writable()?;
        let chunks = self.read_chunks()?;
        let mut out = self.source.output_file()?;
        out.write_all(&PNG_SIGNATURE)?;
        for chunk in &chunks {
            if chunk.is_metadata() {
                debug!(
                    kind = %String::from_utf8_lossy(&chunk.kind),
                    "metadata chunk dropped"
                );
                continue;
            }
            out.write_all(&chunk.raw)?;
        }
        out.flush()?;
        info!(path = %self.source.path().display(), "image rewritten");
        self.source.publish()
    }

    fn try_get_meta(&self) -> StripResult<Metadata> {
        let mut metadata = Metadata::new();
        for chunk in self.read_chunks()? {
            match &chunk.kind {
                b"tEXt" => {
                    let (keyword, value) = split_keyword(&chunk.data);
                    metadata.insert(keyword, String::from_utf8_lossy(value).into_owned());
                }
                b"zTXt" => {
                    let (keyword, rest) = split_keyword(&chunk.data);
                    // One method byte, then a zlib stream.
                    let value = rest
                        .split_first()
                        .map(|(_, compressed)| inflate_text(compressed))
                        .unwrap_or_else(|| "(empty)".to_string());
                    metadata.insert(keyword, value);
                }
                b"iTXt" => {
                    let (keyword, rest) = split_keyword(&chunk.data);
                    metadata.insert(keyword, international_text(rest));
                }
                b"tIME" => {
                    if chunk.data.len() >= 7 {
                        let year = (&chunk.data[..2]).read_u16::<BigEndian>().unwrap_or(0);
                        metadata.insert(
                            "modification-time".to_string(),
                            format!(
                                "{year:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                                chunk.data[2],
                                chunk.data[3],
                                chunk.data[4],
                                chunk.data[5],
                                chunk.data[6]
                            ),
                        );
                    }
                }
                b"eXIf" => {
                    metadata.insert(
                        "exif".to_string(),
                        format!("{} bytes of exif data", chunk.data.len()),
                    );
                }
                _ => {}
            }
        }
        Ok(metadata)
    }
}

impl Stripper for PngStripper {
    fn get_meta(&mut self) -> Metadata {
        self.try_get_meta().unwrap_or_else(|err| {
            error!(path = %self.source.path().display(), %err, "could not read image metadata");
            Metadata::new()
        })
    }

    fn is_clean(&mut self) -> bool {
        match self.read_chunks() {
            Ok(chunks) => chunks.iter().all(|chunk| !chunk.is_metadata()),
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "could not check image");
                false
            }
        }
    }

    fn is_clean_listing(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn remove_all(&mut self) -> bool {
        match self.try_remove_all() {
            Ok(()) => true,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "failed to sanitize image");
                false
            }
        }
    }
}

/// Splits a PNG text payload at its keyword terminator.
fn split_keyword(data: &[u8]) -> (String, &[u8]) {
    match data.iter().position(|&b| b == 0) {
        Some(nul) => (
            String::from_utf8_lossy(&data[..nul]).into_owned(),
            &data[nul + 1..],
        ),
        None => (String::from_utf8_lossy(data).into_owned(), &[]),
    }
}

fn inflate_text(compressed: &[u8]) -> String {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut text = String::new();
    match decoder.read_to_string(&mut text) {
        Ok(_) => text,
        Err(_) => "(unreadable compressed text)".to_string(),
    }
}

/// Renders an iTXt payload after the keyword: compression flag and method,
/// language tag, translated keyword, then the text itself.
fn international_text(rest: &[u8]) -> String {
    if rest.len() < 2 {
        return "(empty)".to_string();
    }
    let compressed = rest[0] == 1;
    let mut fields = rest[2..].splitn(3, |&b| b == 0);
    let _language = fields.next();
    let _translated = fields.next();
    match fields.next() {
        Some(text) if compressed => inflate_text(text),
        Some(text) => String::from_utf8_lossy(text).into_owned(),
        None => "(empty)".to_string(),
    }
}

const JPEG_SOI: [u8; 2] = [0xff, 0xd8];
const MARKER_APP0: u8 = 0xe0;
const MARKER_APP15: u8 = 0xef;
const MARKER_COM: u8 = 0xfe;
const MARKER_SOS: u8 = 0xda;
const MARKER_EOI: u8 = 0xd9;

/// One JPEG segment before the scan data: marker plus the raw bytes
/// (marker through payload).
struct JpegSegment {
    marker: u8,
    raw_start: usize,
    raw_end: usize,
}

impl JpegSegment {
    /// Application segments above APP0 and comments carry metadata.
    fn is_metadata(&self) -> bool {
        (self.marker > MARKER_APP0 && self.marker <= MARKER_APP15) || self.marker == MARKER_COM
    }
}

/// A JPEG image being sanitized.
pub struct JpegStripper {
    source: SourceFile,
}

impl JpegStripper {
    pub fn new(source: SourceFile) -> Self {
        Self { source }
    }

    /// Walks the segment stream up to (not including) start-of-scan.
    /// Returns the segments and the offset of the scan data.
    fn read_segments(&self, data: &[u8]) -> StripResult<(Vec<JpegSegment>, usize)> {
        if !data.starts_with(&JPEG_SOI) {
            return Err(StripError::container(
                self.source.path(),
                "missing jpeg start-of-image marker",
            ));
        }
        let mut segments = Vec::new();
        let mut offset = 2;
        loop {
            // Skip fill bytes between segments.
            while offset < data.len() && data[offset] == 0xff
                && data.get(offset + 1) == Some(&0xff)
            {
                offset += 1;
            }
            if offset + 2 > data.len() {
                return Err(StripError::container(
                    self.source.path(),
                    "truncated segment stream",
                ));
            }
            if data[offset] != 0xff {
                return Err(StripError::container(
                    self.source.path(),
                    "malformed segment marker",
                ));
            }
            let marker = data[offset + 1];
            match marker {
                MARKER_SOS => return Ok((segments, offset)),
                MARKER_EOI => {
                    return Err(StripError::container(
                        self.source.path(),
                        "end-of-image before scan data",
                    ))
                }
                // Standalone markers carry no length word.
                0x01 | 0xd0..=0xd7 => {
                    segments.push(JpegSegment {
                        marker,
                        raw_start: offset,
                        raw_end: offset + 2,
                    });
                    offset += 2;
                }
                _ => {
                    if offset + 4 > data.len() {
                        return Err(StripError::container(
                            self.source.path(),
                            "truncated segment header",
                        ));
                    }
                    let length = (&data[offset + 2..]).read_u16::<BigEndian>()? as usize;
                    let end = offset + 2 + length;
                    if length < 2 || end > data.len() {
                        return Err(StripError::container(
                            self.source.path(),
                            "segment length out of bounds",
                        ));
                    }
                    segments.push(JpegSegment {
                        marker,
                        raw_start: offset,
                        raw_end: end,
                    });
                    offset = end;
                }
            }
        }
    }

    fn try_remove_all(&mut self) -> StripResult<()> {
        self.source.ensure_writable()?;
        let data = fs::read(self.source.path())?;
        let (segments, scan_start) = self.read_segments(&data)?;

        let mut out = self.source.output_file()?;
        out.write_all(&JPEG_SOI)?;
        for segment in &segments {
            if segment.is_metadata() {
                debug!(marker = format!("0x{:02x}", segment.marker), "metadata segment dropped");
                continue;
            }
            out.write_all(&data[segment.raw_start..segment.raw_end])?;
        }
        // Entropy-coded data escapes every 0xff byte, so the first unescaped
        // EOI marker really ends the image; trailing bytes are dropped.
        let scan_end = find_eoi(&data, scan_start).unwrap_or(data.len());
        out.write_all(&data[scan_start..scan_end])?;
        out.flush()?;
        info!(path = %self.source.path().display(), "image rewritten");
        self.source.publish()
    }

    fn try_get_meta(&self) -> StripResult<Metadata> {
        let data = fs::read(self.source.path())?;
        let (segments, _) = self.read_segments(&data)?;
        let mut metadata = Metadata::new();
        for segment in &segments {
            if !segment.is_metadata() {
                continue;
            }
            let payload = &data[segment.raw_start + 4..segment.raw_end];
            if segment.marker == MARKER_COM {
                metadata.insert(
                    "comment".to_string(),
                    String::from_utf8_lossy(payload).into_owned(),
                );
            } else {
                let app = segment.marker - MARKER_APP0;
                metadata.insert(format!("app{app}"), describe_app_payload(payload));
            }
        }
        Ok(metadata)
    }
}

impl Stripper for JpegStripper {
    fn get_meta(&mut self) -> Metadata {
        self.try_get_meta().unwrap_or_else(|err| {
            error!(path = %self.source.path().display(), %err, "could not read image metadata");
            Metadata::new()
        })
    }

    fn is_clean(&mut self) -> bool {
        let data = match fs::read(self.source.path()) {
            Ok(data) => data,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "could not check image");
                return false;
            }
        };
        match self.read_segments(&data) {
            Ok((segments, _)) => segments.iter().all(|segment| !segment.is_metadata()),
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "could not check image");
                false
            }
        }
    }

    fn is_clean_listing(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn remove_all(&mut self) -> bool {
        match self.try_remove_all() {
            Ok(()) => true,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "failed to sanitize image");
                false
            }
        }
    }
}

/// Finds the offset just past the end-of-image marker in the scan data.
fn find_eoi(data: &[u8], from: usize) -> Option<usize> {
    let mut offset = from;
    while offset + 1 < data.len() {
        if data[offset] == 0xff && data[offset + 1] == MARKER_EOI {
            return Some(offset + 2);
        }
        offset += 1;
    }
    None
}

/// Labels a metadata segment payload by its preamble.
fn describe_app_payload(payload: &[u8]) -> String {
    if payload.starts_with(b"Exif\0\0") {
        format!("{} bytes of exif data", payload.len())
    } else if payload.starts_with(b"http://ns.adobe.com/xap/1.0/") {
        "xmp packet".to_string()
    } else if payload.starts_with(b"ICC_PROFILE") {
        "icc color profile".to_string()
    } else if payload.starts_with(b"Photoshop 3.0") {
        "photoshop image resources".to_string()
    } else {
        format!("{} bytes of application data", payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::path::Path;

    fn crc32(bytes: &[u8]) -> u32 {
        // Table-free bitwise CRC-32 over the chunk type and data, as PNG
        // defines it; fine for the handful of bytes in fixtures.
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
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(data.len() as u32).unwrap();
        out.extend_from_slice(kind);
        out.extend_from_slice(data);
        let mut checked = kind.to_vec();
        checked.extend_from_slice(data);
        out.write_u32::<BigEndian>(crc32(&checked)).unwrap();
        out
    }

    fn tiny_png_with_text(comment: &[u8]) -> Vec<u8> {
        let mut png = PNG_SIGNATURE.to_vec();
        // 1x1 grayscale, bit depth 8.
        png.extend(png_chunk(
            b"IHDR",
            &[0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0],
        ));
        png.extend(png_chunk(b"tEXt", comment));
        png.extend(png_chunk(
            b"IDAT",
            &[0x78, 0x9c, 0x62, 0x60, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01],
        ));
        png.extend(png_chunk(b"IEND", &[]));
        png
    }

    fn png_source(path: &Path, writable: bool) -> SourceFile {
        SourceFile::create(path, "image/png", writable, false).unwrap()
    }

    #[test]
    fn png_text_chunk_is_reported_and_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let png = tiny_png_with_text(b"Author\0Jane Doe");
        let path = dir.path().join("photo.png");
        fs::write(&path, &png).unwrap();

        let mut stripper = PngStripper::new(png_source(&path, true));
        let meta = stripper.get_meta();
        assert_eq!(meta.get("Author").map(String::as_str), Some("Jane Doe"));
        assert!(!stripper.is_clean());

        assert!(stripper.remove_all());
        let mut rescan = PngStripper::new(png_source(&path, false));
        assert!(rescan.is_clean());
        assert!(rescan.get_meta().is_empty());
    }

    #[test]
    fn png_pixel_chunks_survive_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let png = tiny_png_with_text(b"Software\0leaky-editor 1.0");
        let path = dir.path().join("photo.png");
        fs::write(&path, &png).unwrap();

        let mut stripper = PngStripper::new(png_source(&path, true));
        assert!(stripper.remove_all());

        // Byte-identical to a PNG that never carried the text chunk.
        let mut without_text = PNG_SIGNATURE.to_vec();
        without_text.extend(png_chunk(
            b"IHDR",
            &[0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0],
        ));
        without_text.extend(png_chunk(
            b"IDAT",
            &[0x78, 0x9c, 0x62, 0x60, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01],
        ));
        without_text.extend(png_chunk(b"IEND", &[]));
        assert_eq!(fs::read(&path).unwrap(), without_text);
    }

    #[test]
    fn jpeg_app1_and_comment_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let mut jpeg = JPEG_SOI.to_vec();
        // APP0/JFIF stays.
        jpeg.extend([0xff, 0xe0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0x00]);
        // APP1/Exif goes.
        jpeg.extend([0xff, 0xe1, 0x00, 0x08, b'E', b'x', b'i', b'f', 0x00, 0x00]);
        // Comment goes.
        jpeg.extend([0xff, 0xfe, 0x00, 0x07, b'h', b'e', b'l', b'l', b'o']);
        // Minimal scan data followed by EOI.
        jpeg.extend([0xff, 0xda, 0x00, 0x04, 0x00, 0x00, 0x12, 0x34, 0xff, 0xd9]);

        let path = dir.path().join("photo.jpg");
        fs::write(&path, &jpeg).unwrap();

        let mut stripper = JpegStripper::new(
            SourceFile::create(&path, "image/jpeg", true, false).unwrap(),
        );
        let meta = stripper.get_meta();
        assert_eq!(meta.get("comment").map(String::as_str), Some("hello"));
        assert!(meta.contains_key("app1"));
        assert!(!stripper.is_clean());

        assert!(stripper.remove_all());
        let sanitized = fs::read(&path).unwrap();
        let mut expected = JPEG_SOI.to_vec();
        expected.extend([0xff, 0xe0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0x00]);
        expected.extend([0xff, 0xda, 0x00, 0x04, 0x00, 0x00, 0x12, 0x34, 0xff, 0xd9]);
        assert_eq!(sanitized, expected);

        let mut rescan = JpegStripper::new(
            SourceFile::create(&path, "image/jpeg", false, false).unwrap(),
        );
        assert!(rescan.is_clean());
    }
}
