//! Format registry and stripper factory.
//!
//! The registry is an immutable table built into the binary; detection is
//! magic-byte sniffing with an extension fallback. Handlers never reach back
//! into this module — they receive [`CHILD_FACTORY`] at construction time.

use std::path::Path;

use tracing::{debug, error};

use super::archive::{TarStripper, ZipStripper};
use super::error::StripResult;
use super::image::{JpegStripper, PngStripper};
use super::office::{OpenDocumentStripper, OpenXmlStripper};
use super::stripper::{ChildFactory, SourceFile, Stripper};
use super::types::{ArchivePolicy, Compression, FormatInfo, StripOptions};

#[derive(Debug, Clone, Copy)]
enum Engine {
    Zip,
    Tar(Compression),
    OpenDocument,
    OpenXml,
    Png,
    Jpeg,
}

struct Format {
    mime: &'static str,
    extension: &'static str,
    description: &'static str,
    engine: Engine,
    container: bool,
}

const REGISTRY: &[Format] = &[
    Format {
        mime: "application/zip",
        extension: "zip",
        description: "ZIP archive",
        engine: Engine::Zip,
        container: true,
    },
    Format {
        mime: "application/x-tar",
        extension: "tar",
        description: "POSIX tar archive",
        engine: Engine::Tar(Compression::None),
        container: true,
    },
    Format {
        mime: "application/gzip",
        extension: "tar.gz",
        description: "gzip-compressed tar archive",
        engine: Engine::Tar(Compression::Gzip),
        container: true,
    },
    Format {
        mime: "application/x-bzip2",
        extension: "tar.bz2",
        description: "bzip2-compressed tar archive",
        engine: Engine::Tar(Compression::Bzip2),
        container: true,
    },
    Format {
        mime: "application/vnd.oasis.opendocument.text",
        extension: "odt",
        description: "OpenDocument text",
        engine: Engine::OpenDocument,
        container: true,
    },
    Format {
        mime: "application/vnd.oasis.opendocument.spreadsheet",
        extension: "ods",
        description: "OpenDocument spreadsheet",
        engine: Engine::OpenDocument,
        container: true,
    },
    Format {
        mime: "application/vnd.oasis.opendocument.presentation",
        extension: "odp",
        description: "OpenDocument presentation",
        engine: Engine::OpenDocument,
        container: true,
    },
    Format {
        mime: "application/vnd.oasis.opendocument.graphics",
        extension: "odg",
        description: "OpenDocument drawing",
        engine: Engine::OpenDocument,
        container: true,
    },
    Format {
        mime: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        extension: "docx",
        description: "Office OpenXML document",
        engine: Engine::OpenXml,
        container: true,
    },
    Format {
        mime: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        extension: "xlsx",
        description: "Office OpenXML spreadsheet",
        engine: Engine::OpenXml,
        container: true,
    },
    Format {
        mime: "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        extension: "pptx",
        description: "Office OpenXML presentation",
        engine: Engine::OpenXml,
        container: true,
    },
    Format {
        mime: "image/png",
        extension: "png",
        description: "PNG image",
        engine: Engine::Png,
        container: false,
    },
    Format {
        mime: "image/jpeg",
        extension: "jpg",
        description: "JPEG image",
        engine: Engine::Jpeg,
        container: false,
    },
];

/// Builds a stripper for `path`, or `None` when its format is unsupported
/// or harmless. Initialization failures are logged and reported as `None`.
pub fn create_stripper(
    path: &Path,
    writable: bool,
    options: &StripOptions,
) -> Option<Box<dyn Stripper>> {
    if !path.is_file() {
        debug!(path = %path.display(), "not a regular file");
        return None;
    }
    let mime = detect_mime(path)?;
    let format = lookup(&mime)?;
    match build(format, &mime, path, writable, options) {
        Ok(stripper) => Some(stripper),
        Err(err) => {
            error!(path = %path.display(), %err, "could not initialize stripper");
            None
        }
    }
}

/// Whether the file at `path` would resolve to a container stripper.
pub fn is_container(path: &Path) -> bool {
    detect_mime(path)
        .as_deref()
        .and_then(lookup)
        .is_some_and(|format| format.container)
}

/// The constructor pair handed to container strippers.
pub const CHILD_FACTORY: ChildFactory = ChildFactory {
    create: create_stripper,
    is_container,
};

/// Enumerates the supported formats for UI collaborators.
pub fn list_supported_formats() -> Vec<FormatInfo> {
    REGISTRY
        .iter()
        .map(|format| FormatInfo {
            mime: format.mime,
            extension: format.extension,
            description: format.description,
        })
        .collect()
}

fn build(
    format: &Format,
    mime: &str,
    path: &Path,
    writable: bool,
    options: &StripOptions,
) -> StripResult<Box<dyn Stripper>> {
    let source = SourceFile::create(path, mime, writable, options.backup)?;
    Ok(match format.engine {
        Engine::Zip => Box::new(ZipStripper::new(
            source,
            options.clone(),
            ArchivePolicy::default(),
            CHILD_FACTORY,
        )?),
        Engine::Tar(compression) => Box::new(TarStripper::new(
            source,
            options.clone(),
            compression,
            Vec::new(),
            CHILD_FACTORY,
        )?),
        Engine::OpenDocument => Box::new(OpenDocumentStripper::new(
            source,
            options.clone(),
            CHILD_FACTORY,
        )?),
        Engine::OpenXml => Box::new(OpenXmlStripper::new(
            source,
            options.clone(),
            CHILD_FACTORY,
        )?),
        Engine::Png => Box::new(PngStripper::new(source)),
        Engine::Jpeg => Box::new(JpegStripper::new(source)),
    })
}

fn lookup(mime: &str) -> Option<&'static Format> {
    let canonical = canonical_mime(mime);
    REGISTRY.iter().find(|format| format.mime == canonical)
}

fn canonical_mime(mime: &str) -> &str {
    match mime {
        "application/x-gzip" => "application/gzip",
        "application/x-bzip" => "application/x-bzip2",
        _ => mime,
    }
}

/// Detects the media type: magic bytes first, extension table as fallback.
/// A generic ZIP match is refined by the extension when it names a
/// ZIP-based document format.
fn detect_mime(path: &Path) -> Option<String> {
    let sniffed = infer::get_from_path(path)
        .ok()
        .flatten()
        .map(|kind| canonical_mime(kind.mime_type()).to_string());
    let by_extension = extension_mime(path);
    match (sniffed, by_extension) {
        (Some(mime), Some(specific)) if mime == "application/zip" && is_zip_based(specific) => {
            Some(specific.to_string())
        }
        (Some(mime), _) => Some(mime),
        (None, Some(mime)) => Some(mime.to_string()),
        (None, None) => None,
    }
}

fn is_zip_based(mime: &str) -> bool {
    mime.starts_with("application/vnd.oasis.opendocument")
        || mime.starts_with("application/vnd.openxmlformats-officedocument")
}

fn extension_mime(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        "bz2" | "tbz2" => "application/x-bzip2",
        "odt" => "application/vnd.oasis.opendocument.text",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "odp" => "application/vnd.oasis.opendocument.presentation",
        "odg" => "application/vnd.oasis.opendocument.graphics",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn registry_lists_every_format_once() {
        let formats = list_supported_formats();
        assert!(formats.iter().any(|f| f.extension == "zip"));
        assert!(formats.iter().any(|f| f.extension == "tar.gz"));
        assert!(formats.iter().any(|f| f.extension == "docx"));
        let mut mimes: Vec<_> = formats.iter().map(|f| f.mime).collect();
        mimes.sort_unstable();
        mimes.dedup();
        assert_eq!(mimes.len(), formats.len());
    }

    #[test]
    fn extension_fallback_covers_the_registry() {
        assert_eq!(
            extension_mime(Path::new("a.ODT")),
            Some("application/vnd.oasis.opendocument.text")
        );
        assert_eq!(extension_mime(Path::new("a.tgz")), Some("application/gzip"));
        assert_eq!(extension_mime(Path::new("a.jpeg")), Some("image/jpeg"));
        assert_eq!(extension_mime(Path::new("a.pdf")), None);
    }

    #[test]
    fn gzip_aliases_share_an_engine() {
        assert!(lookup("application/x-gzip").is_some());
        assert!(lookup("application/gzip").is_some());
        assert!(lookup("text/plain").is_none());
    }

    #[test]
    fn unsupported_files_yield_no_stripper() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "plain text").unwrap();

        let options = StripOptions::default();
        assert!(create_stripper(&path, true, &options).is_none());
        assert!(!is_container(&path));
    }

    #[test]
    fn zip_magic_is_refined_by_document_extension() {
        let dir = tempfile::tempdir().unwrap();
        // A plain empty zip named .zip stays a zip...
        let zip_path = dir.path().join("bundle.zip");
        let file = fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("payload.bin", zip::write::SimpleFileOptions::default())
            .unwrap();
        std::io::Write::write_all(&mut writer, b"payload").unwrap();
        writer.finish().unwrap();
        assert_eq!(detect_mime(&zip_path).as_deref(), Some("application/zip"));

        // ...while the same bytes named .odt resolve to the document format.
        let odt_path = dir.path().join("report.odt");
        fs::copy(&zip_path, &odt_path).unwrap();
        assert_eq!(
            detect_mime(&odt_path).as_deref(),
            Some("application/vnd.oasis.opendocument.text")
        );
    }
}
