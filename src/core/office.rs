//! Zipped document formats: OpenDocument and Office OpenXML.
//!
//! Both are terminal ZIP archives, so nested entries are never treated as
//! containers. Each format is the generic ZIP engine parameterized with its
//! policy record plus an extra cleanliness condition of its own.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use regex_lite::Regex;
use tracing::{debug, error};
use zip::ZipArchive;

use super::archive::ZipStripper;
use super::error::{StripError, StripResult};
use super::stripper::{ChildFactory, Metadata, SourceFile, Stripper};
use super::types::{ArchivePolicy, StripOptions};

/// An OpenDocument file (`.odt`, `.ods`, `.odp`, `.odg`): a ZIP whose
/// metadata lives in a dedicated `meta.xml` entry.
pub struct OpenDocumentStripper {
    inner: ZipStripper,
}

impl OpenDocumentStripper {
    pub fn new(
        source: SourceFile,
        options: StripOptions,
        factory: ChildFactory,
    ) -> StripResult<Self> {
        let policy = ArchivePolicy {
            ending_blacklist: vec!["meta.xml".to_string()],
            terminal: true,
            ..ArchivePolicy::default()
        };
        Ok(Self {
            inner: ZipStripper::new(source, options, policy, factory)?,
        })
    }

    /// Scrapes the document fields out of `meta.xml`, if present.
    fn document_meta(&self) -> StripResult<Metadata> {
        let mut metadata = Metadata::new();
        let path = self.inner.source().path();
        let file = File::open(path)?;
        let mut archive =
            ZipArchive::new(file).map_err(|err| StripError::container(path, err))?;

        let mut content = String::new();
        match archive.by_name("meta.xml") {
            Ok(mut entry) => {
                entry.read_to_string(&mut content)?;
            }
            Err(_) => {
                debug!(path = %path.display(), "no document metadata entry");
                return Ok(metadata);
            }
        }

        // Fields look like <meta:initial-creator>Jane</meta:initial-creator>
        // or <dc:date>2024-06-01T13:37:00</dc:date>.
        if let Ok(re) = Regex::new(r"<(?:dc|meta):([A-Za-z-]+)[^>]*>([^<]+)</") {
            for caps in re.captures_iter(&content) {
                let field = caps[1].to_string();
                if field == "document-statistic" {
                    continue;
                }
                metadata.insert(field, caps[2].to_string());
            }
        }
        Ok(metadata)
    }
}

impl Stripper for OpenDocumentStripper {
    fn get_meta(&mut self) -> Metadata {
        let mut metadata = self.inner.get_meta();
        match self.document_meta() {
            Ok(extra) => metadata.extend(extra),
            Err(err) => {
                error!(
                    path = %self.inner.source().path().display(),
                    %err,
                    "could not read document metadata"
                );
            }
        }
        metadata
    }

    fn is_clean(&mut self) -> bool {
        if !self.inner.is_clean() {
            return false;
        }
        match zip_has_entry(self.inner.source().path(), |name| name == "meta.xml") {
            Ok(found) => !found,
            Err(err) => {
                error!(
                    path = %self.inner.source().path().display(),
                    %err,
                    "could not check document"
                );
                false
            }
        }
    }

    fn is_clean_listing(&mut self) -> Vec<String> {
        self.inner.is_clean_listing()
    }

    fn remove_all(&mut self) -> bool {
        self.inner.remove_all()
    }
}

/// An Office OpenXML document (`.docx`, `.xlsx`, `.pptx`): a ZIP whose
/// metadata lives under the `docProps/` prefix.
pub struct OpenXmlStripper {
    inner: ZipStripper,
}

impl OpenXmlStripper {
    pub fn new(
        source: SourceFile,
        options: StripOptions,
        factory: ChildFactory,
    ) -> StripResult<Self> {
        let policy = ArchivePolicy {
            beginning_blacklist: vec!["docProps/".to_string()],
            whitelist: vec![".rels".to_string()],
            terminal: true,
            ..ArchivePolicy::default()
        };
        Ok(Self {
            inner: ZipStripper::new(source, options, policy, factory)?,
        })
    }
}

impl Stripper for OpenXmlStripper {
    fn get_meta(&mut self) -> Metadata {
        let mut metadata = self.inner.get_meta();
        match zip_entry_names(self.inner.source().path()) {
            Ok(names) => {
                for name in names {
                    if name.starts_with("docProps/") {
                        metadata.insert(name, "harmful content".to_string());
                    }
                }
            }
            Err(err) => {
                error!(
                    path = %self.inner.source().path().display(),
                    %err,
                    "could not read document metadata"
                );
            }
        }
        metadata
    }

    fn is_clean(&mut self) -> bool {
        if !self.inner.is_clean() {
            return false;
        }
        match zip_has_entry(self.inner.source().path(), |name| {
            name.starts_with("docProps/")
        }) {
            Ok(found) => !found,
            Err(err) => {
                error!(
                    path = %self.inner.source().path().display(),
                    %err,
                    "could not check document"
                );
                false
            }
        }
    }

    fn is_clean_listing(&mut self) -> Vec<String> {
        self.inner.is_clean_listing()
    }

    fn remove_all(&mut self) -> bool {
        self.inner.remove_all()
    }
}

fn zip_entry_names(path: &Path) -> StripResult<Vec<String>> {
    let file = File::open(path)?;
    let archive = ZipArchive::new(file).map_err(|err| StripError::container(path, err))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

fn zip_has_entry(path: &Path, predicate: impl Fn(&str) -> bool) -> StripResult<bool> {
    Ok(zip_entry_names(path)?.iter().any(|name| predicate(name)))
}
