//! Type definitions shared across the sanitizer core.

/// Options controlling a sanitization run.
///
/// Passed to the factory and carried by every handle. Nested strippers
/// created during archive recursion inherit these options with `backup`
/// forced off, so a child publishes directly over its extracted file.
#[derive(Debug, Clone, Default)]
pub struct StripOptions {
    /// Keep the original next to the sanitized file as `<name>.bak`.
    pub backup: bool,
    /// Re-add archive entries of unsupported or unknown format instead of
    /// dropping them.
    pub add2archive: bool,
    /// Forwarded to the PDF handler; the core records and ignores it.
    pub low_pdf_quality: bool,
}

impl StripOptions {
    /// Sets backup mode.
    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    /// Sets whether unsupported entries are kept in rebuilt archives.
    pub fn with_add2archive(mut self, add2archive: bool) -> Self {
        self.add2archive = add2archive;
        self
    }

    /// Returns the options a nested stripper is constructed with.
    pub fn for_child(&self) -> Self {
        Self {
            backup: false,
            ..self.clone()
        }
    }
}

/// Per-archive policy hooks that parameterize the rebuild engines.
///
/// Format-specific behavior (OpenDocument, Office OpenXML) is expressed as a
/// value of this record rather than by subclassing the engines.
#[derive(Debug, Clone, Default)]
pub struct ArchivePolicy {
    /// Entry names that are always re-added even if their format is
    /// unsupported.
    pub whitelist: Vec<String>,
    /// Entries whose name starts with one of these prefixes are dropped.
    pub beginning_blacklist: Vec<String>,
    /// Entries whose name ends with one of these suffixes are dropped.
    pub ending_blacklist: Vec<String>,
    /// Entries of this archive are never treated as containers themselves.
    pub terminal: bool,
}

/// Stream compression wrapped around a tar archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Plain uncompressed tar.
    #[default]
    None,
    /// Gzip-compressed stream (`.tar.gz`).
    Gzip,
    /// Bzip2-compressed stream (`.tar.bz2`).
    Bzip2,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Bzip2 => write!(f, "bzip2"),
        }
    }
}

/// One supported format, as reported to UI collaborators.
#[derive(Debug, Clone)]
pub struct FormatInfo {
    pub mime: &'static str,
    pub extension: &'static str,
    pub description: &'static str,
}
