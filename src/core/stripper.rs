//! The stripper capability and the plumbing shared by every handler.
//!
//! A handler owns a [`SourceFile`]: the path being sanitized plus an
//! exclusively created temp file that receives the sanitized artifact.
//! Nothing touches the source until [`SourceFile::publish`] swaps the output
//! in; an unpublished output is overwritten with zeros before its temp file
//! is unlinked.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile, TempDir};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use super::error::{StripError, StripResult};
use super::secure::{overwrite_with_zeros, secure_remove};
use super::types::StripOptions;

/// Key/value view of a file's metadata.
pub type Metadata = BTreeMap<String, String>;

/// The capability every format handler satisfies, leaf or container.
pub trait Stripper {
    /// Returns the metadata fields currently present in the file. An empty
    /// mapping means nothing harmful was detected.
    fn get_meta(&mut self) -> Metadata;

    /// True iff the file contains no harmful metadata.
    fn is_clean(&mut self) -> bool;

    /// Names of entries whose format is unsupported or unknown. Meaningful
    /// only for containers; leaves return an empty sequence.
    fn is_clean_listing(&mut self) -> Vec<String>;

    /// Produces a sanitized sibling and publishes it over the source.
    /// Returns true on success; on failure the source is left untouched.
    fn remove_all(&mut self) -> bool;
}

/// Constructors injected into container strippers so nested entries can be
/// dispatched without the handlers naming the registry.
#[derive(Clone, Copy)]
pub struct ChildFactory {
    /// Builds a stripper for an extracted entry, or `None` when the entry's
    /// format is unsupported or harmless.
    pub create: fn(&Path, bool, &StripOptions) -> Option<Box<dyn Stripper>>,
    /// Whether the file at this path would resolve to a container stripper.
    pub is_container: fn(&Path) -> bool,
}

/// Extensions that cannot carry metadata. Matching archive entries bypass
/// re-sanitization but are still re-added with a normalized envelope.
pub const NOMETA: [&str; 5] = [".bmp", ".rdf", ".txt", ".xml", ".rels"];

/// Whether the path's extension is in the known-harmless set.
pub fn is_nometa(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => NOMETA.iter().any(|known| &known[1..] == ext),
        None => false,
    }
}

/// The file being sanitized, plus the exclusive temp file that receives the
/// sanitized artifact.
pub struct SourceFile {
    path: PathBuf,
    mime: String,
    writable: bool,
    backup: bool,
    output: Option<NamedTempFile>,
}

impl SourceFile {
    /// Creates a handle for `path`, allocating its output temp file.
    pub fn create(path: &Path, mime: &str, writable: bool, backup: bool) -> StripResult<Self> {
        if !path.exists() {
            return Err(StripError::PathNotFound(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(StripError::NotAFile(path.to_path_buf()));
        }
        let output = Builder::new().prefix("metascrub-").tempfile()?;
        Ok(Self {
            path: path.to_path_buf(),
            mime: mime.to_string(),
            writable,
            backup,
            output: Some(output),
        })
    }

    /// Path to the file being sanitized.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detected media type of the source.
    pub fn mime(&self) -> &str {
        &self.mime
    }

    /// Whether the source may be replaced.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Fails unless the source may be replaced.
    pub fn ensure_writable(&self) -> StripResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StripError::NotWritable(self.path.clone()))
        }
    }

    /// Path of the output temp file.
    pub fn output_path(&self) -> StripResult<&Path> {
        self.output
            .as_ref()
            .map(NamedTempFile::path)
            .ok_or_else(|| StripError::publish(&self.path, "output already published"))
    }

    /// Returns a truncated, rewound handle on the output temp file.
    pub fn output_file(&self) -> StripResult<File> {
        let tmp = self
            .output
            .as_ref()
            .ok_or_else(|| StripError::publish(&self.path, "output already published"))?;
        let mut file = tmp.as_file().try_clone()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    /// Atomically replaces the source with the sanitized output.
    ///
    /// With `backup` the original is renamed aside as `<name>.bak` first;
    /// otherwise it is secure-removed. Any failure leaves the output temp
    /// file in place and, where possible, restores the source.
    pub fn publish(&mut self) -> StripResult<()> {
        let output = self
            .output
            .take()
            .ok_or_else(|| StripError::publish(&self.path, "output already published"))?;
        let backup_path = sibling_with_suffix(&self.path, ".bak");

        if self.backup {
            if let Err(err) = fs::rename(&self.path, &backup_path) {
                self.output = Some(output);
                return Err(StripError::publish(&self.path, err));
            }
        } else if let Err(err) = secure_remove(&self.path) {
            self.output = Some(output);
            return Err(StripError::publish(&self.path, err));
        }

        match output.persist(&self.path) {
            Ok(_) => Ok(()),
            Err(persist_err) => {
                // The temp directory may live on a different filesystem than
                // the source; fall back to copy-then-remove.
                let tmp = persist_err.file;
                match fs::copy(tmp.path(), &self.path) {
                    Ok(_) => {
                        wipe_tempfile(tmp);
                        Ok(())
                    }
                    Err(copy_err) => {
                        if self.backup {
                            if let Err(restore_err) = fs::rename(&backup_path, &self.path) {
                                error!(
                                    path = %self.path.display(),
                                    %restore_err,
                                    "could not restore backup after failed publication"
                                );
                            }
                        }
                        self.output = Some(tmp);
                        Err(StripError::publish(&self.path, copy_err))
                    }
                }
            }
        }
    }
}

impl Drop for SourceFile {
    fn drop(&mut self) {
        if let Some(tmp) = self.output.take() {
            wipe_tempfile(tmp);
        }
    }
}

/// Appends `suffix` to the file name, keeping the parent directory.
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Overwrites an unpublished temp file before its handle unlinks it.
fn wipe_tempfile(tmp: NamedTempFile) {
    if let Err(err) = overwrite_with_zeros(tmp.as_file()) {
        warn!(
            path = %tmp.path().display(),
            %err,
            "could not overwrite temp file before removal"
        );
    }
}

/// Exclusive temporary directory that archive strippers extract entries
/// into. One per recursion frame, so nested rebuilds never collide.
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new() -> StripResult<Self> {
        let dir = Builder::new().prefix("metascrub-").tempdir()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for ScratchDir {
    /// Secure-removes every regular file below the scratch directory; the
    /// inner temp dir then removes what is left of the tree.
    fn drop(&mut self) {
        for entry in WalkDir::new(self.dir.path())
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if entry.file_type().is_file() {
                if let Err(err) = secure_remove(entry.path()) {
                    debug!(
                        path = %entry.path().display(),
                        %err,
                        "could not secure-remove scratch file"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn nometa_matches_known_extensions() {
        assert!(is_nometa(Path::new("word/document.xml")));
        assert!(is_nometa(Path::new("word/_rels/document.xml.rels")));
        assert!(is_nometa(Path::new("notes.txt")));
        assert!(!is_nometa(Path::new("photo.png")));
        assert!(!is_nometa(Path::new("mimetype")));
        // A bare ".rels" has no extension, only a hidden-file name.
        assert!(!is_nometa(Path::new("_rels/.rels")));
    }

    #[test]
    fn backup_suffix_appends_to_the_file_name() {
        let path = sibling_with_suffix(Path::new("/tmp/report.odt"), ".bak");
        assert_eq!(path, PathBuf::from("/tmp/report.odt.bak"));
    }

    #[test]
    fn publish_replaces_source_and_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        fs::write(&path, b"original").unwrap();

        let mut source = SourceFile::create(&path, "application/octet-stream", true, true).unwrap();
        source.output_file().unwrap().write_all(b"sanitized").unwrap();
        source.publish().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"sanitized");
        assert_eq!(
            fs::read(dir.path().join("doc.bin.bak")).unwrap(),
            b"original"
        );
    }

    #[test]
    fn publish_without_backup_removes_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        fs::write(&path, b"original").unwrap();

        let mut source =
            SourceFile::create(&path, "application/octet-stream", true, false).unwrap();
        source.output_file().unwrap().write_all(b"sanitized").unwrap();
        source.publish().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"sanitized");
        assert!(!dir.path().join("doc.bin.bak").exists());
    }

    #[test]
    fn dropping_an_unpublished_handle_leaves_source_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        fs::write(&path, b"original").unwrap();

        {
            let source =
                SourceFile::create(&path, "application/octet-stream", true, false).unwrap();
            source.output_file().unwrap().write_all(b"partial").unwrap();
        }

        assert_eq!(fs::read(&path).unwrap(), b"original");
    }
}
