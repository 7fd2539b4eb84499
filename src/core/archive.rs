//! Container rebuild engines for ZIP and tar archives.
//!
//! Both engines share the same shape: extract each entry into the handle's
//! scratch directory, dispatch a nested stripper through the injected
//! factory, then re-pack the sanitized bytes under a normalized envelope.
//! Entries come out in input order; a nested failure aborts the rebuild and
//! leaves the source untouched.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, error, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::envelope;
use super::error::{StripError, StripResult};
use super::stripper::{
    is_nometa, ChildFactory, Metadata, ScratchDir, SourceFile, Stripper,
};
use super::types::{ArchivePolicy, Compression, StripOptions};

/// Entry basenames the ZIP cleanliness check tolerates even though their
/// format is unsupported (structural files of zipped document formats).
const CLEAN_BASENAMES: [&str; 2] = ["mimetype", ".rels"];

/// Payloads at or above this size are stored with zip64 records.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// A ZIP archive being sanitized.
pub struct ZipStripper {
    source: SourceFile,
    options: StripOptions,
    policy: ArchivePolicy,
    factory: ChildFactory,
    scratch: ScratchDir,
}

impl ZipStripper {
    pub fn new(
        source: SourceFile,
        options: StripOptions,
        policy: ArchivePolicy,
        factory: ChildFactory,
    ) -> StripResult<Self> {
        Ok(Self {
            scratch: ScratchDir::new()?,
            source,
            options,
            policy,
            factory,
        })
    }

    pub(crate) fn source(&self) -> &SourceFile {
        &self.source
    }

    fn open_archive(&self) -> StripResult<ZipArchive<File>> {
        let file = File::open(self.source.path())?;
        ZipArchive::new(file).map_err(|err| StripError::container(self.source.path(), err))
    }

    /// Extracts the entry at `index` into scratch. Returns the entry name,
    /// the extracted path, and whether it is a regular file.
    fn extract_entry(
        &self,
        archive: &mut ZipArchive<File>,
        index: usize,
    ) -> StripResult<(String, PathBuf, bool)> {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| StripError::container(self.source.path(), err))?;
        let name = entry.name().to_string();
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| StripError::unsafe_entry(self.source.path(), name.clone()))?;
        let destination = self.scratch.path().join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&destination)?;
            return Ok((name, destination, false));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&destination)?;
        io::copy(&mut entry, &mut out)?;
        Ok((name, destination, true))
    }

    fn try_remove_all(&mut self) -> StripResult<()> {
        self.source.ensure_writable()?;
        let mut zipin = self.open_archive()?;
        let mut zipout = ZipWriter::new(self.source.output_file()?);
        zipout.set_comment("");

        for index in 0..zipin.len() {
            let (name, extracted, is_file) = self.extract_entry(&mut zipin, index)?;
            if !is_file {
                debug!(entry = %name, "directory entry dropped from rebuilt archive");
                continue;
            }
            if self
                .policy
                .beginning_blacklist
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
            {
                debug!(entry = %name, "entry matches a blacklisted prefix, dropped");
                continue;
            }
            if self
                .policy
                .ending_blacklist
                .iter()
                .any(|suffix| name.ends_with(suffix.as_str()))
            {
                debug!(entry = %name, "entry matches a blacklisted suffix, dropped");
                continue;
            }
            if !sanitize_entry(
                self.source.path(),
                &name,
                &extracted,
                &self.options,
                &self.policy,
                self.factory,
            )? {
                continue;
            }

            let size = fs::metadata(&extracted)?.len();
            let entry_options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .last_modified_time(zip::DateTime::default())
                .large_file(size >= ZIP64_THRESHOLD);
            zipout
                .start_file(name.as_str(), entry_options)
                .map_err(|err| StripError::container(self.source.path(), err))?;
            let mut payload = File::open(&extracted)?;
            io::copy(&mut payload, &mut zipout)?;
        }

        zipout
            .finish()
            .map_err(|err| StripError::container(self.source.path(), err))?;
        info!(path = %self.source.path().display(), "archive rebuilt");
        self.source.publish()
    }

    /// Single pass behind `is_clean` and `is_clean_listing`. With `listing`
    /// the walk collects unsupported entry names instead of short-circuiting
    /// on the first compromising field.
    fn scan(&mut self, listing: bool) -> StripResult<(bool, Vec<String>)> {
        if !listing {
            let envelope = envelope::inspect(self.source.path())?;
            if envelope.comment_len != 0 {
                debug!(path = %self.source.path().display(), "archive has a comment");
                return Ok((false, Vec::new()));
            }
            if let Some(entry) = envelope.entries.iter().find(|entry| !entry.is_normalized()) {
                debug!(entry = %entry.name, "entry has compromising envelope fields");
                return Ok((false, Vec::new()));
            }
        }

        let mut zipin = self.open_archive()?;
        let mut unsupported = Vec::new();
        for index in 0..zipin.len() {
            let (name, extracted, is_file) = self.extract_entry(&mut zipin, index)?;
            if !is_file {
                continue;
            }
            let child = resolve_child(&extracted, false, &self.options, &self.policy, self.factory);
            match child {
                Some(mut child) => {
                    if !child.is_clean() && !listing {
                        debug!(entry = %name, "entry has metadata");
                        return Ok((false, unsupported));
                    }
                }
                None => {
                    info!(entry = %name, "entry format is not supported or harmless");
                    let basename = Path::new(&name)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if !CLEAN_BASENAMES.contains(&basename.as_str()) && !is_nometa(&extracted) {
                        if !listing {
                            return Ok((false, unsupported));
                        }
                        unsupported.push(name);
                    }
                }
            }
        }
        Ok((true, unsupported))
    }

    fn try_get_meta(&mut self) -> StripResult<Metadata> {
        let mut metadata = Metadata::new();

        let envelope = envelope::inspect(self.source.path())?;
        let mut zipin = self.open_archive()?;
        if envelope.comment_len > 0 {
            metadata.insert(
                "comment".to_string(),
                String::from_utf8_lossy(zipin.comment()).into_owned(),
            );
        }
        for entry in &envelope.entries {
            if !entry.is_normalized() {
                metadata.insert(
                    format!("{}'s envelope", entry.name),
                    format!(
                        "modified={}, system={}, method={}",
                        entry.modified(),
                        entry.host_name(),
                        entry.method
                    ),
                );
            }
        }

        for index in 0..zipin.len() {
            let (name, extracted, is_file) = self.extract_entry(&mut zipin, index)?;
            if !is_file {
                continue;
            }
            let child = resolve_child(&extracted, false, &self.options, &self.policy, self.factory);
            if let Some(mut child) = child {
                let child_meta = child.get_meta();
                if !child_meta.is_empty() {
                    metadata.insert(name, format!("{child_meta:?}"));
                }
            } else {
                info!(entry = %name, "entry format is not supported or harmless");
            }
        }
        Ok(metadata)
    }
}

impl Stripper for ZipStripper {
    fn get_meta(&mut self) -> Metadata {
        self.try_get_meta().unwrap_or_else(|err| {
            error!(path = %self.source.path().display(), %err, "could not read archive metadata");
            Metadata::new()
        })
    }

    fn is_clean(&mut self) -> bool {
        match self.scan(false) {
            Ok((clean, _)) => clean,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "could not check archive");
                false
            }
        }
    }

    fn is_clean_listing(&mut self) -> Vec<String> {
        match self.scan(true) {
            Ok((_, unsupported)) => unsupported,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "could not list archive entries");
                Vec::new()
            }
        }
    }

    fn remove_all(&mut self) -> bool {
        match self.try_remove_all() {
            Ok(()) => true,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "failed to sanitize archive");
                false
            }
        }
    }
}

/// A POSIX tar archive being sanitized, optionally wrapped in a gzip or
/// bzip2 stream. The same compression is used for both read and write.
pub struct TarStripper {
    source: SourceFile,
    options: StripOptions,
    whitelist: Vec<String>,
    factory: ChildFactory,
    scratch: ScratchDir,
    compression: Compression,
}

impl TarStripper {
    pub fn new(
        source: SourceFile,
        options: StripOptions,
        compression: Compression,
        whitelist: Vec<String>,
        factory: ChildFactory,
    ) -> StripResult<Self> {
        Ok(Self {
            scratch: ScratchDir::new()?,
            source,
            options,
            whitelist,
            factory,
            compression,
        })
    }

    fn open_reader(&self) -> StripResult<tar::Archive<Box<dyn Read>>> {
        let file = File::open(self.source.path())?;
        let reader: Box<dyn Read> = match self.compression {
            Compression::None => Box::new(file),
            Compression::Gzip => Box::new(GzDecoder::new(file)),
            Compression::Bzip2 => Box::new(BzDecoder::new(file)),
        };
        Ok(tar::Archive::new(reader))
    }

    fn try_remove_all(&mut self) -> StripResult<()> {
        self.source.ensure_writable()?;
        let mut tarin = self.open_reader()?;
        let out = self.source.output_file()?;
        match self.compression {
            Compression::None => {
                self.rebuild(&mut tarin, out)?;
            }
            Compression::Gzip => {
                let encoder = GzEncoder::new(out, flate2::Compression::default());
                self.rebuild(&mut tarin, encoder)?.finish()?;
            }
            Compression::Bzip2 => {
                let encoder = BzEncoder::new(out, bzip2::Compression::default());
                self.rebuild(&mut tarin, encoder)?.finish()?;
            }
        }
        info!(path = %self.source.path().display(), "archive rebuilt");
        self.source.publish()
    }

    fn rebuild<W: Write>(
        &mut self,
        tarin: &mut tar::Archive<Box<dyn Read>>,
        out: W,
    ) -> StripResult<W> {
        let mut tarout = tar::Builder::new(out);
        let policy = ArchivePolicy {
            whitelist: self.whitelist.clone(),
            ..ArchivePolicy::default()
        };
        let entries = tarin
            .entries()
            .map_err(|err| StripError::container(self.source.path(), err))?;
        for entry in entries {
            let mut entry = entry.map_err(|err| StripError::container(self.source.path(), err))?;
            let relative = entry
                .path()
                .map_err(|err| StripError::container(self.source.path(), err))?
                .into_owned();
            let name = relative.to_string_lossy().into_owned();
            let header = entry.header().clone();
            let link_target = entry
                .link_name()
                .map_err(|err| StripError::container(self.source.path(), err))?
                .map(|target| target.into_owned());
            if !entry.unpack_in(self.scratch.path())? {
                return Err(StripError::unsafe_entry(self.source.path(), name));
            }
            let extracted = self.scratch.path().join(&relative);

            if header.entry_type().is_file() {
                if !sanitize_entry(
                    self.source.path(),
                    &name,
                    &extracted,
                    &self.options,
                    &policy,
                    self.factory,
                )? {
                    continue;
                }
                let mut fresh = tar::Header::new_gnu();
                fresh.set_entry_type(tar::EntryType::Regular);
                fresh.set_size(fs::metadata(&extracted)?.len());
                fresh.set_mode(header.mode()?);
                normalize_header(&mut fresh)?;
                let mut payload = File::open(&extracted)?;
                tarout.append_data(&mut fresh, &relative, &mut payload)?;
            } else if header.entry_type().is_symlink() || header.entry_type().is_hard_link() {
                let target = link_target.ok_or_else(|| {
                    StripError::container(self.source.path(), "link entry without a target")
                })?;
                let mut fresh = header.clone();
                normalize_header(&mut fresh)?;
                tarout.append_link(&mut fresh, &relative, target)?;
            } else {
                // Directories and special entries are re-added with the
                // envelope normalized and no payload of their own.
                let mut fresh = header.clone();
                normalize_header(&mut fresh)?;
                fresh.set_size(0);
                fresh.set_cksum();
                tarout.append(&fresh, io::empty())?;
            }
        }
        tarout.into_inner().map_err(StripError::from)
    }

    fn scan(&mut self, listing: bool) -> StripResult<(bool, Vec<String>)> {
        let mut tarin = self.open_reader()?;
        let mut unsupported = Vec::new();
        let entries = tarin
            .entries()
            .map_err(|err| StripError::container(self.source.path(), err))?;
        for entry in entries {
            let mut entry = entry.map_err(|err| StripError::container(self.source.path(), err))?;
            let relative = entry
                .path()
                .map_err(|err| StripError::container(self.source.path(), err))?
                .into_owned();
            let name = relative.to_string_lossy().into_owned();
            if !is_header_clean(entry.header())? && !listing {
                debug!(entry = %name, "entry has compromising header fields");
                return Ok((false, unsupported));
            }
            let is_file = entry.header().entry_type().is_file();
            if !entry.unpack_in(self.scratch.path())? {
                return Err(StripError::unsafe_entry(self.source.path(), name));
            }
            if !is_file {
                continue;
            }
            let extracted = self.scratch.path().join(&relative);
            match (self.factory.create)(&extracted, false, &self.options.for_child()) {
                Some(mut child) => {
                    if !child.is_clean() && !listing {
                        debug!(entry = %name, "entry has metadata");
                        return Ok((false, unsupported));
                    }
                }
                None => {
                    info!(entry = %name, "entry format is not supported or harmless");
                    if !is_nometa(&extracted) {
                        if !listing {
                            return Ok((false, unsupported));
                        }
                        unsupported.push(name);
                    }
                }
            }
        }
        Ok((true, unsupported))
    }

    fn try_get_meta(&mut self) -> StripResult<Metadata> {
        let mut tarin = self.open_reader()?;
        let mut metadata = Metadata::new();
        let entries = tarin
            .entries()
            .map_err(|err| StripError::container(self.source.path(), err))?;
        for entry in entries {
            let mut entry = entry.map_err(|err| StripError::container(self.source.path(), err))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .map_err(|err| StripError::container(self.source.path(), err))?
                .into_owned();
            let name = relative.to_string_lossy().into_owned();
            let header = entry.header().clone();
            if !entry.unpack_in(self.scratch.path())? {
                return Err(StripError::unsafe_entry(self.source.path(), name));
            }
            let extracted = self.scratch.path().join(&relative);

            let mut current = Metadata::new();
            match (self.factory.create)(&extracted, false, &self.options.for_child()) {
                Some(mut child) => {
                    let child_meta = child.get_meta();
                    if !child_meta.is_empty() {
                        current.insert("file".to_string(), format!("{child_meta:?}"));
                    }
                }
                None => {
                    info!(entry = %name, "entry format is not supported or harmless");
                }
            }
            if !is_header_clean(&header)? {
                current.insert("mtime".to_string(), header.mtime()?.to_string());
                current.insert("uid".to_string(), header.uid()?.to_string());
                current.insert("gid".to_string(), header.gid()?.to_string());
                current.insert(
                    "uname".to_string(),
                    header.username().ok().flatten().unwrap_or("").to_string(),
                );
                current.insert(
                    "gname".to_string(),
                    header.groupname().ok().flatten().unwrap_or("").to_string(),
                );
            }
            if !current.is_empty() {
                metadata.insert(name, format!("{current:?}"));
            }
        }
        Ok(metadata)
    }
}

impl Stripper for TarStripper {
    fn get_meta(&mut self) -> Metadata {
        self.try_get_meta().unwrap_or_else(|err| {
            error!(path = %self.source.path().display(), %err, "could not read archive metadata");
            Metadata::new()
        })
    }

    fn is_clean(&mut self) -> bool {
        match self.scan(false) {
            Ok((clean, _)) => clean,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "could not check archive");
                false
            }
        }
    }

    fn is_clean_listing(&mut self) -> Vec<String> {
        match self.scan(true) {
            Ok((_, unsupported)) => unsupported,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "could not list archive entries");
                Vec::new()
            }
        }
    }

    fn remove_all(&mut self) -> bool {
        match self.try_remove_all() {
            Ok(()) => true,
            Err(err) => {
                error!(path = %self.source.path().display(), %err, "failed to sanitize archive");
                false
            }
        }
    }
}

/// Zeroes the fields the tar format itself adds to an entry.
fn normalize_header(header: &mut tar::Header) -> io::Result<()> {
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("")?;
    header.set_groupname("")?;
    Ok(())
}

/// Whether a tar header carries only normalized envelope fields.
fn is_header_clean(header: &tar::Header) -> StripResult<bool> {
    let uname_clean = matches!(header.username(), Ok(None) | Ok(Some("")));
    let gname_clean = matches!(header.groupname(), Ok(None) | Ok(Some("")));
    Ok(header.mtime()? == 0
        && header.uid()? == 0
        && header.gid()? == 0
        && uname_clean
        && gname_clean)
}

/// Dispatches the nested stripper for an extracted entry, honoring the
/// terminal short-circuit: entries of a terminal archive are never treated
/// as containers themselves.
fn resolve_child(
    extracted: &Path,
    writable: bool,
    options: &StripOptions,
    policy: &ArchivePolicy,
    factory: ChildFactory,
) -> Option<Box<dyn Stripper>> {
    if policy.terminal && (factory.is_container)(extracted) {
        return None;
    }
    (factory.create)(extracted, writable, &options.for_child())
}

/// Sanitizes one extracted entry in place. Returns whether the entry should
/// be written into the rebuilt archive.
fn sanitize_entry(
    archive: &Path,
    name: &str,
    extracted: &Path,
    options: &StripOptions,
    policy: &ArchivePolicy,
    factory: ChildFactory,
) -> StripResult<bool> {
    match resolve_child(extracted, true, options, policy, factory) {
        Some(mut child) => {
            // Entries stored read-only must still be replaceable in scratch.
            let saved = grant_owner_write(extracted)?;
            let sanitized = child.remove_all();
            fs::set_permissions(extracted, saved)?;
            if !sanitized {
                return Err(StripError::entry_failed(archive, name));
            }
            debug!(entry = %name, archive = %archive.display(), "nested entry sanitized");
            Ok(true)
        }
        None => {
            let keep = is_nometa(extracted)
                || policy.whitelist.iter().any(|white| white == name)
                || options.add2archive;
            if keep {
                info!(entry = %name, "entry format is not supported or harmless, kept as-is");
            } else {
                debug!(entry = %name, "entry format is not supported, dropped");
            }
            Ok(keep)
        }
    }
}

/// Adds the owner-write bit to the file's mode, returning the previous
/// permissions for restoration.
#[cfg(unix)]
fn grant_owner_write(path: &Path) -> io::Result<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;

    let saved = fs::metadata(path)?.permissions();
    let mut writable = saved.clone();
    writable.set_mode(saved.mode() | 0o200);
    fs::set_permissions(path, writable)?;
    Ok(saved)
}

#[cfg(not(unix))]
fn grant_owner_write(path: &Path) -> io::Result<fs::Permissions> {
    let saved = fs::metadata(path)?.permissions();
    let mut writable = saved.clone();
    writable.set_readonly(false);
    fs::set_permissions(path, writable)?;
    Ok(saved)
}
