//! Overwrite-then-unlink file removal.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

const WIPE_CHUNK: usize = 8192;

/// Overwrites the file with zeros, flushes, then unlinks it.
///
/// Best effort: block-remapping storage (SSDs, copy-on-write filesystems) may
/// keep stale copies of the data regardless.
pub fn secure_remove(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    overwrite_with_zeros(&file)?;
    file.sync_all()?;
    drop(file);
    fs::remove_file(path)
}

/// Replaces the current contents of an open file with zeros.
pub(crate) fn overwrite_with_zeros(file: &File) -> io::Result<()> {
    let len = file.metadata()?.len();
    let zeros = [0u8; WIPE_CHUNK];
    let mut handle = file;
    handle.seek(SeekFrom::Start(0))?;
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(WIPE_CHUNK as u64) as usize;
        handle.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    handle.flush()
}
