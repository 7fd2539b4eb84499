//! Bit-level inspection of ZIP container envelopes.
//!
//! The cleanliness contract is defined against raw central-directory fields
//! (host-system byte, DOS date/time words, comment lengths, compression
//! method), so this module reads them straight off the bytes instead of
//! trusting a library's interpretation.

use std::fs;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use super::error::{StripError, StripResult};

const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const EOCD64_SIGNATURE: u32 = 0x0606_4b50;
const EOCD64_LOCATOR_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x06, 0x07];
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;

/// Host-system code for UNIX in the `version made by` field.
pub const HOST_SYSTEM_UNIX: u8 = 3;
/// DOS date word for 1980-01-01, the ZIP epoch floor.
pub const ZIP_EPOCH_DOS_DATE: u16 = 0x0021;
/// Compression method code for DEFLATE.
pub const METHOD_DEFLATE: u16 = 8;

/// Envelope fields of a single central-directory entry.
#[derive(Debug, Clone)]
pub struct EntryEnvelope {
    pub name: String,
    pub host_system: u8,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub comment_len: u16,
}

impl EntryEnvelope {
    /// True iff every field carries its normalized sentinel value.
    pub fn is_normalized(&self) -> bool {
        self.host_system == HOST_SYSTEM_UNIX
            && self.method == METHOD_DEFLATE
            && self.dos_date == ZIP_EPOCH_DOS_DATE
            && self.dos_time == 0
            && self.comment_len == 0
    }

    /// Renders the DOS date/time words as `YYYY-MM-DD HH:MM:SS`.
    pub fn modified(&self) -> String {
        let year = 1980 + ((self.dos_date >> 9) & 0x7f);
        let month = (self.dos_date >> 5) & 0x0f;
        let day = self.dos_date & 0x1f;
        let hour = (self.dos_time >> 11) & 0x1f;
        let minute = (self.dos_time >> 5) & 0x3f;
        let second = (self.dos_time & 0x1f) * 2;
        format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
    }

    /// Human-readable name of the creating host system.
    pub fn host_name(&self) -> &'static str {
        match self.host_system {
            0 => "ms-dos",
            3 => "unix",
            10 => "windows ntfs",
            19 => "os x",
            _ => "unknown",
        }
    }
}

/// Envelope fields of a whole archive.
#[derive(Debug, Clone)]
pub struct ArchiveEnvelope {
    pub comment_len: u16,
    pub entries: Vec<EntryEnvelope>,
}

/// Reads the central directory of the ZIP file at `path`.
pub fn inspect(path: &Path) -> StripResult<ArchiveEnvelope> {
    let data = fs::read(path)?;
    let eocd = find_eocd(&data)
        .ok_or_else(|| StripError::container(path, "missing end-of-central-directory record"))?;

    let mut cursor = Cursor::new(data.as_slice());
    cursor.set_position(eocd as u64 + 10);
    let mut total_entries = cursor.read_u16::<LittleEndian>()? as u64;
    let _cd_size = cursor.read_u32::<LittleEndian>()?;
    let mut cd_offset = cursor.read_u32::<LittleEndian>()? as u64;
    let comment_len = cursor.read_u16::<LittleEndian>()?;

    if total_entries == u16::MAX as u64 || cd_offset == u32::MAX as u64 {
        (total_entries, cd_offset) = read_zip64_directory(path, &data, eocd)?;
    }

    let mut entries = Vec::with_capacity(total_entries as usize);
    cursor.set_position(cd_offset);
    for _ in 0..total_entries {
        entries.push(read_central_header(path, &mut cursor)?);
    }

    Ok(ArchiveEnvelope {
        comment_len,
        entries,
    })
}

fn read_central_header(
    path: &Path,
    cursor: &mut Cursor<&[u8]>,
) -> StripResult<EntryEnvelope> {
    let signature = cursor.read_u32::<LittleEndian>()?;
    if signature != CENTRAL_HEADER_SIGNATURE {
        return Err(StripError::container(path, "malformed central directory"));
    }
    let version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;
    let method = cursor.read_u16::<LittleEndian>()?;
    let dos_time = cursor.read_u16::<LittleEndian>()?;
    let dos_date = cursor.read_u16::<LittleEndian>()?;
    let _crc32 = cursor.read_u32::<LittleEndian>()?;
    let _compressed = cursor.read_u32::<LittleEndian>()?;
    let _uncompressed = cursor.read_u32::<LittleEndian>()?;
    let name_len = cursor.read_u16::<LittleEndian>()?;
    let extra_len = cursor.read_u16::<LittleEndian>()?;
    let comment_len = cursor.read_u16::<LittleEndian>()?;
    let _disk = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>()?;
    let _local_offset = cursor.read_u32::<LittleEndian>()?;

    let mut name = vec![0u8; name_len as usize];
    cursor.read_exact(&mut name)?;
    cursor.seek(SeekFrom::Current(extra_len as i64 + comment_len as i64))?;

    Ok(EntryEnvelope {
        name: String::from_utf8_lossy(&name).into_owned(),
        host_system: (version_made_by >> 8) as u8,
        method,
        dos_time,
        dos_date,
        comment_len,
    })
}

/// Scans backwards for the EOCD signature; the archive comment may push the
/// record up to 65535 bytes from the end.
fn find_eocd(data: &[u8]) -> Option<usize> {
    let start = data.len().checked_sub(22)?;
    let floor = data.len().saturating_sub(22 + u16::MAX as usize);
    (floor..=start)
        .rev()
        .find(|&pos| data[pos..pos + 4] == EOCD_SIGNATURE)
}

/// Resolves entry count and directory offset through the zip64 locator when
/// the classic record overflows.
fn read_zip64_directory(path: &Path, data: &[u8], eocd: usize) -> StripResult<(u64, u64)> {
    let locator = eocd
        .checked_sub(20)
        .filter(|&pos| data[pos..pos + 4] == EOCD64_LOCATOR_SIGNATURE)
        .ok_or_else(|| StripError::container(path, "missing zip64 locator"))?;

    let mut cursor = Cursor::new(data);
    cursor.set_position(locator as u64 + 8);
    let eocd64_offset = cursor.read_u64::<LittleEndian>()?;

    cursor.set_position(eocd64_offset);
    if cursor.read_u32::<LittleEndian>()? != EOCD64_SIGNATURE {
        return Err(StripError::container(path, "malformed zip64 directory record"));
    }
    cursor.set_position(eocd64_offset + 32);
    let total_entries = cursor.read_u64::<LittleEndian>()?;
    cursor.set_position(eocd64_offset + 48);
    let cd_offset = cursor.read_u64::<LittleEndian>()?;
    Ok((total_entries, cd_offset))
}
