//! Index file integrity footer.
//!
//! Every index file ends with a 16-byte big-endian footer:
//!
//! ```text
//! [magic: u32][algorithm id: u32][CRC-32 checksum: u64]
//! ```
//!
//! The checksum covers every byte that precedes it, footer prefix
//! included. CRC-32 values occupy the low 32 bits of the u64; a stored or
//! computed value with any high bit set indicates corruption outside the
//! checksummed range and is rejected outright.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use tracing::debug;

use crate::error::{KnnError, KnnResult};

/// Footer start marker.
pub const FOOTER_MAGIC: u32 = 0xC028_93E8;

/// Checksum algorithm identifier; 0 is CRC-32.
pub const FOOTER_ALGORITHM_ID: u32 = 0;

/// Total footer length in bytes.
pub const FOOTER_LENGTH: usize = 16;

const CHECKSUM_HIGH_BITS: u64 = 0xFFFF_FFFF_0000_0000;

fn check_sanity(checksum: u64) -> KnnResult<u64> {
    if checksum & CHECKSUM_HIGH_BITS != 0 {
        return Err(KnnError::IllegalChecksum { checksum });
    }
    Ok(checksum)
}

/// Append the integrity footer to a finished index file.
///
/// # Errors
///
/// Returns [`KnnError::Io`] on filesystem failures and
/// [`KnnError::IllegalChecksum`] if the computed CRC is out of range.
pub fn append_footer(path: &Path) -> KnnResult<()> {
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;

    file.write_u32::<BigEndian>(FOOTER_MAGIC)?;
    file.write_u32::<BigEndian>(FOOTER_ALGORITHM_ID)?;
    file.flush()?;

    // Checksum spans the body plus the 8 footer bytes just written.
    let checksum = check_sanity(checksum_prefix(path, None)?)?;
    file.write_u64::<BigEndian>(checksum)?;
    file.flush()?;

    debug!(path = %path.display(), checksum, "appended index footer");
    Ok(())
}

/// Verify the integrity footer of an index file, returning its checksum.
///
/// # Errors
///
/// Returns [`KnnError::CorruptedIndex`] when the footer is missing or
/// malformed or the checksum does not match, and
/// [`KnnError::IllegalChecksum`] when the stored value is out of range.
pub fn verify_footer(path: &Path) -> KnnResult<u64> {
    let corrupt = |details: &str| KnnError::CorruptedIndex {
        path: path.display().to_string(),
        details: details.to_string(),
    };

    let file_len = std::fs::metadata(path)?.len();
    if file_len < FOOTER_LENGTH as u64 {
        return Err(corrupt("file shorter than footer"));
    }

    let mut footer = [0u8; FOOTER_LENGTH];
    {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::End(-(FOOTER_LENGTH as i64)))?;
        file.read_exact(&mut footer)?;
    }

    if BigEndian::read_u32(&footer[0..4]) != FOOTER_MAGIC {
        return Err(corrupt("bad footer magic"));
    }
    if BigEndian::read_u32(&footer[4..8]) != FOOTER_ALGORITHM_ID {
        return Err(corrupt("unknown checksum algorithm"));
    }

    let stored = check_sanity(BigEndian::read_u64(&footer[8..16]))?;
    let computed = check_sanity(checksum_prefix(path, Some(file_len - 8))?)?;
    if stored != computed {
        return Err(corrupt(&format!(
            "checksum mismatch: stored {stored:#x}, computed {computed:#x}"
        )));
    }
    Ok(stored)
}

/// CRC-32 over the first `limit` bytes of `path` (whole file when `None`).
fn checksum_prefix(path: &Path, limit: Option<u64>) -> KnnResult<u64> {
    let mut file = File::open(path)?;
    let mut remaining = match limit {
        Some(limit) => limit,
        None => std::fs::metadata(path)?.len(),
    };

    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..want])?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
    }
    Ok(u64::from(hasher.finalize()))
}
