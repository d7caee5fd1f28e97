//! Entry records that follow the header in a persisted segment.
//!
//! ```text
//!  key_len:u32 | key bytes | payload_len:u32 | payload bytes | expiry:u64
//! ```
//!
//! All integers are little-endian. `expiry` is milliseconds since the Unix
//! epoch, with `0` meaning "no TTL"; a deadline at the epoch itself is written
//! as `1` so it stays a past deadline. Records run until end of stream.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::error::PersistError;
use crate::key::CacheKey;
use crate::persist::header::PersistedHeader;
use crate::time::Timestamp;

/// One persisted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: CacheKey,
    pub payload: Arc<[u8]>,
    pub expiry: Option<Timestamp>,
}

impl Record {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), PersistError> {
        writer.write_all(&len_prefix(self.key.len())?)?;
        writer.write_all(self.key.as_bytes())?;
        writer.write_all(&len_prefix(self.payload.len())?)?;
        writer.write_all(&self.payload)?;
        let expiry = self.expiry.map_or(0, |deadline| deadline.as_millis().max(1));
        writer.write_all(&expiry.to_le_bytes())?;
        Ok(())
    }

    /// Reads the next record; `Ok(None)` on a clean end of stream.
    ///
    /// End of stream in the middle of a record is [`PersistError::Corrupt`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>, PersistError> {
        let mut len = [0u8; 4];
        if !read_or_eof(reader, &mut len)? {
            return Ok(None);
        }
        let key = read_vec(reader, u32::from_le_bytes(len), "key")?;

        read_field(reader, &mut len, "payload length")?;
        let payload = read_vec(reader, u32::from_le_bytes(len), "payload")?;

        let mut expiry = [0u8; 8];
        read_field(reader, &mut expiry, "expiry")?;
        let expiry = match u64::from_le_bytes(expiry) {
            0 => None,
            millis => Some(Timestamp::from_millis(millis)),
        };

        Ok(Some(Self {
            key: CacheKey::from(key),
            payload: Arc::from(payload),
            expiry,
        }))
    }
}

/// Writes a complete segment: header, then every record.
pub fn write_segment<'a, W, I>(
    writer: &mut W,
    header: &PersistedHeader,
    records: I,
) -> Result<usize, PersistError>
where
    W: Write,
    I: IntoIterator<Item = &'a Record>,
{
    header.write_to(writer)?;
    let mut written = 0;
    for record in records {
        record.write_to(writer)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Reads and validates a segment against `expected`.
///
/// Nothing is returned unless the header is compatible and every record
/// decodes, so a caller can never install half of a bad segment.
pub fn read_segment<R: Read>(
    reader: &mut R,
    expected: &PersistedHeader,
) -> Result<Vec<Record>, PersistError> {
    let stored = PersistedHeader::read_from(reader).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            PersistError::Corrupt("segment shorter than its header".into())
        } else {
            PersistError::Io(err)
        }
    })?;
    if !stored.compatible(expected) {
        return Err(PersistError::VersionIncompatible {
            stored,
            expected: *expected,
        });
    }

    let mut records = Vec::new();
    while let Some(record) = Record::read_from(reader)? {
        records.push(record);
    }
    Ok(records)
}

fn len_prefix(len: usize) -> Result<[u8; 4], PersistError> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| PersistError::Corrupt(format!("field of {len} bytes exceeds u32 length")))
}

fn read_vec<R: Read>(reader: &mut R, len: u32, what: &str) -> Result<Vec<u8>, PersistError> {
    let len = len as usize;
    let mut buf = Vec::new();
    // take() bounds the allocation by what the stream actually holds.
    Read::take(&mut *reader, len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(PersistError::Corrupt(format!(
            "truncated {what}: expected {len} bytes, found {}",
            buf.len()
        )));
    }
    Ok(buf)
}

fn read_field<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), PersistError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            PersistError::Corrupt(format!("truncated {what}"))
        } else {
            PersistError::Io(err)
        }
    })
}

/// Fills `buf`, or returns `false` if the stream ended before its first byte.
fn read_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, PersistError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(PersistError::Corrupt("truncated record header".into())),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(PersistError::Io(err)),
        }
    }
    Ok(true)
}
