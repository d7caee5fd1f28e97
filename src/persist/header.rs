//! Versioned segment header and its compatibility rule.
//!
//! ```text
//!  offset  size  field
//!  ──────  ────  ─────────────
//!    0      4    magic          (u32 LE, CACHE_MAGIC)
//!    4      2    format_major   (u16 LE)
//!    6      2    format_minor
//!    8      2    object_major
//!   10      2    object_minor
//! ```
//!
//! `format_*` versions the segment layout itself; `object_*` versions the
//! payload the embedding application stores. Minor bumps are additive only,
//! so only magic and the two majors decide compatibility.

use std::fmt;
use std::io::{self, Read, Write};

/// Identifies a cache directory segment ("CDIR" as little-endian bytes).
pub const CACHE_MAGIC: u32 = 0x5249_4443;

/// Layout version written by this build.
pub const FORMAT_VERSION: Version = Version::new(1, 0);

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 12;

/// A `major.minor` version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Header at the start of every persisted segment.
///
/// ```
/// use cachedir::persist::{PersistedHeader, Version};
///
/// let stored = PersistedHeader::current(Version::new(1, 0));
/// let reader = PersistedHeader::current(Version::new(1, 7));
/// assert!(stored.compatible(&reader));
///
/// let newer_payload = PersistedHeader::current(Version::new(2, 0));
/// assert!(!stored.compatible(&newer_payload));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedHeader {
    pub magic: u32,
    pub format_version: Version,
    pub object_version: Version,
}

impl PersistedHeader {
    /// Header this build writes for the given payload version.
    pub const fn current(object_version: Version) -> Self {
        Self {
            magic: CACHE_MAGIC,
            format_version: FORMAT_VERSION,
            object_version,
        }
    }

    /// `self` is the stored header, `expected` the reader's.
    pub fn compatible(&self, expected: &PersistedHeader) -> bool {
        self.magic == expected.magic
            && self.format_version.major == expected.format_version.major
            && self.object_version.major == expected.object_version.major
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..6].copy_from_slice(&self.format_version.major.to_le_bytes());
        out[6..8].copy_from_slice(&self.format_version.minor.to_le_bytes());
        out[8..10].copy_from_slice(&self.object_version.major.to_le_bytes());
        out[10..12].copy_from_slice(&self.object_version.minor.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            format_version: Version::new(u16_at(4), u16_at(6)),
            object_version: Version::new(u16_at(8), u16_at(10)),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Reads exactly [`HEADER_LEN`] bytes. A short stream is `UnexpectedEof`.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut buf)?;
        Ok(Self::from_bytes(&buf))
    }
}

impl fmt::Display for PersistedHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "magic {:#010x} format {} object {}",
            self.magic, self.format_version, self.object_version
        )
    }
}
