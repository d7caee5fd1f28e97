//! Opaque cache keys.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Immutable, variable-length key bytes.
///
/// Cloning is a reference-count bump, so the same key can sit in the shard
/// index, the entry record, and every handle without copying the bytes.
/// Hashes exactly like the underlying `[u8]`, which lets shard indexes be
/// probed with a plain byte slice.
///
/// ```
/// use cachedir::CacheKey;
///
/// let key = CacheKey::from("GET http://example.com/");
/// assert_eq!(key.as_bytes(), b"GET http://example.com/");
/// assert_eq!(key, CacheKey::from(b"GET http://example.com/".to_vec()));
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(Arc<[u8]>);

impl CacheKey {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self(Arc::from(bytes.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Borrow<[u8]> for CacheKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for CacheKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for CacheKey {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl<const N: usize> From<&[u8; N]> for CacheKey {
    fn from(bytes: &[u8; N]) -> Self {
        Self(Arc::from(&bytes[..]))
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(Arc::from(s.as_bytes()))
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(Arc::from(s.into_bytes()))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "CacheKey({text:?})"),
            Err(_) => {
                f.write_str("CacheKey(0x")?;
                for byte in self.0.iter() {
                    write!(f, "{byte:02x}")?;
                }
                f.write_str(")")
            },
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}
