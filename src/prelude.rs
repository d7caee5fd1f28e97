pub use crate::builder::{CacheBuilder, CacheConfig};
pub use crate::cache::{Builder, DirCache, Handle, Lookup};
pub use crate::error::{CacheError, PersistError};
pub use crate::key::CacheKey;
pub use crate::persist::LoadReport;
pub use crate::store::EntryState;
pub use crate::time::Timestamp;
