//! Wall-clock timestamps for expiry deadlines.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Wall-clock rather than monotonic because deadlines are persisted and must
/// mean the same thing after a restart. The sweep driver passes `now`
/// explicitly, so tests can use any fixed value.
///
/// ```
/// use std::time::Duration;
/// use cachedir::Timestamp;
///
/// let t = Timestamp::from_millis(1_000);
/// assert_eq!(t + Duration::from_secs(2), Timestamp::from_millis(3_000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Current wall-clock time. A clock set before the epoch reads as `EPOCH`.
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| Self(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)))
            .unwrap_or(Self::EPOCH)
    }

    pub fn saturating_add(self, ttl: Duration) -> Self {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, ttl: Duration) -> Timestamp {
        self.saturating_add(ttl)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_saturates() {
        let t = Timestamp::from_millis(u64::MAX - 1);
        assert_eq!(t + Duration::from_secs(10), Timestamp::from_millis(u64::MAX));
    }

    #[test]
    fn now_is_after_epoch() {
        assert!(Timestamp::now() > Timestamp::EPOCH);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let now = Timestamp::from_millis(500);
        assert!(now + Duration::ZERO <= now);
    }
}
