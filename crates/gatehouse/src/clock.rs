//! Wall-clock helpers shared by the engines.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// `now + ttl`, saturating instead of overflowing
pub fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time elapsed from `earlier` to `now`, zero if `earlier` is in the future
pub fn elapsed(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}
