//! Abuse detection: attempt tracking, temporary blocks and risk scoring.

mod detector;
mod network;

pub use detector::{
    AbuseDetector, AttemptTracker, DetectorStats, REASON_ADDRESS_BLOCKED, REASON_DAILY_LIMIT,
    REASON_HOURLY_LIMIT, REASON_IP_BLOCKED, REASON_MANY_ADDRESSES, REASON_SUBNET,
};
pub use network::{likely_proxy, same_subnet};
