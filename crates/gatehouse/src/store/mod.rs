//! Storage abstractions injected into the engines.
//!
//! - `challenge` - expiring id -> payload maps shared by the PoW engine and
//!   the CAPTCHA service
//! - `counter` - TTL counters backing the rate limiter, in memory or Redis

mod challenge;
mod counter;

pub use challenge::{ChallengeStore, Expiring, MemoryStore};
pub use counter::{CounterStore, MemoryCounterStore, RedisCounterStore};
