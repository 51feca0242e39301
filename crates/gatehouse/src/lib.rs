//! # Gatehouse
//!
//! Request-admission defenses for a token faucet. Every request passes the
//! abuse detector, IP and address quotas, an image CAPTCHA and a
//! proof-of-work puzzle before the caller performs its external action, then
//! reports the outcome back.
//!
//! ## Architecture
//! ```text
//! client -> proxy -> Gatehouse -> faucet backend
//!                       |
//!                 Redis (counters, optional)
//! ```

pub mod abuse;
pub mod captcha;
pub mod clock;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod pow;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod store;
pub mod tasks;
pub mod telemetry;
