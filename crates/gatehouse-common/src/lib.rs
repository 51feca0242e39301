//! # Gatehouse Common
//!
//! Shared types, errors, and constants used across Gatehouse components.
//!
//! ## Modules
//! - `types` - Data exchanged with callers (DetectionResult, challenges, metrics)
//! - `error` - The `GuardError` kind set
//! - `constants` - Default tunables and store key prefixes

pub mod constants;
pub mod error;
pub mod types;

pub use error::GuardError;
pub use types::*;
