//! Image CAPTCHA challenges.
//!
//! Solutions are drawn from a tier-specific alphabet and rendered to PNG with
//! noise and jitter. Each challenge validates at most once.

mod glyphs;
mod render;
mod service;

pub use render::CaptchaRenderer;
pub use service::{CaptchaOptions, CaptchaService, CaptchaStats};
