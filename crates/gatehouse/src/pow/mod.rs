//! Proof-of-work challenges.
//!
//! - `engine` - issues SHA-256 leading-zero puzzles and verifies solutions
//! - `adaptive` - retunes the engine's difficulty from a load signal
//! - `solver` - reference brute-force client solver

mod adaptive;
mod engine;
mod solver;

pub use adaptive::AdaptiveDifficulty;
pub use engine::{PowStats, ProofOfWork, compute_hash, meets_difficulty};
pub use solver::{estimate_difficulty, solve_challenge, solve_with_budget};
