//! Reference client-side solver.
//!
//! Production clients solve in the browser; this exists for tests, tooling,
//! and for calibrating difficulty.

use std::time::Duration;

use gatehouse_common::GuardError;
use gatehouse_common::constants::POW_MAX_SOLVE_ATTEMPTS;

use super::engine::{compute_hash, meets_difficulty};

/// Brute-force successive decimal integers from zero
pub fn solve_challenge(nonce: &str, difficulty: u32) -> Result<String, GuardError> {
    solve_with_budget(nonce, difficulty, POW_MAX_SOLVE_ATTEMPTS)
}

/// As [`solve_challenge`] with an explicit attempt ceiling.
///
/// Exhausting the budget means the difficulty is misconfigured for this
/// client, not that anything adversarial happened.
pub fn solve_with_budget(nonce: &str, difficulty: u32, max_attempts: u64) -> Result<String, GuardError> {
    (0..max_attempts)
        .map(|attempt| attempt.to_string())
        .find(|candidate| meets_difficulty(&compute_hash(nonce, candidate), difficulty))
        .ok_or(GuardError::Unsolvable {
            attempts: max_attempts,
        })
}

/// Rough difficulty for a desired client solve time
pub fn estimate_difficulty(target: Duration) -> u32 {
    match target.as_secs() {
        0 => 3,
        1..=4 => 4,
        5..=9 => 5,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solution_meets_difficulty() {
        let solution = solve_challenge("abc123", 2).unwrap();
        assert!(meets_difficulty(&compute_hash("abc123", &solution), 2));
    }

    #[test]
    fn test_budget_exhaustion_is_unsolvable() {
        let err = solve_with_budget("abc123", 64, 10).unwrap_err();
        assert!(matches!(err, GuardError::Unsolvable { attempts: 10 }));
    }

    #[test]
    fn test_estimate_difficulty() {
        assert_eq!(estimate_difficulty(Duration::from_millis(500)), 3);
        assert_eq!(estimate_difficulty(Duration::from_secs(3)), 4);
        assert_eq!(estimate_difficulty(Duration::from_secs(7)), 5);
        assert_eq!(estimate_difficulty(Duration::from_secs(30)), 6);
    }
}
