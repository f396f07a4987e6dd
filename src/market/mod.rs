//! Markets approaching their oracle deadline.
//!
//! - `Market`: a binary question with its on-chain identifiers and the two
//!   CLOB outcome tokens
//! - `MarketRegistry`: the live set, swapped wholesale by the discovery feed
//!   and read by the per-block pipeline
//! - `discovery`: the Gamma API feed that builds each replacement set

pub mod discovery;
pub mod registry;

pub use discovery::{GammaFeed, MarketFeed};
pub use registry::{MarketRegistry, RegistryDiff};

use alloy::primitives::B256;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    /// Parse a Gamma outcome label ("Yes" / "No", any case).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "yes" => Some(Outcome::Yes),
            "no" => Some(Outcome::No),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Yes => write!(f, "Yes"),
            Outcome::No => write!(f, "No"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeToken {
    pub outcome: Outcome,
    /// CLOB token id (decimal U256 string).
    pub token_id: String,
    /// Unknown until inferred; false for both tokens on discovery.
    pub winner: bool,
}

/// A market in (or near) its terminal window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Market {
    /// UMA question id, the key used everywhere in the pipeline.
    pub question_id: B256,
    /// CTF condition id the outcome tokens are split against.
    pub condition_id: B256,
    pub slug: String,
    /// Unix seconds after which resolution becomes callable.
    pub expiration_timestamp: i64,
    /// Always `[Yes, No]`.
    pub tokens: [OutcomeToken; 2],
}

impl Market {
    pub fn new(
        question_id: B256,
        condition_id: B256,
        slug: impl Into<String>,
        expiration_timestamp: i64,
        yes_token: impl Into<String>,
        no_token: impl Into<String>,
    ) -> Self {
        Self {
            question_id,
            condition_id,
            slug: slug.into(),
            expiration_timestamp,
            tokens: [
                OutcomeToken {
                    outcome: Outcome::Yes,
                    token_id: yes_token.into(),
                    winner: false,
                },
                OutcomeToken {
                    outcome: Outcome::No,
                    token_id: no_token.into(),
                    winner: false,
                },
            ],
        }
    }

    pub fn token(&self, outcome: Outcome) -> &OutcomeToken {
        match outcome {
            Outcome::Yes => &self.tokens[0],
            Outcome::No => &self.tokens[1],
        }
    }

    pub fn seconds_until_expiry(&self, now: i64) -> i64 {
        self.expiration_timestamp - now
    }
}

/// True when `expiry` is strictly in the future and no further away than `horizon`.
pub fn in_expiring_window(expiry: i64, now: i64, horizon: Duration) -> bool {
    let horizon = i64::try_from(horizon.as_secs()).unwrap_or(i64::MAX);
    expiry > now && expiry - now <= horizon
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_excludes_past_and_far_deadlines() {
        let now = 1_700_000_000;
        let horizon = Duration::from_secs(900);
        assert!(in_expiring_window(now + 1, now, horizon));
        assert!(in_expiring_window(now + 900, now, horizon));
        assert!(!in_expiring_window(now + 901, now, horizon));
        assert!(!in_expiring_window(now, now, horizon));
        assert!(!in_expiring_window(now - 60, now, horizon));
    }

    #[test]
    fn tokens_are_ordered_yes_then_no() {
        let m = Market::new(B256::repeat_byte(1), B256::repeat_byte(2), "m", 0, "11", "22");
        assert_eq!(m.token(Outcome::Yes).token_id, "11");
        assert_eq!(m.token(Outcome::No).token_id, "22");
        assert!(!m.tokens.iter().any(|t| t.winner));
    }

    #[test]
    fn outcome_labels_parse_case_insensitively() {
        assert_eq!(Outcome::from_label("YES"), Some(Outcome::Yes));
        assert_eq!(Outcome::from_label(" no "), Some(Outcome::No));
        assert_eq!(Outcome::from_label("Maybe"), None);
    }
}
