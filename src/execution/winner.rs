//! Winner determination ahead of formal resolution.
//!
//! Deliberately pluggable: the pipeline only needs Yes, No, or unknown
//! (`None`). Unknown always means "do not trade".

use crate::config::WinnerStrategy;
use crate::execution::venue::ExecutionVenue;
use crate::market::{Market, Outcome};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait WinnerSource: Send + Sync {
    async fn determine(&self, market: &Market) -> Option<Outcome>;

    fn name(&self) -> &'static str;
}

/// Never names a winner.
pub struct Undetermined;

#[async_trait]
impl WinnerSource for Undetermined {
    async fn determine(&self, _market: &Market) -> Option<Outcome> {
        None
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Reads the `winner` flags on the market's tokens. Exactly one flag must be set.
pub struct TokenFlag;

#[async_trait]
impl WinnerSource for TokenFlag {
    async fn determine(&self, market: &Market) -> Option<Outcome> {
        let mut winners = market.tokens.iter().filter(|t| t.winner);
        let first = winners.next()?;
        if winners.next().is_some() {
            return None;
        }
        Some(first.outcome)
    }

    fn name(&self) -> &'static str {
        "token_flag"
    }
}

/// Infers the winner from a one-sided book: one outcome bid at or above
/// `threshold` while the other is bid below it.
pub struct BookSkew {
    venue: Arc<dyn ExecutionVenue>,
    threshold: Decimal,
}

impl BookSkew {
    pub fn new(venue: Arc<dyn ExecutionVenue>, threshold: Decimal) -> Self {
        Self { venue, threshold }
    }

    async fn best_bid(&self, token_id: &str) -> Decimal {
        match self.venue.order_book(token_id).await {
            Ok(Some(q)) => q.best_bid.map(|l| l.price).unwrap_or(Decimal::ZERO),
            Ok(None) => Decimal::ZERO,
            Err(e) => {
                debug!(token = %token_id, error = %e, "book unavailable for skew check");
                Decimal::ZERO
            }
        }
    }
}

#[async_trait]
impl WinnerSource for BookSkew {
    async fn determine(&self, market: &Market) -> Option<Outcome> {
        let yes_bid = self.best_bid(&market.token(Outcome::Yes).token_id).await;
        let no_bid = self.best_bid(&market.token(Outcome::No).token_id).await;

        let yes_skewed = yes_bid >= self.threshold;
        let no_skewed = no_bid >= self.threshold;
        match (yes_skewed, no_skewed) {
            (true, false) => Some(Outcome::Yes),
            (false, true) => Some(Outcome::No),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        "book_skew"
    }
}

pub fn build_winner_source(
    strategy: WinnerStrategy,
    venue: Arc<dyn ExecutionVenue>,
    skew_threshold: Decimal,
) -> Arc<dyn WinnerSource> {
    match strategy {
        WinnerStrategy::None => Arc::new(Undetermined),
        WinnerStrategy::TokenFlag => Arc::new(TokenFlag),
        WinnerStrategy::BookSkew => Arc::new(BookSkew::new(venue, skew_threshold)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::venue::{BuyOrder, Level, OrderAck, Quote, VenueError};
    use alloy::primitives::B256;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct BidBook(HashMap<String, Decimal>);

    #[async_trait]
    impl ExecutionVenue for BidBook {
        async fn order_book(&self, token_id: &str) -> Result<Option<Quote>, VenueError> {
            Ok(self.0.get(token_id).map(|&price| Quote {
                best_ask: None,
                best_bid: Some(Level { price, size: dec!(10) }),
            }))
        }

        async fn submit_buy(&self, _order: &BuyOrder) -> Result<OrderAck, VenueError> {
            Err(VenueError::Rejected("read only".to_string()))
        }
    }

    fn market() -> Market {
        Market::new(B256::repeat_byte(1), B256::repeat_byte(2), "m", 0, "yes", "no")
    }

    #[tokio::test]
    async fn undetermined_never_names_a_winner() {
        assert_eq!(Undetermined.determine(&market()).await, None);
    }

    #[tokio::test]
    async fn token_flag_requires_a_single_winner() {
        let mut m = market();
        assert_eq!(TokenFlag.determine(&m).await, None);

        m.tokens[1].winner = true;
        assert_eq!(TokenFlag.determine(&m).await, Some(Outcome::No));

        m.tokens[0].winner = true;
        assert_eq!(TokenFlag.determine(&m).await, None);
    }

    #[tokio::test]
    async fn book_skew_picks_the_lopsided_side() {
        let venue = Arc::new(BidBook(HashMap::from([
            ("yes".to_string(), dec!(0.97)),
            ("no".to_string(), dec!(0.02)),
        ])));
        let source = BookSkew::new(venue, dec!(0.95));
        assert_eq!(source.determine(&market()).await, Some(Outcome::Yes));
    }

    #[tokio::test]
    async fn book_skew_is_unknown_when_balanced_or_empty() {
        let balanced = Arc::new(BidBook(HashMap::from([
            ("yes".to_string(), dec!(0.55)),
            ("no".to_string(), dec!(0.44)),
        ])));
        assert_eq!(BookSkew::new(balanced, dec!(0.95)).determine(&market()).await, None);

        let empty = Arc::new(BidBook(HashMap::new()));
        assert_eq!(BookSkew::new(empty, dec!(0.95)).determine(&market()).await, None);
    }
}
