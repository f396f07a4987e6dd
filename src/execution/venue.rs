//! Execution venue seam: order books in, fill-or-kill buys out.

use crate::auth::{AuthError, ClobApiClient, MarketBuy, OrderSigner, PostOrderRequest};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum VenueError {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("venue unavailable: {0}")]
    Unavailable(String),
}

impl VenueError {
    /// Map a venue error message onto the balance / other split.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("insufficient_balance")
            || lower.contains("insufficient")
            || lower.contains("balance")
        {
            VenueError::InsufficientBalance(message)
        } else {
            VenueError::Rejected(message)
        }
    }

    pub fn is_insufficient_balance(&self) -> bool {
        matches!(self, VenueError::InsufficientBalance(_))
    }
}

impl From<AuthError> for VenueError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::ApiError { status, body } => {
                VenueError::classify(format!("API error {status}: {body}"))
            }
            AuthError::InvalidOrder(reason) => VenueError::Rejected(reason),
            other => VenueError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

/// Top of book for one token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quote {
    pub best_ask: Option<Level>,
    pub best_bid: Option<Level>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    /// Fill-or-kill: execute in full immediately or not at all.
    Fok,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Fok => "FOK",
        }
    }
}

/// A buy decision for this tick. Never queued or retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyOrder {
    pub token_id: String,
    pub limit_price: Decimal,
    pub amount_usd: Decimal,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
}

#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    /// `Ok(None)` when the token has no resting orders at all.
    async fn order_book(&self, token_id: &str) -> Result<Option<Quote>, VenueError>;

    async fn submit_buy(&self, order: &BuyOrder) -> Result<OrderAck, VenueError>;
}

/// Polymarket CLOB over the L2 REST client, with orders signed by the
/// trading wallet.
pub struct ClobVenue {
    api: Arc<ClobApiClient>,
    signer: OrderSigner,
}

impl ClobVenue {
    pub fn new(api: Arc<ClobApiClient>, signer: OrderSigner) -> Self {
        Self { api, signer }
    }
}

fn order_salt() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or_default()
}

fn parse_levels(levels: &[crate::auth::BookLevel]) -> Vec<Level> {
    levels
        .iter()
        .filter_map(|l| {
            let price = Decimal::from_str(&l.price).ok()?;
            let size = Decimal::from_str(&l.size).ok()?;
            (size > Decimal::ZERO).then_some(Level { price, size })
        })
        .collect()
}

/// Best ask is the lowest ask, best bid the highest bid, whatever order
/// the levels arrive in. None when both sides are empty.
pub fn top_of_book(book: &crate::auth::BookResponse) -> Option<Quote> {
    let best_ask = parse_levels(&book.asks).into_iter().min_by_key(|l| l.price);
    let best_bid = parse_levels(&book.bids).into_iter().max_by_key(|l| l.price);
    if best_ask.is_none() && best_bid.is_none() {
        return None;
    }
    Some(Quote { best_ask, best_bid })
}

#[async_trait]
impl ExecutionVenue for ClobVenue {
    async fn order_book(&self, token_id: &str) -> Result<Option<Quote>, VenueError> {
        let book = self.api.order_book(token_id).await?;
        let quote = top_of_book(&book);
        debug!(token = %token_id, quote = ?quote, "order book");
        Ok(quote)
    }

    async fn submit_buy(&self, order: &BuyOrder) -> Result<OrderAck, VenueError> {
        let neg_risk = self.api.neg_risk(&order.token_id).await?;
        let fee_rate_bps = self.api.fee_rate_bps(&order.token_id).await?;
        let signed = self.signer.market_buy(&MarketBuy {
            token_id: &order.token_id,
            amount_usd: order.amount_usd,
            price: order.limit_price,
            fee_rate_bps,
            neg_risk,
            salt: order_salt(),
        })?;
        debug!(
            token = %order.token_id,
            maker_amount = %signed.maker_amount,
            taker_amount = %signed.taker_amount,
            neg_risk,
            "signed market buy"
        );
        let request = PostOrderRequest {
            order: signed,
            owner: self.api.api_key().to_string(),
            order_type: order.order_type.as_str().to_string(),
        };
        let resp = self.api.place_order(&request).await?;
        if !resp.success {
            return Err(VenueError::classify(resp.error_msg));
        }
        Ok(OrderAck {
            order_id: resp.order_id,
            status: resp.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{BookLevel, BookResponse};
    use rust_decimal_macros::dec;

    fn level(price: &str, size: &str) -> BookLevel {
        BookLevel {
            price: price.to_string(),
            size: size.to_string(),
        }
    }

    #[test]
    fn classifies_balance_failures() {
        assert!(VenueError::classify("not enough balance / allowance").is_insufficient_balance());
        assert!(VenueError::classify("INSUFFICIENT_BALANCE").is_insufficient_balance());
        assert!(!VenueError::classify("order couldn't be fully filled").is_insufficient_balance());
    }

    #[test]
    fn api_error_bodies_are_classified() {
        let e: VenueError = AuthError::ApiError {
            status: 400,
            body: "{\"error\":\"not enough balance\"}".to_string(),
        }
        .into();
        assert!(e.is_insufficient_balance());
    }

    #[test]
    fn unsignable_orders_are_rejections() {
        let e: VenueError = AuthError::InvalidOrder("price 1 is outside (0, 1)".to_string()).into();
        assert!(matches!(e, VenueError::Rejected(_)));
        let e: VenueError = AuthError::Signing("boom".to_string()).into();
        assert!(matches!(e, VenueError::Unavailable(_)));
    }

    #[test]
    fn top_of_book_ignores_wire_order() {
        let book = BookResponse {
            bids: vec![level("0.90", "10"), level("0.94", "5"), level("0.10", "1")],
            asks: vec![level("0.99", "100"), level("0.97", "20"), level("0.96", "0")],
        };
        let q = top_of_book(&book).unwrap();
        assert_eq!(q.best_ask.unwrap().price, dec!(0.97));
        assert_eq!(q.best_bid.unwrap().price, dec!(0.94));
    }

    #[test]
    fn one_sided_and_empty_books() {
        let bids_only = BookResponse {
            bids: vec![level("0.5", "1")],
            asks: vec![],
        };
        let q = top_of_book(&bids_only).unwrap();
        assert!(q.best_ask.is_none());
        assert_eq!(q.best_bid.unwrap().price, dec!(0.5));

        assert!(top_of_book(&BookResponse::default()).is_none());
    }
}
