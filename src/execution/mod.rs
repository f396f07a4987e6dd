//! Pre-resolution buying of the winning outcome.
//!
//! Once per tick and per market: ask the winner source which side wins,
//! read that token's book, and send one fill-or-kill buy at the best ask
//! when the ask is strictly below the target price. Nothing is remembered
//! between ticks except the process-wide out-of-funds halt.

pub mod venue;
pub mod winner;

pub use venue::{BuyOrder, ClobVenue, ExecutionVenue, Level, OrderAck, OrderType, Quote, VenueError};
pub use winner::{build_winner_source, BookSkew, TokenFlag, Undetermined, WinnerSource};

use crate::market::Market;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the engine did with one market on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionDecision {
    /// Engine not started, or stopped.
    Stopped,
    /// A previous insufficient-balance failure halted buying for the run.
    Halted,
    NoWinner,
    NoBook,
    AboveTarget { ask: Decimal },
    Submitted { order_id: String, price: Decimal },
    Rejected { reason: String },
    /// This attempt ran out of funds; buying is halted from here on.
    OutOfFunds,
}

impl ExecutionDecision {
    pub fn submitted(&self) -> bool {
        matches!(self, ExecutionDecision::Submitted { .. })
    }
}

pub struct ExecutionEngine {
    venue: Arc<dyn ExecutionVenue>,
    winner: Arc<dyn WinnerSource>,
    target_price: Decimal,
    order_size: Decimal,
    running: AtomicBool,
    out_of_funds: AtomicBool,
}

impl ExecutionEngine {
    pub fn new(
        venue: Arc<dyn ExecutionVenue>,
        winner: Arc<dyn WinnerSource>,
        target_price: Decimal,
        order_size: Decimal,
    ) -> Self {
        Self {
            venue,
            winner,
            target_price,
            order_size,
            running: AtomicBool::new(false),
            out_of_funds: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            target_price = %self.target_price,
            order_size = %self.order_size,
            winner_source = self.winner.name(),
            "execution engine started"
        );
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("execution engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.out_of_funds.load(Ordering::SeqCst)
    }

    /// Evaluate one market from scratch. Never returns an error: every
    /// venue failure is folded into a decision.
    pub async fn process_market(&self, market: &Market) -> ExecutionDecision {
        if !self.is_running() {
            return ExecutionDecision::Stopped;
        }
        if self.is_halted() {
            return ExecutionDecision::Halted;
        }

        let Some(winner) = self.winner.determine(market).await else {
            debug!(market = %market.slug, "could not determine winner, skipping");
            return ExecutionDecision::NoWinner;
        };

        let token = market.token(winner);
        let ask = match self.venue.order_book(&token.token_id).await {
            Ok(Some(quote)) => quote.best_ask,
            Ok(None) => None,
            Err(e) => {
                debug!(token = %token.token_id, error = %e, "order book fetch failed");
                None
            }
        };
        let Some(ask) = ask else {
            debug!(market = %market.slug, token = %token.token_id, "no order book data available");
            return ExecutionDecision::NoBook;
        };

        if ask.price >= self.target_price {
            debug!(
                market = %market.slug,
                best_ask = %ask.price,
                target_price = %self.target_price,
                "price not favorable, waiting"
            );
            return ExecutionDecision::AboveTarget { ask: ask.price };
        }

        info!(
            market = %market.slug,
            outcome = %winner,
            token = %token.token_id,
            best_ask = %ask.price,
            target_price = %self.target_price,
            "trigger condition met, executing buy order"
        );

        let order = BuyOrder {
            token_id: token.token_id.clone(),
            limit_price: ask.price,
            amount_usd: self.order_size,
            order_type: OrderType::Fok,
        };

        match self.venue.submit_buy(&order).await {
            Ok(ack) => {
                info!(
                    market = %market.slug,
                    order_id = %ack.order_id,
                    status = %ack.status,
                    price = %order.limit_price,
                    size = %order.amount_usd,
                    "buy order placed"
                );
                ExecutionDecision::Submitted {
                    order_id: ack.order_id,
                    price: order.limit_price,
                }
            }
            Err(e) if e.is_insufficient_balance() => {
                self.out_of_funds.store(true, Ordering::SeqCst);
                warn!(market = %market.slug, error = %e, "insufficient balance, stopping buys");
                ExecutionDecision::OutOfFunds
            }
            Err(e) => {
                error!(market = %market.slug, token = %order.token_id, error = %e, "error placing buy order");
                ExecutionDecision::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }
}
