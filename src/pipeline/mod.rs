//! The driver loop.
//!
//! One tick per new block (or per timer interval). A tick takes a registry
//! snapshot and walks it in order: execution, then settlement, one market
//! at a time. Every transaction of the run is submitted from here, so the
//! signing account never sees concurrent submissions.

use crate::execution::{ExecutionDecision, ExecutionEngine};
use crate::market::MarketRegistry;
use crate::settlement::SettlementEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Block { number: u64, timestamp: u64 },
    Timer,
}

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub markets: usize,
    pub buys: usize,
    pub resolves: usize,
    pub redeems: usize,
    pub settled: usize,
    pub failures: usize,
}

pub struct Pipeline {
    registry: MarketRegistry,
    execution: Arc<ExecutionEngine>,
    settlement: SettlementEngine,
}

impl Pipeline {
    pub fn new(registry: MarketRegistry, execution: Arc<ExecutionEngine>, settlement: SettlementEngine) -> Self {
        Self {
            registry,
            execution,
            settlement,
        }
    }

    pub fn settlement(&self) -> &SettlementEngine {
        &self.settlement
    }

    pub async fn run_tick(&mut self, tick: Tick, now: i64) -> TickSummary {
        let snapshot = self.registry.snapshot();
        self.settlement.retain(&snapshot);

        let mut summary = TickSummary {
            markets: snapshot.len(),
            ..Default::default()
        };
        if snapshot.is_empty() {
            return summary;
        }
        debug!(tick = ?tick, markets = snapshot.len(), "processing tick");

        for market in snapshot.iter() {
            if let ExecutionDecision::Submitted { .. } = self.execution.process_market(market).await {
                summary.buys += 1;
            }

            match self.settlement.process_market(market, now).await {
                Ok(report) => {
                    summary.resolves += usize::from(report.submitted_resolve());
                    summary.redeems += usize::from(report.submitted_redeem());
                    summary.settled += usize::from(report.newly_settled);
                }
                Err(e) => {
                    summary.failures += 1;
                    error!(
                        market = %market.slug,
                        question_id = %market.question_id,
                        error = %e,
                        "error processing market"
                    );
                }
            }
        }

        if summary.buys + summary.resolves + summary.redeems + summary.failures > 0 {
            info!(
                markets = summary.markets,
                buys = summary.buys,
                resolves = summary.resolves,
                redeems = summary.redeems,
                failures = summary.failures,
                "tick processed"
            );
        }
        summary
    }

    /// Consume ticks until shutdown or until every sender is gone. Ticks
    /// that pile up while one is being processed collapse into the latest.
    pub async fn run(&mut self, mut ticks: mpsc::UnboundedReceiver<Tick>, mut shutdown: watch::Receiver<bool>) {
        info!("pipeline started");
        loop {
            let tick = tokio::select! {
                _ = shutdown.changed() => break,
                tick = ticks.recv() => match tick {
                    Some(t) => t,
                    None => break,
                },
            };
            let (tick, skipped) = latest_pending(tick, &mut ticks);
            if skipped > 0 {
                debug!(skipped, "coalesced backlog of ticks");
            }
            if *shutdown.borrow() {
                break;
            }
            self.run_tick(tick, chrono::Utc::now().timestamp()).await;
        }
        info!("pipeline stopped");
    }
}

/// Drain whatever is queued and keep only the newest tick.
pub fn latest_pending(first: Tick, ticks: &mut mpsc::UnboundedReceiver<Tick>) -> (Tick, usize) {
    let mut latest = first;
    let mut skipped = 0;
    while let Ok(next) = ticks.try_recv() {
        latest = next;
        skipped += 1;
    }
    (latest, skipped)
}

/// Fixed-interval clock for when no block subscription is wanted.
pub fn spawn_timer_clock(interval: Duration, tick_tx: mpsc::UnboundedSender<Tick>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "starting timer clock");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if tick_tx.send(Tick::Timer).is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{BuyOrder, ExecutionVenue, Level, OrderAck, Quote, TokenFlag, VenueError};
    use crate::market::Market;
    use crate::settlement::testing::{settings, MockChain, Sent};
    use alloy::primitives::{B256, U256};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    const NOW: i64 = 1_700_000_000;

    #[derive(Default)]
    struct Venue {
        orders: Mutex<Vec<BuyOrder>>,
    }

    #[async_trait]
    impl ExecutionVenue for Venue {
        async fn order_book(&self, _token_id: &str) -> Result<Option<Quote>, VenueError> {
            Ok(Some(Quote {
                best_ask: Some(Level {
                    price: dec!(0.95),
                    size: dec!(50),
                }),
                best_bid: None,
            }))
        }

        async fn submit_buy(&self, order: &BuyOrder) -> Result<OrderAck, VenueError> {
            self.orders.lock().unwrap().push(order.clone());
            Ok(OrderAck {
                order_id: "1".to_string(),
                status: "matched".to_string(),
            })
        }
    }

    fn market(id: u8, yes_wins: bool) -> Market {
        let mut m = Market::new(
            B256::repeat_byte(id),
            B256::repeat_byte(id + 100),
            format!("market-{id}"),
            NOW + 300,
            format!("yes-{id}"),
            format!("no-{id}"),
        );
        m.tokens[0].winner = yes_wins;
        m
    }

    fn pipeline(registry: &MarketRegistry, venue: Arc<Venue>, chain: Arc<MockChain>) -> Pipeline {
        let execution = Arc::new(ExecutionEngine::new(venue, Arc::new(TokenFlag), dec!(0.99), dec!(1)));
        execution.start();
        Pipeline::new(registry.clone(), execution, SettlementEngine::new(chain, settings()))
    }

    #[tokio::test]
    async fn tick_runs_execution_and_settlement_per_market() {
        let registry = MarketRegistry::new();
        let expired = market(1, false);
        let winning = market(2, true);
        registry.replace_all(vec![expired.clone(), winning.clone()]);

        let chain = Arc::new(MockChain::new(100));
        chain.expire_at(expired.question_id, NOW - 60);
        chain.expire_at(winning.question_id, NOW + 3600);
        let venue = Arc::new(Venue::default());
        let mut pipeline = pipeline(&registry, venue.clone(), chain.clone());

        let summary = pipeline.run_tick(Tick::Timer, NOW).await;

        assert_eq!(
            summary,
            TickSummary {
                markets: 2,
                buys: 1,
                resolves: 1,
                redeems: 1,
                settled: 1,
                failures: 0,
            }
        );
        assert_eq!(venue.orders.lock().unwrap()[0].token_id, "yes-2");
        assert_eq!(
            chain.sent()[1],
            Sent::Redeem {
                condition_id: expired.condition_id,
                index_sets: vec![U256::from(1u8), U256::from(2u8)],
                gas_price: 110,
            }
        );
    }

    #[tokio::test]
    async fn one_failing_market_does_not_stop_the_rest() {
        let registry = MarketRegistry::new();
        let broken = market(1, false);
        let healthy = market(2, false);
        registry.replace_all(vec![broken, healthy.clone()]);

        let chain = Arc::new(MockChain::new(100));
        chain.expire_at(healthy.question_id, NOW - 1);
        let mut pipeline = pipeline(&registry, Arc::new(Venue::default()), chain.clone());

        let summary = pipeline.run_tick(Tick::Block { number: 1, timestamp: NOW as u64 }, NOW).await;

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.settled, 1);
        assert_eq!(chain.sent().len(), 2);
    }

    #[tokio::test]
    async fn settled_counts_only_this_ticks_transitions() {
        let registry = MarketRegistry::new();
        let m = market(1, false);
        registry.replace_all(vec![m.clone()]);
        let chain = Arc::new(MockChain::new(100));
        chain.expire_at(m.question_id, NOW - 1);
        let mut pipeline = pipeline(&registry, Arc::new(Venue::default()), chain.clone());

        let first = pipeline.run_tick(Tick::Timer, NOW).await;
        let second = pipeline.run_tick(Tick::Timer, NOW + 2).await;

        assert_eq!(first.settled, 1);
        assert_eq!(second.settled, 0);
        assert_eq!(second.markets, 1);
        assert_eq!(chain.sent().len(), 2);
    }

    #[tokio::test]
    async fn departed_markets_lose_their_bookkeeping() {
        let registry = MarketRegistry::new();
        let m = market(1, false);
        registry.replace_all(vec![m.clone()]);
        let chain = Arc::new(MockChain::new(100));
        chain.expire_at(m.question_id, NOW - 1);
        let mut pipeline = pipeline(&registry, Arc::new(Venue::default()), chain);

        pipeline.run_tick(Tick::Timer, NOW).await;
        assert!(pipeline.settlement().is_settled(&m.question_id));

        registry.replace_all(Vec::new());
        let summary = pipeline.run_tick(Tick::Timer, NOW).await;
        assert_eq!(summary, TickSummary::default());
        assert!(pipeline.settlement().outstanding(&m.question_id).is_none());
    }

    #[tokio::test]
    async fn backlog_collapses_to_latest_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for number in 2..=5 {
            tx.send(Tick::Block { number, timestamp: number * 2 }).unwrap();
        }
        let (tick, skipped) = latest_pending(Tick::Block { number: 1, timestamp: 2 }, &mut rx);
        assert_eq!(tick, Tick::Block { number: 5, timestamp: 10 });
        assert_eq!(skipped, 4);

        let (tick, skipped) = latest_pending(Tick::Timer, &mut rx);
        assert_eq!((tick, skipped), (Tick::Timer, 0));
    }

    #[tokio::test]
    async fn run_stops_when_clock_closes() {
        let registry = MarketRegistry::new();
        let chain = Arc::new(MockChain::new(100));
        let mut pipeline = pipeline(&registry, Arc::new(Venue::default()), chain);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(Tick::Timer).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), pipeline.run(rx, shutdown_rx))
            .await
            .expect("pipeline should stop once the clock is gone");
    }
}
