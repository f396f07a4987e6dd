//! Force-resolve and redeem for markets past their oracle deadline.
//!
//! Per question the engine walks
//! `Unexpired -> ExpiredUnresolved -> ResolvedUnredeemed -> Settled`,
//! with `AwaitingReceipt` whenever a submitted transaction has not been
//! mined yet. The contracts are the source of truth for "already done":
//! a revert on resolve or redeem is classified, never fatal. The only local
//! state is the per-question bookkeeping below, owned by the engine and
//! mutated by the single pipeline task.

use crate::config::Config;
use crate::market::Market;
use crate::onchain::{premium_gas_price, ChainError, SettlementChain};
use alloy::primitives::{TxHash, B256, U256};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("oracle read failed: {0}")]
    Oracle(#[source] ChainError),
    #[error("resolution check failed: {0}")]
    ResolutionCheck(#[source] ChainError),
    #[error("gas price lookup failed: {0}")]
    GasPrice(#[source] ChainError),
    #[error("resolve failed: {0}")]
    Resolve(#[source] ChainError),
    #[error("redeem failed: {0}")]
    Redeem(#[source] ChainError),
    #[error("receipt lookup for {tx} failed: {source}")]
    Receipt {
        tx: TxHash,
        #[source]
        source: ChainError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Unexpired,
    ExpiredUnresolved,
    ResolvedUnredeemed,
    Settled,
    AwaitingReceipt,
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementState::Unexpired => "unexpired",
            SettlementState::ExpiredUnresolved => "expired_unresolved",
            SettlementState::ResolvedUnredeemed => "resolved_unredeemed",
            SettlementState::Settled => "settled",
            SettlementState::AwaitingReceipt => "awaiting_receipt",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertKind {
    AlreadyResolved,
    /// Already redeemed, or nothing held to redeem.
    AlreadyRedeemed,
}

/// How one submitted transaction ended up this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Success(TxHash),
    /// Mined with status 0.
    FailedStatus(TxHash),
    RecognizedRevert(RevertKind),
    /// Not mined within the receipt timeout; still outstanding.
    Pending(TxHash),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReport {
    pub state: SettlementState,
    pub resolve: Option<TxOutcome>,
    pub redeem: Option<TxOutcome>,
    /// The market reached `Settled` during this call.
    pub newly_settled: bool,
}

impl SettlementReport {
    fn new(state: SettlementState) -> Self {
        Self {
            state,
            resolve: None,
            redeem: None,
            newly_settled: false,
        }
    }

    /// A resolve transaction went out this tick.
    pub fn submitted_resolve(&self) -> bool {
        matches!(
            self.resolve,
            Some(TxOutcome::Success(_) | TxOutcome::FailedStatus(_) | TxOutcome::Pending(_))
        )
    }

    pub fn submitted_redeem(&self) -> bool {
        matches!(
            self.redeem,
            Some(TxOutcome::Success(_) | TxOutcome::FailedStatus(_) | TxOutcome::Pending(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outstanding {
    pub tx_hash: TxHash,
    pub submitted_at: i64,
}

/// Bookkeeping for one question id. At most one resolve and one redeem
/// can be outstanding at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketSettlement {
    pub resolve: Option<Outstanding>,
    pub redeem: Option<Outstanding>,
    pub settled: bool,
}

#[derive(Debug, Clone)]
pub struct SettlementSettings {
    pub gas_multiplier: Decimal,
    pub grace_delay: Duration,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    /// Outstanding transactions older than this are treated as dropped.
    pub stale_after: Duration,
    pub index_sets: Vec<U256>,
    pub check_resolved_onchain: bool,
}

impl SettlementSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            gas_multiplier: config.gas_multiplier(),
            grace_delay: Duration::from_secs(config.settlement.grace_delay_secs),
            receipt_timeout: Duration::from_secs(config.chain.receipt_timeout_secs),
            receipt_poll_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(config.chain.outstanding_stale_after_secs),
            index_sets: config.settlement.index_sets.iter().map(|&s| U256::from(s)).collect(),
            check_resolved_onchain: config.settlement.check_resolved_onchain,
        }
    }
}

/// Where reconciling outstanding transactions left a market.
enum Reconciled {
    /// Nothing outstanding; run the normal flow.
    Fresh,
    /// A resolve mined earlier; go straight to redeem.
    Resolved(TxOutcome),
    Waiting,
    /// Settled before; the flag says whether it happened on this poll.
    Settled { now: bool },
}

pub struct SettlementEngine {
    chain: Arc<dyn SettlementChain>,
    settings: SettlementSettings,
    markets: HashMap<B256, MarketSettlement>,
}

impl SettlementEngine {
    pub fn new(chain: Arc<dyn SettlementChain>, settings: SettlementSettings) -> Self {
        Self {
            chain,
            settings,
            markets: HashMap::new(),
        }
    }

    pub fn outstanding(&self, question_id: &B256) -> Option<&MarketSettlement> {
        self.markets.get(question_id)
    }

    pub fn is_settled(&self, question_id: &B256) -> bool {
        self.markets.get(question_id).is_some_and(|m| m.settled)
    }

    /// Forget questions that are no longer in the registry.
    pub fn retain(&mut self, live: &[Market]) {
        let keep: HashSet<B256> = live.iter().map(|m| m.question_id).collect();
        let before = self.markets.len();
        self.markets.retain(|qid, _| keep.contains(qid));
        let pruned = before - self.markets.len();
        if pruned > 0 {
            debug!(pruned, "dropped settlement bookkeeping for departed markets");
        }
    }

    fn entry(&mut self, question_id: B256) -> &mut MarketSettlement {
        self.markets.entry(question_id).or_default()
    }

    fn is_stale(&self, outstanding: &Outstanding, now: i64) -> bool {
        let age = now.saturating_sub(outstanding.submitted_at);
        age >= i64::try_from(self.settings.stale_after.as_secs()).unwrap_or(i64::MAX)
    }

    async fn receipt(&self, tx: TxHash) -> Result<Option<bool>, SettlementError> {
        self.chain
            .wait_for_receipt(tx, self.settings.receipt_timeout, self.settings.receipt_poll_interval)
            .await
            .map_err(|source| SettlementError::Receipt { tx, source })
    }

    async fn premium_gas(&self) -> Result<u128, SettlementError> {
        let base = self.chain.gas_price().await.map_err(SettlementError::GasPrice)?;
        let gas = premium_gas_price(base, self.settings.gas_multiplier);
        debug!(base_gas_price = %base, gas_price = %gas, "gas price with premium");
        Ok(gas)
    }

    /// One receipt poll for each outstanding transaction of this market.
    async fn reconcile(&mut self, market: &Market, now: i64) -> Result<Reconciled, SettlementError> {
        let qid = market.question_id;
        let state = self.markets.get(&qid).cloned().unwrap_or_default();
        if state.settled {
            return Ok(Reconciled::Settled { now: false });
        }

        if let Some(redeem) = state.redeem {
            match self.chain.receipt_status(redeem.tx_hash).await {
                Ok(Some(true)) => {
                    info!(market = %market.slug, tx = %redeem.tx_hash, "positions redeemed successfully");
                    let entry = self.entry(qid);
                    entry.redeem = None;
                    entry.settled = true;
                    return Ok(Reconciled::Settled { now: true });
                }
                Ok(Some(false)) => {
                    error!(market = %market.slug, tx = %redeem.tx_hash, "redemption transaction failed");
                    self.entry(qid).redeem = None;
                }
                Ok(None) if self.is_stale(&redeem, now) => {
                    warn!(market = %market.slug, tx = %redeem.tx_hash, "redeem never mined, treating as dropped");
                    self.entry(qid).redeem = None;
                }
                Ok(None) => return Ok(Reconciled::Waiting),
                Err(source) => {
                    return Err(SettlementError::Receipt {
                        tx: redeem.tx_hash,
                        source,
                    })
                }
            }
        }

        if let Some(resolve) = state.resolve {
            match self.chain.receipt_status(resolve.tx_hash).await {
                Ok(Some(true)) => {
                    info!(market = %market.slug, tx = %resolve.tx_hash, "market resolved successfully");
                    self.entry(qid).resolve = None;
                    return Ok(Reconciled::Resolved(TxOutcome::Success(resolve.tx_hash)));
                }
                Ok(Some(false)) => {
                    error!(market = %market.slug, tx = %resolve.tx_hash, "market resolution transaction failed");
                    self.entry(qid).resolve = None;
                    return Ok(Reconciled::Resolved(TxOutcome::FailedStatus(resolve.tx_hash)));
                }
                Ok(None) if self.is_stale(&resolve, now) => {
                    warn!(market = %market.slug, tx = %resolve.tx_hash, "resolve never mined, treating as dropped");
                    self.entry(qid).resolve = None;
                }
                Ok(None) => return Ok(Reconciled::Waiting),
                Err(source) => {
                    return Err(SettlementError::Receipt {
                        tx: resolve.tx_hash,
                        source,
                    })
                }
            }
        }

        Ok(Reconciled::Fresh)
    }

    /// Advance one market as far as it can go this tick. Recognized
    /// reverts are folded into the report; anything else is returned.
    pub async fn process_market(
        &mut self,
        market: &Market,
        now: i64,
    ) -> Result<SettlementReport, SettlementError> {
        let mut report = SettlementReport::new(SettlementState::ExpiredUnresolved);

        match self.reconcile(market, now).await? {
            Reconciled::Settled { now } => {
                let mut report = SettlementReport::new(SettlementState::Settled);
                report.newly_settled = now;
                return Ok(report);
            }
            Reconciled::Waiting => {
                debug!(market = %market.slug, "transaction outstanding, waiting for receipt");
                return Ok(SettlementReport::new(SettlementState::AwaitingReceipt));
            }
            Reconciled::Resolved(outcome) => report.resolve = Some(outcome),
            Reconciled::Fresh => {
                let oracle = self
                    .chain
                    .oracle_request(market.question_id)
                    .await
                    .map_err(SettlementError::Oracle)?;
                let expiration = oracle.expiration_timestamp();
                if !oracle.is_expired(now) {
                    debug!(
                        market = %market.slug,
                        expiration_timestamp = expiration,
                        seconds_left = expiration.saturating_sub(now),
                        "oracle liveness not elapsed"
                    );
                    return Ok(SettlementReport::new(SettlementState::Unexpired));
                }
                info!(market = %market.slug, expiration_timestamp = expiration, "market expired");

                if self.confirmed_resolved(market).await? {
                    info!(market = %market.slug, "condition already resolved, proceeding to redeem");
                } else {
                    let outcome = self.force_resolve(market, now).await?;
                    report.resolve = Some(outcome);
                    if matches!(outcome, TxOutcome::Pending(_)) {
                        report.state = SettlementState::AwaitingReceipt;
                        return Ok(report);
                    }
                    if matches!(outcome, TxOutcome::RecognizedRevert(_))
                        && self.settings.check_resolved_onchain
                        && !self.confirmed_resolved(market).await?
                    {
                        warn!(market = %market.slug, "resolve reverted but condition is not resolved yet");
                        return Ok(report);
                    }
                }
            }
        }

        let outcome = self.redeem(market, now).await?;
        report.redeem = Some(outcome);
        let settled = match outcome {
            TxOutcome::Success(_) => true,
            TxOutcome::RecognizedRevert(_) => self.redeem_revert_is_final(market).await,
            TxOutcome::Pending(_) | TxOutcome::FailedStatus(_) => false,
        };
        report.state = match outcome {
            _ if settled => {
                self.entry(market.question_id).settled = true;
                SettlementState::Settled
            }
            TxOutcome::RecognizedRevert(_) => SettlementState::ExpiredUnresolved,
            TxOutcome::Pending(_) => SettlementState::AwaitingReceipt,
            TxOutcome::Success(_) | TxOutcome::FailedStatus(_) => SettlementState::ResolvedUnredeemed,
        };
        report.newly_settled = report.state == SettlementState::Settled;
        Ok(report)
    }

    /// A redeem revert only settles the market once the condition is
    /// resolved on chain; before that it means the payout is not reported yet.
    async fn redeem_revert_is_final(&self, market: &Market) -> bool {
        match self.chain.is_resolved(market.condition_id).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(market = %market.slug, "redeem reverted before the condition resolved, retrying next tick");
                false
            }
            Err(e) => {
                warn!(market = %market.slug, error = %e, "could not confirm resolution after redeem revert");
                false
            }
        }
    }

    async fn confirmed_resolved(&self, market: &Market) -> Result<bool, SettlementError> {
        if !self.settings.check_resolved_onchain {
            return Ok(false);
        }
        self.chain
            .is_resolved(market.condition_id)
            .await
            .map_err(SettlementError::ResolutionCheck)
    }

    async fn force_resolve(&mut self, market: &Market, now: i64) -> Result<TxOutcome, SettlementError> {
        let qid = market.question_id;
        info!(market = %market.slug, question_id = %qid, "attempting to resolve market");
        let gas_price = self.premium_gas().await?;

        let tx = match self.chain.send_resolve(qid, gas_price).await {
            Ok(tx) => tx,
            Err(e) if e.is_revert() => {
                warn!(market = %market.slug, error = %e, "market already resolved or resolution failed");
                return Ok(TxOutcome::RecognizedRevert(RevertKind::AlreadyResolved));
            }
            Err(e) => return Err(SettlementError::Resolve(e)),
        };
        info!(market = %market.slug, tx = %tx, gas_price = %gas_price, "market resolution transaction submitted");
        self.entry(qid).resolve = Some(Outstanding {
            tx_hash: tx,
            submitted_at: now,
        });

        match self.receipt(tx).await? {
            Some(true) => {
                self.entry(qid).resolve = None;
                info!(market = %market.slug, tx = %tx, "market resolved successfully");
                if !self.settings.grace_delay.is_zero() {
                    tokio::time::sleep(self.settings.grace_delay).await;
                }
                Ok(TxOutcome::Success(tx))
            }
            Some(false) => {
                self.entry(qid).resolve = None;
                error!(market = %market.slug, tx = %tx, "market resolution transaction failed");
                Ok(TxOutcome::FailedStatus(tx))
            }
            None => {
                warn!(market = %market.slug, tx = %tx, "resolve receipt not seen in time, will check next tick");
                Ok(TxOutcome::Pending(tx))
            }
        }
    }

    async fn redeem(&mut self, market: &Market, now: i64) -> Result<TxOutcome, SettlementError> {
        let qid = market.question_id;
        let cid = market.condition_id;
        info!(
            market = %market.slug,
            condition_id = %cid,
            index_sets = ?self.settings.index_sets,
            "attempting to redeem positions"
        );
        let gas_price = self.premium_gas().await?;

        let tx = match self.chain.send_redeem(cid, &self.settings.index_sets, gas_price).await {
            Ok(tx) => tx,
            Err(e) if e.is_revert() => {
                warn!(market = %market.slug, error = %e, "redemption reverted, may already be redeemed");
                return Ok(TxOutcome::RecognizedRevert(RevertKind::AlreadyRedeemed));
            }
            Err(e) => return Err(SettlementError::Redeem(e)),
        };
        info!(market = %market.slug, tx = %tx, gas_price = %gas_price, "redemption transaction submitted");
        self.entry(qid).redeem = Some(Outstanding {
            tx_hash: tx,
            submitted_at: now,
        });

        match self.receipt(tx).await? {
            Some(true) => {
                self.entry(qid).redeem = None;
                info!(market = %market.slug, tx = %tx, "positions redeemed successfully");
                Ok(TxOutcome::Success(tx))
            }
            Some(false) => {
                self.entry(qid).redeem = None;
                error!(market = %market.slug, tx = %tx, "redemption transaction failed");
                Ok(TxOutcome::FailedStatus(tx))
            }
            None => {
                warn!(market = %market.slug, tx = %tx, "redeem receipt not seen in time, will check next tick");
                Ok(TxOutcome::Pending(tx))
            }
        }
    }
}
