//! Chain access for settlement: oracle reads, resolve/redeem submission,
//! receipt polling.

use crate::config::ChainConfig;
use crate::onchain::abi::{ConditionalTokens, UmaCtfAdapter, UmaOracle};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

pub const POLYGON_CHAIN_ID: u64 = 137;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("invalid {field} address: {reason}")]
    InvalidAddress { field: &'static str, reason: String },
    #[error("rpc connection failed: {0}")]
    Connect(String),
    #[error("contract call failed: {0}")]
    Call(String),
    #[error("rpc request failed: {0}")]
    Transport(String),
}

impl ChainError {
    /// A node-reported revert, as opposed to a transport or signing failure.
    pub fn is_revert(&self) -> bool {
        match self {
            ChainError::Call(msg) | ChainError::Transport(msg) => {
                let lower = msg.to_ascii_lowercase();
                lower.contains("execution reverted") || lower.contains("revert")
            }
            _ => false,
        }
    }
}

/// `getRequest` result for one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OracleRequest {
    pub request_timestamp: U256,
    pub liveness: U256,
}

impl OracleRequest {
    /// `requestTimestamp + liveness`, saturated into Unix seconds.
    pub fn expiration_timestamp(&self) -> i64 {
        let sum = self.request_timestamp.saturating_add(self.liveness);
        u64::try_from(sum)
            .ok()
            .and_then(|v| i64::try_from(v).ok())
            .unwrap_or(i64::MAX)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expiration_timestamp()
    }
}

/// `base × ⌊multiplier × 100⌋ / 100`, in integer wei.
pub fn premium_gas_price(base: u128, multiplier: Decimal) -> u128 {
    let percent = (multiplier * Decimal::ONE_HUNDRED)
        .floor()
        .to_u128()
        .unwrap_or(100);
    base.saturating_mul(percent) / 100
}

/// Everything the settlement engine needs from the chain. All writes go
/// through one signing account.
#[async_trait]
pub trait SettlementChain: Send + Sync {
    async fn oracle_request(&self, question_id: B256) -> Result<OracleRequest, ChainError>;

    /// True once the condition has a payout reported.
    async fn is_resolved(&self, condition_id: B256) -> Result<bool, ChainError>;

    async fn gas_price(&self) -> Result<u128, ChainError>;

    async fn send_resolve(&self, question_id: B256, gas_price: u128) -> Result<TxHash, ChainError>;

    async fn send_redeem(
        &self,
        condition_id: B256,
        index_sets: &[U256],
        gas_price: u128,
    ) -> Result<TxHash, ChainError>;

    /// One receipt lookup. `None` while the transaction is not mined.
    async fn receipt_status(&self, tx: TxHash) -> Result<Option<bool>, ChainError>;

    /// Poll for a receipt until `timeout`. `Ok(None)` means not mined in time.
    async fn wait_for_receipt(
        &self,
        tx: TxHash,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<bool>, ChainError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.receipt_status(tx).await? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// Polygon access over HTTP with a local signing wallet.
pub struct ChainClient {
    provider: DynProvider,
    wallet: Address,
    uma_oracle: Address,
    uma_ctf_adapter: Address,
    ctf: Address,
    collateral: Address,
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, ChainError> {
    Address::from_str(value).map_err(|e| ChainError::InvalidAddress {
        field,
        reason: e.to_string(),
    })
}

impl ChainClient {
    pub async fn connect(config: &ChainConfig) -> Result<Self, ChainError> {
        let key = config
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&config.private_key);
        let signer = PrivateKeySigner::from_str(key)
            .map_err(|e| ChainError::InvalidKey(e.to_string()))?
            .with_chain_id(Some(POLYGON_CHAIN_ID));
        let wallet = signer.address();

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect(&config.http_url)
            .await
            .map_err(|e| ChainError::Connect(e.to_string()))?
            .erased();

        let client = Self {
            provider,
            wallet,
            uma_oracle: parse_address("uma_oracle", &config.uma_oracle)?,
            uma_ctf_adapter: parse_address("uma_ctf_adapter", &config.uma_ctf_adapter)?,
            ctf: parse_address("ctf", &config.ctf_address)?,
            collateral: parse_address("collateral_token", &config.collateral_token)?,
        };

        info!(
            wallet = %client.wallet,
            rpc = %config.http_url,
            adapter = %client.uma_ctf_adapter,
            ctf = %client.ctf,
            "settlement chain client ready"
        );
        Ok(client)
    }
}

#[async_trait]
impl SettlementChain for ChainClient {
    async fn oracle_request(&self, question_id: B256) -> Result<OracleRequest, ChainError> {
        let oracle = UmaOracle::new(self.uma_oracle, &self.provider);
        let request = oracle
            .getRequest(question_id)
            .call()
            .await
            .map_err(|e| ChainError::Call(e.to_string()))?;
        Ok(OracleRequest {
            request_timestamp: request.requestTimestamp,
            liveness: request.liveness,
        })
    }

    async fn is_resolved(&self, condition_id: B256) -> Result<bool, ChainError> {
        let ctf = ConditionalTokens::new(self.ctf, &self.provider);
        let denominator = ctf
            .payoutDenominator(condition_id)
            .call()
            .await
            .map_err(|e| ChainError::Call(e.to_string()))?;
        Ok(!denominator.is_zero())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))
    }

    async fn send_resolve(&self, question_id: B256, gas_price: u128) -> Result<TxHash, ChainError> {
        let adapter = UmaCtfAdapter::new(self.uma_ctf_adapter, &self.provider);
        let pending = adapter
            .resolve(question_id)
            .gas_price(gas_price)
            .send()
            .await
            .map_err(|e| ChainError::Call(e.to_string()))?;
        let tx = *pending.tx_hash();
        debug!(question_id = %question_id, tx = %tx, gas_price = %gas_price, "resolve submitted");
        Ok(tx)
    }

    async fn send_redeem(
        &self,
        condition_id: B256,
        index_sets: &[U256],
        gas_price: u128,
    ) -> Result<TxHash, ChainError> {
        let ctf = ConditionalTokens::new(self.ctf, &self.provider);
        let pending = ctf
            .redeemPositions(self.collateral, B256::ZERO, condition_id, index_sets.to_vec())
            .gas_price(gas_price)
            .send()
            .await
            .map_err(|e| ChainError::Call(e.to_string()))?;
        let tx = *pending.tx_hash();
        debug!(condition_id = %condition_id, tx = %tx, gas_price = %gas_price, "redeem submitted");
        Ok(tx)
    }

    async fn receipt_status(&self, tx: TxHash) -> Result<Option<bool>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx)
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(receipt.map(|r| r.status()))
    }
}
