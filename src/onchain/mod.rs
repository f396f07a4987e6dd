//! Polygon access for the settlement path.
//!
//! - `abi`: `sol!` bindings for the UMA oracle, the UMA CTF adapter and
//!   the conditional tokens contract
//! - `chain`: the `SettlementChain` seam and its alloy-backed `ChainClient`
//! - `head`: block-header subscription that clocks the pipeline

pub mod abi;
pub mod chain;
pub mod head;

pub use chain::{premium_gas_price, ChainClient, ChainError, OracleRequest, SettlementChain};
pub use head::HeadWatcher;
