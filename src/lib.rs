//! Expiry agent for Polymarket binary markets.
//!
//! Watches markets about to expire, buys the winning outcome below a target
//! price, force-resolves the question once the oracle liveness window has
//! elapsed, and redeems the resulting positions for collateral.

pub mod auth;
pub mod config;
pub mod execution;
pub mod market;
pub mod onchain;
pub mod pipeline;
pub mod settlement;
