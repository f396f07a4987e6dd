//! EIP-712 order signing for the CTF exchange.
//!
//! The CLOB only matches orders signed by the maker. A market buy is a
//! signed `Order` whose maker amount is the USDC spent and whose taker
//! amount is the shares bought at the limit price, both in 6-decimal
//! base units.

use crate::auth::AuthError;
use crate::onchain::chain::POLYGON_CHAIN_ID;
use alloy::hex;
use alloy::primitives::{address, Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use alloy::sol_types::{eip712_domain, Eip712Domain, SolStruct};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::str::FromStr;

pub const CTF_EXCHANGE: Address = address!("4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E");
pub const NEG_RISK_CTF_EXCHANGE: Address = address!("C5d563A36AE78145C45a50134d48A1215220f80a");

/// `side` field of the signed order.
const SIDE_BUY: u8 = 0;
/// Plain EOA signature: the key holder is maker and signer.
const SIGNATURE_TYPE_EOA: u8 = 0;

sol! {
    struct Order {
        uint256 salt;
        address maker;
        address signer;
        address taker;
        uint256 tokenId;
        uint256 makerAmount;
        uint256 takerAmount;
        uint256 expiration;
        uint256 nonce;
        uint256 feeRateBps;
        uint8 side;
        uint8 signatureType;
    }
}

pub fn exchange_domain(neg_risk: bool) -> Eip712Domain {
    let exchange = if neg_risk { NEG_RISK_CTF_EXCHANGE } else { CTF_EXCHANGE };
    eip712_domain! {
        name: "Polymarket CTF Exchange",
        version: "1",
        chain_id: POLYGON_CHAIN_ID,
        verifying_contract: exchange,
    }
}

fn base_units(amount: Decimal) -> Option<U256> {
    (amount * Decimal::from(1_000_000u32)).trunc().to_u128().map(U256::from)
}

/// Maker and taker amounts for a market buy of `amount_usd` at `price`.
/// USDC is cut to cents and shares to four decimals, rounding down.
pub fn market_buy_amounts(amount_usd: Decimal, price: Decimal) -> Result<(U256, U256), AuthError> {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return Err(AuthError::InvalidOrder(format!("price {price} is outside (0, 1)")));
    }
    let spend = amount_usd.round_dp_with_strategy(2, RoundingStrategy::ToZero);
    let shares = (spend / price).round_dp_with_strategy(4, RoundingStrategy::ToZero);
    if spend <= Decimal::ZERO || shares <= Decimal::ZERO {
        return Err(AuthError::InvalidOrder(format!("amount {amount_usd} buys nothing at {price}")));
    }
    let maker = base_units(spend).ok_or_else(|| AuthError::InvalidOrder(format!("amount {spend} out of range")))?;
    let taker = base_units(shares).ok_or_else(|| AuthError::InvalidOrder(format!("shares {shares} out of range")))?;
    Ok((maker, taker))
}

/// Order as the `/order` endpoint expects it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SignedOrder {
    pub salt: u64,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    #[serde(rename = "makerAmount")]
    pub maker_amount: String,
    #[serde(rename = "takerAmount")]
    pub taker_amount: String,
    pub expiration: String,
    pub nonce: String,
    #[serde(rename = "feeRateBps")]
    pub fee_rate_bps: String,
    pub side: String,
    #[serde(rename = "signatureType")]
    pub signature_type: u8,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostOrderRequest {
    pub order: SignedOrder,
    /// API key of the order owner.
    pub owner: String,
    #[serde(rename = "orderType")]
    pub order_type: String,
}

/// Market buy parameters for one token.
#[derive(Debug, Clone, Copy)]
pub struct MarketBuy<'a> {
    pub token_id: &'a str,
    pub amount_usd: Decimal,
    pub price: Decimal,
    pub fee_rate_bps: u64,
    pub neg_risk: bool,
    pub salt: u64,
}

/// Holds the trading key and signs orders with it.
pub struct OrderSigner {
    signer: PrivateKeySigner,
}

impl OrderSigner {
    pub fn from_private_key(key: &str) -> Result<Self, AuthError> {
        let key = key.strip_prefix("0x").unwrap_or(key);
        let signer = PrivateKeySigner::from_str(key).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self { signer })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn market_buy(&self, buy: &MarketBuy<'_>) -> Result<SignedOrder, AuthError> {
        let token_id = U256::from_str(buy.token_id)
            .map_err(|e| AuthError::InvalidOrder(format!("token id {}: {e}", buy.token_id)))?;
        let (maker_amount, taker_amount) = market_buy_amounts(buy.amount_usd, buy.price)?;
        let maker = self.address();

        let order = Order {
            salt: U256::from(buy.salt),
            maker,
            signer: maker,
            taker: Address::ZERO,
            tokenId: token_id,
            makerAmount: maker_amount,
            takerAmount: taker_amount,
            expiration: U256::ZERO,
            nonce: U256::ZERO,
            feeRateBps: U256::from(buy.fee_rate_bps),
            side: SIDE_BUY,
            signatureType: SIGNATURE_TYPE_EOA,
        };
        let hash = order.eip712_signing_hash(&exchange_domain(buy.neg_risk));
        let signature = self.sign_hash(&hash)?;

        Ok(SignedOrder {
            salt: buy.salt,
            maker: maker.to_string(),
            signer: maker.to_string(),
            taker: Address::ZERO.to_string(),
            token_id: token_id.to_string(),
            maker_amount: maker_amount.to_string(),
            taker_amount: taker_amount.to_string(),
            expiration: "0".to_string(),
            nonce: "0".to_string(),
            fee_rate_bps: buy.fee_rate_bps.to_string(),
            side: "BUY".to_string(),
            signature_type: SIGNATURE_TYPE_EOA,
            signature,
        })
    }

    fn sign_hash(&self, hash: &B256) -> Result<String, AuthError> {
        let signature = self
            .signer
            .sign_hash_sync(hash)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        Ok(hex::encode_prefixed(signature.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // Well-known development key.
    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TOKEN: &str = "71321045679252212594626385532706912750332728571942532289631379312455583992563";

    fn buy(neg_risk: bool) -> MarketBuy<'static> {
        MarketBuy {
            token_id: TOKEN,
            amount_usd: dec!(1),
            price: dec!(0.95),
            fee_rate_bps: 0,
            neg_risk,
            salt: 42,
        }
    }

    #[test]
    fn buy_amounts_round_down() {
        let (maker, taker) = market_buy_amounts(dec!(1), dec!(0.95)).unwrap();
        assert_eq!(maker, U256::from(1_000_000u64));
        // 1 / 0.95 = 1.052631.. -> 1.0526 shares
        assert_eq!(taker, U256::from(1_052_600u64));

        let (maker, _) = market_buy_amounts(dec!(2.509), dec!(0.5)).unwrap();
        assert_eq!(maker, U256::from(2_500_000u64));
    }

    #[test]
    fn unusable_amounts_are_rejected() {
        assert!(market_buy_amounts(dec!(1), dec!(1)).is_err());
        assert!(market_buy_amounts(dec!(1), dec!(0)).is_err());
        assert!(market_buy_amounts(dec!(0.001), dec!(0.5)).is_err());
    }

    #[test]
    fn signed_order_carries_maker_and_amounts() {
        let signer = OrderSigner::from_private_key(KEY).unwrap();
        let order = signer.market_buy(&buy(false)).unwrap();

        assert_eq!(
            signer.address(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
        assert_eq!(order.maker, signer.address().to_string());
        assert_eq!(order.signer, order.maker);
        assert_eq!(order.token_id, TOKEN);
        assert_eq!(order.maker_amount, "1000000");
        assert_eq!(order.taker_amount, "1052600");
        assert_eq!(order.side, "BUY");
        // 0x + 65 bytes
        assert_eq!(order.signature.len(), 132);
    }

    #[test]
    fn signature_recovers_to_maker_under_exchange_domain() {
        let signer = OrderSigner::from_private_key(KEY).unwrap();
        let signed = signer.market_buy(&buy(false)).unwrap();

        let order = Order {
            salt: U256::from(42u64),
            maker: signer.address(),
            signer: signer.address(),
            taker: Address::ZERO,
            tokenId: U256::from_str(TOKEN).unwrap(),
            makerAmount: U256::from(1_000_000u64),
            takerAmount: U256::from(1_052_600u64),
            expiration: U256::ZERO,
            nonce: U256::ZERO,
            feeRateBps: U256::ZERO,
            side: SIDE_BUY,
            signatureType: SIGNATURE_TYPE_EOA,
        };
        let hash = order.eip712_signing_hash(&exchange_domain(false));
        let expected = signer.signer.sign_hash_sync(&hash).unwrap();
        assert_eq!(signed.signature, hex::encode_prefixed(expected.as_bytes()));
        assert_eq!(expected.recover_address_from_prehash(&hash).unwrap(), signer.address());
    }

    #[test]
    fn neg_risk_markets_sign_for_the_other_exchange() {
        let signer = OrderSigner::from_private_key(KEY).unwrap();
        let plain = signer.market_buy(&buy(false)).unwrap();
        let neg_risk = signer.market_buy(&buy(true)).unwrap();
        assert_ne!(plain.signature, neg_risk.signature);
        assert_eq!(exchange_domain(true).verifying_contract, Some(NEG_RISK_CTF_EXCHANGE));
    }

    #[test]
    fn wire_names_match_the_order_endpoint() {
        let signer = OrderSigner::from_private_key(KEY).unwrap();
        let request = PostOrderRequest {
            order: signer.market_buy(&buy(false)).unwrap(),
            owner: "api-key".to_string(),
            order_type: "FOK".to_string(),
        };
        let v = serde_json::to_value(&request).unwrap();
        assert_eq!(v["orderType"], "FOK");
        assert_eq!(v["owner"], "api-key");
        assert_eq!(v["order"]["salt"], 42);
        assert_eq!(v["order"]["makerAmount"], "1000000");
        assert_eq!(v["order"]["signatureType"], 0);
        assert_eq!(v["order"]["tokenId"], TOKEN);
    }

    #[test]
    fn bad_inputs_are_rejected() {
        assert!(matches!(
            OrderSigner::from_private_key("nope"),
            Err(AuthError::InvalidKey(_))
        ));
        let signer = OrderSigner::from_private_key(KEY).unwrap();
        let mut bad = buy(false);
        bad.token_id = "not-a-number";
        assert!(matches!(signer.market_buy(&bad), Err(AuthError::InvalidOrder(_))));
    }
}
