//! L2 HMAC-SHA256 authentication for Polymarket CLOB API.
//!
//! Polymarket uses a two-level auth system:
//! - L1: EIP-712 wallet signatures (used to derive API credentials)
//! - L2: HMAC-SHA256 signed requests (used for all trading operations)
//!
//! This module implements L2. Credentials (api_key, secret, passphrase)
//! must be derived externally using py-clob-client or rs-clob-client.
//! Order book reads are public and go out unsigned. Orders themselves are
//! EIP-712 signed by the wallet, see [`order`].

pub mod order;

pub use order::{MarketBuy, OrderSigner, PostOrderRequest, SignedOrder};

use alloy::primitives::Address;
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const HEADER_ADDRESS: &str = "POLY_ADDRESS";
const HEADER_API_KEY: &str = "POLY_API_KEY";
const HEADER_SIGNATURE: &str = "POLY_SIGNATURE";
const HEADER_TIMESTAMP: &str = "POLY_TIMESTAMP";
const HEADER_PASSPHRASE: &str = "POLY_PASSPHRASE";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("order signing failed: {0}")]
    Signing(String),
    #[error("HMAC key error: {0}")]
    HmacKey(String),
    #[error("invalid header value: {0}")]
    Header(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    ApiError { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct L2Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl L2Credentials {
    pub fn from_config(api_key: &str, secret: &str, passphrase: &str) -> Option<Self> {
        if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() {
            return None;
        }
        Some(Self {
            api_key: api_key.to_string(),
            secret: secret.to_string(),
            passphrase: passphrase.to_string(),
        })
    }
}

/// HMAC-SHA256(secret, timestamp + method + path + body), base64 encoded.
///
/// Secrets are issued URL-safe base64; standard base64 is accepted too.
pub fn sign_l2(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, AuthError> {
    let message = format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body);

    let secret_bytes = BASE64_URL
        .decode(secret)
        .or_else(|_| BASE64.decode(secret))
        .map_err(|e| AuthError::HmacKey(e.to_string()))?;

    let mut mac = HmacSha256::new_from_slice(&secret_bytes)
        .map_err(|e| AuthError::HmacKey(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(BASE64_URL.encode(mac.finalize().into_bytes()))
}

fn header_value(value: &str) -> Result<HeaderValue, AuthError> {
    HeaderValue::from_str(value).map_err(|e| AuthError::Header(e.to_string()))
}

/// Build L2 auth headers for a CLOB API request made by `address`.
pub fn build_l2_headers(
    creds: &L2Credentials,
    address: Address,
    method: &str,
    path: &str,
    body: &str,
) -> Result<HeaderMap, AuthError> {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let signature = sign_l2(&creds.secret, &timestamp, method, path, body)?;

    debug!(
        method = method,
        path = path,
        timestamp = %timestamp,
        "built L2 auth headers"
    );

    let mut headers = HeaderMap::new();
    headers.insert(HEADER_ADDRESS, header_value(&address.to_string())?);
    headers.insert(HEADER_API_KEY, header_value(&creds.api_key)?);
    headers.insert(HEADER_SIGNATURE, header_value(&signature)?);
    headers.insert(HEADER_TIMESTAMP, header_value(&timestamp)?);
    headers.insert(HEADER_PASSPHRASE, header_value(&creds.passphrase)?);

    Ok(headers)
}

/// Authenticated HTTP client for Polymarket CLOB REST API.
pub struct ClobApiClient {
    client: reqwest::Client,
    base_url: String,
    creds: L2Credentials,
    address: Address,
}

impl ClobApiClient {
    pub fn new(base_url: String, creds: L2Credentials, address: Address) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
            address,
        }
    }

    /// Owner field for posted orders.
    pub fn api_key(&self) -> &str {
        &self.creds.api_key
    }

    /// Unauthenticated GET (market data).
    pub async fn get_public(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value, AuthError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::ApiError { status, body });
        }
        Ok(resp.json().await?)
    }

    /// POST with L2 auth and JSON body.
    pub async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, AuthError> {
        let body_str = serde_json::to_string(body).unwrap_or_default();
        let headers = build_l2_headers(&self.creds, self.address, "POST", path, &body_str)?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::ApiError { status, body });
        }
        Ok(resp.json().await?)
    }

    /// Order book snapshot for one token.
    pub async fn order_book(&self, token_id: &str) -> Result<BookResponse, AuthError> {
        let resp = self.get_public("/book", &[("token_id", token_id)]).await?;
        Ok(serde_json::from_value(resp).unwrap_or_default())
    }

    /// Whether the token trades on the neg-risk exchange.
    pub async fn neg_risk(&self, token_id: &str) -> Result<bool, AuthError> {
        let resp = self.get_public("/neg-risk", &[("token_id", token_id)]).await?;
        Ok(resp.get("neg_risk").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Fee rate the exchange expects in signed orders for this token.
    pub async fn fee_rate_bps(&self, token_id: &str) -> Result<u64, AuthError> {
        let resp = self.get_public("/fee-rate", &[("token_id", token_id)]).await?;
        Ok(fee_rate_from(&resp))
    }

    /// Post one signed order. Returns a typed response with order_id.
    pub async fn place_order(&self, order: &PostOrderRequest) -> Result<PlaceOrderResponse, AuthError> {
        let body = serde_json::to_value(order).unwrap_or_default();
        let resp = self.post("/order", &body).await?;
        let parsed: PlaceOrderResponse =
            serde_json::from_value(resp).unwrap_or_else(|_| PlaceOrderResponse {
                success: false,
                error_msg: "failed to parse response".to_string(),
                order_id: String::new(),
                status: String::new(),
            });
        Ok(parsed)
    }
}

/// `base_fee` arrives as a number or a numeric string.
fn fee_rate_from(resp: &Value) -> u64 {
    match resp.get("base_fee") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Response from the CLOB API when placing an order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaceOrderResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, rename = "errorMsg")]
    pub error_msg: String,
    #[serde(default, rename = "orderID")]
    pub order_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookLevel {
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub size: String,
}

/// `GET /book` payload (subset).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookResponse {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}
