//! Market discovery from the Gamma API.
//!
//! Pulls the active catalog, keeps only well-formed binary markets, and
//! narrows them to the expiring window before swapping them into the
//! registry. Malformed records never leave this module.

use crate::market::{in_expiring_window, Market, MarketRegistry, Outcome, RegistryDiff};
use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use reqwest::Client;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Source of the full active-market catalog.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn fetch_markets(&self) -> anyhow::Result<Vec<Market>>;
}

/// Gamma REST feed.
pub struct GammaFeed {
    http: Client,
    gamma_url: String,
    page_size: u32,
    max_markets: u32,
}

impl GammaFeed {
    pub fn new(gamma_url: String, page_size: u32, max_markets: u32) -> Self {
        Self {
            http: Client::new(),
            gamma_url: gamma_url.trim_end_matches('/').to_string(),
            page_size: page_size.max(1),
            max_markets,
        }
    }

    async fn fetch_page(&self, offset: u32) -> anyhow::Result<Vec<Value>> {
        let url = format!("{}/markets", self.gamma_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("active", "true".to_string()),
                ("closed", "false".to_string()),
                ("limit", self.page_size.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("Gamma API returned status {}", resp.status());
        }

        Ok(resp.json::<Vec<Value>>().await?)
    }
}

#[async_trait]
impl MarketFeed for GammaFeed {
    async fn fetch_markets(&self) -> anyhow::Result<Vec<Market>> {
        let mut markets = Vec::new();
        let mut offset = 0u32;
        let mut skipped = 0usize;

        loop {
            debug!(offset = offset, limit = self.page_size, "fetching markets page");
            let page = self.fetch_page(offset).await?;
            let count = page.len() as u32;

            for record in &page {
                match parse_gamma_market(record) {
                    Some(m) => markets.push(m),
                    None => skipped += 1,
                }
            }

            if count < self.page_size {
                break;
            }
            offset += count;

            if offset >= self.max_markets {
                warn!("hit safety limit on market pagination at {offset} markets");
                break;
            }
        }

        debug!(parsed = markets.len(), skipped = skipped, "fetched markets from Gamma API");
        Ok(markets)
    }
}

fn first_field<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_null())
}

fn first_str(record: &Value, keys: &[&str]) -> Option<String> {
    first_field(record, keys)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_b256(record: &Value, keys: &[&str]) -> Option<B256> {
    first_str(record, keys).and_then(|s| B256::from_str(&s).ok())
}

/// Gamma encodes some arrays as JSON strings (`"[\"Yes\",\"No\"]"`).
fn string_list(value: &Value) -> Vec<String> {
    let list = match value {
        Value::String(s) => serde_json::from_str::<Vec<Value>>(s).unwrap_or_default(),
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    };
    list.into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

/// Unix seconds from a number, a numeric string, RFC 3339, or a bare date.
pub fn parse_expiry(value: &Value) -> Option<i64> {
    let from_number = |n: i64| if n > 10_000_000_000 { n / 1000 } else { n };

    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).map(from_number),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Some(from_number(n));
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp());
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(dt.and_utc().timestamp());
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Some(dt.and_utc().timestamp());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp())
        }
        _ => None,
    }
}

/// (outcome label, token id, winner flag) from either a `tokens` array or
/// the parallel `outcomes` / `clobTokenIds` lists, which carry no flag.
fn outcome_tokens(record: &Value) -> Vec<(String, String, bool)> {
    if let Some(tokens) = record.get("tokens").and_then(|t| t.as_array()) {
        return tokens
            .iter()
            .filter_map(|t| {
                let outcome = first_str(t, &["outcome"])?;
                let token_id = first_field(t, &["token_id", "tokenID", "tokenId"]).and_then(|v| {
                    match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    }
                })?;
                let winner = t.get("winner").and_then(Value::as_bool).unwrap_or(false);
                Some((outcome, token_id, winner))
            })
            .collect();
    }

    let outcomes = first_field(record, &["outcomes"]).map(string_list).unwrap_or_default();
    let token_ids = first_field(record, &["clobTokenIds", "clob_token_ids"])
        .map(string_list)
        .unwrap_or_default();
    if outcomes.len() != token_ids.len() {
        return Vec::new();
    }
    outcomes
        .into_iter()
        .zip(token_ids)
        .map(|(outcome, token_id)| (outcome, token_id, false))
        .collect()
}

/// Parse one Gamma record. Returns None (logged at debug) for anything
/// missing identity, expiry, or a Yes/No token pair.
pub fn parse_gamma_market(record: &Value) -> Option<Market> {
    let label = first_field(record, &["id", "slug"])
        .map(|v| v.to_string())
        .unwrap_or_default();

    let question_id = parse_b256(record, &["questionID", "question_id", "questionId"]);
    let condition_id = parse_b256(record, &["conditionId", "condition_id", "conditionID"]);
    let slug = first_str(record, &["slug"]);

    let (Some(question_id), Some(condition_id), Some(slug)) = (question_id, condition_id, slug) else {
        debug!(market = %label, "skipping market with missing fields");
        return None;
    };

    let Some(expiration_timestamp) =
        first_field(record, &["umaEndDate", "uma_end_date", "expiration", "endDate"])
            .and_then(parse_expiry)
    else {
        debug!(market = %label, "skipping market with missing expiration");
        return None;
    };

    let mut yes = None;
    let mut no = None;
    for (outcome, token_id, winner) in outcome_tokens(record) {
        match Outcome::from_label(&outcome) {
            Some(Outcome::Yes) => yes = Some((token_id, winner)),
            Some(Outcome::No) => no = Some((token_id, winner)),
            None => {}
        }
    }

    let (Some(yes), Some(no)) = (yes, no) else {
        debug!(market = %label, "skipping market without a Yes/No token pair");
        return None;
    };

    let mut market = Market::new(question_id, condition_id, slug, expiration_timestamp, yes.0, no.0);
    market.tokens[0].winner = yes.1;
    market.tokens[1].winner = no.1;
    Some(market)
}

/// One refresh cycle: fetch, window-filter, swap into the registry.
/// On fetch failure the registry keeps its previous set.
pub async fn refresh<F>(
    feed: &F,
    registry: &MarketRegistry,
    horizon: Duration,
    now: i64,
) -> anyhow::Result<RegistryDiff>
where
    F: MarketFeed + ?Sized,
{
    let all = feed.fetch_markets().await?;
    let total = all.len();

    let expiring: Vec<Market> = all
        .into_iter()
        .filter(|m| in_expiring_window(m.expiration_timestamp, now, horizon))
        .inspect(|m| {
            info!(
                market = %m.slug,
                expiration_timestamp = m.expiration_timestamp,
                time_until_expiration = m.seconds_until_expiry(now),
                "found expiring market"
            );
        })
        .collect();

    let diff = registry.replace_all(expiring);
    let snapshot = registry.snapshot();

    for qid in &diff.added {
        if let Some(m) = snapshot.iter().find(|m| &m.question_id == qid) {
            info!(market = %m.slug, question_id = %qid, "new target market discovered");
        }
    }
    for qid in &diff.removed {
        info!(question_id = %qid, "market no longer in expiration window");
    }

    info!(count = snapshot.len(), scanned = total, "target markets updated");
    Ok(diff)
}

/// Refresh immediately, then every `interval`, until the task is aborted.
pub fn spawn_refresh_loop(
    feed: Arc<dyn MarketFeed>,
    registry: MarketRegistry,
    interval: Duration,
    horizon: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), horizon_secs = horizon.as_secs(), "starting market discovery");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = refresh(feed.as_ref(), &registry, horizon, now).await {
                error!(error = %e, "error updating target markets");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    const QID: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
    const CID: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";

    struct FakeFeed {
        markets: Mutex<Option<Vec<Market>>>,
    }

    #[async_trait]
    impl MarketFeed for FakeFeed {
        async fn fetch_markets(&self) -> anyhow::Result<Vec<Market>> {
            self.markets
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("gamma unavailable"))
        }
    }

    fn market_expiring_at(id: u8, expiry: i64) -> Market {
        Market::new(
            B256::repeat_byte(id),
            B256::repeat_byte(id + 1),
            format!("m{id}"),
            expiry,
            "1",
            "2",
        )
    }

    #[test]
    fn parses_camel_case_gamma_record() {
        let record = json!({
            "id": "512",
            "questionID": QID,
            "conditionId": CID,
            "slug": "btc-above-100k",
            "umaEndDate": "2024-03-01T12:00:00Z",
            "outcomes": "[\"Yes\", \"No\"]",
            "clobTokenIds": "[\"123\", \"456\"]"
        });
        let m = parse_gamma_market(&record).expect("parsed");
        assert_eq!(m.slug, "btc-above-100k");
        assert_eq!(m.question_id, B256::from_str(QID).unwrap());
        assert_eq!(m.expiration_timestamp, 1_709_294_400);
        assert_eq!(m.token(Outcome::Yes).token_id, "123");
        assert_eq!(m.token(Outcome::No).token_id, "456");
    }

    #[test]
    fn parses_tokens_array_and_unix_expiration() {
        let record = json!({
            "question_id": QID,
            "condition_id": CID,
            "slug": "rain-in-nyc",
            "expiration": 1_700_000_000,
            "tokens": [
                {"outcome": "No", "token_id": "9", "winner": true},
                {"outcome": "Yes", "tokenID": "8"}
            ]
        });
        let m = parse_gamma_market(&record).expect("parsed");
        assert_eq!(m.expiration_timestamp, 1_700_000_000);
        assert_eq!(m.token(Outcome::Yes).token_id, "8");
        assert_eq!(m.token(Outcome::No).token_id, "9");
        assert!(m.token(Outcome::No).winner);
        assert!(!m.token(Outcome::Yes).winner);
    }

    #[test]
    fn drops_records_missing_identity_or_expiry() {
        let no_question = json!({
            "conditionId": CID, "slug": "x", "endDate": "2024-03-01",
            "outcomes": ["Yes", "No"], "clobTokenIds": ["1", "2"]
        });
        assert!(parse_gamma_market(&no_question).is_none());

        let no_expiry = json!({
            "questionID": QID, "conditionId": CID, "slug": "x",
            "outcomes": ["Yes", "No"], "clobTokenIds": ["1", "2"]
        });
        assert!(parse_gamma_market(&no_expiry).is_none());

        let not_binary = json!({
            "questionID": QID, "conditionId": CID, "slug": "x", "endDate": "2024-03-01",
            "outcomes": ["Trump", "Harris"], "clobTokenIds": ["1", "2"]
        });
        assert!(parse_gamma_market(&not_binary).is_none());
    }

    #[test]
    fn expiry_formats() {
        assert_eq!(parse_expiry(&json!("2024-03-01")), Some(1_709_251_200));
        assert_eq!(parse_expiry(&json!("1709251200")), Some(1_709_251_200));
        assert_eq!(parse_expiry(&json!(1_709_251_200_000i64)), Some(1_709_251_200));
        assert_eq!(parse_expiry(&json!("2024-03-01 00:00:00")), Some(1_709_251_200));
        assert_eq!(parse_expiry(&json!("soon")), None);
    }

    #[tokio::test]
    async fn refresh_keeps_only_expiring_window() {
        let now = 1_700_000_000;
        let feed = FakeFeed {
            markets: Mutex::new(Some(vec![
                market_expiring_at(1, now + 300),
                market_expiring_at(3, now + 3600),
                market_expiring_at(5, now - 10),
                market_expiring_at(7, now + 900),
            ])),
        };
        let registry = MarketRegistry::new();

        let diff = refresh(&feed, &registry, Duration::from_secs(900), now)
            .await
            .unwrap();

        let slugs: Vec<String> = registry.snapshot().iter().map(|m| m.slug.clone()).collect();
        assert_eq!(slugs, vec!["m1", "m7"]);
        assert_eq!(diff.added.len(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_registry_untouched() {
        let now = 1_700_000_000;
        let registry = MarketRegistry::new();
        registry.replace_all(vec![market_expiring_at(1, now + 60)]);

        let feed = FakeFeed {
            markets: Mutex::new(None),
        };
        assert!(refresh(&feed, &registry, Duration::from_secs(900), now)
            .await
            .is_err());
        assert_eq!(registry.len(), 1);
    }
}
