//! New-block subscription driving the pipeline clock.
//!
//! Keeps a WebSocket subscription to block headers alive, rotating through
//! the primary and fallback endpoints on failure, and forwards one
//! `Tick::Block` per header.

use crate::config::ChainConfig;
use crate::pipeline::Tick;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct HeadWatcher {
    urls: Vec<String>,
    tick_tx: mpsc::UnboundedSender<Tick>,
}

/// Primary first, then fallbacks, without blanks or duplicates.
pub fn ws_urls(primary: &str, fallbacks: &[String]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for url in std::iter::once(primary).chain(fallbacks.iter().map(String::as_str)) {
        if !url.is_empty() && !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

/// Fast rotation while untried endpoints remain, exponential once every
/// endpoint has failed in a row.
pub fn reconnect_backoff(consecutive_failures: usize, endpoints: usize) -> Duration {
    const MAX_BACKOFF_SECS: u64 = 60;
    if consecutive_failures == 0 {
        Duration::from_secs(1)
    } else if consecutive_failures < endpoints {
        Duration::from_secs(2)
    } else {
        let cycle = consecutive_failures / endpoints.max(1);
        let secs = 2u64.pow(cycle.min(5) as u32).min(MAX_BACKOFF_SECS);
        Duration::from_secs(secs)
    }
}

fn is_rate_limited(err: &str) -> bool {
    err.contains("429") || err.contains("Too Many Requests") || err.contains("Space limit exceeded")
}

impl HeadWatcher {
    pub fn new(config: &ChainConfig, tick_tx: mpsc::UnboundedSender<Tick>) -> Self {
        Self {
            urls: ws_urls(&config.ws_url, &config.fallback_ws_urls),
            tick_tx,
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_forever().await;
        })
    }

    async fn run_forever(&self) {
        if self.urls.is_empty() {
            error!("no Polygon WebSocket URLs configured (primary or fallback)");
            return;
        }
        let mut url_index = 0;
        let mut consecutive_failures: usize = 0;

        loop {
            let url = &self.urls[url_index];
            info!(url = %url, provider = url_index + 1, total = self.urls.len(), "subscribing to new blocks");

            match self.run_session(url).await {
                Ok(()) if self.tick_tx.is_closed() => {
                    info!("pipeline gone, stopping block subscription");
                    return;
                }
                Ok(()) => {
                    info!("block subscription ended cleanly");
                    consecutive_failures = 0;
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if is_rate_limited(&err_str) {
                        warn!(url = %url, "provider rate limited / quota exceeded, rotating");
                    } else {
                        error!(url = %url, error = %e, "block subscription error");
                    }
                    consecutive_failures += 1;
                    url_index = (url_index + 1) % self.urls.len();
                }
            }

            let backoff = reconnect_backoff(consecutive_failures, self.urls.len());
            info!(
                backoff_secs = backoff.as_secs(),
                next_url = %self.urls[url_index],
                failures = consecutive_failures,
                "reconnecting block subscription"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_session(&self, url: &str) -> anyhow::Result<()> {
        let provider = ProviderBuilder::new().connect_ws(WsConnect::new(url)).await?;
        let current = provider.get_block_number().await?;
        info!(block = current, "Polygon WebSocket connected, streaming heads");

        let mut stream = provider.subscribe_blocks().await?.into_stream();
        while let Some(header) = stream.next().await {
            debug!(block = header.number, timestamp = header.timestamp, "new block");
            let tick = Tick::Block {
                number: header.number,
                timestamp: header.timestamp,
            };
            if self.tick_tx.send(tick).is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_rotation_order() {
        let urls = ws_urls(
            "wss://a",
            &["".to_string(), "wss://b".to_string(), "wss://a".to_string()],
        );
        assert_eq!(urls, vec!["wss://a".to_string(), "wss://b".to_string()]);
        assert_eq!(ws_urls("", &["wss://c".to_string()]), vec!["wss://c".to_string()]);
    }

    #[test]
    fn backoff_grows_after_full_cycle() {
        assert_eq!(reconnect_backoff(0, 3), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(2, 3), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(3, 3), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(6, 3), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(100, 1), Duration::from_secs(32));
    }
}
