use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub polymarket: PolymarketConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Streaming endpoint for new-head subscriptions - loaded from env RPC_URL_WSS
    #[serde(default)]
    pub ws_url: String,
    /// Extra WebSocket endpoints rotated through on consecutive failures.
    #[serde(default)]
    pub fallback_ws_urls: Vec<String>,
    /// Request/response endpoint for reads and transactions - env RPC_URL_HTTP
    #[serde(default = "default_http_url")]
    pub http_url: String,
    /// Signing key - loaded from env PRIVATE_KEY only
    #[serde(skip)]
    pub private_key: String,
    /// Premium applied to the node's suggested gas price.
    #[serde(default = "default_gas_multiplier")]
    pub gas_price_multiplier: f64,
    /// Upper bound on a single receipt wait before leaving the tx outstanding.
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
    /// Outstanding transactions older than this without a receipt are
    /// considered dropped and may be resubmitted.
    #[serde(default = "default_stale_after")]
    pub outstanding_stale_after_secs: u64,
    #[serde(default = "default_uma_oracle")]
    pub uma_oracle: String,
    #[serde(default = "default_uma_ctf_adapter")]
    pub uma_ctf_adapter: String,
    #[serde(default = "default_ctf_address")]
    pub ctf_address: String,
    #[serde(default = "default_collateral")]
    pub collateral_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolymarketConfig {
    /// CLOB REST API base URL
    #[serde(default = "default_clob_url")]
    pub clob_url: String,
    /// Gamma API URL (market discovery)
    #[serde(default = "default_gamma_url")]
    pub gamma_url: String,
    /// API key (L2 auth) - loaded from env POLYMARKET_API_KEY
    #[serde(default)]
    pub api_key: String,
    /// API secret (L2 auth) - loaded from env POLYMARKET_SECRET
    #[serde(default)]
    pub api_secret: String,
    /// API passphrase (L2 auth) - loaded from env POLYMARKET_PASSPHRASE
    #[serde(default)]
    pub api_passphrase: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Forward window: a market is tracked when its deadline is within this many seconds.
    #[serde(default = "default_horizon")]
    pub horizon_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Hard cap on catalog pagination.
    #[serde(default = "default_max_markets")]
    pub max_markets: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Buy the winning token when its best ask is strictly below this.
    #[serde(default = "default_target_price")]
    pub target_price: f64,
    /// USD amount per fill-or-kill buy.
    #[serde(default = "default_order_size")]
    pub order_size_usd: f64,
    #[serde(default)]
    pub winner_strategy: WinnerStrategy,
    /// For `book_skew`: minimum best bid that marks an outcome as the winner.
    #[serde(default = "default_skew_threshold")]
    pub skew_threshold: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerStrategy {
    /// Never claims a winner; execution stays idle.
    #[default]
    None,
    /// Trust the `winner` flags carried on the market's tokens.
    TokenFlag,
    /// Infer from a sharply one-sided order book.
    BookSkew,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// Pause after a successful resolve before redeeming.
    #[serde(default = "default_grace_delay")]
    pub grace_delay_secs: u64,
    #[serde(default = "default_index_sets")]
    pub index_sets: Vec<u64>,
    /// Read payoutDenominator before resolving and skip the resolve tx when
    /// the condition already has a payout.
    #[serde(default = "default_true")]
    pub check_resolved_onchain: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub clock: ClockKind,
    /// Tick interval when `clock = "timer"`.
    #[serde(default = "default_timer_interval")]
    pub timer_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockKind {
    #[default]
    Blocks,
    Timer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_http_url() -> String {
    "https://polygon-rpc.com".to_string()
}
fn default_gas_multiplier() -> f64 {
    1.1
}
fn default_receipt_timeout() -> u64 {
    120
}
fn default_stale_after() -> u64 {
    600
}
fn default_uma_oracle() -> String {
    "0xee3af10ebb505d975377d620ccfc098e9168858a".to_string()
}
fn default_uma_ctf_adapter() -> String {
    "0xd91E80cF2E7be2e162c6513ceD06f1dD0dA35296".to_string()
}
fn default_ctf_address() -> String {
    "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".to_string()
}
fn default_collateral() -> String {
    "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".to_string()
}
fn default_clob_url() -> String {
    "https://clob.polymarket.com".to_string()
}
fn default_gamma_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}
fn default_poll_interval() -> u64 {
    60
}
fn default_horizon() -> u64 {
    15 * 60
}
fn default_page_size() -> u32 {
    500
}
fn default_max_markets() -> u32 {
    20_000
}
fn default_true() -> bool {
    true
}
fn default_target_price() -> f64 {
    0.99
}
fn default_order_size() -> f64 {
    1.0
}
fn default_skew_threshold() -> f64 {
    0.95
}
fn default_grace_delay() -> u64 {
    5
}
fn default_index_sets() -> Vec<u64> {
    vec![1, 2]
}
fn default_timer_interval() -> u64 {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            fallback_ws_urls: Vec::new(),
            http_url: default_http_url(),
            private_key: String::new(),
            gas_price_multiplier: default_gas_multiplier(),
            receipt_timeout_secs: default_receipt_timeout(),
            outstanding_stale_after_secs: default_stale_after(),
            uma_oracle: default_uma_oracle(),
            uma_ctf_adapter: default_uma_ctf_adapter(),
            ctf_address: default_ctf_address(),
            collateral_token: default_collateral(),
        }
    }
}

impl Default for PolymarketConfig {
    fn default() -> Self {
        Self {
            clob_url: default_clob_url(),
            gamma_url: default_gamma_url(),
            api_key: String::new(),
            api_secret: String::new(),
            api_passphrase: String::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            horizon_secs: default_horizon(),
            page_size: default_page_size(),
            max_markets: default_max_markets(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_price: default_target_price(),
            order_size_usd: default_order_size(),
            winner_strategy: WinnerStrategy::None,
            skew_threshold: default_skew_threshold(),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            grace_delay_secs: default_grace_delay(),
            index_sets: default_index_sets(),
            check_resolved_onchain: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clock: ClockKind::Blocks,
            timer_interval_secs: default_timer_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Converts a config float into a Decimal, going through its shortest
/// string form so 0.99 stays 0.99.
pub fn to_decimal(value: f64) -> Decimal {
    Decimal::from_str(&value.to_string()).unwrap_or(Decimal::ZERO)
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.overlay_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults plus environment, for running without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.overlay_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Use the file at `path` if it exists, env-only otherwise.
    pub fn load_or_env(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::from_env()
        }
    }

    /// Override endpoints and secrets from the environment (never stored in the file).
    /// CLOB credentials also answer to their short `POLY_API_*` names.
    pub fn overlay_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_either = |key: &str, alias: &str| get(key).or_else(|| get(alias));

        if let Some(url) = get("RPC_URL_WSS") {
            self.chain.ws_url = url;
        }
        if let Some(url) = get("RPC_URL_HTTP") {
            self.chain.http_url = url;
        }
        if let Some(key) = get("PRIVATE_KEY") {
            self.chain.private_key = key;
        }
        if let Some(mult) = get("GAS_PRICE_MULTIPLIER") {
            self.chain.gas_price_multiplier =
                mult.trim().parse::<f64>().map_err(|e| ConfigError::Invalid {
                    field: "GAS_PRICE_MULTIPLIER",
                    reason: format!("{mult:?}: {e}"),
                })?;
        }
        if let Some(key) = get_either("POLYMARKET_API_KEY", "POLY_API_KEY") {
            self.polymarket.api_key = key;
        }
        if let Some(secret) = get_either("POLYMARKET_SECRET", "POLY_API_SECRET") {
            self.polymarket.api_secret = secret;
        }
        if let Some(pass) = get_either("POLYMARKET_PASSPHRASE", "POLY_API_PASSPHRASE") {
            self.polymarket.api_passphrase = pass;
        }
        Ok(())
    }

    /// Fail fast on anything the bot cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.ws_url.is_empty() {
            return Err(ConfigError::MissingEnv("RPC_URL_WSS".to_string()));
        }
        if self.chain.private_key.is_empty() {
            return Err(ConfigError::MissingEnv("PRIVATE_KEY".to_string()));
        }
        if self.polymarket.api_key.is_empty() {
            return Err(ConfigError::MissingEnv("POLYMARKET_API_KEY".to_string()));
        }
        if self.polymarket.api_secret.is_empty() {
            return Err(ConfigError::MissingEnv("POLYMARKET_SECRET".to_string()));
        }
        if self.polymarket.api_passphrase.is_empty() {
            return Err(ConfigError::MissingEnv("POLYMARKET_PASSPHRASE".to_string()));
        }
        if !self.chain.gas_price_multiplier.is_finite() || self.chain.gas_price_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "chain.gas_price_multiplier",
                reason: format!("{} is below 1.0", self.chain.gas_price_multiplier),
            });
        }
        if !(self.execution.target_price > 0.0 && self.execution.target_price <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "execution.target_price",
                reason: format!("{} is outside (0, 1]", self.execution.target_price),
            });
        }
        if self.execution.order_size_usd <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "execution.order_size_usd",
                reason: "must be positive".to_string(),
            });
        }
        if self.settlement.index_sets.is_empty() {
            return Err(ConfigError::Invalid {
                field: "settlement.index_sets",
                reason: "at least one index set is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.discovery.horizon_secs)
    }

    pub fn target_price(&self) -> Decimal {
        to_decimal(self.execution.target_price)
    }

    pub fn order_size(&self) -> Decimal {
        to_decimal(self.execution.order_size_usd)
    }

    pub fn gas_multiplier(&self) -> Decimal {
        to_decimal(self.chain.gas_price_multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn full_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("RPC_URL_WSS", "wss://polygon.example/ws"),
            ("PRIVATE_KEY", "0xabc"),
            ("POLYMARKET_API_KEY", "key"),
            ("POLYMARKET_SECRET", "c2VjcmV0"),
            ("POLYMARKET_PASSPHRASE", "pass"),
        ])
    }

    fn config_with(env: &HashMap<&'static str, &'static str>) -> Config {
        let mut config = Config::default();
        config.overlay_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.target_price(), dec!(0.99));
        assert_eq!(config.order_size(), dec!(1));
        assert_eq!(config.gas_multiplier(), dec!(1.1));
        assert_eq!(config.horizon(), Duration::from_secs(900));
        assert_eq!(config.discovery.poll_interval_secs, 60);
        assert_eq!(config.settlement.grace_delay_secs, 5);
        assert_eq!(config.settlement.index_sets, vec![1, 2]);
        assert_eq!(config.execution.winner_strategy, WinnerStrategy::None);
    }

    #[test]
    fn env_overlay_fills_secrets_and_validates() {
        let config = config_with(&full_env());
        assert!(config.validate().is_ok());
        assert_eq!(config.polymarket.api_key, "key");
        assert_eq!(config.polymarket.api_secret, "c2VjcmV0");
        assert_eq!(config.polymarket.api_passphrase, "pass");
        assert_eq!(config.chain.ws_url, "wss://polygon.example/ws");
    }

    #[test]
    fn missing_required_env_is_fatal() {
        let mut env = full_env();
        env.remove("PRIVATE_KEY");
        match config_with(&env).validate() {
            Err(ConfigError::MissingEnv(name)) => assert_eq!(name, "PRIVATE_KEY"),
            other => panic!("expected MissingEnv, got {other:?}"),
        }
    }

    #[test]
    fn gas_multiplier_comes_from_env() {
        let mut env = full_env();
        env.insert("GAS_PRICE_MULTIPLIER", "1.25");
        let config = config_with(&env);
        assert_eq!(config.gas_multiplier(), dec!(1.25));
    }

    #[test]
    fn unparsable_gas_multiplier_is_rejected() {
        let mut env = full_env();
        env.insert("GAS_PRICE_MULTIPLIER", "1,5");
        let mut config = Config::default();
        let err = config
            .overlay_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "GAS_PRICE_MULTIPLIER", .. }));
    }

    #[test]
    fn short_credential_names_still_work() {
        let env = HashMap::from([
            ("POLY_API_KEY", "short-key"),
            ("POLY_API_SECRET", "short-secret"),
            ("POLY_API_PASSPHRASE", "short-pass"),
            ("POLYMARKET_SECRET", "long-secret"),
        ]);
        let config = config_with(&env);
        assert_eq!(config.polymarket.api_key, "short-key");
        assert_eq!(config.polymarket.api_secret, "long-secret");
        assert_eq!(config.polymarket.api_passphrase, "short-pass");
    }

    #[test]
    fn missing_credentials_report_the_documented_names() {
        for (var, expected) in [
            ("POLYMARKET_API_KEY", "POLYMARKET_API_KEY"),
            ("POLYMARKET_SECRET", "POLYMARKET_SECRET"),
            ("POLYMARKET_PASSPHRASE", "POLYMARKET_PASSPHRASE"),
        ] {
            let mut env = full_env();
            env.remove(var);
            match config_with(&env).validate() {
                Err(ConfigError::MissingEnv(name)) => assert_eq!(name, expected),
                other => panic!("expected MissingEnv, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_target_price_above_one() {
        let mut config = config_with(&full_env());
        config.execution.target_price = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "execution.target_price", .. })
        ));
    }

    #[test]
    fn parses_toml_sections() {
        let toml = r#"
            [execution]
            target_price = 0.97
            winner_strategy = "book_skew"

            [pipeline]
            clock = "timer"
            timer_interval_secs = 3
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.target_price(), dec!(0.97));
        assert_eq!(config.execution.winner_strategy, WinnerStrategy::BookSkew);
        assert_eq!(config.pipeline.clock, ClockKind::Timer);
        assert_eq!(config.pipeline.timer_interval_secs, 3);
        assert_eq!(config.discovery.horizon_secs, 900);
    }
}
