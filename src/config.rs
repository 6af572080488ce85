//! Configuration management for the swap client
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub bitcoin: BitcoinConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Interval of the deadline ticker that marks quote expiry
    pub expiry_tick_ms: u64,
    /// Interval of the watchdog's authoritative commit-status polls
    pub watchdog_poll_ms: u64,
    /// Maximum retries for transient chain queries
    pub max_retries: u32,
    /// Initial backoff delay; doubles per attempt
    pub retry_delay_ms: u64,
    /// Backoff delay cap
    pub retry_delay_max_ms: u64,
    /// Margin subtracted from the quote expiry when deciding soft expiry
    pub soft_expiry_margin_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            expiry_tick_ms: 1_000,
            watchdog_poll_ms: 5_000,
            max_retries: 5,
            retry_delay_ms: 500,
            retry_delay_max_ms: 15_000,
            soft_expiry_margin_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite connection url, e.g. `sqlite://swaps.db`; `sqlite::memory:`
    /// for an ephemeral store
    pub url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://swaps.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Discovery endpoint returning the intermediary registry
    pub registry_url: Option<String>,
    /// Statically configured intermediary urls, merged with discovery
    pub intermediary_urls: Vec<String>,
    /// Chain tag the client settles on; selects which advertised
    /// intermediary address quoted escrows are checked against
    pub chain: String,
    /// Grace window granted to slower intermediaries once the first
    /// quote has arrived
    pub grace_window_ms: u64,
    /// Per-request timeout towards one intermediary
    pub request_timeout_ms: u64,
    /// Price deviation tolerance against the market price, in ppm
    pub price_tolerance_ppm: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            registry_url: None,
            intermediary_urls: Vec::new(),
            chain: "solana".to_string(),
            grace_window_ms: 2_000,
            request_timeout_ms: 10_000,
            price_tolerance_ppm: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BitcoinConfig {
    /// Esplora-compatible REST endpoint
    pub esplora_url: String,
    pub request_timeout_ms: u64,
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            esplora_url: "https://blockstream.info/api".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Page size of the backward walk locating the relay's last known header
    pub retrieval_page_size: u64,
    /// Extra backward pages fetched below the relay tip before a reorg
    /// replay gives up and forks from the oldest header fetched
    pub max_walk_pages: u64,
    /// Pause between synchronizer passes when already at the tip
    pub sync_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retrieval_page_size: 15,
            max_walk_pages: 4,
            sync_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Settings {
    /// Load settings from the configuration file named by `BTCSWAP_CONFIG`,
    /// falling back to `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("BTCSWAP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.client.expiry_tick_ms == 0 {
            anyhow::bail!("client.expiry_tick_ms must be positive");
        }
        if self.client.watchdog_poll_ms == 0 {
            anyhow::bail!("client.watchdog_poll_ms must be positive");
        }
        if self.relay.retrieval_page_size == 0 {
            anyhow::bail!("relay.retrieval_page_size must be positive");
        }
        if self.bitcoin.esplora_url.is_empty() {
            anyhow::bail!("bitcoin.esplora_url must be set");
        }
        if self.broker.chain.is_empty() {
            anyhow::bail!("broker.chain must be set");
        }
        for url in &self.broker.intermediary_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("broker.intermediary_urls entry {} is not an http(s) url", url);
            }
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
