use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::error::SettingsError;
use crate::factory::FactoryV3;
use crate::multicall::MULTICALL3_ADDRESS;
use crate::types::conversions::{string_to_address, string_to_h256};

#[derive(Debug, Deserialize, Clone)]
pub struct Chain {
    pub chain_id: u64,
    pub rpc_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Extractor {
    /// Tick-lens style helper contract handed to every watcher.
    pub tick_helper: String,
    #[serde(default = "default_multicall_address")]
    pub multicall_address: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_quality_check_concurrency")]
    pub quality_check_concurrency: usize,
    #[serde(default = "default_quality_check_interval_seconds")]
    pub quality_check_interval_seconds: u64,
    #[serde(default = "default_transient_retry_seconds")]
    pub transient_retry_seconds: u64,
    #[serde(default = "default_multicall_batch_size")]
    pub multicall_batch_size: usize,
    #[serde(default = "default_multicall_window_ms")]
    pub multicall_window_ms: u64,
    #[serde(default = "default_multicall_timeout_seconds")]
    pub multicall_timeout_seconds: u64,
    #[serde(default = "default_log_poll_interval_ms")]
    pub log_poll_interval_ms: u64,
    #[serde(default = "default_log_max_block_range")]
    pub log_max_block_range: u64,
}

fn default_multicall_address() -> String {
    MULTICALL3_ADDRESS.to_string()
}
fn default_cache_dir() -> String {
    "./cache".to_string()
}
fn default_quality_check_concurrency() -> usize {
    200
}
fn default_quality_check_interval_seconds() -> u64 {
    60
}
fn default_transient_retry_seconds() -> u64 {
    300 // 5 minutes
}
fn default_multicall_batch_size() -> usize {
    100
}
fn default_multicall_window_ms() -> u64 {
    20
}
fn default_multicall_timeout_seconds() -> u64 {
    10
}
fn default_log_poll_interval_ms() -> u64 {
    1_000
}
fn default_log_max_block_range() -> u64 {
    100
}

impl Extractor {
    pub fn quality_check_interval(&self) -> Duration {
        Duration::from_secs(self.quality_check_interval_seconds)
    }

    pub fn transient_retry(&self) -> Duration {
        Duration::from_secs(self.transient_retry_seconds)
    }

    pub fn multicall_window(&self) -> Duration {
        Duration::from_millis(self.multicall_window_ms)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String, // "debug", "info", "warn"
    #[serde(default = "default_log_format")]
    pub format: String, // "text" or "json"
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeeSpacingEntry {
    pub fee: u32,
    pub tick_spacing: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FactoryEntry {
    pub address: String,
    pub provider: String,
    pub init_code_hash: String,
    #[serde(default)]
    pub deployer: Option<String>,
    /// Empty means the protocol default fee tiers.
    #[serde(default)]
    pub fee_spacing: Vec<FeeSpacingEntry>,
}

impl FactoryEntry {
    pub fn to_factory(&self) -> Result<FactoryV3, SettingsError> {
        let mut factory = FactoryV3::new(
            string_to_address(&self.address)?,
            self.provider.clone(),
            string_to_h256(&self.init_code_hash)?,
        );
        if let Some(deployer) = self.deployer.as_deref().filter(|d| !d.trim().is_empty()) {
            factory = factory.with_deployer(string_to_address(deployer)?);
        }
        if !self.fee_spacing.is_empty() {
            let mut map = BTreeMap::new();
            for entry in &self.fee_spacing {
                if entry.tick_spacing <= 0 {
                    return Err(SettingsError::InvalidTickSpacing {
                        factory: self.address.clone(),
                        fee: entry.fee,
                        tick_spacing: entry.tick_spacing,
                    });
                }
                if map.insert(entry.fee, entry.tick_spacing).is_some() {
                    return Err(SettingsError::DuplicateFee {
                        factory: self.address.clone(),
                        fee: entry.fee,
                    });
                }
            }
            factory = factory.with_fee_spacing(map);
        }
        Ok(factory)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub chain: Chain,
    pub extractor: Extractor,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub factories: Vec<FactoryEntry>,
}

impl Settings {
    /// Loads `Config.toml` (or the file named by `EXTRACTOR_CONFIG`), then
    /// applies `EXTRACTOR_*` environment overrides.
    pub fn new() -> Result<Self, SettingsError> {
        dotenv::dotenv().ok();
        let path = env::var("EXTRACTOR_CONFIG").unwrap_or_else(|_| "Config.toml".to_string());
        let s = Config::builder()
            .add_source(File::with_name(&path))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self, SettingsError> {
        let s = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("EXTRACTOR_RPC_URL") {
            if !url.trim().is_empty() {
                self.chain.rpc_url = url.trim().to_string();
            }
        }
        if let Ok(dir) = env::var("EXTRACTOR_CACHE_DIR") {
            if !dir.trim().is_empty() {
                self.extractor.cache_dir = dir.trim().to_string();
            }
        }
        if let Ok(helper) = env::var("EXTRACTOR_TICK_HELPER") {
            if !helper.trim().is_empty() {
                self.extractor.tick_helper = helper.trim().to_string();
            }
        }
    }

    /// Validated factory descriptors, in configuration order.
    pub fn factories(&self) -> Result<Vec<FactoryV3>, SettingsError> {
        if self.factories.is_empty() {
            return Err(SettingsError::NoFactories);
        }
        self.factories.iter().map(FactoryEntry::to_factory).collect()
    }
}
