use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use paysettle::settings::{Settings, SettingsError};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Missing(&'static str),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Sled,
}

/// Webhook signing secret for one merchant identity.
#[derive(Clone, Debug, Deserialize)]
pub struct MerchantKey {
    pub public_key: String,
    pub secret: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen_addr: String,
    pub store: StoreKind,
    pub data_dir: PathBuf,
    /// Signs requests to the wallet and authenticates merchant API calls.
    pub master_key: String,
    /// Key the wallet signs payment webhooks with. Falls back to `master_key`.
    pub wallet_key: Option<String>,
    pub wallet_url: String,
    pub request_timeout_secs: u64,
    pub purge_interval_secs: u64,
    pub log_level: String,
    pub settlement: Settings,
    pub rates: BTreeMap<String, f64>,
    pub merchants: Vec<MerchantKey>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8070".to_string(),
            store: StoreKind::Sled,
            data_dir: PathBuf::from("paysettle.db"),
            master_key: String::new(),
            wallet_key: None,
            wallet_url: "http://127.0.0.1:8071".to_string(),
            request_timeout_secs: 5,
            purge_interval_secs: 60,
            log_level: "info".to_string(),
            settlement: Settings::default(),
            rates: BTreeMap::from([("trtl".to_string(), 1.0)]),
            merchants: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master_key.is_empty() {
            return Err(ConfigError::Missing("master_key is required (config, --master-key or PAYSETTLE_MASTER_KEY)"));
        }
        if self.rates.is_empty() {
            return Err(ConfigError::Missing("at least one exchange rate is required"));
        }
        self.settlement.validate()?;
        Ok(())
    }

    pub fn wallet_key(&self) -> &str {
        self.wallet_key.as_deref().filter(|k| !k.is_empty()).unwrap_or(&self.master_key)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

#[derive(Parser, Debug)]
#[command(name = "payments-service", about = "invoice settlement service")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen_addr: Option<String>,
    #[arg(long, value_enum)]
    pub store: Option<StoreKind>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long, env = "PAYSETTLE_MASTER_KEY", hide_env_values = true)]
    pub master_key: Option<String>,
    #[arg(long, env = "PAYSETTLE_WALLET_KEY", hide_env_values = true)]
    pub wallet_key: Option<String>,
    #[arg(long)]
    pub wallet_url: Option<String>,
    #[arg(long)]
    pub scan_interval_secs: Option<u64>,
    #[arg(long)]
    pub min_confirmations: Option<u64>,
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn merge_into_config(self, mut cfg: ServiceConfig) -> ServiceConfig {
        if let Some(v) = self.listen_addr {
            cfg.listen_addr = v;
        }
        if let Some(v) = self.store {
            cfg.store = v;
        }
        if let Some(v) = self.data_dir {
            cfg.data_dir = v;
        }
        if let Some(v) = self.master_key {
            cfg.master_key = v;
        }
        if let Some(v) = self.wallet_key {
            cfg.wallet_key = Some(v);
        }
        if let Some(v) = self.wallet_url {
            cfg.wallet_url = v;
        }
        if let Some(v) = self.scan_interval_secs {
            cfg.settlement.scan_interval_secs = v;
        }
        if let Some(v) = self.min_confirmations {
            cfg.settlement.min_confirmations = v;
        }
        if let Some(v) = self.log_level {
            cfg.log_level = v;
        }
        cfg
    }

    /// Config file (or defaults), then command-line overrides, then validation.
    pub fn resolve(self) -> Result<ServiceConfig, ConfigError> {
        let base = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };
        let cfg = self.merge_into_config(base);
        cfg.validate()?;
        Ok(cfg)
    }
}
