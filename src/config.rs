//! Application configuration.
//!
//! The config file is re-read at the top of every live cycle through
//! [`ConfigSource::reload`], which keeps the last good snapshot when the file is
//! missing, unreadable or invalid. Secrets never live in the file: accounts,
//! the advisor and the notifier name the environment variables holding them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::advisor::AdvisorSettings;
use crate::backtest::BacktestConfig;
use crate::control::write_atomic;
use crate::notify::NotifierSettings;
use crate::strategy::StrategySettings;
use crate::trading::RiskParams;

pub const DEFAULT_CONFIG_PATH: &str = "config/titan.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loop timing, run flag and storage locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    /// Run flag checked at the top of every cycle, for every account
    pub running: bool,

    /// Kline interval, e.g. `1h`
    pub interval: String,

    /// Bars fetched per cycle
    pub bar_limit: u32,

    /// Sleep between cycles while idle (seconds)
    pub poll_interval_secs: u64,

    /// Sleep between cycles while a position is open (seconds)
    pub position_poll_secs: u64,

    /// Sleep after a failed cycle (seconds)
    pub retry_delay_secs: u64,

    /// Root for command and status files
    pub data_dir: PathBuf,

    pub database_url: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            running: true,
            interval: "1h".to_string(),
            bar_limit: 200,
            poll_interval_secs: 10,
            position_poll_secs: 60,
            retry_delay_secs: 10,
            data_dir: PathBuf::from("data"),
            database_url: "sqlite:./data/titan.db?mode=rwc".to_string(),
        }
    }
}

impl SystemSettings {
    pub fn command_dir(&self) -> PathBuf {
        self.data_dir.join("commands")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.data_dir.join("status")
    }
}

/// The traded instrument and its risk budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairSettings {
    /// `BTC/USDT` style symbol
    pub symbol: String,

    /// Margin asset whose free balance is sized against
    pub quote_asset: String,

    /// Decimal places for trigger prices
    pub price_precision: Option<u32>,

    pub risk: RiskParams,
}

impl Default for PairSettings {
    fn default() -> Self {
        Self {
            symbol: "BTC/USDT".to_string(),
            quote_asset: "USDT".to_string(),
            price_precision: None,
            risk: RiskParams {
                quantity_precision: Some(3),
                ..RiskParams::default()
            },
        }
    }
}

/// One exchange account, driven by its own loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    pub name: String,
    pub enabled: bool,
    pub api_key_env: String,
    pub api_secret_env: String,

    /// Override for the futures REST root (e.g. testnet)
    pub base_url: Option<String>,

    /// Set by the pause/resume commands; only this account's loop stops
    pub paused: bool,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            enabled: true,
            api_key_env: "BINANCE_API_KEY".to_string(),
            api_secret_env: "BINANCE_API_SECRET".to_string(),
            base_url: None,
            paused: false,
        }
    }
}

/// Whole config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemSettings,
    pub strategy: StrategySettings,
    pub pair: PairSettings,
    pub accounts: Vec<AccountSettings>,
    pub advisor: AdvisorSettings,
    pub notifier: NotifierSettings,
    pub backtest: BacktestConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            system: SystemSettings::default(),
            strategy: StrategySettings::default(),
            pair: PairSettings::default(),
            accounts: vec![AccountSettings::default()],
            advisor: AdvisorSettings::default(),
            notifier: NotifierSettings::default(),
            backtest: BacktestConfig::default(),
        }
    }
}

impl AppConfig {
    /// Parse and validate a config document.
    pub fn from_json(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pair.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("pair.symbol is empty".into()));
        }
        let risk = &self.pair.risk;
        if risk.risk_fraction <= Decimal::ZERO || risk.risk_fraction > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "pair.risk.risk_fraction must be in (0, 1], got {}",
                risk.risk_fraction
            )));
        }
        if risk.leverage == 0 {
            return Err(ConfigError::Invalid("pair.risk.leverage must be >= 1".into()));
        }
        if self.system.bar_limit == 0 {
            return Err(ConfigError::Invalid("system.bar_limit must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            let valid_name = !account.name.is_empty()
                && account
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid_name {
                return Err(ConfigError::Invalid(format!(
                    "account name '{}' must be non-empty [A-Za-z0-9_-]",
                    account.name
                )));
            }
            if !seen.insert(account.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate account '{}'", account.name)));
            }
        }
        Ok(())
    }

    /// Backtest settings with the pair's risk budget applied.
    pub fn backtest_config(&self) -> BacktestConfig {
        BacktestConfig {
            risk: self.pair.risk.clone(),
            ..self.backtest.clone()
        }
    }

    pub fn account(&self, name: &str) -> Option<&AccountSettings> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Global run flag and the account's own pause flag together.
    pub fn is_running(&self, account: &str) -> bool {
        self.system.running && !self.account(account).is_some_and(|a| a.paused)
    }
}

/// Config file plus the last snapshot that loaded cleanly.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    last_good: Option<AppConfig>,
}

impl ConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_good: None,
        }
    }

    /// Start from an already loaded snapshot.
    pub fn with_snapshot(path: impl Into<PathBuf>, snapshot: AppConfig) -> Self {
        Self {
            path: path.into(),
            last_good: Some(snapshot),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse and validate the file.
    pub async fn load(&self) -> Result<AppConfig, ConfigError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.clone(),
                source,
            })?;
        AppConfig::from_json(&self.path, &raw)
    }

    /// Reload boundary. Returns the fresh snapshot, or the previous good one
    /// when loading fails (`None` if there never was one).
    pub async fn reload(&mut self) -> Option<AppConfig> {
        match self.load().await {
            Ok(config) => {
                self.last_good = Some(config.clone());
                Some(config)
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Config reload failed, keeping last good snapshot");
                self.last_good.clone()
            }
        }
    }

    /// Set `paused` on one account in the file, leaving every other field as written.
    pub async fn set_paused(&self, account: &str, paused: bool) -> anyhow::Result<()> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        let mut doc: serde_json::Value =
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse {:?}", self.path))?;

        let entry = doc
            .get_mut("accounts")
            .and_then(|a| a.as_array_mut())
            .and_then(|accounts| {
                accounts
                    .iter_mut()
                    .find(|a| a.get("name").and_then(|n| n.as_str()) == Some(account))
            })
            .and_then(|a| a.as_object_mut())
            .ok_or_else(|| anyhow!("Account '{}' is not listed in {:?}", account, self.path))?;
        entry.insert("paused".to_string(), serde_json::Value::Bool(paused));

        write_atomic(&self.path, &serde_json::to_vec_pretty(&doc)?).await
    }

    /// Write a default config file.
    pub async fn write_default(&self) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(&AppConfig::default())?;
        write_atomic(&self.path, &body).await
    }
}
