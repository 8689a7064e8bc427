use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::duration::{deserialize_duration, deserialize_duration_opt};
use crate::market_data::fx::DEFAULT_FX_TTL;
use crate::market_data::ServiceSettings;

const CONFIG_FILE_NAME: &str = "quotebook.toml";

fn default_reporting_currency() -> String {
    "EUR".to_string()
}

fn default_reference_currency() -> String {
    "USD".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

fn deserialize_secret_opt<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// `cache.jsonl` under the data directory.
    #[default]
    File,
    Memory,
}

/// Cache lifetimes. Freshness decides when a provider is asked again; TTL
/// decides when an entry stops being served at all.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    #[serde(deserialize_with = "deserialize_duration")]
    pub price_freshness: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub price_ttl: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub history_freshness: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub history_ttl: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub performance_ttl: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub fx_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let settings = ServiceSettings::default();
        Self {
            backend: CacheBackend::default(),
            price_freshness: settings.price_freshness,
            price_ttl: settings.price_ttl,
            history_freshness: settings.history_freshness,
            history_ttl: settings.history_ttl,
            performance_ttl: settings.performance_ttl,
            fx_ttl: DEFAULT_FX_TTL,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: ServiceSettings::default().batch_window,
        }
    }
}

/// Per-provider overrides. Unset fields keep the built-in defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: Option<bool>,
    pub base_url: Option<String>,
    #[serde(deserialize_with = "deserialize_secret_opt")]
    pub api_key: Option<SecretString>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub cooldown: Option<Duration>,
    pub per_minute_limit: Option<u32>,
    pub daily_limit: Option<u32>,
}

/// Application configuration as written in `quotebook.toml`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to data directory. If relative, resolved from config file location.
    pub data_dir: Option<PathBuf>,
    pub reporting_currency: String,
    pub reference_currency: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub http_timeout: Duration,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            reporting_currency: default_reporting_currency(),
            reference_currency: default_reference_currency(),
            http_timeout: default_http_timeout(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        anyhow::ensure!(
            is_currency_code(&config.reporting_currency),
            "reporting_currency must be a three-letter code, got {:?}",
            config.reporting_currency
        );
        anyhow::ensure!(
            is_currency_code(&config.reference_currency),
            "reference_currency must be a three-letter code, got {:?}",
            config.reference_currency
        );
        Ok(config)
    }

    /// If `data_dir` is set and relative, it's resolved relative to `config_dir`.
    /// If `data_dir` is not set, returns `config_dir`.
    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }
}

fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
}

/// Loaded configuration with resolved paths.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub reporting_currency: String,
    pub reference_currency: String,
    pub http_timeout: Duration,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./quotebook.toml` if it exists in current directory
/// 2. `quotebook/quotebook.toml` under the XDG data directory
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from(CONFIG_FILE_NAME);
    if local_config.exists() {
        return local_config;
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("quotebook").join(CONFIG_FILE_NAME);
    }
    local_config
}

impl ResolvedConfig {
    fn from_config(config: Config, config_dir: &Path) -> Self {
        let data_dir = config.resolve_data_dir(config_dir);
        Self {
            data_dir,
            reporting_currency: config.reporting_currency.to_uppercase(),
            reference_currency: config.reference_currency.to_uppercase(),
            http_timeout: config.http_timeout,
            cache: config.cache,
            batch: config.batch,
            providers: config.providers,
        }
    }

    /// The data directory is resolved relative to the config file's parent directory.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;
        let config_dir = config_path
            .parent()
            .context("Config file has no parent directory")?;
        let config = Config::load(&config_path)?;
        Ok(Self::from_config(config, config_dir))
    }

    /// Falls back to defaults when the file is missing, with the intended
    /// parent directory as the data directory.
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }
        let config_path = if config_path.is_relative() {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(config_path)
        } else {
            config_path.to_path_buf()
        };
        let config_dir = config_path
            .parent()
            .context("Config path has no parent directory")?;
        Ok(Self::from_config(Config::default(), config_dir))
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            reporting_currency: self.reporting_currency.clone(),
            reference_currency: self.reference_currency.clone(),
            price_freshness: self.cache.price_freshness,
            price_ttl: self.cache.price_ttl,
            history_freshness: self.cache.history_freshness,
            history_ttl: self.cache.history_ttl,
            performance_ttl: self.cache.performance_ttl,
            batch_window: self.batch.window,
            ..ServiceSettings::default()
        }
    }
}
