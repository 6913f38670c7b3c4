use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::chan::{FetchPolicy, ProxyEndpoint};

const DEFAULT_ENV_PREFIX: &str = "CHANTUI";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub ui: UIConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_media_base")]
    pub media_base: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// CORS-style front-ends to rotate through; empty means direct.
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            media_base: default_media_base(),
            user_agent: default_user_agent(),
            proxies: Vec::new(),
        }
    }
}

fn default_api_base() -> String {
    crate::chan::DEFAULT_API_BASE.to_string()
}

fn default_media_base() -> String {
    crate::chan::DEFAULT_MEDIA_BASE.to_string()
}

fn default_user_agent() -> String {
    "chan-tui/0.1 (terminal imageboard client)".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Prefix,
    Query,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    #[serde(default)]
    pub mode: ProxyMode,
    pub url: String,
}

impl ProxyConfig {
    pub fn to_endpoint(&self) -> ProxyEndpoint {
        match self.mode {
            ProxyMode::Prefix => ProxyEndpoint::Prefix(self.url.clone()),
            ProxyMode::Query => ProxyEndpoint::Query(self.url.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_cap", with = "humantime_serde")]
    pub backoff_cap: Duration,
    #[serde(default = "default_jitter", with = "humantime_serde")]
    pub jitter: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout: default_timeout(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(8)
}

fn default_jitter() -> Duration {
    Duration::from_millis(250)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UIConfig {
    #[serde(default = "default_theme")]
    pub theme: String,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            theme: default_theme(),
        }
    }
}

fn default_theme() -> String {
    "default".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_catalog_ttl", with = "humantime_serde")]
    pub catalog_ttl: Duration,
    #[serde(default = "default_refresh_period", with = "humantime_serde")]
    pub refresh_period: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            catalog_ttl: default_catalog_ttl(),
            refresh_period: default_refresh_period(),
        }
    }
}

fn default_catalog_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_refresh_period() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: i64,
    #[serde(default = "default_media_ttl_duration", with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_size_bytes: default_max_size_bytes(),
            default_ttl: default_media_ttl_duration(),
            workers: default_workers(),
        }
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("chan-tui"))
}

fn default_max_size_bytes() -> i64 {
    200 * 1024 * 1024
}

fn default_media_ttl_duration() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_workers() -> usize {
    2
}

impl Config {
    /// Single policy shared by every API call site.
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_retries: self.fetch.max_retries,
            backoff_base: self.fetch.backoff_base,
            backoff_cap: self.fetch.backoff_cap,
            jitter: self.fetch.jitter,
            timeout: self.fetch.timeout,
            proxies: self.api.proxies.iter().map(ProxyConfig::to_endpoint).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.api.api_base.is_empty() {
        base.api.api_base = other.api.api_base;
    }
    if !other.api.media_base.is_empty() {
        base.api.media_base = other.api.media_base;
    }
    if !other.api.user_agent.is_empty() {
        base.api.user_agent = other.api.user_agent;
    }
    if !other.api.proxies.is_empty() {
        base.api.proxies = other.api.proxies;
    }

    if other.fetch.max_retries != default_max_retries() {
        base.fetch.max_retries = other.fetch.max_retries;
    }
    if other.fetch.timeout != default_timeout() {
        base.fetch.timeout = other.fetch.timeout;
    }
    if other.fetch.backoff_base != default_backoff_base() {
        base.fetch.backoff_base = other.fetch.backoff_base;
    }
    if other.fetch.backoff_cap != default_backoff_cap() {
        base.fetch.backoff_cap = other.fetch.backoff_cap;
    }
    if other.fetch.jitter != default_jitter() {
        base.fetch.jitter = other.fetch.jitter;
    }

    if !other.ui.theme.is_empty() {
        base.ui.theme = other.ui.theme;
    }

    if other.cache.catalog_ttl != default_catalog_ttl() {
        base.cache.catalog_ttl = other.cache.catalog_ttl;
    }
    if other.cache.refresh_period != default_refresh_period() {
        base.cache.refresh_period = other.cache.refresh_period;
    }

    if other.media.cache_dir.is_some() {
        base.media.cache_dir = other.media.cache_dir;
    }
    if other.media.max_size_bytes != 0 {
        base.media.max_size_bytes = other.media.max_size_bytes;
    }
    if other.media.default_ttl != default_media_ttl_duration() {
        base.media.default_ttl = other.media.default_ttl;
    }
    if other.media.workers != 0 {
        base.media.workers = other.media.workers;
    }

    base
}

/// Applies `PREFIX_SECTION__FIELD` environment variables on top of the
/// merged config. Only variables that are actually set touch `cfg`.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(cfg, &normalized, value);
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.api_base" => cfg.api.api_base = value,
        "api.media_base" => cfg.api.media_base = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.proxies" => {
            cfg.api.proxies = value
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|entry| match entry.strip_prefix("query:") {
                    Some(url) => ProxyConfig {
                        mode: ProxyMode::Query,
                        url: url.to_string(),
                    },
                    None => ProxyConfig {
                        mode: ProxyMode::Prefix,
                        url: entry.strip_prefix("prefix:").unwrap_or(entry).to_string(),
                    },
                })
                .collect();
        }
        "fetch.max_retries" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.fetch.max_retries = parsed;
            }
        }
        "fetch.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.fetch.timeout = duration;
            }
        }
        "fetch.backoff_base" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.fetch.backoff_base = duration;
            }
        }
        "fetch.backoff_cap" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.fetch.backoff_cap = duration;
            }
        }
        "fetch.jitter" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.fetch.jitter = duration;
            }
        }
        "ui.theme" => cfg.ui.theme = value,
        "cache.catalog_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.cache.catalog_ttl = duration;
            }
        }
        "cache.refresh_period" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.cache.refresh_period = duration;
            }
        }
        "media.cache_dir" => cfg.media.cache_dir = Some(PathBuf::from(value)),
        "media.max_size_bytes" => {
            if let Ok(parsed) = value.parse::<i64>() {
                cfg.media.max_size_bytes = parsed;
            }
        }
        "media.default_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.media.default_ttl = duration;
            }
        }
        "media.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.workers = parsed;
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chan-tui").join("config.yaml"))
}
