// src/config/config_manager.rs

use std::path::Path;

use chrono::FixedOffset;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// **服务配置**（TOML）
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub counters: CountersConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// 排期按该时区计算星期与小时
    pub timezone_offset_hours: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            timezone_offset_hours: 0,
        }
    }
}

impl ServerConfig {
    pub fn timezone(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.timezone_offset_hours * 3600).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "timezone_offset_hours {} is out of range",
                self.timezone_offset_hours
            ))
        })
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    Postgres(PostgresConfig),
    /// 联表后的行，JSON 数组
    File { path: String },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub dbname: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// 取连接与建连的超时
    #[serde(default = "default_pg_timeout_ms")]
    pub timeout_ms: u64,
}

impl PostgresConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pool_size() -> usize {
    16
}

fn default_pg_timeout_ms() -> u64 {
    5_000
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub refresh_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { refresh_secs: 60 }
    }
}

impl CacheConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.refresh_secs.max(1))
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Redis,
    #[default]
    Memory,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CountersConfig {
    pub kind: CounterKind,
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            kind: CounterKind::Memory,
            url: None,
            timeout_ms: 50,
            breaker_threshold: 5,
            breaker_cooldown_ms: 10_000,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    File,
    Http,
    None,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub sink: SinkKind,
    pub dir: String,
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::File,
            dir: "logs".to_string(),
            url: None,
            timeout_ms: 1_000,
            buffer_size: 10_000,
            batch_size: 100,
            flush_interval_ms: 1_000,
        }
    }
}

/// 插件引用：注册表中的名字加各自的配置表
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::value::Table::new())
}

impl PluginConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: empty_table(),
        }
    }
}

/// 一条投放流水线：Input → Stages → Output
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub name: String,
    pub route: String,
    pub input: PluginConfig,
    #[serde(default)]
    pub stages: Vec<PluginConfig>,
    #[serde(default)]
    pub targetings: Vec<PluginConfig>,
    #[serde(default)]
    pub formats: Vec<PluginConfig>,
    pub output: PluginConfig,
}

pub struct ConfigManager {
    pub config: Config,
}

impl ConfigManager {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Self::validate(&config)?;
        Ok(Self { config })
    }

    fn validate(config: &Config) -> Result<(), ConfigError> {
        config.server.timezone()?;
        if config.counters.kind == CounterKind::Redis && config.counters.url.is_none() {
            return Err(ConfigError::Invalid("counters.url is required for redis".into()));
        }
        if config.analytics.sink == SinkKind::Http && config.analytics.url.is_none() {
            return Err(ConfigError::Invalid("analytics.url is required for the http sink".into()));
        }
        if let StorageConfig::File { path } = &config.storage {
            if path.is_empty() {
                return Err(ConfigError::Invalid("storage.path must not be empty".into()));
            }
        }
        if config.routes.is_empty() {
            return Err(ConfigError::Invalid("at least one [[routes]] entry is required".into()));
        }
        Ok(())
    }
}
