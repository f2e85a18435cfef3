// src/counters/mod.rs

pub mod guard;
pub mod redis;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::model::{Metric, Tier};

pub use guard::Guarded;
pub use self::redis::RedisCounters;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter store circuit is open")]
    CircuitOpen,
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// 计数键，形如 `cap:{user}:{tier}:{id}` / `budget:{metric}:{tier}:{id}:{period}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// 用户在某层级某对象上的曝光次数
    pub fn capping(user: &str, tier: Tier, id: i64) -> Self {
        Self(format!("cap:{user}:{tier}:{id}"))
    }

    pub fn daily(metric: Metric, tier: Tier, id: i64, day: NaiveDate) -> Self {
        Self(format!("budget:{metric}:{tier}:{id}:{}", day.format("%Y%m%d")))
    }

    pub fn total(metric: Metric, tier: Tier, id: i64) -> Self {
        Self(format!("budget:{metric}:{tier}:{id}:total"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// **计数存储**（外部缓存集群）
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 批量读取，不存在的键为 0，结果与 `keys` 一一对应
    async fn get_many(&self, keys: &[CounterKey]) -> Result<Vec<u64>, CounterError>;

    /// 自增并返回新值；`ttl` 只在键首次创建时生效
    async fn incr(&self, key: &CounterKey, by: u64, ttl: Option<Duration>) -> Result<u64, CounterError>;
}

#[async_trait]
impl<C: CounterStore + ?Sized> CounterStore for Arc<C> {
    async fn get_many(&self, keys: &[CounterKey]) -> Result<Vec<u64>, CounterError> {
        (**self).get_many(keys).await
    }

    async fn incr(&self, key: &CounterKey, by: u64, ttl: Option<Duration>) -> Result<u64, CounterError> {
        (**self).incr(key, by, ttl).await
    }
}

/// 进程内计数，用于单机部署与测试
#[derive(Debug, Default)]
pub struct MemoryCounters {
    values: Mutex<HashMap<String, (u64, Option<Instant>)>>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn get_many(&self, keys: &[CounterKey]) -> Result<Vec<u64>, CounterError> {
        let now = Instant::now();
        let values = self.values.lock();
        Ok(keys
            .iter()
            .map(|key| match values.get(key.as_str()) {
                Some((value, expires)) if expires.map_or(true, |at| at > now) => *value,
                _ => 0,
            })
            .collect())
    }

    async fn incr(&self, key: &CounterKey, by: u64, ttl: Option<Duration>) -> Result<u64, CounterError> {
        let now = Instant::now();
        let mut values = self.values.lock();
        let entry = values
            .entry(key.as_str().to_string())
            .or_insert_with(|| (0, ttl.map(|ttl| now + ttl)));
        if entry.1.map_or(false, |at| at <= now) {
            *entry = (0, ttl.map(|ttl| now + ttl));
        }
        entry.0 = entry.0.saturating_add(by);
        Ok(entry.0)
    }
}
