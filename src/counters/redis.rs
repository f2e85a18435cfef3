// src/counters/redis.rs

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::time::Duration;

use super::{CounterError, CounterKey, CounterStore};

/// Redis 计数存储
#[derive(Clone)]
pub struct RedisCounters {
    conn: MultiplexedConnection,
}

impl RedisCounters {
    pub async fn connect(url: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn get_many(&self, keys: &[CounterKey]) -> Result<Vec<u64>, CounterError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<&str> = keys.iter().map(CounterKey::as_str).collect();
        let values = redis::cmd("MGET")
            .arg(&names)
            .query_async::<_, Vec<Option<u64>>>(&mut self.conn.clone())
            .await?;
        Ok(values.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn incr(&self, key: &CounterKey, by: u64, ttl: Option<Duration>) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        match ttl {
            // SET NX 保证过期时间从窗口第一次计数开始算
            Some(ttl) => {
                let (value,): (u64,) = redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(key.as_str())
                    .arg(0)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .arg("NX")
                    .ignore()
                    .cmd("INCRBY")
                    .arg(key.as_str())
                    .arg(by)
                    .query_async(&mut conn)
                    .await?;
                Ok(value)
            }
            None => Ok(redis::cmd("INCRBY")
                .arg(key.as_str())
                .arg(by)
                .query_async::<_, u64>(&mut conn)
                .await?),
        }
    }
}
