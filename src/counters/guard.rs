// src/counters/guard.rs

use std::future::Future;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{timeout, Duration, Instant};
use tracing::{info, warn};

use super::{CounterError, CounterKey, CounterStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    /// 冷却结束，放行一次试探调用
    HalfOpen { trial_started: Instant },
}

/// 连续失败熔断器
#[derive(Debug)]
struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    trial_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration, trial_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            trial_timeout,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } if now >= until => {
                *state = BreakerState::HalfOpen { trial_started: now };
                true
            }
            BreakerState::Open { .. } => false,
            // 试探调用被取消时不会回报结果，超过调用超时后允许再次试探
            BreakerState::HalfOpen { trial_started } if now.duration_since(trial_started) >= self.trial_timeout => {
                *state = BreakerState::HalfOpen { trial_started: now };
                true
            }
            BreakerState::HalfOpen { .. } => false,
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, BreakerState::Closed { .. }) {
            info!("counter store recovered, circuit closed");
        }
        *state = BreakerState::Closed { failures: 0 };
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        let open = BreakerState::Open {
            until: Instant::now() + self.cooldown,
        };
        *state = match *state {
            BreakerState::Closed { failures } if failures + 1 >= self.threshold => {
                warn!(failures = failures + 1, cooldown_ms = self.cooldown.as_millis() as u64, "counter store circuit opened");
                open
            }
            BreakerState::Closed { failures } => BreakerState::Closed { failures: failures + 1 },
            BreakerState::HalfOpen { .. } | BreakerState::Open { .. } => open,
        };
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(*self.state.lock(), BreakerState::Open { .. })
    }
}

/// **带超时与熔断的计数存储**
///
/// 每次调用都有超时；连续失败达到阈值后短路 `cooldown`，期间直接返回 `CircuitOpen`。
pub struct Guarded<C> {
    inner: C,
    timeout: Duration,
    breaker: CircuitBreaker,
}

impl<C: CounterStore> Guarded<C> {
    pub fn new(inner: C, call_timeout: Duration, threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner,
            timeout: call_timeout,
            breaker: CircuitBreaker::new(threshold, cooldown, call_timeout),
        }
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, CounterError>
    where
        F: Future<Output = Result<T, CounterError>> + Send,
    {
        if !self.breaker.try_acquire() {
            return Err(CounterError::CircuitOpen);
        }
        match timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.breaker.on_success();
                Ok(value)
            }
            Ok(Err(error)) => {
                self.breaker.on_failure();
                Err(error)
            }
            Err(_) => {
                self.breaker.on_failure();
                Err(CounterError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl<C: CounterStore> CounterStore for Guarded<C> {
    async fn get_many(&self, keys: &[CounterKey]) -> Result<Vec<u64>, CounterError> {
        self.call(self.inner.get_many(keys)).await
    }

    async fn incr(&self, key: &CounterKey, by: u64, ttl: Option<Duration>) -> Result<u64, CounterError> {
        self.call(self.inner.incr(key, by, ttl)).await
    }
}
