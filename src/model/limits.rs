// src/model/limits.rs

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// 计数指标
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Impressions,
    Clicks,
    Conversions,
    /// 花费，单位与 `Banner::price` 相同
    Money,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Impressions, Metric::Clicks, Metric::Conversions, Metric::Money];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Impressions => "impressions",
            Metric::Clicks => "clicks",
            Metric::Conversions => "conversions",
            Metric::Money => "money",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个指标的上限，0 表示不限
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Limit {
    pub daily: u64,
    pub total: u64,
    /// 按天匀速投放
    pub uniform: bool,
}

impl Limit {
    pub fn is_unlimited(&self) -> bool {
        self.daily == 0 && self.total == 0
    }

    /// 截至当日已过去 `day_fraction`（0..=1）时允许的日用量
    ///
    /// 非匀速投放时直接返回 `daily`；匀速投放按线性配额放量，且至少为 1。
    pub fn daily_allowance(&self, day_fraction: f64) -> Option<u64> {
        if self.daily == 0 {
            return None;
        }
        if !self.uniform {
            return Some(self.daily);
        }
        let fraction = day_fraction.clamp(0.0, 1.0);
        let allowed = (self.daily as f64 * fraction).ceil() as u64;
        Some(allowed.clamp(1, self.daily))
    }

    /// 已用量未达到上限时返回 true
    pub fn allows(&self, used_today: u64, used_total: u64, day_fraction: f64) -> bool {
        if self.total > 0 && used_total >= self.total {
            return false;
        }
        match self.daily_allowance(day_fraction) {
            Some(allowed) => used_today < allowed,
            None => true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Budget {
    pub impressions: Limit,
    pub clicks: Limit,
    pub conversions: Limit,
    pub money: Limit,
}

impl Budget {
    pub fn limit(&self, metric: Metric) -> &Limit {
        match metric {
            Metric::Impressions => &self.impressions,
            Metric::Clicks => &self.clicks,
            Metric::Conversions => &self.conversions,
            Metric::Money => &self.money,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        Metric::ALL.iter().all(|metric| self.limit(*metric).is_unlimited())
    }

    /// 设置了上限的指标
    pub fn limited(&self) -> impl Iterator<Item = (Metric, &Limit)> {
        Metric::ALL
            .into_iter()
            .map(move |metric| (metric, self.limit(metric)))
            .filter(|(_, limit)| !limit.is_unlimited())
    }
}

/// 频控：同一用户在 `period` 小时内最多曝光 `count` 次
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Capping {
    pub count: u32,
    pub period: u32,
}

impl Capping {
    pub fn is_unlimited(&self) -> bool {
        self.count == 0 || self.period == 0
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.period) * 3600)
    }

    pub fn allows(&self, exposures: u64) -> bool {
        self.is_unlimited() || exposures < u64::from(self.count)
    }
}
