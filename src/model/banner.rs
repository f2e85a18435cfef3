// src/model/banner.rs

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::model::limits::{Budget, Capping};
use crate::model::targeting::Targeting;
use crate::model::timetable::Timetable;

/// 早于该时间的结束时间视为“未设置结束时间”（库里的零值日期）
pub static NO_END_SENTINEL: Lazy<DateTime<Utc>> = Lazy::new(|| {
    DateTime::from_timestamp(946_684_800, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
});

/// **投放层级**
///
/// 属性按 广告主 → 计划 → 组 → 创意 的顺序逐级覆盖，`ALL` 即覆盖顺序。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Advertiser,
    Campaign,
    Group,
    Banner,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Advertiser, Tier::Campaign, Tier::Group, Tier::Banner];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Advertiser => "advertiser",
            Tier::Campaign => "campaign",
            Tier::Group => "group",
            Tier::Banner => "banner",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 每个层级各自持有一份的值（预算、频控、时间窗口、ID 等）
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Tiered<T> {
    pub advertiser: T,
    pub campaign: T,
    pub group: T,
    pub banner: T,
}

impl<T> Tiered<T> {
    pub fn get(&self, tier: Tier) -> &T {
        match tier {
            Tier::Advertiser => &self.advertiser,
            Tier::Campaign => &self.campaign,
            Tier::Group => &self.group,
            Tier::Banner => &self.banner,
        }
    }

    /// 按覆盖顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (Tier, &T)> {
        Tier::ALL.into_iter().map(move |tier| (tier, self.get(tier)))
    }

    pub fn try_map<U, E>(&self, mut f: impl FnMut(Tier, &T) -> Result<U, E>) -> Result<Tiered<U>, E> {
        Ok(Tiered {
            advertiser: f(Tier::Advertiser, &self.advertiser)?,
            campaign: f(Tier::Campaign, &self.campaign)?,
            group: f(Tier::Group, &self.group)?,
            banner: f(Tier::Banner, &self.banner)?,
        })
    }
}

/// 投放时间窗口，`None` 表示不限
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Window {
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        match self.end {
            None => false,
            Some(end) if end < *NO_END_SENTINEL => false,
            Some(end) => end <= now,
        }
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| start <= now)
    }

    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.has_started(now) && !self.has_ended(now)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// 第三方监测及落地页地址
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerInfo {
    pub click: Option<String>,
    pub impression: Option<String>,
    pub target: Option<String>,
}

/// **可直接投放的创意**
///
/// 由四个层级合并而来。定向与排期已合并为一份有效值；
/// 预算和频控按层级分别保留，每一级各自计数、各自限制。
#[derive(Debug, Clone, PartialEq)]
pub struct Banner {
    pub id: i64,
    /// 四个层级各自的 ID，`ids.banner == id`
    pub ids: Tiered<i64>,
    pub title: String,
    pub label: String,
    pub description: String,
    pub image: Option<Image>,
    pub icon: Option<Image>,
    /// 最小货币单位（分）
    pub price: u64,
    pub active: bool,
    pub windows: Tiered<Window>,
    pub trackers: TrackerInfo,
    pub targeting: Targeting,
    pub timetable: Timetable,
    pub budgets: Tiered<Budget>,
    pub cappings: Tiered<Capping>,
}

impl Banner {
    /// 所有层级都已开始且未结束
    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.active && self.windows.iter().all(|(_, window)| window.is_running(now))
    }
}
