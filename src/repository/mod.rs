// src/repository/mod.rs

pub mod file;
pub mod memory;
pub mod postgres;
pub mod resolver;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Banner, Image, Tiered, TrackerInfo, Window};
use resolver::{resolve, ResolveError, TierAttrs};

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("postgres pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("postgres pool setup: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rows file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// 四层联表后单个层级的字段
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TierRow {
    pub id: i64,
    pub active: bool,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub attrs: TierAttrs,
}

impl TierRow {
    pub fn window(&self) -> Window {
        Window {
            start: self.start,
            end: self.end,
        }
    }

    /// 启用、未删除、未归档、未过期
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.active && self.deleted_at.is_none() && self.archived_at.is_none() && !self.window().has_ended(now)
    }
}

/// **存储层返回的一行**：创意及其三级上层
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BannerRow {
    pub advertiser: TierRow,
    pub campaign: TierRow,
    pub group: TierRow,
    pub banner: TierRow,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: Option<Image>,
    #[serde(default)]
    pub icon: Option<Image>,
    pub price: i64,
    #[serde(default)]
    pub trackers: TrackerInfo,
}

impl BannerRow {
    fn tiers(&self) -> [&TierRow; 4] {
        [&self.advertiser, &self.campaign, &self.group, &self.banner]
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.tiers().iter().all(|tier| tier.is_eligible(now))
    }

    /// 合并各层属性，生成可投放的创意
    pub fn into_banner(self) -> Result<Banner, ResolveError> {
        let price = u64::try_from(self.price).map_err(|_| ResolveError::NegativePrice(self.price))?;
        let attrs = Tiered {
            advertiser: self.advertiser.attrs.clone(),
            campaign: self.campaign.attrs.clone(),
            group: self.group.attrs.clone(),
            banner: self.banner.attrs.clone(),
        };
        let resolved = resolve(&attrs)?;

        Ok(Banner {
            id: self.banner.id,
            ids: Tiered {
                advertiser: self.advertiser.id,
                campaign: self.campaign.id,
                group: self.group.id,
                banner: self.banner.id,
            },
            title: self.title,
            label: self.label,
            description: self.description,
            image: self.image,
            icon: self.icon,
            price,
            active: self.banner.active,
            windows: Tiered {
                advertiser: self.advertiser.window(),
                campaign: self.campaign.window(),
                group: self.group.window(),
                banner: self.banner.window(),
            },
            trackers: self.trackers,
            targeting: resolved.targeting,
            timetable: resolved.timetable,
            budgets: resolved.budgets,
            cappings: resolved.cappings,
        })
    }
}

/// 持久化存储，一次读出全部候选行
#[async_trait]
pub trait Storage: Send + Sync {
    async fn rows(&self, now: DateTime<Utc>) -> Result<Vec<BannerRow>, StorageError>;
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for Arc<S> {
    async fn rows(&self, now: DateTime<Utc>) -> Result<Vec<BannerRow>, StorageError> {
        (**self).rows(now).await
    }
}

/// **创意仓库**
///
/// 存储层错误直接返回；单行数据错误只丢弃该行并告警。
#[derive(Clone)]
pub struct Repository {
    storage: Arc<dyn Storage>,
}

impl Repository {
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }

    pub async fn all(&self) -> Result<Vec<Banner>, StorageError> {
        self.all_at(Utc::now()).await
    }

    pub async fn all_at(&self, now: DateTime<Utc>) -> Result<Vec<Banner>, StorageError> {
        let rows = self.storage.rows(now).await?;
        let total = rows.len();

        // 存储层已按条件过滤，这里再校验一次，保证各实现语义一致
        let banners: Vec<Banner> = rows
            .into_iter()
            .filter(|row| row.is_eligible(now))
            .filter_map(|row| {
                let banner_id = row.banner.id;
                match row.into_banner() {
                    Ok(banner) => Some(banner),
                    Err(error) => {
                        warn!(banner_id, %error, "dropping banner with malformed data");
                        None
                    }
                }
            })
            .collect();

        debug!(rows = total, banners = banners.len(), "banners loaded from storage");
        Ok(banners)
    }
}
