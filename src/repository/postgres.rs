// src/repository/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolSettings, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use once_cell::sync::Lazy;
use tokio_postgres::{NoTls, Row};

use super::resolver::TierAttrs;
use super::{BannerRow, Storage, StorageError, TierRow};
use crate::config::config_manager::PostgresConfig;
use crate::model::banner::NO_END_SENTINEL;
use crate::model::{Image, TrackerInfo};

/// (表别名, 列前缀, 表名)
const TIERS: [(&str, &str, &str); 4] = [
    ("a", "advertiser", "advertisers"),
    ("c", "campaign", "campaigns"),
    ("g", "group", "groups"),
    ("b", "banner", "banners"),
];

/// ```text
/// SELECT <每层: id, active, start/end, deleted_at, archived_at, 四个 JSON 属性>, <创意展示字段>
/// FROM banners b JOIN groups g JOIN campaigns c JOIN advertisers a
/// WHERE 每层 active AND 未删除 AND 未归档 AND (end IS NULL OR end > $1 OR end < $2)
/// ```
static ALL_BANNERS: Lazy<String> = Lazy::new(|| {
    let mut columns = Vec::new();
    let mut predicates = Vec::new();
    for (alias, prefix, _) in TIERS {
        columns.push(format!(
            "{alias}.id AS {prefix}_id, {alias}.active AS {prefix}_active, \
             {alias}.start_at AS {prefix}_start, {alias}.end_at AS {prefix}_end, \
             {alias}.targeting::text AS {prefix}_targeting, {alias}.timetable::text AS {prefix}_timetable, \
             {alias}.budget::text AS {prefix}_budget, {alias}.capping::text AS {prefix}_capping"
        ));
        predicates.push(format!(
            "{alias}.active AND {alias}.deleted_at IS NULL AND {alias}.archived_at IS NULL \
             AND ({alias}.end_at IS NULL OR {alias}.end_at > $1 OR {alias}.end_at < $2)"
        ));
    }
    format!(
        "SELECT {}, b.title, b.label, b.description, \
         b.image_url, b.image_width, b.image_height, b.icon_url, b.icon_width, b.icon_height, \
         b.price, b.click_url, b.impression_url, b.target_url \
         FROM {} b \
         JOIN {} g ON g.id = b.group_id \
         JOIN {} c ON c.id = g.campaign_id \
         JOIN {} a ON a.id = c.advertiser_id \
         WHERE {} \
         ORDER BY b.id",
        columns.join(", "),
        TIERS[3].2,
        TIERS[2].2,
        TIERS[1].2,
        TIERS[0].2,
        predicates.join(" AND "),
    )
});

pub struct PostgresStorage {
    pool: Pool,
}

impl PostgresStorage {
    pub fn connect(config: &PostgresConfig) -> Result<Self, StorageError> {
        let mut settings = PoolSettings::new();
        settings.host = Some(config.host.clone());
        settings.port = Some(config.port);
        settings.user = Some(config.user.clone());
        settings.password = config.password.clone();
        settings.dbname = Some(config.dbname.clone());
        settings.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        // 数据库失联时取连接不会无限等待
        let mut pool = PoolConfig::new(config.pool_size);
        pool.timeouts.wait = Some(config.timeout());
        pool.timeouts.create = Some(config.timeout());
        pool.timeouts.recycle = Some(config.timeout());
        settings.pool = Some(pool);

        let pool = settings.create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn rows(&self, now: DateTime<Utc>) -> Result<Vec<BannerRow>, StorageError> {
        let client = self.pool.get().await?;
        let statement = client.prepare_cached(ALL_BANNERS.as_str()).await?;
        let rows = client.query(&statement, &[&now, &*NO_END_SENTINEL]).await?;

        rows.iter()
            .map(|row| banner_row(row).map_err(StorageError::from))
            .collect()
    }
}

fn column(prefix: &str, name: &str) -> String {
    format!("{prefix}_{name}")
}

fn tier_row(row: &Row, prefix: &str) -> Result<TierRow, tokio_postgres::Error> {
    Ok(TierRow {
        id: row.try_get(column(prefix, "id").as_str())?,
        active: row.try_get(column(prefix, "active").as_str())?,
        start: row.try_get(column(prefix, "start").as_str())?,
        end: row.try_get(column(prefix, "end").as_str())?,
        // 查询条件已排除
        deleted_at: None,
        archived_at: None,
        attrs: TierAttrs {
            targeting: row.try_get(column(prefix, "targeting").as_str())?,
            timetable: row.try_get(column(prefix, "timetable").as_str())?,
            budget: row.try_get(column(prefix, "budget").as_str())?,
            capping: row.try_get(column(prefix, "capping").as_str())?,
        },
    })
}

fn image(row: &Row, prefix: &str) -> Result<Option<Image>, tokio_postgres::Error> {
    let url: Option<String> = row.try_get(column(prefix, "url").as_str())?;
    let width: Option<i32> = row.try_get(column(prefix, "width").as_str())?;
    let height: Option<i32> = row.try_get(column(prefix, "height").as_str())?;

    Ok(url.filter(|url| !url.is_empty()).map(|url| Image {
        url,
        width: width.and_then(|w| u32::try_from(w).ok()).unwrap_or_default(),
        height: height.and_then(|h| u32::try_from(h).ok()).unwrap_or_default(),
    }))
}

fn banner_row(row: &Row) -> Result<BannerRow, tokio_postgres::Error> {
    Ok(BannerRow {
        advertiser: tier_row(row, TIERS[0].1)?,
        campaign: tier_row(row, TIERS[1].1)?,
        group: tier_row(row, TIERS[2].1)?,
        banner: tier_row(row, TIERS[3].1)?,
        title: row.try_get::<_, Option<String>>("title")?.unwrap_or_default(),
        label: row.try_get::<_, Option<String>>("label")?.unwrap_or_default(),
        description: row.try_get::<_, Option<String>>("description")?.unwrap_or_default(),
        image: image(row, "image")?,
        icon: image(row, "icon")?,
        price: row.try_get("price")?,
        trackers: TrackerInfo {
            click: row.try_get("click_url")?,
            impression: row.try_get("impression_url")?,
            target: row.try_get("target_url")?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_applies_eligibility_to_every_tier() {
        for (alias, prefix, table) in TIERS {
            assert!(ALL_BANNERS.contains(&format!("{alias}.deleted_at IS NULL")));
            assert!(ALL_BANNERS.contains(&format!("{alias}.archived_at IS NULL")));
            assert!(ALL_BANNERS.contains(&format!("{alias}.end_at < $2")));
            assert!(ALL_BANNERS.contains(&format!("AS {prefix}_targeting")));
            assert!(ALL_BANNERS.contains(&format!("{table} {alias}")));
        }
    }

    #[tokio::test]
    async fn unreachable_database_fails_within_timeout() {
        let storage = PostgresStorage::connect(&PostgresConfig {
            host: "127.0.0.1".into(),
            port: 1,
            user: "adserver".into(),
            password: None,
            dbname: "ads".into(),
            pool_size: 1,
            timeout_ms: 200,
        })
        .expect("pool creation does not connect");

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), storage.rows(Utc::now()))
            .await
            .expect("pool timeouts bound the call");
        assert!(result.is_err());
    }
}
