// src/repository/resolver.rs

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::model::{Budget, Capping, Targeting, Tier, Tiered, Timetable};

/// 单个层级库里存储的原始 JSON 属性
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TierAttrs {
    #[serde(deserialize_with = "raw_payload")]
    pub targeting: Option<String>,
    #[serde(deserialize_with = "raw_payload")]
    pub timetable: Option<String>,
    #[serde(deserialize_with = "raw_payload")]
    pub budget: Option<String>,
    #[serde(deserialize_with = "raw_payload")]
    pub capping: Option<String>,
}

/// 文件数据源里既可以写 JSON 字符串，也可以直接内嵌对象
fn raw_payload<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(raw)) => Some(raw),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("malformed {field} payload on {tier}: {source}")]
    Payload {
        tier: Tier,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("negative price {0}")]
    NegativePrice(i64),
}

/// 合并后的约束
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    pub targeting: Targeting,
    pub timetable: Timetable,
    pub budgets: Tiered<Budget>,
    pub cappings: Tiered<Capping>,
}

/// **逐级合并四个层级的属性**
///
/// - 定向：逐个子集合覆盖，下层非空即整体替换上层
/// - 排期：下层非空即整体替换
/// - 预算 / 频控：不合并，按层级原样保留
///
/// 任一层级的 JSON 无法解析都会返回错误，调用方丢弃这条创意。
pub fn resolve(attrs: &Tiered<TierAttrs>) -> Result<Resolved, ResolveError> {
    let mut targeting = Targeting::default();
    let mut timetable = Timetable::default();

    for (tier, tier_attrs) in attrs.iter() {
        let tier_targeting: Targeting = parse(tier, "targeting", tier_attrs.targeting.as_deref())?;
        targeting.overlay(tier_targeting);

        let tier_timetable: Timetable = parse(tier, "timetable", tier_attrs.timetable.as_deref())?;
        if !tier_timetable.is_empty() {
            timetable = tier_timetable;
        }
    }

    let budgets = attrs.try_map(|tier, tier_attrs| parse(tier, "budget", tier_attrs.budget.as_deref()))?;
    let cappings = attrs.try_map(|tier, tier_attrs| parse(tier, "capping", tier_attrs.capping.as_deref()))?;

    Ok(Resolved {
        targeting,
        timetable,
        budgets,
        cappings,
    })
}

fn parse<T>(tier: Tier, field: &'static str, raw: Option<&str>) -> Result<T, ResolveError>
where
    T: DeserializeOwned + Default,
{
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(T::default()),
        Some(raw) => serde_json::from_str(raw).map_err(|source| ResolveError::Payload { tier, field, source }),
    }
}
