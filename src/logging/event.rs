use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Action, Banner};

/// **投放分析事件**，每个投放动作一条
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdEvent {
    pub timestamp: DateTime<Utc>,
    pub event: Action,
    pub route: String,
    pub request_id: String,
    pub banner_id: i64,
    pub group_id: i64,
    pub campaign_id: i64,
    pub advertiser_id: i64,
    pub price: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
}

impl AdEvent {
    pub fn new(event: Action, route: &str, request_id: &str, banner: &Banner) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            route: route.to_string(),
            request_id: request_id.to_string(),
            banner_id: banner.id,
            group_id: banner.ids.group,
            campaign_id: banner.ids.campaign,
            advertiser_id: banner.ids.advertiser,
            price: banner.price,
            user_id: None,
            ip: None,
            country: None,
            bundle: None,
        }
    }
}
