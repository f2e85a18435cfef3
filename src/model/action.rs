// src/model/action.rs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::limits::Metric;

/// 一次请求对应的投放动作
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// 广告请求（出价 / 取广告）
    #[default]
    Request,
    Impression,
    Click,
    Conversion,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Request => "request",
            Action::Impression => "impression",
            Action::Click => "click",
            Action::Conversion => "conversion",
        }
    }

    /// 该动作累加的预算指标，请求本身不计数
    pub fn metric(&self) -> Option<Metric> {
        match self {
            Action::Request => None,
            Action::Impression => Some(Metric::Impressions),
            Action::Click => Some(Metric::Clicks),
            Action::Conversion => Some(Metric::Conversions),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
