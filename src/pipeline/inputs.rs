// src/pipeline/inputs.rs

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use super::registry::{options, BuildError};
use super::state::{RawRequest, RequestContext};
use crate::model::Action;
use crate::openrtb::request::BidRequest;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("malformed bid request: {0}")]
    Body(#[from] simd_json::Error),
    #[error("missing parameter `{0}`")]
    Missing(&'static str),
    #[error("invalid parameter `{name}`: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RtbOptions {}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WebOptions {
    pub default_count: usize,
    pub max_count: usize,
}

impl Default for WebOptions {
    fn default() -> Self {
        Self {
            default_count: 1,
            max_count: 10,
        }
    }
}

/// 固定上下文，用于自有广告位和冒烟测试
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StaticOptions {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub bundle: Option<String>,
    pub network: Option<String>,
    pub audience: Vec<String>,
    pub count: usize,
    pub format: Option<String>,
}

impl Default for StaticOptions {
    fn default() -> Self {
        Self {
            country: None,
            region: None,
            city: None,
            bundle: None,
            network: None,
            audience: Vec::new(),
            count: 1,
            format: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerOptions {
    /// 固定事件类型，不设置时读取 `event` 参数
    pub event: Option<Action>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PostbackOptions {}

/// **Input 插件**：从原始请求提取 `RequestContext`
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Rtb(RtbOptions),
    Web(WebOptions),
    Static(StaticOptions),
    Tracker(TrackerOptions),
    Postback(PostbackOptions),
}

impl Input {
    pub fn prototypes() -> Vec<Input> {
        vec![
            Input::Rtb(RtbOptions::default()),
            Input::Web(WebOptions::default()),
            Input::Static(StaticOptions::default()),
            Input::Tracker(TrackerOptions::default()),
            Input::Postback(PostbackOptions::default()),
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Input::Rtb(_) => "rtb",
            Input::Web(_) => "web",
            Input::Static(_) => "static",
            Input::Tracker(_) => "tracker",
            Input::Postback(_) => "postback",
        }
    }

    /// 以路由配置生成新实例，原型不变
    pub fn copy(&self, config: &toml::Value) -> Result<Input, BuildError> {
        let name = self.name();
        Ok(match self {
            Input::Rtb(_) => Input::Rtb(options("input", name, config)?),
            Input::Web(_) => Input::Web(options("input", name, config)?),
            Input::Static(_) => Input::Static(options("input", name, config)?),
            Input::Tracker(_) => {
                let options: TrackerOptions = options("input", name, config)?;
                if matches!(options.event, Some(Action::Request) | Some(Action::Conversion)) {
                    return Err(BuildError::Invalid {
                        plugin: name.to_string(),
                        reason: "tracker event must be impression or click".into(),
                    });
                }
                Input::Tracker(options)
            }
            Input::Postback(_) => Input::Postback(options("input", name, config)?),
        })
    }

    pub fn extract(&self, raw: &RawRequest, now: DateTime<FixedOffset>) -> Result<RequestContext, InputError> {
        match self {
            Input::Rtb(_) => extract_rtb(raw, now),
            Input::Web(options) => extract_web(options, raw, now),
            Input::Static(options) => Ok(extract_static(options, raw, now)),
            Input::Tracker(options) => {
                let mut context = tracked(raw, now)?;
                context.action = match options.event {
                    Some(event) => event,
                    None => match raw.param("event") {
                        Some("impression") => Action::Impression,
                        Some("click") => Action::Click,
                        Some(other) => {
                            return Err(InputError::Invalid {
                                name: "event",
                                value: other.to_string(),
                            })
                        }
                        None => return Err(InputError::Missing("event")),
                    },
                };
                Ok(context)
            }
            Input::Postback(_) => {
                let mut context = tracked(raw, now)?;
                context.action = Action::Conversion;
                Ok(context)
            }
        }
    }
}

fn request_id() -> String {
    Uuid::new_v4().to_string()
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

fn list(value: Option<&str>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn extract_rtb(raw: &RawRequest, now: DateTime<FixedOffset>) -> Result<RequestContext, InputError> {
    let request = BidRequest::decode(&raw.body)?;
    if request.imp.is_empty() {
        return Err(InputError::Missing("imp"));
    }

    let id = if request.id.is_empty() { request_id() } else { request.id.clone() };
    let mut context = RequestContext::new(id, now);
    context.ip = owned(request.device_ip()).or_else(|| raw.client_ip());
    if let Some(geo) = request.geo() {
        context.country = geo.country.clone();
        context.region = geo.region.clone();
        context.city = geo.city.clone();
    }
    context.bundle = request.app.as_ref().and_then(|app| app.bundle.clone());
    context.bapp = request.bapp.clone();
    context.user_id = owned(request.user_id());
    context.audience = request.segments();
    context.network = owned(request.network());
    context.count = request.imp.len();
    context.impressions = request.imp.iter().map(|imp| imp.id.clone()).collect();
    Ok(context)
}

fn extract_web(options: &WebOptions, raw: &RawRequest, now: DateTime<FixedOffset>) -> Result<RequestContext, InputError> {
    let count = match raw.param("count") {
        Some(value) => value.parse::<usize>().map_err(|_| InputError::Invalid {
            name: "count",
            value: value.to_string(),
        })?,
        None => options.default_count,
    };

    let mut context = RequestContext::new(request_id(), now);
    context.count = count.clamp(1, options.max_count.max(1));
    context.ip = raw.client_ip();
    context.user_id = owned(raw.param("uid"));
    context.country = owned(raw.param("country"));
    context.region = owned(raw.param("region"));
    context.city = owned(raw.param("city"));
    context.bundle = owned(raw.param("bundle"));
    context.network = owned(raw.param("network"));
    context.audience = list(raw.param("audience"));
    context.format = owned(raw.param("format"));
    Ok(context)
}

fn extract_static(options: &StaticOptions, raw: &RawRequest, now: DateTime<FixedOffset>) -> RequestContext {
    let mut context = RequestContext::new(request_id(), now);
    context.ip = raw.client_ip();
    context.user_id = owned(raw.param("uid"));
    context.country = options.country.clone();
    context.region = options.region.clone();
    context.city = options.city.clone();
    context.bundle = options.bundle.clone();
    context.network = options.network.clone();
    context.audience = options.audience.clone();
    context.count = options.count.max(1);
    context.format = options.format.clone();
    context
}

/// 监测与回传请求共用：`banner` 必填，`req` 沿用投放时的请求 ID
fn tracked(raw: &RawRequest, now: DateTime<FixedOffset>) -> Result<RequestContext, InputError> {
    let banner = raw.param("banner").ok_or(InputError::Missing("banner"))?;
    let banner_id = banner.parse::<i64>().map_err(|_| InputError::Invalid {
        name: "banner",
        value: banner.to_string(),
    })?;

    let id = raw.param("req").map(str::to_string).unwrap_or_else(request_id);
    let mut context = RequestContext::new(id, now);
    context.banner_id = Some(banner_id);
    context.ip = raw.client_ip();
    context.user_id = owned(raw.param("uid"));
    Ok(context)
}
