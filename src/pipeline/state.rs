// src/pipeline/state.rs

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method};
use chrono::{DateTime, FixedOffset, Timelike};

use crate::model::{Action, Banner};

/// 进入流水线的原始 HTTP 请求
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub body: Bytes,
    pub peer: Option<IpAddr>,
}

impl RawRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str).filter(|value| !value.is_empty())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// 代理头优先，其次是对端地址
    pub fn client_ip(&self) -> Option<String> {
        self.header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| self.header("x-real-ip").map(str::trim))
            .map(str::to_string)
            .or_else(|| self.peer.map(|ip| ip.to_string()))
    }
}

/// **请求上下文**：Input 从请求中提取的用户与设备信息
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub action: Action,
    /// 请求时间，已换算到排期时区
    pub now: DateTime<FixedOffset>,
    pub ip: Option<String>,
    pub user_id: Option<String>,
    pub audience: Vec<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub bundle: Option<String>,
    pub bapp: Vec<String>,
    pub network: Option<String>,
    /// 需要的广告数
    pub count: usize,
    /// 要求的渲染格式名
    pub format: Option<String>,
    /// 监测 / 回传请求指向的创意
    pub banner_id: Option<i64>,
    /// OpenRTB imp ID，按顺序与胜出创意配对
    pub impressions: Vec<String>,
}

impl RequestContext {
    pub fn new(request_id: String, now: DateTime<FixedOffset>) -> Self {
        Self {
            request_id,
            action: Action::Request,
            now,
            ip: None,
            user_id: None,
            audience: Vec::new(),
            country: None,
            region: None,
            city: None,
            bundle: None,
            bapp: Vec::new(),
            network: None,
            count: 1,
            format: None,
            banner_id: None,
            impressions: Vec::new(),
        }
    }

    /// 当天已过去的比例，用于匀速投放
    pub fn day_fraction(&self) -> f64 {
        f64::from(self.now.num_seconds_from_midnight()) / 86_400.0
    }
}

/// 单个请求的可变状态，只属于处理该请求的任务
#[derive(Debug, Clone)]
pub struct State {
    pub context: RequestContext,
    pub candidates: Vec<Arc<Banner>>,
    pub winners: Vec<Arc<Banner>>,
}

impl State {
    pub fn new(context: RequestContext) -> Self {
        Self {
            context,
            candidates: Vec::new(),
            winners: Vec::new(),
        }
    }
}
