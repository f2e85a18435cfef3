// src/pipeline/outputs.rs

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use super::formats::{pick, Format};
use super::registry::{options, BuildError};
use super::state::State;
use super::targetings::NoOptions;
use crate::openrtb::response::{Bid, BidResponse, SeatBid};

/// 1x1 透明 GIF
const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff,
    0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02,
    0x02, 0x44, 0x01, 0x00, 0x3b,
];

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RtbOutputOptions {
    pub currency: String,
    pub seat: Option<String>,
}

impl Default for RtbOutputOptions {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            seat: None,
        }
    }
}

/// **Output 插件**：把 `State` 写成 HTTP 响应
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Rtb(RtbOutputOptions),
    Json,
    Redirect,
    Pixel,
}

impl Output {
    pub fn prototypes() -> Vec<Output> {
        vec![Output::Rtb(RtbOutputOptions::default()), Output::Json, Output::Redirect, Output::Pixel]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Output::Rtb(_) => "rtb",
            Output::Json => "json",
            Output::Redirect => "redirect",
            Output::Pixel => "pixel",
        }
    }

    pub fn copy(&self, config: &toml::Value) -> Result<Output, BuildError> {
        let name = self.name();
        match self {
            Output::Rtb(_) => Ok(Output::Rtb(options("output", name, config)?)),
            other => {
                let _: NoOptions = options("output", name, config)?;
                Ok(other.clone())
            }
        }
    }

    /// 需要路由至少配置一个渲染格式
    pub fn needs_format(&self) -> bool {
        matches!(self, Output::Rtb(_) | Output::Json)
    }

    pub fn respond(&self, state: &State, formats: &[Format]) -> Response {
        match self {
            Output::Rtb(options) => rtb(options, state, formats),
            Output::Json => {
                let Some(format) = pick(formats, state.context.format.as_deref()) else {
                    return StatusCode::NO_CONTENT.into_response();
                };
                if state.winners.is_empty() {
                    return StatusCode::NO_CONTENT.into_response();
                }
                let ads: Vec<Value> = state
                    .winners
                    .iter()
                    .map(|banner| format.render_value(banner, &state.context))
                    .collect();
                (StatusCode::OK, Json(ads)).into_response()
            }
            Output::Redirect => {
                let target = state.winners.first().and_then(|banner| banner.trackers.target.as_deref());
                match target {
                    Some(target) => (StatusCode::FOUND, [(header::LOCATION, target.to_string())]).into_response(),
                    None => StatusCode::NO_CONTENT.into_response(),
                }
            }
            Output::Pixel => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "image/gif"), (header::CACHE_CONTROL, "no-store")],
                PIXEL_GIF.as_slice(),
            )
                .into_response(),
        }
    }
}

fn rtb(options: &RtbOutputOptions, state: &State, formats: &[Format]) -> Response {
    let context = &state.context;
    let format = pick(formats, context.format.as_deref());
    let bids: Vec<Bid> = match format {
        Some(format) => state
            .winners
            .iter()
            .zip(context.impressions.iter())
            .map(|(banner, impid)| Bid {
                id: format!("{}-{}", banner.id, impid),
                impid: impid.clone(),
                // 出价以元每千次计，价格存的是分
                price: banner.price as f64 / 100.0,
                adid: banner.id.to_string(),
                crid: banner.id.to_string(),
                adm: format.render(banner, context),
                w: banner.image.as_ref().map(|image| image.width),
                h: banner.image.as_ref().map(|image| image.height),
            })
            .collect(),
        None => Vec::new(),
    };

    if bids.is_empty() {
        // **204 - 无广告可填充**，204 不能带响应体
        return StatusCode::NO_CONTENT.into_response();
    }

    let response = BidResponse {
        id: context.request_id.clone(),
        seatbid: vec![SeatBid {
            bid: bids,
            seat: options.seat.clone(),
        }],
        bidid: None,
        cur: Some(options.currency.clone()),
    };
    (StatusCode::OK, Json(response)).into_response()
}
