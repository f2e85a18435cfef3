// src/pipeline/mod.rs

pub mod formats;
pub mod inputs;
pub mod outputs;
pub mod registry;
pub mod stages;
pub mod state;
pub mod targetings;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{FixedOffset, Utc};
use tracing::{debug, warn};

use crate::cache::BannerCache;
use crate::counters::CounterStore;
use crate::logging::{AdEvent, EventQueue};
use formats::Format;
use inputs::Input;
use outputs::Output;
use stages::Stage;

pub use registry::Registries;
pub use state::{RawRequest, State};

/// 流水线运行时依赖的共享组件，由 `main` 构造一次
#[derive(Clone)]
pub struct Services {
    pub cache: Arc<BannerCache>,
    pub counters: Arc<dyn CounterStore>,
    pub events: EventQueue,
    /// 排期与日预算所用时区
    pub timezone: FixedOffset,
}

/// **投放流水线**：Input → Stage₁ … Stageₙ → Output
///
/// 启动时由 `Registries::build` 组装，之后只读，可被任意多请求并发执行。
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    route: String,
    input: Input,
    stages: Vec<Stage>,
    formats: Vec<Format>,
    output: Output,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub async fn handle(&self, raw: RawRequest, services: &Services) -> Response {
        let now = Utc::now().with_timezone(&services.timezone);
        let context = match self.input.extract(&raw, now) {
            Ok(context) => context,
            Err(error) => {
                debug!(
                    route = %self.name,
                    method = %raw.method,
                    input = self.input.name(),
                    %error,
                    "rejecting request"
                );
                return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
            }
        };

        let mut state = State::new(context);
        for stage in &self.stages {
            if let Err(error) = stage.run(&mut state, services).await {
                // 无广告也要返回正常响应
                warn!(
                    route = %self.name,
                    stage = stage.name(),
                    request_id = %state.context.request_id,
                    %error,
                    "stage failed, serving no ad"
                );
                state.winners.clear();
                break;
            }
        }

        let response = self.output.respond(&state, &self.formats);
        self.publish(&state, &services.events);
        response
    }

    /// 每个胜出创意一条分析事件，不等待写入
    fn publish(&self, state: &State, events: &EventQueue) {
        let context = &state.context;
        for banner in &state.winners {
            let mut event = AdEvent::new(context.action, &self.name, &context.request_id, banner);
            event.user_id = context.user_id.clone();
            event.ip = context.ip.clone();
            event.country = context.country.clone();
            event.bundle = context.bundle.clone();
            events.publish(event);
        }
    }
}
