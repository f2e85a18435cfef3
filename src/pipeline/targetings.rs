// src/pipeline/targetings.rs

use std::slice;

use serde::Deserialize;

use super::registry::{options, BuildError};
use super::state::RequestContext;
use crate::model::Banner;

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NoOptions {}

/// **定向插件**，每个维度一个，在构建流水线时交给 targeting 阶段
#[derive(Debug, Clone, PartialEq)]
pub enum TargetingFilter {
    Geo,
    App,
    Audience,
    Network,
    Ip,
    Timetable,
}

fn one(value: &Option<String>) -> &[String] {
    value.as_ref().map(slice::from_ref).unwrap_or_default()
}

impl TargetingFilter {
    pub fn prototypes() -> Vec<TargetingFilter> {
        vec![
            TargetingFilter::Geo,
            TargetingFilter::App,
            TargetingFilter::Audience,
            TargetingFilter::Network,
            TargetingFilter::Ip,
            TargetingFilter::Timetable,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            TargetingFilter::Geo => "geo",
            TargetingFilter::App => "app",
            TargetingFilter::Audience => "audience",
            TargetingFilter::Network => "network",
            TargetingFilter::Ip => "ip",
            TargetingFilter::Timetable => "timetable",
        }
    }

    pub fn copy(&self, config: &toml::Value) -> Result<TargetingFilter, BuildError> {
        let _: NoOptions = options("targeting", self.name(), config)?;
        Ok(self.clone())
    }

    pub fn accepts(&self, banner: &Banner, context: &RequestContext) -> bool {
        let targeting = &banner.targeting;
        match self {
            TargetingFilter::Geo => {
                targeting.country.validate(one(&context.country))
                    && targeting.region.validate(one(&context.region))
                    && targeting.city.validate(one(&context.city))
            }
            TargetingFilter::App => {
                targeting.bundle.validate(one(&context.bundle)) && targeting.bapp.validate(&context.bapp)
            }
            TargetingFilter::Audience => targeting.audience.validate(&context.audience),
            TargetingFilter::Network => targeting.network.validate(one(&context.network)),
            TargetingFilter::Ip => targeting.ip.validate(context.ip.as_deref()),
            TargetingFilter::Timetable => banner.timetable.validate_at(&context.now),
        }
    }
}
