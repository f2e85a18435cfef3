// src/pipeline/registry.rs

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::formats::Format;
use super::inputs::Input;
use super::outputs::Output;
use super::stages::Stage;
use super::targetings::TargetingFilter;
use super::Pipeline;
use crate::config::{PluginConfig, RouteConfig};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown {kind} `{name}`")]
    UnknownPlugin { kind: &'static str, name: String },
    #[error("invalid options for {kind} `{plugin}`: {source}")]
    Options {
        kind: &'static str,
        plugin: &'static str,
        #[source]
        source: toml::de::Error,
    },
    #[error("{plugin}: {reason}")]
    Invalid { plugin: String, reason: String },
    #[error("route `{0}` is mounted more than once")]
    DuplicateRoute(String),
    #[error("route `{route}`: {source}")]
    Route {
        route: String,
        #[source]
        source: Box<BuildError>,
    },
}

/// 把插件的配置表解码为其选项结构，未知字段报错
pub(crate) fn options<T: DeserializeOwned>(
    kind: &'static str,
    plugin: &'static str,
    config: &toml::Value,
) -> Result<T, BuildError> {
    config
        .clone()
        .try_into()
        .map_err(|source| BuildError::Options { kind, plugin, source })
}

/// 保留给服务自身的路径
const RESERVED_ROUTES: [&str; 1] = ["/health"];

/// **插件注册表**：名字 → 原型，启动后只读
pub struct Registries {
    inputs: HashMap<&'static str, Input>,
    stages: HashMap<&'static str, Stage>,
    targetings: HashMap<&'static str, TargetingFilter>,
    formats: HashMap<&'static str, Format>,
    outputs: HashMap<&'static str, Output>,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            inputs: Input::prototypes().into_iter().map(|p| (p.name(), p)).collect(),
            stages: Stage::prototypes().into_iter().map(|p| (p.name(), p)).collect(),
            targetings: TargetingFilter::prototypes().into_iter().map(|p| (p.name(), p)).collect(),
            formats: Format::prototypes().into_iter().map(|p| (p.name(), p)).collect(),
            outputs: Output::prototypes().into_iter().map(|p| (p.name(), p)).collect(),
        }
    }
}

fn lookup<'a, T>(
    registry: &'a HashMap<&'static str, T>,
    kind: &'static str,
    plugin: &PluginConfig,
) -> Result<&'a T, BuildError> {
    registry.get(plugin.name.as_str()).ok_or_else(|| BuildError::UnknownPlugin {
        kind,
        name: plugin.name.clone(),
    })
}

impl Registries {
    /// 按路由配置组装一条流水线，任何未注册的名字都会失败
    pub fn build(&self, route: &RouteConfig) -> Result<Pipeline, BuildError> {
        self.assemble(route).map_err(|source| BuildError::Route {
            route: route.name.clone(),
            source: Box::new(source),
        })
    }

    fn assemble(&self, route: &RouteConfig) -> Result<Pipeline, BuildError> {
        if !route.route.starts_with('/') {
            return Err(BuildError::Invalid {
                plugin: route.name.clone(),
                reason: format!("route path `{}` must start with `/`", route.route),
            });
        }

        let input = lookup(&self.inputs, "input", &route.input)?.copy(&route.input.config)?;

        let targetings = route
            .targetings
            .iter()
            .map(|plugin| lookup(&self.targetings, "targeting", plugin)?.copy(&plugin.config))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = route
            .stages
            .iter()
            .map(|plugin| {
                let stage = lookup(&self.stages, "stage", plugin)?.copy(&plugin.config)?;
                Ok(stage.with_targetings(&targetings))
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        let formats = route
            .formats
            .iter()
            .map(|plugin| lookup(&self.formats, "format", plugin)?.copy(&plugin.config))
            .collect::<Result<Vec<_>, _>>()?;

        let output = lookup(&self.outputs, "output", &route.output)?.copy(&route.output.config)?;
        if output.needs_format() && formats.is_empty() {
            return Err(BuildError::Invalid {
                plugin: output.name().to_string(),
                reason: "output needs at least one format".into(),
            });
        }

        Ok(Pipeline {
            name: route.name.clone(),
            route: route.route.clone(),
            input,
            stages,
            formats,
            output,
        })
    }

    pub fn build_all(&self, routes: &[RouteConfig]) -> Result<Vec<Pipeline>, BuildError> {
        let mut mounted: HashSet<&str> = RESERVED_ROUTES.into_iter().collect();
        routes
            .iter()
            .map(|route| {
                if !mounted.insert(route.route.as_str()) {
                    return Err(BuildError::DuplicateRoute(route.route.clone()));
                }
                self.build(route)
            })
            .collect()
    }
}
