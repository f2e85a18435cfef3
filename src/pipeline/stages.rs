// src/pipeline/stages.rs

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::registry::{options, BuildError};
use super::state::State;
use super::targetings::{NoOptions, TargetingFilter};
use super::Services;
use crate::bidding::{select, select_many, SelectionError};
use crate::counters::{CounterKey, CounterStore};
use crate::model::{Action, Banner, Capping, Limit, Metric};

/// 日计数键保留两天，跨时区的当日查询仍可读到
const DAILY_TTL: Duration = Duration::from_secs(48 * 3600);

#[derive(Debug, Error)]
pub enum StageError {
    #[error("rotation: {0}")]
    Selection(#[from] SelectionError),
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    /// 候选数上限
    pub limit: Option<usize>,
}

/// 计数存储不可用时的处理方式
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// 有预算或频控的候选全部剔除
    #[default]
    Reject,
    /// 视为未达上限
    Allow,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsOptions {
    pub on_error: OnError,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RotationOptions {
    /// 单次请求最多胜出数
    pub max: usize,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self { max: 10 }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecordOptions {
    /// 覆盖请求本身的动作，例如投放即计曝光
    pub event: Option<Action>,
}

/// **Stage 插件**，按路由配置的顺序依次修改 `State`
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Cache(CacheOptions),
    Targeting(Vec<TargetingFilter>),
    Limits(LimitsOptions),
    Rotation(RotationOptions),
    Lookup,
    Record(RecordOptions),
}

impl Stage {
    pub fn prototypes() -> Vec<Stage> {
        vec![
            Stage::Cache(CacheOptions::default()),
            Stage::Targeting(Vec::new()),
            Stage::Limits(LimitsOptions::default()),
            Stage::Rotation(RotationOptions::default()),
            Stage::Lookup,
            Stage::Record(RecordOptions::default()),
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Cache(_) => "cache",
            Stage::Targeting(_) => "targeting",
            Stage::Limits(_) => "limits",
            Stage::Rotation(_) => "rotation",
            Stage::Lookup => "lookup",
            Stage::Record(_) => "record",
        }
    }

    pub fn copy(&self, config: &toml::Value) -> Result<Stage, BuildError> {
        let name = self.name();
        Ok(match self {
            Stage::Cache(_) => Stage::Cache(options("stage", name, config)?),
            Stage::Limits(_) => Stage::Limits(options("stage", name, config)?),
            Stage::Rotation(_) => Stage::Rotation(options("stage", name, config)?),
            Stage::Record(_) => Stage::Record(options("stage", name, config)?),
            Stage::Targeting(_) | Stage::Lookup => {
                let _: NoOptions = options("stage", name, config)?;
                self.clone()
            }
        })
    }

    /// 构建时绑定路由的定向列表，只有 targeting 阶段使用
    pub fn with_targetings(self, targetings: &[TargetingFilter]) -> Stage {
        match self {
            Stage::Targeting(_) => Stage::Targeting(targetings.to_vec()),
            other => other,
        }
    }

    pub async fn run(&self, state: &mut State, services: &Services) -> Result<(), StageError> {
        match self {
            Stage::Cache(options) => {
                let now = state.context.now.with_timezone(&Utc);
                let snapshot = services.cache.snapshot();
                // 缓存只按结束时间过滤，开始时间需要每次请求判断
                state.candidates = snapshot
                    .banners()
                    .iter()
                    .filter(|banner| banner.is_running(now))
                    .take(options.limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect();
                Ok(())
            }
            Stage::Targeting(filters) => {
                let State { context, candidates, .. } = state;
                candidates.retain(|banner| filters.iter().all(|filter| filter.accepts(banner, context)));
                Ok(())
            }
            Stage::Limits(options) => {
                limits(options, state, services.counters.as_ref()).await;
                Ok(())
            }
            Stage::Rotation(options) => {
                state.winners.clear();
                let count = state.context.count.min(options.max);
                // ThreadRng 不能跨 await 持有
                let picked = {
                    let mut rng = rand::thread_rng();
                    if count == 1 {
                        select(&state.candidates, &mut rng)?.into_iter().collect()
                    } else {
                        select_many(&state.candidates, count, &mut rng)?
                    }
                };
                state.winners = picked
                    .into_iter()
                    .map(|index| Arc::clone(&state.candidates[index]))
                    .collect();
                Ok(())
            }
            Stage::Lookup => {
                state.winners = state
                    .context
                    .banner_id
                    .and_then(|id| services.cache.one(id))
                    .into_iter()
                    .collect();
                if state.winners.is_empty() {
                    debug!(banner_id = ?state.context.banner_id, "tracked banner is not in the cache");
                }
                Ok(())
            }
            Stage::Record(options) => {
                record(options, state, services.counters.as_ref()).await;
                Ok(())
            }
        }
    }
}

/// 去重后的计数键，同一计划下多个创意共用一个键
#[derive(Default)]
struct KeyPlan {
    keys: Vec<CounterKey>,
    slots: HashMap<CounterKey, usize>,
}

impl KeyPlan {
    fn slot(&mut self, key: CounterKey) -> usize {
        if let Some(slot) = self.slots.get(&key) {
            return *slot;
        }
        let slot = self.keys.len();
        self.keys.push(key.clone());
        self.slots.insert(key, slot);
        slot
    }
}

enum Check {
    Budget { limit: Limit, daily: usize, total: usize },
    Capping { capping: Capping, exposures: usize },
}

fn checks_for(banner: &Banner, user: Option<&str>, day: NaiveDate, plan: &mut KeyPlan) -> Vec<Check> {
    let mut checks = Vec::new();
    for (tier, budget) in banner.budgets.iter() {
        let id = *banner.ids.get(tier);
        for (metric, limit) in budget.limited() {
            checks.push(Check::Budget {
                limit: *limit,
                daily: plan.slot(CounterKey::daily(metric, tier, id, day)),
                total: plan.slot(CounterKey::total(metric, tier, id)),
            });
        }
    }
    // 没有用户标识时无法频控
    if let Some(user) = user {
        for (tier, capping) in banner.cappings.iter() {
            if capping.is_unlimited() {
                continue;
            }
            checks.push(Check::Capping {
                capping: *capping,
                exposures: plan.slot(CounterKey::capping(user, tier, *banner.ids.get(tier))),
            });
        }
    }
    checks
}

/// 预算与频控过滤，所有计数一次批量读取
async fn limits(options: &LimitsOptions, state: &mut State, counters: &dyn CounterStore) {
    let context = &state.context;
    let day = context.now.date_naive();
    let day_fraction = context.day_fraction();

    let mut plan = KeyPlan::default();
    let checks: Vec<Vec<Check>> = state
        .candidates
        .iter()
        .map(|banner| checks_for(banner, context.user_id.as_deref(), day, &mut plan))
        .collect();
    if plan.keys.is_empty() {
        return;
    }

    let values = match counters.get_many(&plan.keys).await {
        Ok(values) => values,
        Err(error) => {
            let candidates = std::mem::take(&mut state.candidates);
            match options.on_error {
                OnError::Reject => {
                    warn!(%error, candidates = candidates.len(), "counter store unavailable, rejecting limited candidates");
                    state.candidates = candidates
                        .into_iter()
                        .zip(checks)
                        .filter(|(_, checks)| checks.is_empty())
                        .map(|(banner, _)| banner)
                        .collect();
                }
                OnError::Allow => {
                    warn!(%error, candidates = candidates.len(), "counter store unavailable, ignoring limits");
                    state.candidates = candidates;
                }
            }
            return;
        }
    };

    let value = |slot: usize| values.get(slot).copied().unwrap_or_default();
    let candidates = std::mem::take(&mut state.candidates);
    state.candidates = candidates
        .into_iter()
        .zip(checks)
        .filter(|(_, checks)| {
            checks.iter().all(|check| match check {
                Check::Budget { limit, daily, total } => limit.allows(value(*daily), value(*total), day_fraction),
                Check::Capping { capping, exposures } => capping.allows(value(*exposures)),
            })
        })
        .map(|(banner, _)| banner)
        .collect();
}

/// 按动作累加各层级的计数，失败只记日志
async fn record(options: &RecordOptions, state: &State, counters: &dyn CounterStore) {
    let context = &state.context;
    let action = options.event.unwrap_or(context.action);
    let day = context.now.date_naive();

    let mut increments: Vec<(CounterKey, u64, Option<Duration>)> = Vec::new();
    for banner in &state.winners {
        for (tier, id) in banner.ids.iter() {
            let mut add = |metric: Metric, by: u64| {
                if by > 0 {
                    increments.push((CounterKey::daily(metric, tier, *id, day), by, Some(DAILY_TTL)));
                    increments.push((CounterKey::total(metric, tier, *id), by, None));
                }
            };
            if let Some(metric) = action.metric() {
                add(metric, 1);
            }
            if action == Action::Impression {
                add(Metric::Money, banner.price);
            }
        }

        if action == Action::Impression {
            if let Some(user) = context.user_id.as_deref() {
                for (tier, capping) in banner.cappings.iter() {
                    if !capping.is_unlimited() {
                        let key = CounterKey::capping(user, tier, *banner.ids.get(tier));
                        increments.push((key, 1, Some(capping.ttl())));
                    }
                }
            }
        }
    }

    let results = join_all(increments.iter().map(|(key, by, ttl)| counters.incr(key, *by, *ttl))).await;
    for ((key, _, _), result) in increments.iter().zip(results) {
        if let Err(error) = result {
            warn!(%error, %key, request_id = %context.request_id, "counter increment failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::guard::tests::FlakyCounters;
    use crate::model::{Budget, Tier};
    use crate::pipeline::state::RequestContext;
    use crate::pipeline::testing::services;
    use crate::repository::fixtures::row;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::Ordering;

    fn state_with(count: usize) -> State {
        let mut context = RequestContext::new("req".into(), Utc::now().fixed_offset());
        context.count = count;
        context.user_id = Some("u1".into());
        State::new(context)
    }

    fn ids(banners: &[Arc<Banner>]) -> Vec<i64> {
        banners.iter().map(|banner| banner.id).collect()
    }

    fn capped(id: i64, count: u32) -> crate::repository::BannerRow {
        let mut row = row(id, 100);
        row.campaign.attrs.capping = Some(format!(r#"{{"count":{count},"period":24}}"#));
        row
    }

    fn budgeted(id: i64, daily_impressions: u64) -> crate::repository::BannerRow {
        let mut row = row(id, 100);
        row.banner.attrs.budget = Some(format!(r#"{{"impressions":{{"daily":{daily_impressions}}}}}"#));
        row
    }

    #[tokio::test]
    async fn cache_stage_filters_future_starts_and_applies_limit() {
        let mut future = row(2, 100);
        future.group.start = Some(Utc::now() + ChronoDuration::hours(1));
        let (services, _, _) = services(vec![row(1, 100), future, row(3, 100), row(4, 100)]).await;

        let mut state = state_with(1);
        Stage::Cache(CacheOptions::default()).run(&mut state, &services).await.expect("cache stage");
        assert_eq!(ids(&state.candidates), vec![1, 3, 4]);

        Stage::Cache(CacheOptions { limit: Some(2) })
            .run(&mut state, &services)
            .await
            .expect("cache stage");
        assert_eq!(ids(&state.candidates), vec![1, 3]);
    }

    #[tokio::test]
    async fn targeting_stage_applies_bound_filters() {
        let mut german = row(1, 100);
        german.campaign.attrs.targeting = Some(r#"{"country":{"include_or":["DE"]}}"#.into());
        let (services, _, _) = services(vec![german, row(2, 100)]).await;

        let mut state = state_with(1);
        state.context.country = Some("FR".into());
        state.candidates = services.cache.all();

        let stage = Stage::Targeting(Vec::new()).with_targetings(&[TargetingFilter::Geo]);
        stage.run(&mut state, &services).await.expect("targeting stage");
        assert_eq!(ids(&state.candidates), vec![2]);
    }

    #[tokio::test]
    async fn limits_enforce_capping_per_user() {
        let (services, _, counters) = services(vec![capped(1, 2), row(2, 100)]).await;
        let campaign = services.cache.one(1).expect("cached").ids.campaign;
        counters
            .incr(&CounterKey::capping("u1", Tier::Campaign, campaign), 2, None)
            .await
            .expect("memory counters");

        let mut state = state_with(1);
        state.candidates = services.cache.all();
        Stage::Limits(LimitsOptions::default()).run(&mut state, &services).await.expect("limits");
        assert_eq!(ids(&state.candidates), vec![2]);

        // 其他用户不受影响
        let mut other = state_with(1);
        other.context.user_id = Some("u2".into());
        other.candidates = services.cache.all();
        Stage::Limits(LimitsOptions::default()).run(&mut other, &services).await.expect("limits");
        assert_eq!(ids(&other.candidates), vec![1, 2]);
    }

    #[tokio::test]
    async fn limits_enforce_daily_budget() {
        let (services, _, counters) = services(vec![budgeted(1, 5), row(2, 100)]).await;
        let day = Utc::now().fixed_offset().date_naive();
        counters
            .incr(&CounterKey::daily(Metric::Impressions, Tier::Banner, 1, day), 5, None)
            .await
            .expect("memory counters");

        let mut state = state_with(1);
        state.candidates = services.cache.all();
        Stage::Limits(LimitsOptions::default()).run(&mut state, &services).await.expect("limits");
        assert_eq!(ids(&state.candidates), vec![2]);
    }

    #[tokio::test]
    async fn counter_failure_follows_policy() {
        let (mut services, _, _) = services(vec![capped(1, 2), row(2, 100)]).await;
        let flaky = Arc::new(FlakyCounters::default());
        flaky.failing.store(true, Ordering::SeqCst);
        services.counters = flaky;

        let mut rejected = state_with(1);
        rejected.candidates = services.cache.all();
        Stage::Limits(LimitsOptions { on_error: OnError::Reject })
            .run(&mut rejected, &services)
            .await
            .expect("limits never fails the request");
        assert_eq!(ids(&rejected.candidates), vec![2]);

        let mut allowed = state_with(1);
        allowed.candidates = services.cache.all();
        Stage::Limits(LimitsOptions { on_error: OnError::Allow })
            .run(&mut allowed, &services)
            .await
            .expect("limits never fails the request");
        assert_eq!(ids(&allowed.candidates), vec![1, 2]);
    }

    #[tokio::test]
    async fn rotation_picks_up_to_count_capped_by_max() {
        let (services, _, _) = services(vec![row(1, 100), row(2, 100), row(3, 100)]).await;

        let mut state = state_with(5);
        state.candidates = services.cache.all();
        Stage::Rotation(RotationOptions { max: 2 }).run(&mut state, &services).await.expect("rotation");
        assert_eq!(state.winners.len(), 2);
        assert_ne!(state.winners[0].id, state.winners[1].id);
    }

    #[tokio::test]
    async fn rotation_reports_zero_weight() {
        let (services, _, _) = services(vec![row(1, 0), row(2, 0)]).await;
        let mut state = state_with(1);
        state.candidates = services.cache.all();
        let error = Stage::Rotation(RotationOptions::default())
            .run(&mut state, &services)
            .await
            .expect_err("zero prices must fail");
        assert!(matches!(error, StageError::Selection(SelectionError::ZeroWeight { candidates: 2 })));
        assert!(state.winners.is_empty());
    }

    #[tokio::test]
    async fn lookup_finds_tracked_banner() {
        let (services, _, _) = services(vec![row(1, 100)]).await;
        let mut state = state_with(1);
        state.context.banner_id = Some(1);
        Stage::Lookup.run(&mut state, &services).await.expect("lookup");
        assert_eq!(ids(&state.winners), vec![1]);

        state.context.banner_id = Some(99);
        Stage::Lookup.run(&mut state, &services).await.expect("lookup");
        assert!(state.winners.is_empty());
    }

    #[tokio::test]
    async fn record_counts_impressions_money_and_exposures() {
        let (services, _, counters) = services(vec![capped(1, 3)]).await;
        let banner = services.cache.one(1).expect("cached");
        let day = Utc::now().fixed_offset().date_naive();

        let mut state = state_with(1);
        state.context.action = Action::Impression;
        state.winners = vec![Arc::clone(&banner)];
        let stage = Stage::Record(RecordOptions::default());
        stage.run(&mut state, &services).await.expect("record");
        stage.run(&mut state, &services).await.expect("record");

        let keys = vec![
            CounterKey::daily(Metric::Impressions, Tier::Banner, 1, day),
            CounterKey::total(Metric::Impressions, Tier::Advertiser, banner.ids.advertiser),
            CounterKey::total(Metric::Money, Tier::Group, banner.ids.group),
            CounterKey::capping("u1", Tier::Campaign, banner.ids.campaign),
            CounterKey::total(Metric::Clicks, Tier::Banner, 1),
        ];
        assert_eq!(counters.get_many(&keys).await.expect("memory counters"), vec![2, 2, 200, 2, 0]);
    }

    #[tokio::test]
    async fn record_event_override_and_failures_are_swallowed() {
        let (mut services, _, _) = services(vec![row(1, 100)]).await;
        let mut state = state_with(1);
        state.winners = services.cache.all();

        // 请求动作本身不计数，配置 event 后按曝光计
        let counters = Arc::new(crate::counters::MemoryCounters::new());
        services.counters = counters.clone();
        Stage::Record(RecordOptions::default()).run(&mut state, &services).await.expect("record");
        let key = CounterKey::total(Metric::Impressions, Tier::Banner, 1);
        assert_eq!(counters.get_many(&[key.clone()]).await.expect("memory"), vec![0]);

        Stage::Record(RecordOptions { event: Some(Action::Impression) })
            .run(&mut state, &services)
            .await
            .expect("record");
        assert_eq!(counters.get_many(&[key]).await.expect("memory"), vec![1]);

        let flaky = Arc::new(FlakyCounters::default());
        flaky.failing.store(true, Ordering::SeqCst);
        services.counters = flaky;
        assert!(Stage::Record(RecordOptions { event: Some(Action::Click) })
            .run(&mut state, &services)
            .await
            .is_ok());
    }

    #[test]
    fn budget_keys_are_shared_across_banners() {
        let mut plan = KeyPlan::default();
        let day = Utc::now().date_naive();
        let mut first = (*crate::repository::fixtures::banner(1, 100)).clone();
        first.budgets.campaign = Budget {
            clicks: Limit {
                daily: 10,
                total: 0,
                uniform: false,
            },
            ..Budget::default()
        };
        let mut second = first.clone();
        second.id = 2;
        second.ids.banner = 2;

        checks_for(&first, None, day, &mut plan);
        checks_for(&second, None, day, &mut plan);
        assert_eq!(plan.keys.len(), 2);
    }
}
