// src/cache/mod.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::model::Banner;
use crate::repository::{Repository, StorageError};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Empty,
    Populated,
    Stopped,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Empty => "empty",
            CacheState::Populated => "populated",
            CacheState::Stopped => "stopped",
        }
    }
}

/// 某次刷新得到的完整结果，生成后不再修改
#[derive(Debug, Default)]
pub struct Snapshot {
    banners: Vec<Arc<Banner>>,
    by_id: HashMap<i64, Arc<Banner>>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    fn new(banners: Vec<Banner>, refreshed_at: DateTime<Utc>) -> Self {
        let banners: Vec<Arc<Banner>> = banners.into_iter().map(Arc::new).collect();
        let by_id = banners.iter().map(|banner| (banner.id, Arc::clone(banner))).collect();
        Self {
            banners,
            by_id,
            refreshed_at: Some(refreshed_at),
        }
    }

    pub fn banners(&self) -> &[Arc<Banner>] {
        &self.banners
    }

    pub fn get(&self, id: i64) -> Option<&Arc<Banner>> {
        self.by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.banners.len()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}

/// 发送端被丢弃同样视为停止
fn stopping(closed: bool, shutdown: &watch::Receiver<bool>) -> bool {
    closed || *shutdown.borrow()
}

/// **创意内存缓存**
///
/// 单写多读。刷新时先在锁外构建完整快照，再在写锁内替换一个 `Arc`，
/// 写锁持有时间与创意数量无关；读者只会看到刷新前或刷新后的完整快照。
/// 刷新失败时继续提供旧快照。
pub struct BannerCache {
    repository: Repository,
    period: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    stopped: AtomicBool,
}

impl BannerCache {
    pub fn new(repository: Repository, period: Duration) -> Self {
        Self {
            repository,
            period,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            stopped: AtomicBool::new(false),
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// 当前全部创意的副本，调用方修改它不会影响缓存
    pub fn all(&self) -> Vec<Arc<Banner>> {
        self.snapshot().banners.clone()
    }

    pub fn one(&self, id: i64) -> Option<Arc<Banner>> {
        self.snapshot().get(id).cloned()
    }

    pub fn state(&self) -> CacheState {
        if self.stopped.load(Ordering::Acquire) {
            CacheState::Stopped
        } else if self.snapshot().refreshed_at().is_some() {
            CacheState::Populated
        } else {
            CacheState::Empty
        }
    }

    /// 从仓库加载一次并替换快照，返回新快照中的创意数
    pub async fn refresh(&self) -> Result<usize, StorageError> {
        let banners = self.repository.all().await?;
        let fresh = Arc::new(Snapshot::new(banners, Utc::now()));
        let count = fresh.len();

        let previous = std::mem::replace(&mut *self.snapshot.write(), fresh);
        // 旧快照在写锁外释放
        drop(previous);
        Ok(count)
    }

    /// 刷新循环，启动时立即加载一次，之后按周期刷新，直到收到停止信号
    ///
    /// 进行中的刷新同样会被停止信号打断，存储层卡住不会拖住退出。
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if stopping(changed.is_err(), &shutdown) {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                result = self.refresh() => match result {
                    Ok(count) => info!(banners = count, "banner cache refreshed"),
                    Err(error) => warn!(
                        %error,
                        stale_banners = self.snapshot().len(),
                        "banner cache refresh failed, serving previous snapshot"
                    ),
                },
                changed = shutdown.changed() => {
                    if stopping(changed.is_err(), &shutdown) {
                        warn!("banner cache refresh abandoned on shutdown");
                        break;
                    }
                }
            }
        }

        self.stopped.store(true, Ordering::Release);
        info!("banner cache refresh loop stopped");
    }
}
