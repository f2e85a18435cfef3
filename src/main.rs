// src/main.rs

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

mod api;
mod bidding;
mod cache;
mod config;
mod counters;
mod logging;
mod model;
mod openrtb;
mod pipeline;
mod repository;

use api::AppState;
use cache::BannerCache;
use config::config_manager::{AnalyticsConfig, CounterKind, CountersConfig, SinkKind, StorageConfig};
use config::ConfigManager;
use counters::{CounterStore, Guarded, MemoryCounters, RedisCounters};
use logging::{EventQueue, EventSink, FileSink, HttpSink, NullSink};
use pipeline::{Registries, Services};
use repository::{FileStorage, PostgresStorage, Repository, Storage};

#[derive(Parser, Debug)]
#[command(author = "whiteCcinn", version = "1.0", about = "A pipeline-driven ad decision server")]
struct CliArgs {
    #[arg(short, long, default_value = "config/adserver.toml")]
    config: String,
    /// 覆盖配置文件中的端口
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(long, default_value = "logs")]
    log_dir: String,
}

fn storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn Storage>> {
    Ok(match config {
        StorageConfig::Postgres(postgres) => Arc::new(PostgresStorage::connect(postgres)?),
        StorageConfig::File { path } => Arc::new(FileStorage::new(path)),
    })
}

async fn counters(config: &CountersConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let cooldown = Duration::from_millis(config.breaker_cooldown_ms);
    Ok(match config.kind {
        CounterKind::Redis => {
            let url = config.url.as_deref().context("counters.url is required for redis")?;
            let redis = RedisCounters::connect(url)
                .await
                .with_context(|| format!("connecting to redis at {url}"))?;
            Arc::new(Guarded::new(redis, timeout, config.breaker_threshold, cooldown))
        }
        CounterKind::Memory => {
            warn!("using in-process counters, limits are not shared between instances");
            Arc::new(Guarded::new(MemoryCounters::new(), timeout, config.breaker_threshold, cooldown))
        }
    })
}

fn sink(config: &AnalyticsConfig) -> anyhow::Result<Arc<dyn EventSink>> {
    Ok(match config.sink {
        SinkKind::File => Arc::new(FileSink::new(&config.dir, "ad_events.json")),
        SinkKind::Http => {
            let url = config.url.as_deref().context("analytics.url is required for the http sink")?;
            Arc::new(HttpSink::new(url, Duration::from_millis(config.timeout_ms))?)
        }
        SinkKind::None => Arc::new(NullSink),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // 初始化全局 tracing 日志
    let log_file = rolling::hourly(&args.log_dir, "adserver.json");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);
    let subscriber = Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(non_blocking));
    tracing::subscriber::set_global_default(subscriber).context("unable to set global tracing subscriber")?;

    let config = ConfigManager::load(&args.config)
        .with_context(|| format!("loading {}", args.config))?
        .config;
    let port = args.port.unwrap_or(config.server.port);
    info!(config = %args.config, port, "adserver starting");

    // 路由配置有误时直接拒绝启动
    let pipelines = Registries::default().build_all(&config.routes)?;

    let repository = Repository::new(storage(&config.storage)?);
    let cache = Arc::new(BannerCache::new(repository, config.cache.period()));
    let analytics = &config.analytics;
    let events = EventQueue::start(
        sink(analytics)?,
        analytics.buffer_size,
        analytics.batch_size,
        Duration::from_millis(analytics.flush_interval_ms),
    );

    let services = Services {
        cache: Arc::clone(&cache),
        counters: counters(&config.counters).await?,
        events: events.clone(),
        timezone: config.server.timezone()?,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = tokio::spawn(Arc::clone(&cache).start(shutdown_rx));

    let app = api::router(Arc::new(AppState { services }), pipelines);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!(%addr, "adserver listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "unable to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down gracefully...");
        })
        .await
        .context("http server")?;

    // 停止刷新，并把剩余事件写完
    let _ = shutdown_tx.send(true);
    if let Err(error) = refresher.await {
        warn!(%error, "cache refresher ended abnormally");
    }
    events.shutdown().await;
    info!("adserver shut down");
    Ok(())
}
