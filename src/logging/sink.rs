// src/logging/sink.rs

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tokio::task;
use tokio::time::Duration;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::fmt::MakeWriter;

use super::event::AdEvent;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("writing analytics file: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding analytics events: {0}")]
    Json(#[from] serde_json::Error),
    #[error("analytics endpoint: {0}")]
    Http(#[from] reqwest::Error),
    #[error("analytics writer task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// 分析事件的落地目标（消息日志）
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn write(&self, batch: &[AdEvent]) -> Result<(), SinkError>;
}

/// 按小时滚动的 JSON Lines 文件
pub struct FileSink {
    file: Arc<RollingFileAppender>,
}

impl FileSink {
    pub fn new(dir: &str, prefix: &str) -> Self {
        Self {
            file: Arc::new(rolling::hourly(dir, prefix)),
        }
    }
}

#[async_trait]
impl EventSink for FileSink {
    async fn write(&self, batch: &[AdEvent]) -> Result<(), SinkError> {
        let mut content = String::new();
        for event in batch {
            content.push_str(&serde_json::to_string(event)?);
            content.push('\n');
        }

        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || {
            let mut writer = file.make_writer();
            writer.write_all(content.as_bytes())?;
            writer.flush()
        })
        .await??;
        Ok(())
    }
}

/// 以 JSON 数组 POST 到收集端
pub struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn write(&self, batch: &[AdEvent]) -> Result<(), SinkError> {
        self.client
            .post(&self.url)
            .json(batch)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn write(&self, _batch: &[AdEvent]) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logging::event::tests::event;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 记录每个批次，可切换为失败
    #[derive(Default)]
    pub struct MemorySink {
        pub batches: Mutex<Vec<Vec<AdEvent>>>,
        pub failing: AtomicBool,
        pub delay: Option<Duration>,
    }

    impl MemorySink {
        pub fn events(&self) -> Vec<AdEvent> {
            self.batches.lock().iter().flatten().cloned().collect()
        }
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn write(&self, batch: &[AdEvent]) -> Result<(), SinkError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::Io(std::io::Error::new(std::io::ErrorKind::Other, "injected")));
            }
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn file_sink_writes_json_lines() {
        let dir = std::env::temp_dir().join(format!("adserver-sink-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let sink = FileSink::new(dir.to_str().expect("utf-8 temp dir"), "events.json");

        sink.write(&[event(1), event(2)]).await.expect("file sink");

        let mut lines = Vec::new();
        for entry in std::fs::read_dir(&dir).expect("read temp dir") {
            let content = std::fs::read_to_string(entry.expect("dir entry").path()).expect("read log file");
            lines.extend(content.lines().map(str::to_string));
        }
        assert_eq!(lines.len(), 2);
        let first: AdEvent = serde_json::from_str(&lines[0]).expect("json line");
        assert_eq!(first.banner_id, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        assert!(NullSink.write(&[event(1)]).await.is_ok());
    }
}
