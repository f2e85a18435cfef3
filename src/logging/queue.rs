// src/logging/queue.rs

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use super::event::AdEvent;
use super::sink::EventSink;

/// **异步分析事件队列**
///
/// 有界通道加一个后台写入任务，按批大小或定时刷出。
/// 发布方从不等待：队列满或已关闭时丢弃事件并告警。
#[derive(Clone)]
pub struct EventQueue {
    sender: Sender<AdEvent>,
    stop: Arc<watch::Sender<bool>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventQueue {
    pub fn start(sink: Arc<dyn EventSink>, buffer_size: usize, batch_size: usize, flush_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let (stop, stop_rx) = watch::channel(false);

        let worker = tokio::spawn(Self::background_writer(
            sink,
            receiver,
            stop_rx,
            batch_size.max(1),
            flush_interval,
        ));

        Self {
            sender,
            stop: Arc::new(stop),
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// 入队，成功返回 true
    pub fn publish(&self, event: AdEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(banner_id = event.banner_id, event = %event.event, "analytics queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(banner_id = event.banner_id, event = %event.event, "analytics queue closed, event dropped");
                false
            }
        }
    }

    async fn background_writer(
        sink: Arc<dyn EventSink>,
        mut receiver: Receiver<AdEvent>,
        mut stop: watch::Receiver<bool>,
        batch_size: usize,
        flush_interval: Duration,
    ) {
        let mut buffer = Vec::with_capacity(batch_size);
        let mut interval = time::interval(flush_interval);

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            Self::flush(sink.as_ref(), &mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        Self::flush(sink.as_ref(), &mut buffer).await;
                    }
                }
                _ = stop.changed() => break,
            }
        }

        // 停止接收，写完已入队的事件
        receiver.close();
        while let Some(event) = receiver.recv().await {
            buffer.push(event);
            if buffer.len() >= batch_size {
                Self::flush(sink.as_ref(), &mut buffer).await;
            }
        }
        if !buffer.is_empty() {
            Self::flush(sink.as_ref(), &mut buffer).await;
        }
        debug!("analytics writer stopped");
    }

    async fn flush(sink: &dyn EventSink, buffer: &mut Vec<AdEvent>) {
        if let Err(error) = sink.write(buffer).await {
            warn!(%error, dropped = buffer.len(), "analytics publish failed");
        }
        buffer.clear();
    }

    /// 关闭队列并等待后台任务写完剩余事件
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                warn!(%error, "analytics writer task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::event::tests::event;
    use crate::logging::sink::tests::MemorySink;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn flushes_on_batch_size() {
        let sink = Arc::new(MemorySink::default());
        let queue = EventQueue::start(sink.clone(), 100, 2, Duration::from_secs(3600));

        for id in 1..=4 {
            assert!(queue.publish(event(id)));
        }
        for _ in 0..100 {
            if sink.batches.lock().len() == 2 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.batches.lock().len(), 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn flushes_on_interval() {
        let sink = Arc::new(MemorySink::default());
        let queue = EventQueue::start(sink.clone(), 100, 1000, Duration::from_millis(20));

        queue.publish(event(1));
        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.events().len(), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_pending_events() {
        let sink = Arc::new(MemorySink::default());
        let queue = EventQueue::start(sink.clone(), 100, 1000, Duration::from_secs(3600));

        for id in 1..=5 {
            queue.publish(event(id));
        }
        queue.shutdown().await;

        let ids: Vec<i64> = sink.events().iter().map(|e| e.banner_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        // 关闭后发布被丢弃
        assert!(!queue.publish(event(6)));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let sink = Arc::new(MemorySink {
            delay: Some(Duration::from_millis(200)),
            ..MemorySink::default()
        });
        let queue = EventQueue::start(sink.clone(), 1, 1, Duration::from_secs(3600));

        let started = time::Instant::now();
        let accepted = (1..=20).filter(|id| queue.publish(event(*id))).count();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(accepted < 20);
        queue.shutdown().await;
        assert_eq!(sink.events().len(), accepted);
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let sink = Arc::new(MemorySink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let queue = EventQueue::start(sink.clone(), 10, 1, Duration::from_secs(3600));

        assert!(queue.publish(event(1)));
        queue.shutdown().await;
        assert!(sink.events().is_empty());
    }
}
