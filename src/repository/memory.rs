// src/repository/memory.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{BannerRow, Storage, StorageError};

/// 内存数据源，用于测试及本地调试；可模拟存储故障
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rows: Mutex<Vec<BannerRow>>,
    failure: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new(rows: Vec<BannerRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            failure: Mutex::new(None),
        }
    }

    pub fn set_rows(&self, rows: Vec<BannerRow>) {
        *self.rows.lock() = rows;
    }

    /// 之后的每次读取都返回错误，直到 `recover`
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn rows(&self, _now: DateTime<Utc>) -> Result<Vec<BannerRow>, StorageError> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(StorageError::Unavailable(reason));
        }
        Ok(self.rows.lock().clone())
    }
}
