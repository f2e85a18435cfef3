// src/repository/file.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BannerRow, Storage, StorageError};

/// 从 JSON 文件读取联表后的行（`[BannerRow, ...]`）
///
/// 每次刷新都重新读取文件，修改文件后下一个刷新周期即生效。
pub struct FileStorage {
    pub path: String,
}

impl FileStorage {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn rows(&self, _now: DateTime<Utc>) -> Result<Vec<BannerRow>, StorageError> {
        let content = tokio::fs::read(&self.path).await.map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(serde_json::from_slice(&content)?)
    }
}
