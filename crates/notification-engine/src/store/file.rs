//! JSON 文件存储
//!
//! 内存中仍由 DashMap 承载，每次变更后把全部实例整体重写到
//! `notifications.json`。写入失败视为存储不可用。租约只存在于内存中。

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salon_shared::persistence::JsonFile;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::{MemoryNotificationStore, NotificationStore};
use crate::error::StoreError;
use crate::models::{NotificationFilter, NotificationInstance, NotificationStats, StatusUpdate};

/// 持久化文件名
pub const NOTIFICATIONS_FILE_NAME: &str = "notifications.json";

/// 文件通知存储
pub struct FileNotificationStore {
    inner: MemoryNotificationStore,
    file: JsonFile,
    /// 串行化「变更 + 落盘」，保证文件内容与某一时刻的内存一致
    write_lock: Mutex<()>,
}

impl FileNotificationStore {
    /// 打开存储，文件存在时加载已有实例
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = JsonFile::new(path);
        let instances: Vec<NotificationInstance> = file.read().await?.unwrap_or_default();

        info!(
            path = %file.path().display(),
            count = instances.len(),
            "通知存储已加载"
        );

        Ok(Self {
            inner: MemoryNotificationStore::from_instances(instances),
            file,
            write_lock: Mutex::new(()),
        })
    }

    /// 数据目录下的默认文件
    pub async fn open_in_dir(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open(data_dir.into().join(NOTIFICATIONS_FILE_NAME)).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let snapshot = self.inner.all_instances();
        self.file.write(&snapshot).await.map_err(|e| {
            error!(path = %self.file.path().display(), error = %e, "通知存储写入失败");
            StoreError::from(e)
        })
    }
}

#[async_trait]
impl NotificationStore for FileNotificationStore {
    async fn insert(&self, instance: NotificationInstance) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.inner.insert_instance(instance)?;
        self.flush().await
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationInstance>, StoreError> {
        self.inner.get(id).await
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let applied = self.inner.apply_update(id, &update)?;
        if applied {
            self.flush().await?;
        }
        Ok(applied)
    }

    async fn lease_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationInstance>, StoreError> {
        self.inner.lease_due(now).await
    }

    async fn release(&self, id: &str) -> Result<(), StoreError> {
        self.inner.release(id).await
    }

    async fn query(
        &self,
        filter: NotificationFilter,
    ) -> Result<Vec<NotificationInstance>, StoreError> {
        self.inner.query(filter).await
    }

    async fn stats(&self) -> Result<NotificationStats, StoreError> {
        self.inner.stats().await
    }
}
