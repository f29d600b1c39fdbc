//! 通知引擎门面
//!
//! 组装配置、存储、调度器、分发器与后台 Worker，对外提供预约事件入口和管理操作。
//! 引擎在 `main` 中构建一次，以 `Arc` 注入 HTTP 层，生命周期由 `init` / `shutdown` 显式控制。

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use salon_shared::config::{AppConfig, SchedulerConfig, StorageBackend};
use salon_shared::observability::metrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::channels::AdapterRegistry;
use crate::dispatcher::{Dispatcher, DispatcherOptions, SweepReport};
use crate::error::{NotificationError, Result, StoreError};
use crate::models::{
    NotificationFilter, NotificationInstance, NotificationStats, StatusUpdate,
};
use crate::scheduler::{ScheduleRequest, Scheduler, salon_offset};
use crate::settings::{
    ConfigPatch, ConfigStore, FileConfigStore, MemoryConfigStore, NotificationConfig,
    SettingsService,
};
use crate::store::{FileNotificationStore, MemoryNotificationStore, NotificationStore};
use crate::worker::SweepWorker;

/// 通知引擎
pub struct NotificationEngine {
    settings: Arc<SettingsService>,
    store: Arc<dyn NotificationStore>,
    scheduler: Scheduler,
    dispatcher: Arc<Dispatcher>,
    scheduler_config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationEngine {
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        store: Arc<dyn NotificationStore>,
        registry: AdapterRegistry,
        scheduler_config: SchedulerConfig,
    ) -> Result<Self> {
        let settings = Arc::new(SettingsService::new(config_store));
        let offset = salon_offset(scheduler_config.utc_offset_minutes)?;

        let scheduler = Scheduler::new(Arc::clone(&settings), Arc::clone(&store), offset);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            Arc::new(registry),
            DispatcherOptions::from(&scheduler_config),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            settings,
            store,
            scheduler,
            dispatcher,
            scheduler_config,
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    /// 内存存储 + 模拟渠道，用于测试和本地开发
    pub fn in_memory(scheduler_config: SchedulerConfig) -> Result<Self> {
        Self::new(
            Arc::new(MemoryConfigStore::new()),
            Arc::new(MemoryNotificationStore::new()),
            AdapterRegistry::with_defaults(),
            scheduler_config,
        )
    }

    /// 按进程配置选择存储后端与渠道传输
    pub async fn from_app_config(config: &AppConfig) -> Result<Self> {
        let (config_store, store): (Arc<dyn ConfigStore>, Arc<dyn NotificationStore>) =
            match config.storage.backend {
                StorageBackend::Memory => (
                    Arc::new(MemoryConfigStore::new()),
                    Arc::new(MemoryNotificationStore::new()),
                ),
                StorageBackend::File => {
                    let data_dir = config.storage.data_dir.clone();
                    (
                        Arc::new(FileConfigStore::in_dir(&data_dir)),
                        Arc::new(FileNotificationStore::open_in_dir(&data_dir).await?),
                    )
                }
            };

        let registry = AdapterRegistry::from_config(&config.channels)
            .map_err(|e| NotificationError::Validation(format!("渠道配置无效: {}", e)))?;

        info!(
            backend = ?config.storage.backend,
            data_dir = %config.storage.data_dir.display(),
            "通知引擎已构建"
        );

        Self::new(config_store, store, registry, config.scheduler.clone())
    }

    /// 加载保存的配置并启动后台扫描
    pub async fn init(&self) -> Result<()> {
        self.settings.load().await?;

        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("通知引擎已在运行，忽略重复 init");
            return Ok(());
        }

        self.shutdown_tx.send_replace(false);
        let handle = SweepWorker::from_config(Arc::clone(&self.dispatcher), &self.scheduler_config)
            .spawn(self.shutdown_tx.subscribe());
        *worker = Some(handle);

        info!("通知引擎已启动");
        Ok(())
    }

    /// 停止后台扫描，等待 Worker 在宽限期内退出
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };

        self.shutdown_tx.send_replace(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "SweepWorker 异常退出");
        }
        info!("通知引擎已停止");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    // ==================== 预约事件 ====================

    /// 处理预约事件，返回创建的通知 id
    pub async fn notify_appointment(&self, request: ScheduleRequest) -> Result<Vec<String>> {
        self.scheduler.schedule_for_appointment(request).await
    }

    // ==================== 管理操作 ====================

    /// 取消待发送的通知
    ///
    /// 仅未被租用的 Pending 实例可以取消；已终结、发送中、不存在的 id 以及存储故障都返回 false。
    #[instrument(skip(self))]
    pub async fn cancel_notification(&self, id: &str) -> bool {
        let cancelled = match self
            .store
            .update_status(id, StatusUpdate::cancelled(Utc::now()))
            .await
        {
            Ok(applied) => applied,
            Err(StoreError::NotFound(_)) => false,
            Err(e) => {
                error!(error = %e, "取消通知时存储不可用");
                false
            }
        };

        metrics::record_cancellation(cancelled);
        info!(cancelled, "取消通知");
        cancelled
    }

    pub fn get_config(&self) -> Arc<NotificationConfig> {
        self.settings.snapshot()
    }

    pub async fn update_config(&self, patch: ConfigPatch) -> Result<Arc<NotificationConfig>> {
        Ok(self.settings.update(patch).await?)
    }

    pub async fn list_notifications(
        &self,
        filter: NotificationFilter,
    ) -> Result<Vec<NotificationInstance>> {
        Ok(self.store.query(filter).await?)
    }

    pub async fn get_notification(&self, id: &str) -> Result<Option<NotificationInstance>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn get_stats(&self) -> Result<NotificationStats> {
        Ok(self.store.stats().await?)
    }

    /// 立即执行一次扫描
    pub async fn run_sweep_now(&self) -> Result<SweepReport> {
        Ok(self.dispatcher.run_sweep().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotificationKind, NotificationStatus, fixtures};
    use std::time::Duration;

    fn engine() -> NotificationEngine {
        NotificationEngine::in_memory(SchedulerConfig {
            sweep_interval_secs: 3600,
            shutdown_grace_secs: 1,
            ..Default::default()
        })
        .unwrap()
    }

    fn request(kind: NotificationKind) -> ScheduleRequest {
        ScheduleRequest {
            kind,
            appointment: fixtures::appointment(),
            recipient: fixtures::recipient(),
            custom_message: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let engine = engine();
        assert!(!engine.is_running());

        engine.init().await.unwrap();
        assert!(engine.is_running());
        // 重复 init 无副作用
        engine.init().await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), engine.shutdown())
            .await
            .unwrap();
        assert!(!engine.is_running());

        // 可以再次启动
        engine.init().await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let engine = engine();
        let ids = engine
            .notify_appointment(request(NotificationKind::Cancellation))
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        assert!(engine.cancel_notification(&ids[0]).await);
        // 已终结
        assert!(!engine.cancel_notification(&ids[0]).await);
        // 不存在
        assert!(!engine.cancel_notification("nope").await);

        let report = engine.run_sweep_now().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.sent, 1);

        let cancelled = engine.get_notification(&ids[0]).await.unwrap().unwrap();
        assert_eq!(cancelled.status, NotificationStatus::Cancelled);
        // 已发送的不能再取消
        assert!(!engine.cancel_notification(&ids[1]).await);
    }

    #[tokio::test]
    async fn test_cancel_store_failure_returns_false() {
        let mut store = crate::store::MockNotificationStore::new();
        store
            .expect_update_status()
            .returning(|_, _| Err(StoreError::Unavailable("disk".to_string())));
        let engine = NotificationEngine::new(
            Arc::new(MemoryConfigStore::new()),
            Arc::new(store),
            AdapterRegistry::with_defaults(),
            SchedulerConfig::default(),
        )
        .unwrap();

        assert!(!engine.cancel_notification("n-1").await);
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let engine = engine();
        let updated = engine
            .update_config(ConfigPatch {
                channels: Some(vec!["email".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.channels.len(), 1);
        assert_eq!(engine.get_config().channels, updated.channels);

        let err = engine
            .update_config(ConfigPatch {
                channels: Some(vec!["fax".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_CHANNEL");
    }

    #[tokio::test]
    async fn test_invalid_offset_rejected() {
        let result = NotificationEngine::in_memory(SchedulerConfig {
            utc_offset_minutes: 10_000,
            ..Default::default()
        });
        assert!(matches!(result, Err(NotificationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_from_app_config_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::File;
        config.storage.data_dir = dir.path().to_path_buf();

        let engine = NotificationEngine::from_app_config(&config).await.unwrap();
        engine
            .notify_appointment(request(NotificationKind::Rescheduling))
            .await
            .unwrap();
        assert!(dir.path().join(crate::store::NOTIFICATIONS_FILE_NAME).exists());

        let reopened = NotificationEngine::from_app_config(&config).await.unwrap();
        assert_eq!(reopened.get_stats().await.unwrap().total, 2);
    }
}
