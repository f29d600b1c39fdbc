//! 通知扫描 Worker
//!
//! 以固定间隔触发扫描，每个 tick 在独立任务中执行 `Dispatcher::run_sweep`。
//! 错过的 tick 直接丢弃；扫描本身是单飞的，撞上进行中的扫描会被跳过。
//!
//! 收到关闭信号后不再触发新扫描，等待进行中的扫描在宽限期内结束，超时则中止。
//! 被中止扫描持有的租约不会重新入队。

use std::sync::Arc;
use std::time::Duration;

use salon_shared::config::SchedulerConfig;
use salon_shared::observability::metrics;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;

const WORKER_NAME: &str = "sweep_worker";

/// 扫描 Worker
pub struct SweepWorker {
    dispatcher: Arc<Dispatcher>,
    /// 扫描间隔
    interval: Duration,
    /// 关闭时的等待上限
    shutdown_grace: Duration,
}

impl SweepWorker {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration, shutdown_grace: Duration) -> Self {
        Self {
            dispatcher,
            interval,
            shutdown_grace,
        }
    }

    pub fn from_config(dispatcher: Arc<Dispatcher>, config: &SchedulerConfig) -> Self {
        Self::new(
            dispatcher,
            Duration::from_secs(config.sweep_interval_secs.max(1)),
            Duration::from_secs(config.shutdown_grace_secs),
        )
    }

    /// 在后台任务中运行
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// 主循环：直到收到关闭信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            shutdown_grace = ?self.shutdown_grace,
            max_concurrency = self.dispatcher.options().max_concurrency,
            "SweepWorker 已启动"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeps = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while sweeps.try_join_next().is_some() {}

                    let dispatcher = Arc::clone(&self.dispatcher);
                    sweeps.spawn(async move {
                        match dispatcher.run_sweep().await {
                            Ok(report) if report.skipped => debug!("扫描进行中，本次 tick 跳过"),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "扫描中止，等待下一次 tick 重试"),
                        }
                    });

                    metrics::set_worker_last_run(WORKER_NAME);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(sweeps).await;
        info!("SweepWorker 已停止");
    }

    async fn drain(&self, mut sweeps: JoinSet<()>) {
        if sweeps.is_empty() {
            return;
        }

        let wait_all = async { while sweeps.join_next().await.is_some() {} };
        if tokio::time::timeout(self.shutdown_grace, wait_all).await.is_err() {
            warn!(
                grace = ?self.shutdown_grace,
                remaining = sweeps.len(),
                "宽限期内扫描未结束，强制中止"
            );
            sweeps.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AdapterRegistry;
    use crate::dispatcher::DispatcherOptions;
    use crate::models::{ChannelKind, NotificationStatus, fixtures};
    use crate::settings::{MemoryConfigStore, SettingsService};
    use crate::store::{MemoryNotificationStore, NotificationStore};
    use chrono::Utc;

    fn dispatcher(store: Arc<MemoryNotificationStore>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            store,
            Arc::new(SettingsService::new(Arc::new(MemoryConfigStore::new()))),
            Arc::new(AdapterRegistry::with_defaults()),
            DispatcherOptions::default(),
        ))
    }

    #[tokio::test]
    async fn test_worker_sweeps_and_stops_on_shutdown() {
        let store = Arc::new(MemoryNotificationStore::new());
        let instance = fixtures::instance(ChannelKind::Sms, Utc::now());
        let id = instance.id.clone();
        store.insert(instance).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = SweepWorker::new(
            dispatcher(store.clone()),
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        let handle = worker.spawn(rx);

        // 第一次 tick 立即触发
        let mut sent = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get(&id).await.unwrap().unwrap().status == NotificationStatus::Sent {
                sent = true;
                break;
            }
        }
        assert!(sent);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker 应在关闭信号后退出")
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_when_sender_dropped() {
        let store = Arc::new(MemoryNotificationStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = SweepWorker::new(
            dispatcher(store),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        )
        .spawn(rx);

        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_from_config() {
        let store = Arc::new(MemoryNotificationStore::new());
        let config = SchedulerConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        let worker = SweepWorker::from_config(dispatcher(store), &config);
        assert_eq!(worker.interval, Duration::from_secs(1));
        assert_eq!(worker.shutdown_grace, Duration::from_secs(10));
    }
}
