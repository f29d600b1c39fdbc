//! 分发器
//!
//! 周期扫描的执行体：租用到期实例，经有界并发池逐个渲染并发送，再回写终态。
//!
//! - 同一时刻最多一次扫描（`try_lock`），撞上进行中的扫描直接跳过
//! - 每个实例只尝试一次，发送受超时约束
//! - 单个实例的失败只记录到该实例；存储不可用时停止放入新实例，等已开始的跑完，
//!   只释放从未开始的租约

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use salon_shared::config::SchedulerConfig;
use salon_shared::observability::metrics;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::channels::{AdapterRegistry, SendResult};
use crate::error::{DispatchError, StoreError};
use crate::models::{NotificationInstance, StatusUpdate};
use crate::settings::{NotificationConfig, SettingsService};
use crate::store::NotificationStore;
use crate::template::TemplateEngine;

/// 单个实例的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Failed,
    /// 回写时实例已不是 Pending，本次结果被丢弃
    Superseded,
}

/// 扫描报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub skipped: bool,
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    pub superseded: usize,
    pub duration_ms: u64,
}

impl SweepReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent => self.sent += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Superseded => self.superseded += 1,
        }
    }
}

/// 分发参数
#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    pub max_concurrency: usize,
    pub send_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for DispatcherOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        }
    }
}

/// 分发器
pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    settings: Arc<SettingsService>,
    registry: Arc<AdapterRegistry>,
    templates: TemplateEngine,
    options: DispatcherOptions,
    sweep_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        settings: Arc<SettingsService>,
        registry: Arc<AdapterRegistry>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            store,
            settings,
            registry,
            templates: TemplateEngine::new(),
            options,
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn options(&self) -> DispatcherOptions {
        self.options
    }

    /// 以当前时间执行一次扫描
    pub async fn run_sweep(&self) -> Result<SweepReport, StoreError> {
        self.run_sweep_at(Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn run_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!("上一次扫描仍在进行，跳过本次");
            metrics::record_sweep("skipped", 0.0);
            return Ok(SweepReport::skipped());
        };

        let started = Instant::now();
        let due = self.store.lease_due(now).await.inspect_err(|e| {
            error!(error = %e, "租用到期通知失败");
            metrics::record_sweep("aborted", started.elapsed().as_secs_f64());
        })?;

        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            report.duration_ms = elapsed_ms(started);
            metrics::record_sweep("completed", started.elapsed().as_secs_f64());
            return Ok(report);
        }

        let config = self.settings.snapshot();
        let mut queue = due.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut admitted = 0usize;
        let mut fatal = None;

        // 出现致命错误后不再放入新实例，已放入的实例必须跑完，否则已发送的结果会丢失
        loop {
            while fatal.is_none() && in_flight.len() < self.options.max_concurrency {
                let Some(instance) = queue.next() else {
                    break;
                };
                admitted += 1;
                in_flight.push(self.process(instance, &config));
            }

            let Some((id, result)) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) if fatal.is_none() => fatal = Some(e),
                Err(e) => warn!(notification_id = %id, error = %e, "回写状态失败"),
            }
        }

        if let Some(err) = fatal {
            let mut released = 0usize;
            for instance in queue {
                match self.store.release(&instance.id).await {
                    Ok(()) => released += 1,
                    Err(e) => warn!(notification_id = %instance.id, error = %e, "释放租约失败"),
                }
            }
            error!(
                error = %err,
                processed = admitted,
                released,
                due = report.due,
                "通知存储不可用，本次扫描中止"
            );
            metrics::record_sweep("aborted", started.elapsed().as_secs_f64());
            return Err(err);
        }

        report.duration_ms = elapsed_ms(started);
        metrics::record_sweep("completed", started.elapsed().as_secs_f64());
        info!(
            due = report.due,
            sent = report.sent,
            failed = report.failed,
            superseded = report.superseded,
            duration_ms = report.duration_ms,
            "通知扫描完成"
        );

        Ok(report)
    }

    /// 发送并回写一个已租用的实例
    async fn process(
        &self,
        instance: NotificationInstance,
        config: &NotificationConfig,
    ) -> (String, Result<DispatchOutcome, StoreError>) {
        let started = Instant::now();

        let (update, outcome) = match self.deliver(&instance, config).await {
            Ok(result) => {
                debug!(
                    notification_id = %instance.id,
                    channel = %instance.channel,
                    message_id = ?result.message_id,
                    "通知发送成功"
                );
                (StatusUpdate::sent(Utc::now()), DispatchOutcome::Sent)
            }
            Err(e) => {
                warn!(
                    notification_id = %instance.id,
                    channel = %instance.channel,
                    kind = %instance.kind,
                    validation = e.is_validation(),
                    error = %e,
                    "通知发送失败"
                );
                (
                    StatusUpdate::failed(Utc::now(), e.to_string()),
                    DispatchOutcome::Failed,
                )
            }
        };

        let result = match self.store.update_status(&instance.id, update).await {
            Ok(true) => Ok(outcome),
            Ok(false) => {
                warn!(notification_id = %instance.id, "实例状态已变化，丢弃本次结果");
                Ok(DispatchOutcome::Superseded)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(notification_id = %instance.id, error = %e, "回写状态失败");
                Ok(DispatchOutcome::Superseded)
            }
        };

        let label = match &result {
            Ok(DispatchOutcome::Sent) => "sent",
            Ok(DispatchOutcome::Failed) => "failed",
            Ok(DispatchOutcome::Superseded) => "superseded",
            Err(_) => "aborted",
        };
        metrics::record_dispatch(
            instance.channel.as_str(),
            label,
            started.elapsed().as_secs_f64(),
        );

        (instance.id, result)
    }

    /// 校验联系方式、渲染、查找适配器并在超时内发送
    pub async fn deliver(
        &self,
        instance: &NotificationInstance,
        config: &NotificationConfig,
    ) -> Result<SendResult, DispatchError> {
        let channel = instance.channel;
        if instance.recipient.contact_for(channel).is_none() {
            return Err(DispatchError::MissingContact {
                channel,
                field: channel.contact_field(),
            });
        }

        let message = self.templates.render_instance(instance, config)?;
        let adapter = self
            .registry
            .get(channel)
            .ok_or(DispatchError::AdapterNotRegistered(channel))?;

        let timeout_ms = u64::try_from(self.options.send_timeout.as_millis()).unwrap_or(u64::MAX);
        let result = tokio::time::timeout(
            self.options.send_timeout,
            adapter.send(&instance.recipient, &message),
        )
        .await
        .map_err(|_| DispatchError::Timeout {
            channel,
            timeout_ms,
        })?
        .map_err(|e| DispatchError::from_adapter(channel, timeout_ms, e))?;

        if !result.success {
            return Err(DispatchError::Rejected {
                channel,
                reason: result.error.unwrap_or_else(|| "未知原因".to_string()),
            });
        }

        Ok(result)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MockChannelAdapter;
    use crate::error::AdapterError;
    use crate::models::{ChannelKind, NotificationStatus, Recipient, fixtures};
    use crate::settings::MemoryConfigStore;
    use crate::store::{MemoryNotificationStore, MockNotificationStore};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap()
    }

    fn settings() -> Arc<SettingsService> {
        Arc::new(SettingsService::new(Arc::new(MemoryConfigStore::new())))
    }

    fn options(timeout_ms: u64) -> DispatcherOptions {
        DispatcherOptions {
            max_concurrency: 4,
            send_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn dispatcher_with(
        store: Arc<dyn NotificationStore>,
        registry: AdapterRegistry,
        timeout_ms: u64,
    ) -> Dispatcher {
        Dispatcher::new(store, settings(), Arc::new(registry), options(timeout_ms))
    }

    fn mock_adapter(
        channel: ChannelKind,
        result: impl Fn() -> Result<SendResult, AdapterError> + Send + Sync + 'static,
    ) -> MockChannelAdapter {
        let mut mock = MockChannelAdapter::new();
        mock.expect_channel().return_const(channel);
        mock.expect_name().return_const("mock");
        mock.expect_send().returning(move |_, _| result());
        mock
    }

    /// 记录调用次数与并发峰值，可只对指定收件人延迟
    struct TrackingAdapter {
        delay: Duration,
        slow_for: Option<&'static str>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TrackingAdapter {
        fn new(delay: Duration, slow_for: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                slow_for,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl crate::channels::ChannelAdapter for TrackingAdapter {
        fn channel(&self) -> ChannelKind {
            ChannelKind::Sms
        }

        fn name(&self) -> &'static str {
            "tracking"
        }

        async fn send(
            &self,
            recipient: &Recipient,
            _message: &crate::template::RenderedMessage,
        ) -> Result<SendResult, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);

            if self.slow_for.is_none_or(|name| recipient.name == name) {
                tokio::time::sleep(self.delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(SendResult::sent(ChannelKind::Sms, "tracked"))
        }
    }

    #[tokio::test]
    async fn test_missing_contact_never_calls_adapter() {
        let store = Arc::new(MemoryNotificationStore::new());
        let mut instance = fixtures::instance(ChannelKind::Push, now());
        instance.recipient = Recipient::new("Maria").with_phone("11987654321");
        let id = instance.id.clone();
        store.insert(instance).await.unwrap();

        let mut mock = MockChannelAdapter::new();
        mock.expect_channel().return_const(ChannelKind::Push);
        mock.expect_name().return_const("mock");
        mock.expect_send().never();
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(mock));

        let dispatcher = dispatcher_with(store.clone(), registry, 1000);
        let report = dispatcher.run_sweep_at(now()).await.unwrap();

        assert_eq!(report.due, 1);
        assert_eq!(report.failed, 1);
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert!(stored.error.unwrap().contains("pushToken"));
    }

    #[tokio::test]
    async fn test_success_marks_sent() {
        let store = Arc::new(MemoryNotificationStore::new());
        let instance = fixtures::instance(ChannelKind::Sms, now());
        let id = instance.id.clone();
        store.insert(instance).await.unwrap();

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(mock_adapter(ChannelKind::Sms, || {
            Ok(SendResult::sent(ChannelKind::Sms, "sms_1"))
        })));

        let dispatcher = dispatcher_with(store.clone(), registry, 1000);
        let report = dispatcher.run_sweep_at(now()).await.unwrap();

        assert_eq!(report.sent, 1);
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(stored.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_not_due_is_untouched() {
        let store = Arc::new(MemoryNotificationStore::new());
        store
            .insert(fixtures::instance(ChannelKind::Sms, now() + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let dispatcher = dispatcher_with(store.clone(), AdapterRegistry::with_defaults(), 1000);
        let report = dispatcher.run_sweep_at(now()).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.due, 0);
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_adapter_failures_recorded() {
        let store = Arc::new(MemoryNotificationStore::new());
        let rejected = fixtures::instance(ChannelKind::Sms, now());
        let negative = fixtures::instance(ChannelKind::Email, now());
        let unregistered = fixtures::instance(ChannelKind::WhatsApp, now());
        for i in [&rejected, &negative, &unregistered] {
            store.insert(i.clone()).await.unwrap();
        }

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(mock_adapter(ChannelKind::Sms, || {
            Err(AdapterError::Rejected("HTTP 400".to_string()))
        })));
        registry.register(Arc::new(mock_adapter(ChannelKind::Email, || {
            Ok(SendResult::failed(ChannelKind::Email, "mailbox full"))
        })));

        let dispatcher = dispatcher_with(store.clone(), registry, 1000);
        let report = dispatcher.run_sweep_at(now()).await.unwrap();
        assert_eq!(report.failed, 3);

        let error_of = |id: String| {
            let store = store.clone();
            async move { store.get(&id).await.unwrap().unwrap().error.unwrap() }
        };
        assert!(error_of(rejected.id).await.contains("HTTP 400"));
        assert!(error_of(negative.id).await.contains("mailbox full"));
        assert!(error_of(unregistered.id).await.contains("未注册"));
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        struct SlowAdapter;

        #[async_trait::async_trait]
        impl crate::channels::ChannelAdapter for SlowAdapter {
            fn channel(&self) -> ChannelKind {
                ChannelKind::Sms
            }
            fn name(&self) -> &'static str {
                "slow"
            }
            async fn send(
                &self,
                _recipient: &Recipient,
                _message: &crate::template::RenderedMessage,
            ) -> Result<SendResult, AdapterError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(SendResult::sent(ChannelKind::Sms, "late"))
            }
        }

        let store = Arc::new(MemoryNotificationStore::new());
        let instance = fixtures::instance(ChannelKind::Sms, now());
        let id = instance.id.clone();
        store.insert(instance).await.unwrap();

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(SlowAdapter));
        let dispatcher = dispatcher_with(store.clone(), registry, 50);

        let report = dispatcher.run_sweep_at(now()).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert!(stored.error.unwrap().contains("超时"));
    }

    #[tokio::test]
    async fn test_concurrent_sweep_is_skipped() {
        let store = Arc::new(MemoryNotificationStore::new());
        let dispatcher = dispatcher_with(store, AdapterRegistry::with_defaults(), 1000);

        let _held = dispatcher.sweep_lock.lock().await;
        let report = dispatcher.run_sweep_at(now()).await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn test_fatal_store_error_aborts_and_releases() {
        let mut store = MockNotificationStore::new();
        let first = fixtures::instance(ChannelKind::Sms, now());
        let second = fixtures::instance(ChannelKind::Sms, now());
        let leased = vec![first, second];
        store
            .expect_lease_due()
            .returning(move |_| Ok(leased.clone()));
        store
            .expect_update_status()
            .returning(|_, _| Err(StoreError::Unavailable("disk".to_string())));
        store.expect_release().times(1).returning(|_| Ok(()));

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(mock_adapter(ChannelKind::Sms, || {
            Ok(SendResult::sent(ChannelKind::Sms, "sms_1"))
        })));

        // 并发度 1，保证第一个结果返回时第二个尚未开始
        let dispatcher = Dispatcher::new(
            Arc::new(store),
            settings(),
            Arc::new(registry),
            DispatcherOptions {
                max_concurrency: 1,
                send_timeout: Duration::from_secs(1),
            },
        );

        let err = dispatcher.run_sweep_at(now()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_fatal_store_error_lets_started_sends_finish() {
        let mut slow = fixtures::instance(ChannelKind::Sms, now());
        slow.recipient.name = "Lenta".to_string();
        let failing = fixtures::instance(ChannelKind::Sms, now());
        let never_started = fixtures::instance(ChannelKind::Sms, now());
        let failing_id = failing.id.clone();
        let never_started_id = never_started.id.clone();
        let leased = vec![slow, failing, never_started];

        let mut store = MockNotificationStore::new();
        store
            .expect_lease_due()
            .returning(move |_| Ok(leased.clone()));
        // 慢实例的发送已开始，必须回写结果而不是被释放
        store
            .expect_update_status()
            .times(2)
            .returning(move |id, _| {
                if id.to_string() == failing_id {
                    Err(StoreError::Unavailable("disk".to_string()))
                } else {
                    Ok(true)
                }
            });
        store
            .expect_release()
            .withf(move |id| id.to_string() == never_started_id)
            .times(1)
            .returning(|_| Ok(()));

        let adapter = TrackingAdapter::new(Duration::from_millis(100), Some("Lenta"));
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());

        let dispatcher = Dispatcher::new(
            Arc::new(store),
            settings(),
            Arc::new(registry),
            DispatcherOptions {
                max_concurrency: 2,
                send_timeout: Duration::from_secs(1),
            },
        );

        let err = dispatcher.run_sweep_at(now()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let store = Arc::new(MemoryNotificationStore::new());
        for _ in 0..20 {
            store
                .insert(fixtures::instance(ChannelKind::Sms, now()))
                .await
                .unwrap();
        }

        let adapter = TrackingAdapter::new(Duration::from_millis(20), None);
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());

        let dispatcher = Dispatcher::new(
            store.clone(),
            settings(),
            Arc::new(registry),
            DispatcherOptions {
                max_concurrency: 3,
                send_timeout: Duration::from_secs(1),
            },
        );

        let report = dispatcher.run_sweep_at(now()).await.unwrap();
        assert_eq!(report.due, 20);
        assert_eq!(report.sent, 20);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 20);

        let peak = adapter.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak = {}", peak);
        assert!(peak > 1, "peak = {}", peak);
    }

    #[tokio::test]
    async fn test_lease_failure_propagates() {
        let mut store = MockNotificationStore::new();
        store
            .expect_lease_due()
            .returning(|_| Err(StoreError::Unavailable("disk".to_string())));
        let dispatcher = dispatcher_with(Arc::new(store), AdapterRegistry::with_defaults(), 1000);

        assert!(dispatcher.run_sweep_at(now()).await.is_err());
        // 锁已释放，下一次扫描不会被跳过
        assert!(dispatcher.sweep_lock.try_lock().is_ok());
    }
}
