//! 调度器
//!
//! 根据预约事件计算触发时间，并为「触发规则 × 渠道」的每一对创建一个待发送实例。
//! 每次调用都读取最新配置快照，不做缓存。

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use salon_shared::observability::metrics;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::error::{NotificationError, Result};
use crate::models::{
    AppointmentSnapshot, NotificationInstance, NotificationKind, Recipient, Trigger,
};
use crate::settings::{NotificationConfig, SettingsService};
use crate::store::NotificationStore;

/// 预约事件
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub kind: NotificationKind,
    pub appointment: AppointmentSnapshot,
    pub recipient: Recipient,
    #[serde(default)]
    pub custom_message: Option<String>,
}

/// 计算出的一次触发
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTrigger {
    pub kind: NotificationKind,
    pub trigger: Trigger,
    pub scheduled_for: DateTime<Utc>,
}

/// 计算触发计划
///
/// - confirmation 事件：可选的即时确认，加上严格晚于 `now` 的提醒（类型为 reminder）
/// - 其他事件：一条同类型的即时通知
///
/// 每条启用的规则各自生成一个触发点，落在同一时刻也不合并。
pub fn plan_triggers(
    config: &NotificationConfig,
    kind: NotificationKind,
    appointment_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<PlannedTrigger> {
    if kind != NotificationKind::Confirmation {
        return vec![PlannedTrigger {
            kind,
            trigger: Trigger::Immediate,
            scheduled_for: now,
        }];
    }

    let timing = &config.timing;
    let mut planned = Vec::with_capacity(3 + timing.custom.len());

    if timing.confirmation {
        planned.push(PlannedTrigger {
            kind: NotificationKind::Confirmation,
            trigger: Trigger::Immediate,
            scheduled_for: now,
        });
    }

    let offsets = [(timing.reminder_24h, 24), (timing.reminder_2h, 2)]
        .into_iter()
        .chain(timing.custom.iter().map(|c| (c.enabled, c.offset_hours)))
        .filter_map(|(enabled, hours)| enabled.then_some(hours));

    for hours in offsets {
        let scheduled_for = appointment_at - Duration::hours(i64::from(hours));
        if scheduled_for <= now {
            debug!(hours, %scheduled_for, "提醒时间已过，跳过");
            continue;
        }
        planned.push(PlannedTrigger {
            kind: NotificationKind::Reminder,
            trigger: Trigger::BeforeAppointment { hours },
            scheduled_for,
        });
    }

    planned
}

/// 由分钟数构造沙龙时区偏移
pub fn salon_offset(utc_offset_minutes: i32) -> Result<FixedOffset> {
    utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| {
            NotificationError::Validation(format!("无效的时区偏移: {} 分钟", utc_offset_minutes))
        })
}

/// 调度器
pub struct Scheduler {
    settings: Arc<SettingsService>,
    store: Arc<dyn NotificationStore>,
    offset: FixedOffset,
}

impl Scheduler {
    pub fn new(
        settings: Arc<SettingsService>,
        store: Arc<dyn NotificationStore>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            settings,
            store,
            offset,
        }
    }

    /// 为一次预约事件创建通知实例，返回新实例的 id
    pub async fn schedule_for_appointment(&self, request: ScheduleRequest) -> Result<Vec<String>> {
        self.schedule_at(request, Utc::now()).await
    }

    #[instrument(skip(self, request), fields(appointment_id = %request.appointment.id, kind = %request.kind))]
    pub async fn schedule_at(
        &self,
        request: ScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let config = self.settings.snapshot();
        if !config.enabled {
            info!("通知已关闭，忽略预约事件");
            return Ok(Vec::new());
        }

        let ScheduleRequest {
            kind,
            appointment,
            recipient,
            custom_message,
        } = request;
        let custom_message = custom_message.filter(|m| !m.trim().is_empty());

        let appointment_at = appointment.starts_at(self.offset);
        let planned = plan_triggers(&config, kind, appointment_at, now);

        let mut ids = Vec::with_capacity(planned.len() * config.channels.len());
        for trigger in &planned {
            for &channel in &config.channels {
                let instance = NotificationInstance::pending(
                    trigger.kind,
                    channel,
                    trigger.trigger,
                    recipient.clone(),
                    appointment.clone(),
                    custom_message.clone(),
                    trigger.scheduled_for,
                    now,
                );
                let id = instance.id.clone();
                self.store.insert(instance).await?;
                metrics::record_scheduled(trigger.kind.as_str(), channel.as_str(), 1);
                ids.push(id);
            }
        }

        info!(
            %appointment_at,
            triggers = planned.len(),
            channels = config.channels.len(),
            created = ids.len(),
            "通知实例已创建"
        );

        Ok(ids)
    }
}
