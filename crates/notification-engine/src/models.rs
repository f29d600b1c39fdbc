//! 通知领域模型
//!
//! 渠道、通知类型、状态、收件人、预约快照以及通知实例本身。
//! 所有持久化结构统一使用 camelCase JSON 与 RFC 3339 时间戳。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// 投递渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Push,
    Email,
    Sms,
    WhatsApp,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Push,
        ChannelKind::Email,
        ChannelKind::Sms,
        ChannelKind::WhatsApp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::WhatsApp => "whatsapp",
        }
    }

    /// 该渠道要求收件人提供的联系方式字段
    pub fn contact_field(&self) -> &'static str {
        match self {
            Self::Push => "pushToken",
            Self::Email => "email",
            Self::Sms | Self::WhatsApp => "phone",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "whatsapp" => Ok(Self::WhatsApp),
            _ => Err(ConfigError::UnknownChannel(s.to_string())),
        }
    }
}

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Confirmation,
    Reminder,
    Cancellation,
    Rescheduling,
    Custom,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::Reminder => "reminder",
            Self::Cancellation => "cancellation",
            Self::Rescheduling => "rescheduling",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通知实例状态
///
/// 只允许 Pending -> {Sent | Failed | Cancelled}，终态不再变化。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 收件人
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

impl Recipient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
            phone: None,
            push_token: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_push_token(mut self, token: impl Into<String>) -> Self {
        self.push_token = Some(token.into());
        self
    }

    /// 取该渠道对应的联系方式，空白视为缺失
    pub fn contact_for(&self, channel: ChannelKind) -> Option<&str> {
        let value = match channel {
            ChannelKind::Push => self.push_token.as_deref(),
            ChannelKind::Email => self.email.as_deref(),
            ChannelKind::Sms | ChannelKind::WhatsApp => self.phone.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }
}

/// 预约快照
///
/// 在调度时捕获，之后不可变。日期与时间是沙龙本地的墙上时间。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentSnapshot {
    pub id: String,
    pub date: NaiveDate,
    #[serde(with = "hh_mm")]
    pub time: NaiveTime,
    pub service_name: String,
    pub professional_name: String,
    pub salon_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl AppointmentSnapshot {
    /// 按沙龙的固定时区偏移换算出预约开始的 UTC 时刻
    pub fn starts_at(&self, offset: FixedOffset) -> DateTime<Utc> {
        let local = NaiveDateTime::new(self.date, self.time);
        (local - chrono::Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
    }
}

/// `HH:MM` 格式的时间，兼容 `HH:MM:SS` 输入
mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|e| D::Error::custom(format!("invalid time '{}': {}", raw, e)))
    }
}

/// 触发规则，仅用于审计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Trigger {
    Immediate,
    BeforeAppointment { hours: u32 },
}

/// 通知实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationInstance {
    pub id: String,
    pub kind: NotificationKind,
    pub channel: ChannelKind,
    pub trigger: Trigger,
    pub recipient: Recipient,
    pub appointment: AppointmentSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotificationInstance {
    /// 创建待发送实例
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        kind: NotificationKind,
        channel: ChannelKind,
        trigger: Trigger,
        recipient: Recipient,
        appointment: AppointmentSnapshot,
        custom_message: Option<String>,
        scheduled_for: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            channel,
            trigger,
            recipient,
            appointment,
            custom_message,
            scheduled_for,
            status: NotificationStatus::Pending,
            created_at,
            sent_at: None,
            error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == NotificationStatus::Pending && self.scheduled_for <= now
    }
}

/// 状态变更请求
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: NotificationStatus,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn sent(at: DateTime<Utc>) -> Self {
        Self {
            status: NotificationStatus::Sent,
            at,
            error: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: NotificationStatus::Failed,
            at,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self {
            status: NotificationStatus::Cancelled,
            at,
            error: None,
        }
    }

    /// 将变更应用到实例上，调用方负责保证当前状态为 Pending
    pub fn apply_to(&self, instance: &mut NotificationInstance) {
        instance.status = self.status;
        if self.status == NotificationStatus::Sent {
            instance.sent_at = Some(self.at);
        }
        if let Some(error) = &self.error {
            instance.error = Some(error.clone());
        }
    }
}

/// 通知查询条件，字段全部可选
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub kind: Option<NotificationKind>,
    pub channel: Option<ChannelKind>,
}

impl NotificationFilter {
    pub fn matches(&self, instance: &NotificationInstance) -> bool {
        self.status.is_none_or(|s| s == instance.status)
            && self.kind.is_none_or(|k| k == instance.kind)
            && self.channel.is_none_or(|c| c == instance.channel)
    }
}

/// 聚合统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
    pub total: usize,
    pub sent: usize,
    pub pending: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub by_channel: BTreeMap<ChannelKind, usize>,
    pub by_kind: BTreeMap<NotificationKind, usize>,
}

impl NotificationStats {
    /// 单次遍历累加一个实例
    pub fn record(&mut self, instance: &NotificationInstance) {
        self.total += 1;
        match instance.status {
            NotificationStatus::Pending => self.pending += 1,
            NotificationStatus::Sent => self.sent += 1,
            NotificationStatus::Failed => self.failed += 1,
            NotificationStatus::Cancelled => self.cancelled += 1,
        }
        *self.by_channel.entry(instance.channel).or_default() += 1;
        *self.by_kind.entry(instance.kind).or_default() += 1;
    }
}

impl<'a> FromIterator<&'a NotificationInstance> for NotificationStats {
    fn from_iter<I: IntoIterator<Item = &'a NotificationInstance>>(iter: I) -> Self {
        let mut stats = Self::default();
        for instance in iter {
            stats.record(instance);
        }
        stats
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn appointment() -> AppointmentSnapshot {
        AppointmentSnapshot {
            id: "apt-001".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            service_name: "Corte".to_string(),
            professional_name: "Ana".to_string(),
            salon_name: "Salão Bela".to_string(),
            address: Some("Rua das Flores, 100".to_string()),
        }
    }

    pub fn recipient() -> Recipient {
        Recipient::new("Maria")
            .with_phone("11987654321")
            .with_email("maria@example.com")
            .with_push_token("push-token-1")
    }

    pub fn instance(channel: ChannelKind, scheduled_for: DateTime<Utc>) -> NotificationInstance {
        NotificationInstance::pending(
            NotificationKind::Confirmation,
            channel,
            Trigger::Immediate,
            recipient(),
            appointment(),
            None,
            scheduled_for,
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        )
    }
}
