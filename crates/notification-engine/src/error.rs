//! 通知引擎错误类型
//!
//! 按来源划分：配置、存储、渠道适配器、投递。投递类错误只会记录到实例上，
//! 不会中断扫描；只有存储不可用会让本次扫描提前结束。

use salon_shared::error::SharedError;
use thiserror::Error;

use crate::models::{ChannelKind, NotificationKind};

/// 管理配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("未知的通知渠道: {0}")]
    UnknownChannel(String),

    #[error("通知类型 {0} 缺少模板")]
    MissingTemplate(NotificationKind),

    #[error("配置持久化失败: {0}")]
    Persistence(#[from] SharedError),
}

/// 通知存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("通知已存在: {0}")]
    Duplicate(String),

    #[error("通知不存在: {0}")]
    NotFound(String),

    /// 存储介质不可用，扫描遇到后立即中止
    #[error("通知存储不可用: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<SharedError> for StoreError {
    fn from(err: SharedError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// 渠道适配器返回的错误
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("请求被拒绝: {0}")]
    Rejected(String),

    #[error("传输失败: {0}")]
    Transport(String),

    #[error("请求超时")]
    Timeout,
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// 单个实例的投递错误
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("收件人缺少 {channel} 渠道所需的 {field}")]
    MissingContact {
        channel: ChannelKind,
        field: &'static str,
    },

    #[error("渠道 {0} 未注册适配器")]
    AdapterNotRegistered(ChannelKind),

    #[error("通知类型 {0} 没有可用模板")]
    TemplateMissing(NotificationKind),

    #[error("渠道 {channel} 发送超时 ({timeout_ms}ms)")]
    Timeout { channel: ChannelKind, timeout_ms: u64 },

    #[error("渠道 {channel} 拒绝发送: {reason}")]
    Rejected { channel: ChannelKind, reason: String },

    #[error("渠道 {channel} 传输失败: {reason}")]
    Transport { channel: ChannelKind, reason: String },
}

impl DispatchError {
    pub fn from_adapter(channel: ChannelKind, timeout_ms: u64, err: AdapterError) -> Self {
        match err {
            AdapterError::Rejected(reason) => Self::Rejected { channel, reason },
            AdapterError::Transport(reason) => Self::Transport { channel, reason },
            AdapterError::Timeout => Self::Timeout {
                channel,
                timeout_ms,
            },
        }
    }

    /// 校验类错误，不经过适配器
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingContact { .. })
    }
}

/// 引擎对外的统一错误
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error(transparent)]
    Shared(#[from] SharedError),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

impl NotificationError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(ConfigError::UnknownChannel(_)) => "UNKNOWN_CHANNEL",
            Self::Config(ConfigError::MissingTemplate(_)) => "MISSING_TEMPLATE",
            Self::Config(ConfigError::Persistence(_)) => "CONFIG_PERSISTENCE_ERROR",
            Self::Store(StoreError::Duplicate(_)) => "DUPLICATE_NOTIFICATION",
            Self::Store(StoreError::NotFound(_)) => "NOTIFICATION_NOT_FOUND",
            Self::Store(StoreError::Unavailable(_)) => "STORE_UNAVAILABLE",
            Self::Dispatch(DispatchError::MissingContact { .. }) => "MISSING_CONTACT",
            Self::Dispatch(_) => "DISPATCH_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Shared(e) => e.code(),
        }
    }
}
