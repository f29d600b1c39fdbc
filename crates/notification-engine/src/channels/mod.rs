//! 通知渠道实现
//!
//! 定义渠道适配器 trait 并提供各渠道的具体实现。
//!
//! ## 支持的渠道
//!
//! - **Push**: 浏览器/App 推送
//! - **Email**: 邮件
//! - **SMS**: 短信（正文不超过 160 字符）
//! - **WhatsApp**: WhatsApp 消息
//!
//! 配置了 `endpoint` 的渠道通过 HTTP 中转服务投递，否则模拟发送并记录日志。

mod email;
mod push;
mod registry;
mod sms;
mod whatsapp;

pub use email::EmailChannel;
pub use push::PushChannel;
pub use registry::AdapterRegistry;
pub use sms::SmsChannel;
pub use whatsapp::{WhatsAppChannel, normalize_phone};

use std::time::Duration;

use async_trait::async_trait;
use salon_shared::config::ChannelEndpointConfig;
use serde::Serialize;
use tracing::debug;

use crate::error::AdapterError;
use crate::models::{ChannelKind, Recipient};
use crate::template::RenderedMessage;

/// 渠道适配器
///
/// 适配器应当是无状态的，便于并发调用。
/// 服务商明确拒绝时可以返回 `SendResult::failed`，也可以返回 `AdapterError::Rejected`。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// 渠道类型标识
    fn channel(&self) -> ChannelKind;

    /// 渠道名称（用于日志）
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<SendResult, AdapterError>;
}

/// 单次发送结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    pub channel: ChannelKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    pub fn sent(channel: ChannelKind, message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            channel,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failed(channel: ChannelKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            channel,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

/// 渠道配置
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// 是否启用
    pub enabled: bool,
    /// 请求超时（毫秒）
    pub timeout_ms: u64,
    /// 中转端点（如有）
    pub endpoint: Option<String>,
    /// API 密钥（如有）
    pub api_key: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ChannelConfig {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            timeout_ms: 5000,
            endpoint: None,
            api_key: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// 构建 HTTP 中转客户端，未配置端点时返回 None
    fn relay(&self) -> Result<Option<HttpRelay>, AdapterError> {
        match self.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(endpoint) => Ok(Some(HttpRelay::new(
                endpoint,
                self.api_key.clone(),
                Duration::from_millis(self.timeout_ms),
            )?)),
            None => Ok(None),
        }
    }
}

impl From<&ChannelEndpointConfig> for ChannelConfig {
    fn from(config: &ChannelEndpointConfig) -> Self {
        Self {
            enabled: config.enabled,
            timeout_ms: config.timeout_ms,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

/// HTTP 中转客户端
///
/// 以 JSON POST 到配置的端点，非 2xx 视为拒绝。
#[derive(Debug, Clone)]
pub(crate) struct HttpRelay {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpRelay {
    pub(crate) fn new(
        endpoint: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Transport(format!("HTTP 客户端初始化失败: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }

    /// 发送 JSON，返回服务商给出的消息 ID（如有）
    pub(crate) async fn post<T: Serialize + Sync>(
        &self,
        payload: &T,
    ) -> Result<Option<String>, AdapterError> {
        let mut request = self.client.post(&self.endpoint).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(AdapterError::Rejected(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let message_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| {
                v.get("messageId")
                    .or_else(|| v.get("id"))
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            });

        debug!(endpoint = %self.endpoint, status = status.as_u16(), "中转请求完成");
        Ok(message_id)
    }
}

/// 渠道被禁用或收件人缺少联系方式时的统一处理
pub(crate) fn require_contact<'a>(
    config: &ChannelConfig,
    channel: ChannelKind,
    recipient: &'a Recipient,
) -> Result<&'a str, AdapterError> {
    if !config.enabled {
        return Err(AdapterError::Rejected(format!("{} 渠道已禁用", channel)));
    }
    recipient.contact_for(channel).ok_or_else(|| {
        AdapterError::Rejected(format!("收件人缺少 {}", channel.contact_field()))
    })
}
