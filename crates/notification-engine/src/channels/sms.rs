//! SMS 短信渠道
//!
//! 正文在渲染阶段已截断到 160 字符，这里再做一次兜底。

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{ChannelAdapter, ChannelConfig, HttpRelay, SendResult, require_contact};
use crate::error::AdapterError;
use crate::models::{ChannelKind, Recipient};
use crate::template::{RenderedMessage, SMS_MAX_CHARS};

#[derive(Debug, Serialize)]
struct SmsPayload<'a> {
    to: &'a str,
    message: String,
}

/// SMS 短信渠道
pub struct SmsChannel {
    config: ChannelConfig,
    relay: Option<HttpRelay>,
}

impl SmsChannel {
    pub fn new(config: ChannelConfig) -> Result<Self, AdapterError> {
        let relay = config.relay()?;
        Ok(Self { config, relay })
    }

    /// 模拟发送
    pub fn with_defaults() -> Self {
        Self {
            config: ChannelConfig::default(),
            relay: None,
        }
    }
}

#[async_trait]
impl ChannelAdapter for SmsChannel {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    fn name(&self) -> &'static str {
        "SMS"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<SendResult, AdapterError> {
        let phone = require_contact(&self.config, ChannelKind::Sms, recipient)?;
        let payload = SmsPayload {
            to: phone,
            message: message.body.chars().take(SMS_MAX_CHARS).collect(),
        };

        let message_id = match &self.relay {
            Some(relay) => relay
                .post(&payload)
                .await?
                .unwrap_or_else(|| format!("sms_{}", Uuid::new_v4())),
            None => format!("sms_{}", Uuid::new_v4()),
        };

        info!(
            appointment_id = %message.appointment_id,
            message_id = %message_id,
            relayed = self.relay.is_some(),
            content_length = payload.message.chars().count(),
            "SMS 发送成功"
        );

        Ok(SendResult::sent(ChannelKind::Sms, message_id))
    }
}
