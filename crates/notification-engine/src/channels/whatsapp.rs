//! WhatsApp 渠道
//!
//! 手机号统一为纯数字并补全巴西国家码 55 后投递。

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{ChannelAdapter, ChannelConfig, HttpRelay, SendResult, require_contact};
use crate::error::AdapterError;
use crate::models::{ChannelKind, Recipient};
use crate::template::RenderedMessage;

/// 规范化手机号：去掉非数字字符，11 位本地号码补 55 前缀
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 11 && !digits.starts_with("55") {
        format!("55{}", digits)
    } else {
        digits
    }
}

#[derive(Debug, Serialize)]
struct WhatsAppPayload<'a> {
    phone: String,
    message: &'a str,
}

/// WhatsApp 渠道
pub struct WhatsAppChannel {
    config: ChannelConfig,
    relay: Option<HttpRelay>,
}

impl WhatsAppChannel {
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
impl ChannelAdapter for WhatsAppChannel {
    fn channel(&self) -> ChannelKind {
        ChannelKind::WhatsApp
    }

    fn name(&self) -> &'static str {
        "WhatsApp"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<SendResult, AdapterError> {
        let raw = require_contact(&self.config, ChannelKind::WhatsApp, recipient)?;
        let phone = normalize_phone(raw);
        if phone.is_empty() {
            return Ok(SendResult::failed(
                ChannelKind::WhatsApp,
                format!("无效的手机号: {}", raw),
            ));
        }

        let payload = WhatsAppPayload {
            phone,
            message: &message.body,
        };

        let message_id = match &self.relay {
            Some(relay) => relay
                .post(&payload)
                .await?
                .unwrap_or_else(|| format!("wa_{}", Uuid::new_v4())),
            None => format!("wa_{}", Uuid::new_v4()),
        };

        info!(
            appointment_id = %message.appointment_id,
            message_id = %message_id,
            relayed = self.relay.is_some(),
            phone = %payload.phone,
            "WhatsApp 消息发送成功"
        );

        Ok(SendResult::sent(ChannelKind::WhatsApp, message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("(11) 98765-4321"), "5511987654321");
        assert_eq!(normalize_phone("+55 11 98765-4321"), "5511987654321");
        assert_eq!(normalize_phone("5511987654321"), "5511987654321");
        // 10 位号码不补前缀
        assert_eq!(normalize_phone("1133334444"), "1133334444");
    }

    #[tokio::test]
    async fn test_non_numeric_phone_fails() {
        let channel = WhatsAppChannel::with_defaults();
        let recipient = Recipient::new("Maria").with_phone("sem telefone");
        let message = RenderedMessage {
            kind: NotificationKind::Confirmation,
            channel: ChannelKind::WhatsApp,
            appointment_id: "apt-001".to_string(),
            title: None,
            subject: None,
            body: "Oi".to_string(),
            facts: None,
        };

        let result = channel.send(&recipient, &message).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("sem telefone"));
    }
}
