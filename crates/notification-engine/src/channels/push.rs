//! Push 推送渠道
//!
//! 按收件人的 pushToken 投递，标题为 `Agendamento - {salao}`，
//! 附带预约 ID 与通知类型，便于客户端点击后跳转。

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{ChannelAdapter, ChannelConfig, HttpRelay, SendResult, require_contact};
use crate::error::AdapterError;
use crate::models::{ChannelKind, NotificationKind, Recipient};
use crate::template::RenderedMessage;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushData<'a> {
    appointment_id: &'a str,
    #[serde(rename = "type")]
    kind: NotificationKind,
}

#[derive(Debug, Serialize)]
struct PushPayload<'a> {
    token: &'a str,
    title: &'a str,
    body: &'a str,
    data: PushData<'a>,
}

/// Push 推送渠道
pub struct PushChannel {
    config: ChannelConfig,
    relay: Option<HttpRelay>,
}

impl PushChannel {
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
impl ChannelAdapter for PushChannel {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn name(&self) -> &'static str {
        "Push"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<SendResult, AdapterError> {
        let token = require_contact(&self.config, ChannelKind::Push, recipient)?;
        let title = message.title.as_deref().unwrap_or("Agendamento");

        let payload = PushPayload {
            token,
            title,
            body: &message.body,
            data: PushData {
                appointment_id: &message.appointment_id,
                kind: message.kind,
            },
        };

        let message_id = match &self.relay {
            Some(relay) => relay
                .post(&payload)
                .await?
                .unwrap_or_else(|| format!("push_{}", Uuid::new_v4())),
            None => format!("push_{}", Uuid::new_v4()),
        };

        info!(
            appointment_id = %message.appointment_id,
            message_id = %message_id,
            relayed = self.relay.is_some(),
            title = %title,
            "Push 推送成功"
        );

        Ok(SendResult::sent(ChannelKind::Push, message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> RenderedMessage {
        RenderedMessage {
            kind: NotificationKind::Confirmation,
            channel: ChannelKind::Push,
            appointment_id: "apt-001".to_string(),
            title: Some("Agendamento - Bela".to_string()),
            subject: None,
            body: "Confirmado".to_string(),
            facts: None,
        }
    }

    #[tokio::test]
    async fn test_simulated_send() {
        let channel = PushChannel::with_defaults();
        let recipient = Recipient::new("Maria").with_push_token("tok-1");

        let result = channel.send(&recipient, &message()).await.unwrap();
        assert!(result.success);
        assert!(result.message_id.unwrap().starts_with("push_"));
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let channel = PushChannel::with_defaults();
        let recipient = Recipient::new("Maria").with_phone("11987654321");

        let err = channel.send(&recipient, &message()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Rejected(_)));
    }

    #[test]
    fn test_payload_shape() {
        let msg = message();
        let payload = PushPayload {
            token: "tok-1",
            title: "Agendamento - Bela",
            body: &msg.body,
            data: PushData {
                appointment_id: &msg.appointment_id,
                kind: msg.kind,
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["data"]["appointmentId"], "apt-001");
        assert_eq!(json["data"]["type"], "confirmation");
    }
}
