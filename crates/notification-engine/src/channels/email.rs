//! 邮件渠道
//!
//! 主题为 `Agendamento - {salao}`，正文在纯文本之外附带一份 HTML，
//! 其中的详情块列出日期、时间、服务、专业人员与地址。

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{ChannelAdapter, ChannelConfig, HttpRelay, SendResult, require_contact};
use crate::error::AdapterError;
use crate::models::{ChannelKind, Recipient};
use crate::template::{EmailFacts, RenderedMessage};

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    to: &'a str,
    subject: &'a str,
    html: String,
    text: &'a str,
}

/// 邮件渠道
pub struct EmailChannel {
    config: ChannelConfig,
    relay: Option<HttpRelay>,
}

impl EmailChannel {
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

/// 构建邮件 HTML
pub fn build_email_html(subject: &str, body: &str, facts: Option<&EmailFacts>) -> String {
    let mut html = String::with_capacity(1024);
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{}</title>\n", escape_html(subject)));
    html.push_str("</head>\n<body>\n<div class=\"container\">\n");
    html.push_str(&format!(
        "<div class=\"header\"><h2>{}</h2></div>\n",
        escape_html(subject)
    ));
    html.push_str("<div class=\"content\">\n");

    if let Some(facts) = facts {
        html.push_str(&format!("<p>Olá {},</p>\n", escape_html(&facts.recipient_name)));
    }
    html.push_str(&format!("<p>{}</p>\n", escape_html(body)));

    if let Some(facts) = facts {
        html.push_str("<div class=\"details\">\n");
        html.push_str(&format!("<p><strong>Data:</strong> {}</p>\n", escape_html(&facts.date)));
        html.push_str(&format!("<p><strong>Horário:</strong> {}</p>\n", escape_html(&facts.time)));
        html.push_str(&format!(
            "<p><strong>Serviço:</strong> {}</p>\n",
            escape_html(&facts.service)
        ));
        html.push_str(&format!(
            "<p><strong>Profissional:</strong> {}</p>\n",
            escape_html(&facts.professional)
        ));
        if let Some(address) = &facts.address {
            html.push_str(&format!(
                "<p><strong>Endereço:</strong> {}</p>\n",
                escape_html(address)
            ));
        }
        html.push_str("</div>\n");
    }

    html.push_str("</div>\n</div>\n</body>\n</html>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
impl ChannelAdapter for EmailChannel {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn name(&self) -> &'static str {
        "Email"
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &RenderedMessage,
    ) -> Result<SendResult, AdapterError> {
        let to = require_contact(&self.config, ChannelKind::Email, recipient)?;
        let subject = message.subject.as_deref().unwrap_or("Agendamento");

        let payload = EmailPayload {
            to,
            subject,
            html: build_email_html(subject, &message.body, message.facts.as_ref()),
            text: &message.body,
        };

        let message_id = match &self.relay {
            Some(relay) => relay
                .post(&payload)
                .await?
                .unwrap_or_else(|| format!("email_{}", Uuid::new_v4())),
            None => format!("email_{}", Uuid::new_v4()),
        };

        info!(
            appointment_id = %message.appointment_id,
            message_id = %message_id,
            relayed = self.relay.is_some(),
            subject = %subject,
            html_length = payload.html.len(),
            "邮件发送成功"
        );

        Ok(SendResult::sent(ChannelKind::Email, message_id))
    }
}
