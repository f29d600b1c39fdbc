//! 通知模板引擎
//!
//! 支持 `{name}` 占位符，变量集合固定为
//! `data, hora, servico, profissional, salao, endereco, nome`。
//!
//! - 每处出现都会被替换
//! - 已知但缺值的变量替换为空串
//! - 未知占位符保留原样
//!
//! 渲染是纯函数：相同输入总是得到相同输出。
//!
//! ```ignore
//! let engine = TemplateEngine::new();
//! let vars = TemplateVariables::from_instance(&instance);
//! let text = engine.substitute("Olá {nome}, até {data}!", &vars);
//! ```

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, Weekday};
use regex::Regex;
use serde::Serialize;

use crate::error::DispatchError;
use crate::models::{ChannelKind, NotificationInstance, NotificationKind};
use crate::settings::NotificationConfig;

/// 短信正文上限（字符数）
pub const SMS_MAX_CHARS: usize = 160;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder pattern is valid"));

/// 模板变量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    Data,
    Hora,
    Servico,
    Profissional,
    Salao,
    Endereco,
    Nome,
}

impl Placeholder {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "data" => Some(Self::Data),
            "hora" => Some(Self::Hora),
            "servico" => Some(Self::Servico),
            "profissional" => Some(Self::Profissional),
            "salao" => Some(Self::Salao),
            "endereco" => Some(Self::Endereco),
            "nome" => Some(Self::Nome),
            _ => None,
        }
    }
}

/// 变量取值
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVariables {
    values: HashMap<Placeholder, String>,
}

impl TemplateVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, placeholder: Placeholder, value: impl Into<String>) -> &mut Self {
        self.values.insert(placeholder, value.into());
        self
    }

    /// 缺失的变量返回空串
    pub fn get(&self, placeholder: Placeholder) -> &str {
        self.values.get(&placeholder).map(String::as_str).unwrap_or("")
    }

    /// 由通知实例中的预约快照和收件人构建
    pub fn from_instance(instance: &NotificationInstance) -> Self {
        let apt = &instance.appointment;
        let mut vars = Self::new();
        vars.set(Placeholder::Data, format_long_date_pt_br(apt.date))
            .set(Placeholder::Hora, apt.time.format("%H:%M").to_string())
            .set(Placeholder::Servico, apt.service_name.as_str())
            .set(Placeholder::Profissional, apt.professional_name.as_str())
            .set(Placeholder::Salao, apt.salon_name.as_str())
            .set(Placeholder::Nome, instance.recipient.name.as_str());
        if let Some(address) = &apt.address {
            vars.set(Placeholder::Endereco, address.as_str());
        }
        vars
    }
}

/// 邮件正文中的预约详情
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailFacts {
    pub date: String,
    pub time: String,
    pub service: String,
    pub professional: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub recipient_name: String,
}

/// 渲染后的渠道消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedMessage {
    pub kind: NotificationKind,
    pub channel: ChannelKind,
    pub appointment_id: String,
    /// 推送标题
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// 邮件主题
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<EmailFacts>,
}

/// 模板引擎
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEngine;

impl TemplateEngine {
    pub fn new() -> Self {
        Self
    }

    /// 替换模板中的占位符
    pub fn substitute(&self, template: &str, vars: &TemplateVariables) -> String {
        PLACEHOLDER_REGEX
            .replace_all(template, |caps: &regex::Captures| {
                match Placeholder::from_name(&caps[1]) {
                    Some(placeholder) => vars.get(placeholder).to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// 按渠道渲染一条消息
    pub fn render(
        &self,
        kind: NotificationKind,
        channel: ChannelKind,
        template: &str,
        appointment_id: &str,
        vars: &TemplateVariables,
    ) -> RenderedMessage {
        let body = self.substitute(template, vars);
        let heading = format!("Agendamento - {}", vars.get(Placeholder::Salao));

        let mut message = RenderedMessage {
            kind,
            channel,
            appointment_id: appointment_id.to_string(),
            title: None,
            subject: None,
            body,
            facts: None,
        };

        match channel {
            ChannelKind::Sms => {
                message.body = truncate_chars(&message.body, SMS_MAX_CHARS);
            }
            ChannelKind::Email => {
                message.subject = Some(heading);
                message.facts = Some(EmailFacts {
                    date: vars.get(Placeholder::Data).to_string(),
                    time: vars.get(Placeholder::Hora).to_string(),
                    service: vars.get(Placeholder::Servico).to_string(),
                    professional: vars.get(Placeholder::Profissional).to_string(),
                    address: Some(vars.get(Placeholder::Endereco))
                        .filter(|a| !a.is_empty())
                        .map(str::to_string),
                    recipient_name: vars.get(Placeholder::Nome).to_string(),
                });
            }
            ChannelKind::Push => {
                message.title = Some(heading);
            }
            ChannelKind::WhatsApp => {}
        }

        message
    }

    /// 渲染通知实例：优先使用自定义消息，其次使用配置中该类型的模板
    pub fn render_instance(
        &self,
        instance: &NotificationInstance,
        config: &NotificationConfig,
    ) -> Result<RenderedMessage, DispatchError> {
        let template = instance
            .custom_message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| config.template(instance.kind))
            .ok_or(DispatchError::TemplateMissing(instance.kind))?;

        let vars = TemplateVariables::from_instance(instance);
        Ok(self.render(
            instance.kind,
            instance.channel,
            template,
            &instance.appointment.id,
            &vars,
        ))
    }

    /// 提取模板中的所有占位符名称
    pub fn extract_placeholders(&self, template: &str) -> Vec<String> {
        PLACEHOLDER_REGEX
            .captures_iter(template)
            .map(|caps| caps[1].to_string())
            .collect()
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

const WEEKDAYS_PT_BR: [&str; 7] = [
    "segunda-feira",
    "terça-feira",
    "quarta-feira",
    "quinta-feira",
    "sexta-feira",
    "sábado",
    "domingo",
];

const MONTHS_PT_BR: [&str; 12] = [
    "janeiro",
    "fevereiro",
    "março",
    "abril",
    "maio",
    "junho",
    "julho",
    "agosto",
    "setembro",
    "outubro",
    "novembro",
    "dezembro",
];

/// pt-BR 长日期，如 `segunda-feira, 10 de março de 2025`
pub fn format_long_date_pt_br(date: NaiveDate) -> String {
    let weekday = WEEKDAYS_PT_BR[weekday_index(date.weekday())];
    let month = MONTHS_PT_BR[date.month0() as usize];
    format!("{}, {} de {} de {}", weekday, date.day(), month, date.year())
}

fn weekday_index(weekday: Weekday) -> usize {
    weekday.num_days_from_monday() as usize
}
