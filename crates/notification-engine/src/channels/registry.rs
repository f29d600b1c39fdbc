//! 渠道适配器注册表
//!
//! 按 `ChannelKind` 索引适配器实例，分发器通过它查找发送目标。
//! 适配器以 `Arc` 共享，可在并发发送间复用。

use std::collections::HashMap;
use std::sync::Arc;

use salon_shared::config::ChannelsConfig;
use tracing::{debug, info};

use super::{
    ChannelAdapter, ChannelConfig, EmailChannel, PushChannel, SmsChannel, WhatsAppChannel,
};
use crate::error::AdapterError;
use crate::models::ChannelKind;

/// 适配器注册表
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    /// 创建空的注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册适配器，同类型的旧适配器会被替换
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) -> &mut Self {
        let channel = adapter.channel();
        debug!(channel = %channel, name = adapter.name(), "注册渠道适配器");
        self.adapters.insert(channel, adapter);
        self
    }

    pub fn get(&self, channel: ChannelKind) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    pub fn contains(&self, channel: ChannelKind) -> bool {
        self.adapters.contains_key(&channel)
    }

    /// 已注册的渠道，按固定顺序
    pub fn registered_channels(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|c| self.adapters.contains_key(c))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// 四个渠道均使用模拟发送
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(PushChannel::with_defaults()))
            .register(Arc::new(EmailChannel::with_defaults()))
            .register(Arc::new(SmsChannel::with_defaults()))
            .register(Arc::new(WhatsAppChannel::with_defaults()));
        registry
    }

    /// 按进程配置创建，配置了端点的渠道走 HTTP 中转
    pub fn from_config(config: &ChannelsConfig) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        registry
            .register(Arc::new(PushChannel::new(ChannelConfig::from(&config.push))?))
            .register(Arc::new(EmailChannel::new(ChannelConfig::from(&config.email))?))
            .register(Arc::new(SmsChannel::new(ChannelConfig::from(&config.sms))?))
            .register(Arc::new(WhatsAppChannel::new(ChannelConfig::from(
                &config.whatsapp,
            ))?));

        info!(
            channels = ?registry.registered_channels(),
            relayed = ?[
                ("push", config.push.endpoint.is_some()),
                ("email", config.email.endpoint.is_some()),
                ("sms", config.sms.endpoint.is_some()),
                ("whatsapp", config.whatsapp.endpoint.is_some()),
            ],
            "渠道适配器初始化完成"
        );

        Ok(registry)
    }
}
