//! 通知管理配置
//!
//! 管理员可修改的全局配置：开关、渠道、触发规则与模板。
//! 当前值保存在 `ArcSwap` 中，读取方拿到的是不可变快照；
//! 修改按「合并 -> 校验 -> 持久化 -> 发布」顺序进行，任一步失败都不会影响已发布的值。

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use salon_shared::persistence::JsonFile;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::models::{ChannelKind, NotificationKind};

/// 持久化文件名
pub const CONFIG_FILE_NAME: &str = "notification-config.json";

/// 自定义提前量提醒
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReminder {
    #[serde(alias = "hours")]
    pub offset_hours: u32,
    pub enabled: bool,
}

/// 触发规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingRules {
    pub confirmation: bool,
    #[serde(rename = "reminder24h")]
    pub reminder_24h: bool,
    #[serde(rename = "reminder2h")]
    pub reminder_2h: bool,
    #[serde(default)]
    pub custom: Vec<CustomReminder>,
}

impl TimingRules {
    /// 是否有任何提醒规则处于开启状态
    pub fn any_reminder(&self) -> bool {
        self.reminder_24h || self.reminder_2h || self.custom.iter().any(|c| c.enabled)
    }
}

impl Default for TimingRules {
    fn default() -> Self {
        Self {
            confirmation: true,
            reminder_24h: true,
            reminder_2h: true,
            custom: vec![
                CustomReminder {
                    offset_hours: 48,
                    enabled: false,
                },
                CustomReminder {
                    offset_hours: 1,
                    enabled: false,
                },
            ],
        }
    }
}

/// 通知配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub channels: BTreeSet<ChannelKind>,
    pub timing: TimingRules,
    pub templates: BTreeMap<NotificationKind, String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: BTreeSet::from([ChannelKind::Push, ChannelKind::WhatsApp]),
            timing: TimingRules::default(),
            templates: default_templates(),
        }
    }
}

/// 默认 pt-BR 模板
pub fn default_templates() -> BTreeMap<NotificationKind, String> {
    BTreeMap::from([
        (
            NotificationKind::Confirmation,
            "✅ Agendamento confirmado para {data} às {hora}. Serviço: {servico} com {profissional}."
                .to_string(),
        ),
        (
            NotificationKind::Reminder,
            "⏰ Lembrete: seu agendamento é {data} às {hora}. Serviço: {servico} com {profissional}."
                .to_string(),
        ),
        (
            NotificationKind::Cancellation,
            "❌ Seu agendamento para {data} às {hora} foi cancelado. Entre em contato para reagendar."
                .to_string(),
        ),
        (
            NotificationKind::Rescheduling,
            "📅 Seu agendamento foi reagendado. Nova data: {data} às {hora}. Serviço: {servico}."
                .to_string(),
        ),
    ])
}

impl NotificationConfig {
    pub fn template(&self, kind: NotificationKind) -> Option<&str> {
        self.templates
            .get(&kind)
            .map(String::as_str)
            .filter(|t| !t.trim().is_empty())
    }

    /// 当前配置下可能被触发的通知类型
    pub fn active_kinds(&self) -> Vec<NotificationKind> {
        let mut kinds = Vec::with_capacity(4);
        if self.timing.confirmation {
            kinds.push(NotificationKind::Confirmation);
        }
        if self.timing.any_reminder() {
            kinds.push(NotificationKind::Reminder);
        }
        kinds.push(NotificationKind::Cancellation);
        kinds.push(NotificationKind::Rescheduling);
        kinds
    }

    /// 每个活跃类型都必须有非空模板
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self
            .active_kinds()
            .into_iter()
            .find(|kind| self.template(*kind).is_none())
        {
            Some(kind) => Err(ConfigError::MissingTemplate(kind)),
            None => Ok(()),
        }
    }
}

/// 配置局部更新
///
/// 顶层字段浅合并，提供的字段整体替换。渠道以字符串接收，便于给出未知渠道的错误。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub channels: Option<Vec<String>>,
    pub timing: Option<TimingRules>,
    pub templates: Option<BTreeMap<NotificationKind, String>>,
}

impl ConfigPatch {
    pub fn apply(self, current: &NotificationConfig) -> Result<NotificationConfig, ConfigError> {
        let mut next = current.clone();

        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        if let Some(channels) = self.channels {
            next.channels = channels
                .iter()
                .map(|name| name.parse::<ChannelKind>())
                .collect::<Result<_, _>>()?;
        }
        if let Some(timing) = self.timing {
            next.timing = timing;
        }
        if let Some(templates) = self.templates {
            next.templates = templates;
        }

        Ok(next)
    }
}

/// 配置存储后端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<Option<NotificationConfig>, ConfigError>;

    async fn save(&self, config: &NotificationConfig) -> Result<(), ConfigError>;
}

/// 内存配置存储
#[derive(Default)]
pub struct MemoryConfigStore {
    saved: RwLock<Option<NotificationConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<Option<NotificationConfig>, ConfigError> {
        Ok(self.saved.read().clone())
    }

    async fn save(&self, config: &NotificationConfig) -> Result<(), ConfigError> {
        *self.saved.write() = Some(config.clone());
        Ok(())
    }
}

/// JSON 文件配置存储
pub struct FileConfigStore {
    file: JsonFile,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    /// 数据目录下的默认文件
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(data_dir.into().join(CONFIG_FILE_NAME))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self) -> Result<Option<NotificationConfig>, ConfigError> {
        Ok(self.file.read().await?)
    }

    async fn save(&self, config: &NotificationConfig) -> Result<(), ConfigError> {
        self.file.write(config).await?;
        Ok(())
    }
}

/// 配置服务
pub struct SettingsService {
    current: ArcSwap<NotificationConfig>,
    store: Arc<dyn ConfigStore>,
    update_lock: tokio::sync::Mutex<()>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            current: ArcSwap::from_pointee(NotificationConfig::default()),
            store,
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 从存储加载已保存的配置，没有或无效时保留默认值
    pub async fn load(&self) -> Result<(), ConfigError> {
        match self.store.load().await? {
            Some(saved) => match saved.validate() {
                Ok(()) => {
                    info!(
                        enabled = saved.enabled,
                        channels = saved.channels.len(),
                        "已加载保存的通知配置"
                    );
                    self.current.store(Arc::new(saved));
                }
                Err(e) => warn!(error = %e, "保存的通知配置无效，使用默认配置"),
            },
            None => info!("未找到保存的通知配置，使用默认配置"),
        }
        Ok(())
    }

    /// 当前配置快照
    pub fn snapshot(&self) -> Arc<NotificationConfig> {
        self.current.load_full()
    }

    /// 合并、校验、持久化后发布新配置
    pub async fn update(&self, patch: ConfigPatch) -> Result<Arc<NotificationConfig>, ConfigError> {
        let _guard = self.update_lock.lock().await;

        let next = patch.apply(&self.current.load())?;
        next.validate()?;
        self.store.save(&next).await?;

        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        info!(
            enabled = next.enabled,
            channels = ?next.channels,
            "通知配置已更新"
        );
        Ok(next)
    }
}
