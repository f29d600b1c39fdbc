//! 沙龙预约通知引擎
//!
//! 根据预约事件生成多渠道通知实例，按计划时间扫描发送，并提供管理接口。
//!
//! ## 核心流程
//!
//! 1. **调度**：预约事件进入 `Scheduler`，按时间规则和启用渠道展开为待发送实例
//! 2. **扫描**：`SweepWorker` 周期触发 `Dispatcher`，租用到期实例并在有界并发下发送
//! 3. **渲染**：`TemplateEngine` 按渠道格式化消息（短信截断、邮件主题、推送标题）
//! 4. **发送**：`AdapterRegistry` 按渠道查找适配器，未配置端点时模拟发送
//! 5. **管理**：配置读写、实例查询、取消和统计
//!
//! ## 模块结构
//!
//! - `models`: 通知实例、收件人、预约快照等领域模型
//! - `settings`: 管理员配置及其持久化
//! - `store`: 通知实例存储（内存 / JSON 文件）
//! - `channels`: 渠道适配器与注册表
//! - `template`: 模板渲染
//! - `scheduler` / `dispatcher` / `worker`: 调度、扫描与后台任务
//! - `service`: 对外门面
//! - `api`: 管理 HTTP 接口

pub mod api;
pub mod channels;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod store;
pub mod template;
pub mod worker;

pub use channels::{AdapterRegistry, ChannelAdapter, ChannelConfig, SendResult};
pub use dispatcher::{Dispatcher, DispatcherOptions, SweepReport};
pub use error::{
    AdapterError, ConfigError, DispatchError, NotificationError, Result, StoreError,
};
pub use models::{
    AppointmentSnapshot, ChannelKind, NotificationFilter, NotificationInstance, NotificationKind,
    NotificationStats, NotificationStatus, Recipient, StatusUpdate, Trigger,
};
pub use scheduler::{ScheduleRequest, Scheduler};
pub use service::NotificationEngine;
pub use settings::{ConfigPatch, NotificationConfig, SettingsService, TimingRules};
pub use store::{FileNotificationStore, MemoryNotificationStore, NotificationStore};
pub use template::{RenderedMessage, TemplateEngine};
pub use worker::SweepWorker;
