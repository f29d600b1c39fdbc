//! 通知存储
//!
//! 定义存储接口，调度器与分发器依赖抽象而非具体实现。
//!
//! 并发约束：
//! - `update_status` 只允许从 Pending 出发的比较并设置
//! - `lease_due` 为本次扫描独占地租用到期实例；被租用的实例不能被取消
//! - 成功的状态变更会同时清除租约

mod file;
mod memory;

pub use file::{FileNotificationStore, NOTIFICATIONS_FILE_NAME};
pub use memory::MemoryNotificationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{NotificationFilter, NotificationInstance, NotificationStats, StatusUpdate};

/// 通知存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// 新增实例，id 已存在时返回 `StoreError::Duplicate`
    async fn insert(&self, instance: NotificationInstance) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<NotificationInstance>, StoreError>;

    /// 比较并设置状态
    ///
    /// 非法迁移返回 `Ok(false)`；取消遇到有效租约时同样返回 `Ok(false)`。
    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<bool, StoreError>;

    /// 租用所有到期、待发送且未被租用的实例，按计划时间升序返回
    async fn lease_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationInstance>, StoreError>;

    /// 放弃租约（扫描中止时使用）
    async fn release(&self, id: &str) -> Result<(), StoreError>;

    /// 按条件查询，结果按创建时间倒序
    async fn query(&self, filter: NotificationFilter)
    -> Result<Vec<NotificationInstance>, StoreError>;

    async fn stats(&self) -> Result<NotificationStats, StoreError>;
}
