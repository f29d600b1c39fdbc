//! 内存存储
//!
//! 使用 DashMap 实现。状态迁移与租约都在条目锁内完成，
//! 因此同一实例上的取消和发送不会交错。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;

use super::NotificationStore;
use crate::error::StoreError;
use crate::models::{
    NotificationFilter, NotificationInstance, NotificationStats, NotificationStatus, StatusUpdate,
};

#[derive(Debug, Clone)]
struct Entry {
    instance: NotificationInstance,
    leased: bool,
}

/// 内存通知存储
#[derive(Debug, Default)]
pub struct MemoryNotificationStore {
    entries: DashMap<String, Entry>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由已有实例构建（例如从文件恢复），租约全部清空
    pub fn from_instances(instances: impl IntoIterator<Item = NotificationInstance>) -> Self {
        let store = Self::new();
        for instance in instances {
            store.entries.insert(
                instance.id.clone(),
                Entry {
                    instance,
                    leased: false,
                },
            );
        }
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 所有实例，按创建时间升序
    pub(crate) fn all_instances(&self) -> Vec<NotificationInstance> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| e.value().instance.clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub(crate) fn insert_instance(&self, instance: NotificationInstance) -> Result<(), StoreError> {
        match self.entries.entry(instance.id.clone()) {
            MapEntry::Occupied(_) => Err(StoreError::Duplicate(instance.id)),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    instance,
                    leased: false,
                });
                Ok(())
            }
        }
    }

    pub(crate) fn apply_update(&self, id: &str, update: &StatusUpdate) -> Result<bool, StoreError> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if entry.instance.status != NotificationStatus::Pending
            || update.status == NotificationStatus::Pending
        {
            return Ok(false);
        }
        // 发送中的实例不能被取消
        if update.status == NotificationStatus::Cancelled && entry.leased {
            return Ok(false);
        }

        update.apply_to(&mut entry.instance);
        entry.leased = false;
        Ok(true)
    }

    fn lease(&self, now: DateTime<Utc>) -> Vec<NotificationInstance> {
        let mut leased: Vec<_> = self
            .entries
            .iter_mut()
            .filter_map(|mut e| {
                if e.leased || !e.instance.is_due(now) {
                    return None;
                }
                e.leased = true;
                Some(e.instance.clone())
            })
            .collect();
        leased.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        leased
    }

    fn release_lease(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.leased = false;
        }
    }

    fn find(&self, filter: &NotificationFilter) -> Vec<NotificationInstance> {
        let mut found: Vec<_> = self
            .entries
            .iter()
            .filter(|e| filter.matches(&e.instance))
            .map(|e| e.instance.clone())
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        found
    }

    fn aggregate(&self) -> NotificationStats {
        let mut stats = NotificationStats::default();
        for entry in self.entries.iter() {
            stats.record(&entry.instance);
        }
        stats
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, instance: NotificationInstance) -> Result<(), StoreError> {
        self.insert_instance(instance)
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationInstance>, StoreError> {
        Ok(self.entries.get(id).map(|e| e.instance.clone()))
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<bool, StoreError> {
        self.apply_update(id, &update)
    }

    async fn lease_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationInstance>, StoreError> {
        Ok(self.lease(now))
    }

    async fn release(&self, id: &str) -> Result<(), StoreError> {
        self.release_lease(id);
        Ok(())
    }

    async fn query(
        &self,
        filter: NotificationFilter,
    ) -> Result<Vec<NotificationInstance>, StoreError> {
        Ok(self.find(&filter))
    }

    async fn stats(&self) -> Result<NotificationStats, StoreError> {
        Ok(self.aggregate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelKind, fixtures};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryNotificationStore::new();
        let instance = fixtures::instance(ChannelKind::Push, now());
        store.insert(instance.clone()).await.unwrap();

        let err = store.insert(instance).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_returns_false() {
        let store = MemoryNotificationStore::new();
        let instance = fixtures::instance(ChannelKind::Push, now());
        let id = instance.id.clone();
        store.insert(instance).await.unwrap();

        assert!(store.update_status(&id, StatusUpdate::sent(now())).await.unwrap());
        assert!(!store.update_status(&id, StatusUpdate::cancelled(now())).await.unwrap());
        assert!(!store
            .update_status(&id, StatusUpdate::failed(now(), "late"))
            .await
            .unwrap());

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_id() {
        let store = MemoryNotificationStore::new();
        let err = store
            .update_status("missing", StatusUpdate::sent(now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_lease_due_is_exclusive() {
        let store = MemoryNotificationStore::new();
        let due = fixtures::instance(ChannelKind::Push, now() - Duration::minutes(1));
        let future = fixtures::instance(ChannelKind::Sms, now() + Duration::hours(1));
        store.insert(due.clone()).await.unwrap();
        store.insert(future).await.unwrap();

        let first = store.lease_due(now()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, due.id);

        // 已被租用的实例不会被再次租出
        assert!(store.lease_due(now()).await.unwrap().is_empty());

        store.release(&due.id).await.unwrap();
        assert_eq!(store.lease_due(now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_loses_to_lease() {
        let store = MemoryNotificationStore::new();
        let instance = fixtures::instance(ChannelKind::Push, now());
        let id = instance.id.clone();
        store.insert(instance).await.unwrap();

        store.lease_due(now()).await.unwrap();
        assert!(!store.update_status(&id, StatusUpdate::cancelled(now())).await.unwrap());
        assert!(store.update_status(&id, StatusUpdate::sent(now())).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_before_lease_excludes_from_sweep() {
        let store = MemoryNotificationStore::new();
        let instance = fixtures::instance(ChannelKind::Push, now());
        let id = instance.id.clone();
        store.insert(instance).await.unwrap();

        assert!(store.update_status(&id, StatusUpdate::cancelled(now())).await.unwrap());
        assert!(store.lease_due(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_sorted_by_created_desc() {
        let store = MemoryNotificationStore::new();
        let mut older = fixtures::instance(ChannelKind::Push, now());
        older.created_at = now() - Duration::hours(2);
        let mut newer = fixtures::instance(ChannelKind::Sms, now());
        newer.created_at = now() - Duration::hours(1);
        store.insert(older.clone()).await.unwrap();
        store.insert(newer.clone()).await.unwrap();

        let all = store.query(NotificationFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec![newer.id.as_str(), older.id.as_str()]
        );

        let sms_only = store
            .query(NotificationFilter {
                channel: Some(ChannelKind::Sms),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sms_only.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cancel_and_lease_single_outcome() {
        for _ in 0..50 {
            let store = Arc::new(MemoryNotificationStore::new());
            let instance = fixtures::instance(ChannelKind::Push, now());
            let id = instance.id.clone();
            store.insert(instance).await.unwrap();

            let sweeper = {
                let store = Arc::clone(&store);
                let id = id.clone();
                tokio::spawn(async move {
                    let leased = store.lease_due(now()).await.unwrap();
                    if leased.is_empty() {
                        return false;
                    }
                    store.update_status(&id, StatusUpdate::sent(now())).await.unwrap()
                })
            };
            let canceller = {
                let store = Arc::clone(&store);
                let id = id.clone();
                tokio::spawn(async move {
                    store
                        .update_status(&id, StatusUpdate::cancelled(now()))
                        .await
                        .unwrap()
                })
            };

            let sent = sweeper.await.unwrap();
            let cancelled = canceller.await.unwrap();
            assert!(sent ^ cancelled, "恰好一个结果生效");

            let stored = store.get(&id).await.unwrap().unwrap();
            let expected = if sent {
                NotificationStatus::Sent
            } else {
                NotificationStatus::Cancelled
            };
            assert_eq!(stored.status, expected);
        }
    }
}
