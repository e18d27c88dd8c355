//! In-process backend.
//!
//! Every primitive runs inside one critical section over the collection's
//! map, which makes each of them linearizable across all callers sharing the
//! store. Intended for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Backend, Collection, Eligibility, Expected, ItemStore, ItemUpdate};
use crate::error::Result;
use crate::model::{Item, ItemId, Status};

type Records = Arc<Mutex<HashMap<ItemId, Item>>>;

/// Storage handle for in-memory collections. Clones share the same data, so
/// schedulers opened on the same collection see each other's items.
#[derive(Clone, Default)]
pub struct MemoryDb {
    collections: Arc<Mutex<HashMap<Collection, Records>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryDb {
    type Store = MemoryStore;

    async fn open(&self, location: &Collection) -> Result<MemoryStore> {
        let mut collections = self.collections.lock().await;
        let records = collections.entry(location.clone()).or_default();
        Ok(MemoryStore {
            records: Arc::clone(records),
        })
    }
}

/// One in-memory collection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Records,
}

impl MemoryStore {
    /// A standalone collection not registered with any [`MemoryDb`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored record.
    pub async fn get(&self, id: ItemId) -> Option<Item> {
        self.records.lock().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn create(&self, item: &Item) -> Result<ItemId> {
        let id = ItemId::new();
        let mut record = item.clone();
        record.id = Some(id);
        self.records.lock().await.insert(id, record);
        Ok(id)
    }

    async fn claim(&self, eligibility: &Eligibility, update: &ItemUpdate) -> Result<Option<Item>> {
        let mut records = self.records.lock().await;

        let chosen = records
            .values()
            .filter(|item| eligibility.matches(item))
            .min_by_key(|item| (item.run_date, item.id))
            .and_then(|item| item.id);

        Ok(chosen.and_then(|id| {
            let record = records.get_mut(&id)?;
            update.apply(record);
            Some(record.clone())
        }))
    }

    async fn update_if(
        &self,
        id: ItemId,
        expected: &Expected,
        update: &ItemUpdate,
    ) -> Result<Option<Item>> {
        let mut records = self.records.lock().await;
        Ok(records
            .get_mut(&id)
            .filter(|record| expected.matches(record))
            .map(|record| {
                update.apply(record);
                record.clone()
            }))
    }

    async fn update(&self, id: ItemId, update: &ItemUpdate) -> Result<Option<Item>> {
        let mut records = self.records.lock().await;
        Ok(records.get_mut(&id).map(|record| {
            update.apply(record);
            record.clone()
        }))
    }

    async fn remove(&self, id: ItemId) -> Result<()> {
        self.records.lock().await.remove(&id);
        Ok(())
    }

    async fn count(&self, status: Status) -> Result<u64> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|item| item.status == Some(status))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now;
    use chrono::Duration;

    fn pending(run_date: chrono::DateTime<chrono::Utc>) -> Item {
        Item {
            status: Some(Status::Pending),
            ..Item::new(run_date)
        }
    }

    fn claim_update() -> ItemUpdate {
        ItemUpdate::new().status(Status::Processing).heartbeat(now())
    }

    #[tokio::test]
    async fn create_assigns_fresh_ids() {
        let store = MemoryStore::new();
        let item = pending(now());

        let a = store.create(&item).await.unwrap();
        let b = store.create(&item).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get(a).await.unwrap().id, Some(a));
    }

    #[tokio::test]
    async fn claim_prefers_earliest_run_date() {
        let store = MemoryStore::new();
        let t = now();
        let later = store.create(&pending(t - Duration::seconds(1))).await.unwrap();
        let earlier = store.create(&pending(t - Duration::seconds(10))).await.unwrap();
        store.create(&pending(t + Duration::hours(1))).await.unwrap();

        let rule = Eligibility::at(t, Duration::minutes(5));
        let first = store.claim(&rule, &claim_update()).await.unwrap().unwrap();
        let second = store.claim(&rule, &claim_update()).await.unwrap().unwrap();
        let third = store.claim(&rule, &claim_update()).await.unwrap();

        assert_eq!(first.id, Some(earlier));
        assert_eq!(second.id, Some(later));
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn claim_breaks_run_date_ties_by_id() {
        let store = MemoryStore::new();
        let t = now() - Duration::seconds(1);
        let a = store.create(&pending(t)).await.unwrap();
        let b = store.create(&pending(t)).await.unwrap();

        let rule = Eligibility::at(now(), Duration::minutes(5));
        let first = store.claim(&rule, &claim_update()).await.unwrap().unwrap();

        assert_eq!(first.id, Some(a.min(b)));
    }

    #[tokio::test]
    async fn update_if_requires_expected_heartbeat() {
        let store = MemoryStore::new();
        let beat = now();
        let id = store
            .create(&Item {
                status: Some(Status::Processing),
                heartbeat: Some(beat),
                ..Item::new(beat)
            })
            .await
            .unwrap();

        let renew = ItemUpdate::new().heartbeat(beat + Duration::seconds(1));
        let stale = Expected {
            status: Status::Processing,
            heartbeat: beat - Duration::seconds(1),
        };
        assert!(store.update_if(id, &stale, &renew).await.unwrap().is_none());

        let current = Expected {
            status: Status::Processing,
            heartbeat: beat,
        };
        let renewed = store.update_if(id, &current, &renew).await.unwrap().unwrap();
        assert_eq!(renewed.heartbeat, Some(beat + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn update_if_requires_expected_status() {
        let store = MemoryStore::new();
        let beat = now();
        let id = store
            .create(&Item {
                status: Some(Status::Pending),
                heartbeat: Some(beat),
                ..Item::new(beat)
            })
            .await
            .unwrap();

        let renew = ItemUpdate::new().heartbeat(beat + Duration::seconds(1));
        let expected = Expected {
            status: Status::Processing,
            heartbeat: beat,
        };
        assert!(store.update_if(id, &expected, &renew).await.unwrap().is_none());
        assert_eq!(store.get(id).await.unwrap().heartbeat, Some(beat));
    }

    #[test]
    fn eligibility_clamps_huge_lease_to_earliest_time() {
        let rule = Eligibility::at(now(), Duration::days(365 * 10_000_000));
        assert_eq!(rule.expired_before, chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let abandoned = Item {
            status: Some(Status::Processing),
            heartbeat: Some(now() - Duration::days(1)),
            ..Item::new(now())
        };
        assert!(!rule.matches(&abandoned));
    }

    #[tokio::test]
    async fn update_and_remove_tolerate_missing_items() {
        let store = MemoryStore::new();
        let missing = ItemId::new();

        assert!(
            store
                .update(missing, &ItemUpdate::new().status(Status::Pending))
                .await
                .unwrap()
                .is_none()
        );
        store.remove(missing).await.unwrap();
    }

    #[tokio::test]
    async fn count_filters_by_status() {
        let store = MemoryStore::new();
        store.create(&pending(now())).await.unwrap();
        store.create(&pending(now())).await.unwrap();
        store
            .create(&Item {
                status: Some(Status::Processing),
                heartbeat: Some(now()),
                ..Item::new(now())
            })
            .await
            .unwrap();

        assert_eq!(store.count(Status::Pending).await.unwrap(), 2);
        assert_eq!(store.count(Status::Processing).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_db_shares_collections_between_opens() {
        let db = MemoryDb::new();
        let jobs = Collection::new("okra", "jobs").unwrap();
        let other = Collection::new("okra", "other").unwrap();

        let first = db.open(&jobs).await.unwrap();
        let second = db.clone().open(&jobs).await.unwrap();
        let unrelated = db.open(&other).await.unwrap();

        first.create(&pending(now())).await.unwrap();

        assert_eq!(second.len().await, 1);
        assert!(unrelated.is_empty().await);
    }
}
