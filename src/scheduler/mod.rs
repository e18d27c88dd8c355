//! Scheduler core: the claim / heartbeat / reschedule protocol.
//!
//! The scheduler holds no locks of its own. Every guarantee it makes (one
//! owner per lease, lost-lease detection, recovery of abandoned items) comes
//! from running each state change as a single atomic store primitive. Lease
//! expiry is discovered lazily: an abandoned item is only recovered when
//! some caller next claims and the expired-heartbeat branch of the
//! eligibility predicate matches it.

pub mod builder;

pub use builder::{DEFAULT_DATABASE, DEFAULT_LEASE_EXPIRATION, SchedulerBuilder};

use std::time::Instant;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span, debug, error, info};

use crate::error::{Error, Result};
use crate::model::{self, Attributes, Item, Status};
use crate::store::{Collection, Eligibility, Expected, ItemStore, ItemUpdate};
use crate::telemetry::item::{record_item, start_item_span};
use crate::telemetry::metrics;

/// What `reschedule` does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReschedulePolicy {
    /// Move the item back to pending with its new run date, matched by id
    /// alone.
    #[default]
    Update,
    /// Reject every reschedule with [`Error::Unsupported`]. Callers must
    /// delete and schedule a fresh item instead.
    Disabled,
}

/// A lease-based work queue over one collection.
pub struct Scheduler<S> {
    store: S,
    collection: Collection,
    lease_expiration: chrono::Duration,
    reschedule_policy: ReschedulePolicy,
}

impl<S: ItemStore> Scheduler<S> {
    pub(crate) fn new(
        store: S,
        collection: Collection,
        lease_expiration: chrono::Duration,
        reschedule_policy: ReschedulePolicy,
    ) -> Self {
        Self {
            store,
            collection,
            lease_expiration,
            reschedule_policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn lease_expiration(&self) -> chrono::Duration {
        self.lease_expiration
    }

    pub fn reschedule_policy(&self) -> ReschedulePolicy {
        self.reschedule_policy
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Persist a new item as pending. On success the store-assigned id and
    /// the pending status are written back into `item`.
    pub async fn schedule(&self, item: &mut Item) -> Result<()> {
        let span = start_item_span("schedule", self.collection.name());
        async {
            validate_schedule(item)?;

            let mut record = item.clone();
            record.status = Some(Status::Pending);

            let started = Instant::now();
            let id = self.store.create(&record).await?;
            self.observe("schedule", started);

            record.id = Some(id);
            *item = record;

            record_item(&Span::current(), id);
            metrics::items_scheduled().add(1, &self.labels());
            info!(item_id = %id, run_date = ?item.run_date, "item scheduled");
            Ok(())
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    /// Claim one eligible item: a pending item that is due, or a processing
    /// item whose lease has expired. The claimed item comes back as
    /// `Processing` with a fresh heartbeat. `None` means there is nothing to
    /// do right now; backing off is up to the caller.
    pub async fn peek(&self) -> Result<Option<Item>> {
        let span = start_item_span("peek", self.collection.name());
        self.claim().instrument(span).await
    }

    /// Claim one eligible item and delete it straight away.
    ///
    /// For fire-and-forget work that needs no completion step. The claim
    /// already made this caller the only owner, so nobody can take the item
    /// between the claim and the delete.
    pub async fn poll(&self) -> Result<Option<Item>> {
        let span = start_item_span("poll", self.collection.name());
        async {
            let Some(item) = self.claim().await? else {
                return Ok(None);
            };
            if let Some(id) = item.id {
                let started = Instant::now();
                self.store.remove(id).await?;
                self.observe("remove", started);
                metrics::items_deleted().add(1, &self.labels());
                debug!(item_id = %id, "polled item removed");
            }
            Ok(Some(item))
        }
        .instrument(span)
        .await
    }

    /// Like [`peek`](Self::peek), but an empty queue is an error.
    pub async fn retrieve(&self) -> Result<Item> {
        let span = start_item_span("retrieve", self.collection.name());
        async { self.claim().await?.ok_or(Error::ItemNotFound) }
            .instrument(span)
            .await
    }

    /// Renew the lease on `item`.
    ///
    /// Succeeds only while the stored record is still `Processing` with the
    /// heartbeat this caller last saw. `None` means the lease is lost: it
    /// expired and was reclaimed, or the item was rescheduled or deleted.
    /// The caller must continue with the returned item, whose heartbeat is
    /// the one the next renewal will be checked against.
    pub async fn heartbeat(&self, item: &Item) -> Result<Option<Item>> {
        self.heartbeat_and_update_attributes(item, Attributes::new())
            .await
    }

    /// Renew the lease on `item` and merge `attributes` into the stored
    /// attribute map in the same atomic step.
    pub async fn heartbeat_and_update_attributes(
        &self,
        item: &Item,
        attributes: Attributes,
    ) -> Result<Option<Item>> {
        let span = start_item_span("heartbeat", self.collection.name());
        async {
            let (Some(id), Some(last), Some(_)) = (item.id, item.heartbeat, item.status) else {
                metrics::heartbeats().add(1, &self.labels_with("result", "skipped"));
                debug!("heartbeat skipped, item is not leased");
                return Ok(None);
            };
            record_item(&Span::current(), id);

            // The stored heartbeat must change on every renewal, otherwise a
            // stale copy of the item could still pass the comparison.
            let Some(next) = last.checked_add_signed(chrono::Duration::microseconds(1)) else {
                metrics::heartbeats().add(1, &self.labels_with("result", "lost"));
                debug!(item_id = %id, "heartbeat lost, no later timestamp exists");
                return Ok(None);
            };
            let beat = model::now().max(next);
            let expected = Expected {
                status: Status::Processing,
                heartbeat: last,
            };
            let update = ItemUpdate::new()
                .heartbeat(beat)
                .merge_attributes(attributes);

            let started = Instant::now();
            let renewed = self.store.update_if(id, &expected, &update).await?;
            self.observe("update_if", started);

            let result = if renewed.is_some() { "renewed" } else { "lost" };
            metrics::heartbeats().add(1, &self.labels_with("result", result));
            debug!(item_id = %id, result, "heartbeat");
            Ok(renewed)
        }
        .instrument(span)
        .await
    }

    /// Move `item` back to pending, due at `item.run_date`, and drop its
    /// lease. Returns the stored record, or `None` if it no longer exists.
    pub async fn reschedule(&self, item: &Item) -> Result<Option<Item>> {
        let span = start_item_span("reschedule", self.collection.name());
        async {
            if self.reschedule_policy == ReschedulePolicy::Disabled {
                return Err(Error::Unsupported("reschedule"));
            }
            let Some(id) = item.id else {
                return Err(Error::InvalidItem(
                    "cannot reschedule an item that was never scheduled".into(),
                ));
            };
            let Some(run_date) = item.run_date else {
                return Err(Error::InvalidItem(
                    "cannot reschedule an item without a run date".into(),
                ));
            };
            record_item(&Span::current(), id);

            let update = ItemUpdate::new()
                .status(Status::Pending)
                .run_date(run_date)
                .clear_heartbeat();

            let started = Instant::now();
            let rescheduled = self.store.update(id, &update).await?;
            self.observe("update", started);

            if rescheduled.is_some() {
                metrics::items_rescheduled().add(1, &self.labels());
                info!(item_id = %id, %run_date, "item rescheduled");
            } else {
                debug!(item_id = %id, "reschedule found no item");
            }
            Ok(rescheduled)
        }
        .instrument(span)
        .await
    }

    /// Remove `item` from the store. Unscheduled items and items that are
    /// already gone are ignored.
    pub async fn delete(&self, item: &Item) -> Result<()> {
        let Some(id) = item.id else {
            return Ok(());
        };
        let span = start_item_span("delete", self.collection.name());
        async {
            record_item(&Span::current(), id);

            let started = Instant::now();
            self.store.remove(id).await?;
            self.observe("remove", started);

            metrics::items_deleted().add(1, &self.labels());
            info!(item_id = %id, "item deleted");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Number of stored items with `status`.
    pub async fn count_by_status(&self, status: Status) -> Result<u64> {
        let span = start_item_span("count", self.collection.name());
        async {
            let started = Instant::now();
            let count = self.store.count(status).await?;
            self.observe("count", started);
            debug!(%status, count, "counted items");
            Ok(count)
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn claim(&self) -> Result<Option<Item>> {
        let now = model::now();
        let eligibility = Eligibility::at(now, self.lease_expiration);
        let update = ItemUpdate::new()
            .status(Status::Processing)
            .heartbeat(now);

        let started = Instant::now();
        let claimed = self.store.claim(&eligibility, &update).await?;
        self.observe("claim", started);

        match claimed.as_ref().and_then(|item| item.id) {
            Some(id) => {
                record_item(&Span::current(), id);
                metrics::items_claimed().add(1, &self.labels_with("result", "claimed"));
                debug!(item_id = %id, "item claimed");
            }
            None => {
                metrics::items_claimed().add(1, &self.labels_with("result", "empty"));
            }
        }
        Ok(claimed)
    }

    fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("collection", self.collection.to_string())]
    }

    fn labels_with(&self, key: &'static str, value: &'static str) -> [KeyValue; 2] {
        [
            KeyValue::new("collection", self.collection.to_string()),
            KeyValue::new(key, value),
        ]
    }

    fn observe(&self, operation: &'static str, started: Instant) {
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation)],
        );
    }
}

fn validate_schedule(item: &Item) -> Result<()> {
    if let Some(id) = item.id {
        error!(item_id = %id, "cannot schedule item, it already has an id");
        return Err(Error::InvalidItem(format!(
            "item already has id {id}, it was scheduled before"
        )));
    }
    if item.run_date.is_none() {
        error!("cannot schedule item, it has no run date");
        return Err(Error::InvalidItem("item has no run date".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemId;
    use crate::store::{ItemStore, MemoryStore};

    fn scheduler(policy: ReschedulePolicy) -> Scheduler<MemoryStore> {
        Scheduler::new(
            MemoryStore::new(),
            Collection::new("okra", "unit").unwrap(),
            chrono::Duration::minutes(5),
            policy,
        )
    }

    #[test]
    fn validate_schedule_requires_run_date_and_no_id() {
        assert!(validate_schedule(&Item::due_now()).is_ok());

        let no_date = Item::default();
        assert!(matches!(
            validate_schedule(&no_date),
            Err(Error::InvalidItem(_))
        ));

        let with_id = Item {
            id: Some(ItemId::new()),
            ..Item::due_now()
        };
        assert!(matches!(
            validate_schedule(&with_id),
            Err(Error::InvalidItem(_))
        ));
    }

    #[tokio::test]
    async fn failed_schedule_leaves_item_untouched() {
        let okra = scheduler(ReschedulePolicy::Update);
        let mut item = Item::default();

        assert!(okra.schedule(&mut item).await.is_err());
        assert_eq!(item, Item::default());
        assert!(okra.store().is_empty().await);
    }

    #[tokio::test]
    async fn heartbeat_always_moves_forward() {
        let okra = scheduler(ReschedulePolicy::Update);
        let mut item = Item::new(model::now() - chrono::Duration::seconds(1));
        okra.schedule(&mut item).await.unwrap();

        let claimed = okra.peek().await.unwrap().unwrap();
        let first = okra.heartbeat(&claimed).await.unwrap().unwrap();
        let second = okra.heartbeat(&first).await.unwrap().unwrap();

        assert!(first.heartbeat > claimed.heartbeat);
        assert!(second.heartbeat > first.heartbeat);
        // The copy from before the renewals is stale now.
        assert!(okra.heartbeat(&claimed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_on_rescheduled_item_is_lost() {
        let okra = scheduler(ReschedulePolicy::Update);
        let beat = model::now();
        // Pending again but still carrying the heartbeat the worker saw.
        let id = okra
            .store()
            .create(&Item {
                status: Some(Status::Pending),
                heartbeat: Some(beat),
                ..Item::new(beat + chrono::Duration::hours(1))
            })
            .await
            .unwrap();
        let held = Item {
            id: Some(id),
            status: Some(Status::Processing),
            heartbeat: Some(beat),
            ..Item::new(beat)
        };

        assert!(okra.heartbeat(&held).await.unwrap().is_none());
        let stored = okra.store().get(id).await.unwrap();
        assert_eq!(stored.status, Some(Status::Pending));
        assert_eq!(stored.heartbeat, Some(beat));
    }

    #[tokio::test]
    async fn heartbeat_at_latest_timestamp_is_lost() {
        let okra = scheduler(ReschedulePolicy::Update);
        let item = Item {
            id: Some(ItemId::new()),
            status: Some(Status::Processing),
            heartbeat: Some(chrono::DateTime::<chrono::Utc>::MAX_UTC),
            ..Item::due_now()
        };

        assert!(okra.heartbeat(&item).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retrieve_and_count_on_empty_queue() {
        let okra = scheduler(ReschedulePolicy::Update);
        assert!(matches!(okra.retrieve().await, Err(Error::ItemNotFound)));
        assert_eq!(okra.count_by_status(Status::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_reschedule_never_reaches_store() {
        let okra = scheduler(ReschedulePolicy::Disabled);
        let mut item = Item::new(model::now() - chrono::Duration::seconds(1));
        okra.schedule(&mut item).await.unwrap();
        let claimed = okra.peek().await.unwrap().unwrap();

        let err = okra.reschedule(&claimed).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported("reschedule")));
        assert_eq!(okra.count_by_status(Status::Processing).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reschedule_requires_scheduled_item() {
        let okra = scheduler(ReschedulePolicy::Update);
        let err = okra.reschedule(&Item::due_now()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidItem(_)));
    }
}
