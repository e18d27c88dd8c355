//! Construction-time configuration for [`Scheduler`].

use std::time::Duration;

use tracing::info;

use super::{ReschedulePolicy, Scheduler};
use crate::config::SchedulerSettings;
use crate::error::{Error, Result};
use crate::model;
use crate::store::{Backend, Collection};

/// Logical database used when none is configured.
pub const DEFAULT_DATABASE: &str = "okra";

/// How long a lease lives without a heartbeat before another worker may
/// reclaim the item.
pub const DEFAULT_LEASE_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// Builder for [`Scheduler`]. A backend and a collection are required.
///
/// ```no_run
/// # async fn demo() -> okra::error::Result<()> {
/// use std::time::Duration;
/// use okra::scheduler::SchedulerBuilder;
/// use okra::store::MemoryDb;
///
/// let scheduler = SchedulerBuilder::new()
///     .backend(MemoryDb::new())
///     .database("okra")
///     .collection("emails")
///     .lease_expiration(Duration::from_secs(60))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SchedulerBuilder<B> {
    backend: Option<B>,
    database: String,
    collection: Option<String>,
    lease_expiration: Duration,
    reschedule_policy: ReschedulePolicy,
}

impl<B> Default for SchedulerBuilder<B> {
    fn default() -> Self {
        Self {
            backend: None,
            database: DEFAULT_DATABASE.to_string(),
            collection: None,
            lease_expiration: DEFAULT_LEASE_EXPIRATION,
            reschedule_policy: ReschedulePolicy::default(),
        }
    }
}

impl<B: Backend> SchedulerBuilder<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage handle the scheduler opens its collection on.
    pub fn backend(mut self, backend: B) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn lease_expiration(mut self, lease_expiration: Duration) -> Self {
        self.lease_expiration = lease_expiration;
        self
    }

    pub fn reschedule_policy(mut self, policy: ReschedulePolicy) -> Self {
        self.reschedule_policy = policy;
        self
    }

    /// Take database, collection, lease and reschedule policy from loaded
    /// settings.
    pub fn settings(self, settings: &SchedulerSettings) -> Self {
        self.database(settings.database.clone())
            .collection(settings.collection.clone())
            .lease_expiration(settings.lease_expiration())
            .reschedule_policy(settings.reschedule)
    }

    /// Validate the configuration and open the collection.
    pub async fn build(self) -> Result<Scheduler<B::Store>> {
        let backend = self
            .backend
            .ok_or_else(|| Error::InvalidConfiguration("a storage backend is required".into()))?;
        let name = self
            .collection
            .ok_or_else(|| Error::InvalidConfiguration("a collection is required".into()))?;
        let collection = Collection::new(self.database, name)?;

        if self.lease_expiration.is_zero() {
            return Err(Error::InvalidConfiguration(
                "lease expiration must be greater than zero".into(),
            ));
        }
        let lease_expiration = chrono::Duration::from_std(self.lease_expiration).map_err(|e| {
            Error::InvalidConfiguration(format!("lease expiration out of range: {e}"))
        })?;
        if model::now().checked_sub_signed(lease_expiration).is_none() {
            return Err(Error::InvalidConfiguration(
                "lease expiration reaches past the earliest representable time".into(),
            ));
        }

        let store = backend.open(&collection).await?;
        info!(
            %collection,
            lease_expiration_secs = self.lease_expiration.as_secs_f64(),
            reschedule = ?self.reschedule_policy,
            "scheduler ready"
        );

        Ok(Scheduler::new(
            store,
            collection,
            lease_expiration,
            self.reschedule_policy,
        ))
    }
}
