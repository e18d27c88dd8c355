//! The atomic store contract the scheduler is written against.
//!
//! A backend only has to provide six primitives, each executed as one
//! linearizable step across every concurrent caller: create, claim,
//! conditional update, unconditional update, remove and count. Nothing in
//! the scheduler relies on multi-item transactions or on any index beyond
//! equality and range lookups on the core fields.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Attributes, Item, ItemId, Status};

pub use memory::{MemoryDb, MemoryStore};

/// Longest identifier accepted for a database or collection name.
/// Matches the Postgres identifier limit.
const MAX_IDENTIFIER_LEN: usize = 63;

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Atomic primitives over one collection of items.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Persist a new item and return the identifier the store assigned.
    /// Any `id` already present on `item` is ignored.
    async fn create(&self, item: &Item) -> Result<ItemId>;

    /// Select one item matching `eligibility`, apply `update` to it and
    /// return the updated record, all in one indivisible step. Candidates are
    /// taken in ascending `run_date`, then ascending `id`.
    async fn claim(&self, eligibility: &Eligibility, update: &ItemUpdate) -> Result<Option<Item>>;

    /// Apply `update` to item `id` only if it still holds the `expected`
    /// fields. Returns the updated record, or `None` if the comparison failed
    /// or the item is gone.
    async fn update_if(
        &self,
        id: ItemId,
        expected: &Expected,
        update: &ItemUpdate,
    ) -> Result<Option<Item>>;

    /// Apply `update` to item `id`. Returns `None` if the item is gone.
    async fn update(&self, id: ItemId, update: &ItemUpdate) -> Result<Option<Item>>;

    /// Remove item `id`. Removing a missing item is not an error.
    async fn remove(&self, id: ItemId) -> Result<()>;

    /// Number of items with the given status.
    async fn count(&self, status: Status) -> Result<u64>;
}

/// A storage handle that can open named collections.
#[async_trait]
pub trait Backend: Send + Sync {
    type Store: ItemStore + 'static;

    /// Open (creating if needed) the collection at `location`.
    async fn open(&self, location: &Collection) -> Result<Self::Store>;
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Where a scheduler keeps its items: a logical database and a collection
/// (table) inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Collection {
    database: String,
    name: String,
}

impl Collection {
    /// Validate both identifiers. Names are restricted to
    /// `[A-Za-z_][A-Za-z0-9_]*` so that SQL backends can splice them into
    /// statements as quoted identifiers.
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let database = database.into();
        let name = name.into();
        validate_identifier("database", &database)?;
        validate_identifier("collection", &name)?;
        Ok(Self { database, name })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || value.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::InvalidConfiguration(format!(
            "{kind} name {value:?} must match [A-Za-z_][A-Za-z0-9_]* and be at most {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Which items a claim may select.
///
/// ```text
/// (status == Pending AND run_date <= now)
///   OR (status == Processing AND (heartbeat IS NULL OR heartbeat < expired_before))
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eligibility {
    pub now: DateTime<Utc>,
    /// Heartbeats older than this belong to expired leases.
    pub expired_before: DateTime<Utc>,
}

impl Eligibility {
    pub fn at(now: DateTime<Utc>, lease_expiration: chrono::Duration) -> Self {
        Self {
            now,
            expired_before: now
                .checked_sub_signed(lease_expiration)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn matches(&self, item: &Item) -> bool {
        match item.status {
            Some(Status::Pending) => item.run_date.is_some_and(|due| due <= self.now),
            Some(Status::Processing) => item
                .heartbeat
                .is_none_or(|beat| beat < self.expired_before),
            None => false,
        }
    }
}

/// Fields a conditional update compares against the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub status: Status,
    pub heartbeat: DateTime<Utc>,
}

impl Expected {
    pub fn matches(&self, item: &Item) -> bool {
        item.status == Some(self.status) && item.heartbeat == Some(self.heartbeat)
    }
}

// ---------------------------------------------------------------------------
// ItemUpdate
// ---------------------------------------------------------------------------

/// How an update treats the heartbeat field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeartbeatChange {
    #[default]
    Keep,
    Set(DateTime<Utc>),
    Clear,
}

/// A partial update. Unset fields are left alone; attributes are merged key
/// by key into the stored map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub status: Option<Status>,
    pub run_date: Option<DateTime<Utc>>,
    pub heartbeat: HeartbeatChange,
    pub attributes: Attributes,
}

impl ItemUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn run_date(mut self, run_date: DateTime<Utc>) -> Self {
        self.run_date = Some(run_date);
        self
    }

    pub fn heartbeat(mut self, heartbeat: DateTime<Utc>) -> Self {
        self.heartbeat = HeartbeatChange::Set(heartbeat);
        self
    }

    pub fn clear_heartbeat(mut self) -> Self {
        self.heartbeat = HeartbeatChange::Clear;
        self
    }

    pub fn merge_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Apply the update to an in-memory record.
    pub fn apply(&self, item: &mut Item) {
        if let Some(status) = self.status {
            item.status = Some(status);
        }
        if let Some(run_date) = self.run_date {
            item.run_date = Some(run_date);
        }
        match self.heartbeat {
            HeartbeatChange::Keep => {}
            HeartbeatChange::Set(beat) => item.heartbeat = Some(beat),
            HeartbeatChange::Clear => item.heartbeat = None,
        }
        for (key, value) in &self.attributes {
            item.attributes.insert(key.clone(), value.clone());
        }
    }
}
