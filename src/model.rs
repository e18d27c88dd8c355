//! Core data model.
//!
//! An item is a unit of work with a due time. Once scheduled it carries a
//! store-assigned identity and a status; while leased it also carries the
//! heartbeat of its current owner.

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Open key/value data carried alongside the core fields.
///
/// Updates merge into this map key by key; it is never replaced wholesale.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Assigned by the store on creation. `None` until scheduled.
    pub id: Option<ItemId>,

    /// Lifecycle status. `None` until scheduled.
    pub status: Option<Status>,

    /// The item becomes eligible for claiming once `now >= run_date`.
    pub run_date: Option<DateTime<Utc>>,

    /// Last lease renewal. Only meaningful while `Processing`.
    pub heartbeat: Option<DateTime<Utc>>,

    #[serde(default)]
    pub attributes: Attributes,
}

impl Item {
    /// An unscheduled item due at `run_date`.
    pub fn new(run_date: DateTime<Utc>) -> Self {
        Self {
            run_date: Some(run_date),
            ..Self::default()
        }
    }

    /// An unscheduled item that is due immediately.
    pub fn due_now() -> Self {
        Self::new(now())
    }

    /// An unscheduled item due after `delay`.
    pub fn due_in(delay: std::time::Duration) -> Result<Self> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| Error::InvalidItem(format!("delay out of range: {e}")))?;
        let run_date = now()
            .checked_add_signed(delay)
            .ok_or_else(|| Error::InvalidItem("delay puts the run date out of range".into()))?;
        Ok(Self::new(run_date))
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Merge a typed payload into the attribute map.
    ///
    /// The payload must serialize to a JSON object; its fields become
    /// top-level attributes.
    pub fn with_attributes<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        match serde_json::to_value(payload)? {
            serde_json::Value::Object(map) => {
                self.attributes.extend(map);
                Ok(self)
            }
            other => Err(Error::InvalidItem(format!(
                "attributes must serialize to an object, got {other}"
            ))),
        }
    }

    /// Read the attribute map back as a typed payload.
    pub fn attributes_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            self.attributes.clone(),
        ))?)
    }

    pub fn is_scheduled(&self) -> bool {
        self.id.is_some()
    }
}

/// Newtype for item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse()
            .map(Self)
            .map_err(|e| Error::InvalidItem(format!("invalid item id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a scheduled item. Deleted items have no status; they
/// are simply gone from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for its run date, or ready and unclaimed.
    Pending,
    /// Leased by a worker (or abandoned with an expired lease).
    Processing,
}

impl Status {
    pub const ALL: [Status; 2] = [Status::Pending, Status::Processing];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "processing" => Ok(Status::Processing),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Current time at microsecond precision.
///
/// Heartbeats are compared for exact equality, so every timestamp the
/// scheduler writes must survive a round trip through a microsecond store.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
