//! # okra
//!
//! Lease-based work queue. Producers schedule items with a due time; workers
//! atomically claim due items, hold them under a heartbeat-renewed lease and
//! then delete or reschedule them. Items abandoned by a crashed worker are
//! reclaimed once their lease expires, with no coordinator involved.
//!
//! The protocol lives in [`scheduler`] and is written against the atomic
//! primitives of [`store::ItemStore`]. Backends: in-process
//! ([`store::MemoryDb`]) and Postgres ([`db::Db`]).

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
pub use model::{Attributes, Item, ItemId, Status};
pub use scheduler::{ReschedulePolicy, Scheduler, SchedulerBuilder};
