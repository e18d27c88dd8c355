//! Item operations on a Postgres table.
//!
//! Each store primitive is a single SQL statement. The claim selects its
//! candidate with `FOR UPDATE SKIP LOCKED` inside the same `UPDATE`, so
//! concurrent claimers never block on, or double-claim, the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use super::quote;
use crate::error::{Error, Result};
use crate::model::{Attributes, Item, ItemId, Status};
use crate::store::{Collection, Eligibility, Expected, HeartbeatChange, ItemStore, ItemUpdate};

const COLUMNS: &str = "id, status, run_date, heartbeat, attributes";

/// SET clause shared by every updating statement. Binds `$1`..`$5`; see
/// [`bind_update`].
const SET_CLAUSE: &str = "status = COALESCE($1::text, status),
    run_date = COALESCE($2::timestamptz, run_date),
    heartbeat = CASE $3::smallint WHEN 1 THEN $4::timestamptz WHEN 2 THEN NULL ELSE heartbeat END,
    attributes = attributes || $5::jsonb";

const HEARTBEAT_KEEP: i16 = 0;
const HEARTBEAT_SET: i16 = 1;
const HEARTBEAT_CLEAR: i16 = 2;

pub(crate) fn table_ref(collection: &Collection) -> String {
    format!("{}.{}", quote(collection.database()), quote(collection.name()))
}

/// Statements rendered once per collection.
#[derive(Debug, Clone)]
struct Statements {
    create: String,
    claim: String,
    update_if: String,
    update: String,
    remove: String,
    count: String,
}

impl Statements {
    fn render(table: &str) -> Self {
        Self {
            create: format!(
                "INSERT INTO {table} (id, status, run_date, heartbeat, attributes)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id"
            ),
            claim: format!(
                "UPDATE {table} AS t SET {SET_CLAUSE}
                 FROM (
                     SELECT id FROM {table}
                     WHERE (status = 'pending' AND run_date <= $6)
                        OR (status = 'processing' AND (heartbeat IS NULL OR heartbeat < $7))
                     ORDER BY run_date ASC, id ASC
                     LIMIT 1
                     FOR UPDATE SKIP LOCKED
                 ) AS candidate
                 WHERE t.id = candidate.id
                 RETURNING t.id, t.status, t.run_date, t.heartbeat, t.attributes"
            ),
            update_if: format!(
                "UPDATE {table} SET {SET_CLAUSE}
                 WHERE id = $6 AND status = $7 AND heartbeat = $8
                 RETURNING {COLUMNS}"
            ),
            update: format!(
                "UPDATE {table} SET {SET_CLAUSE}
                 WHERE id = $6
                 RETURNING {COLUMNS}"
            ),
            remove: format!("DELETE FROM {table} WHERE id = $1"),
            count: format!("SELECT COUNT(*) FROM {table} WHERE status = $1"),
        }
    }
}

/// One collection stored in a Postgres table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    sql: Statements,
}

impl PgStore {
    pub(crate) fn new(pool: PgPool, collection: &Collection) -> Self {
        Self {
            pool,
            sql: Statements::render(&table_ref(collection)),
        }
    }
}

#[async_trait]
impl ItemStore for PgStore {
    async fn create(&self, item: &Item) -> Result<ItemId> {
        let status = item
            .status
            .ok_or_else(|| Error::InvalidItem("item has no status".into()))?;
        let run_date = item
            .run_date
            .ok_or_else(|| Error::InvalidItem("item has no run date".into()))?;

        let row: (Uuid,) = sqlx::query_as(&self.sql.create)
            .bind(Uuid::new_v4())
            .bind(status.as_str())
            .bind(run_date)
            .bind(item.heartbeat)
            .bind(serde_json::Value::Object(item.attributes.clone()))
            .fetch_one(&self.pool)
            .await?;
        Ok(ItemId(row.0))
    }

    async fn claim(&self, eligibility: &Eligibility, update: &ItemUpdate) -> Result<Option<Item>> {
        let row: Option<ItemRow> = bind_update(sqlx::query_as(&self.sql.claim), update)
            .bind(eligibility.now)
            .bind(eligibility.expired_before)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ItemRow::try_into_item).transpose()
    }

    async fn update_if(
        &self,
        id: ItemId,
        expected: &Expected,
        update: &ItemUpdate,
    ) -> Result<Option<Item>> {
        let row: Option<ItemRow> = bind_update(sqlx::query_as(&self.sql.update_if), update)
            .bind(id.0)
            .bind(expected.status.as_str())
            .bind(expected.heartbeat)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ItemRow::try_into_item).transpose()
    }

    async fn update(&self, id: ItemId, update: &ItemUpdate) -> Result<Option<Item>> {
        let row: Option<ItemRow> = bind_update(sqlx::query_as(&self.sql.update), update)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ItemRow::try_into_item).transpose()
    }

    async fn remove(&self, id: ItemId) -> Result<()> {
        sqlx::query(&self.sql.remove)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count(&self, status: Status) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(&self.sql.count)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }
}

/// Bind `$1`..`$5` of [`SET_CLAUSE`].
fn bind_update<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    update: &ItemUpdate,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    let (mode, heartbeat) = match update.heartbeat {
        HeartbeatChange::Keep => (HEARTBEAT_KEEP, None),
        HeartbeatChange::Set(beat) => (HEARTBEAT_SET, Some(beat)),
        HeartbeatChange::Clear => (HEARTBEAT_CLEAR, None),
    };
    query
        .bind(update.status.map(Status::as_str))
        .bind(update.run_date)
        .bind(mode)
        .bind(heartbeat)
        .bind(serde_json::Value::Object(update.attributes.clone()))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    status: String,
    run_date: DateTime<Utc>,
    heartbeat: Option<DateTime<Utc>>,
    attributes: serde_json::Value,
}

impl ItemRow {
    fn try_into_item(self) -> Result<Item> {
        let attributes = match self.attributes {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Attributes::new(),
            other => {
                return Err(Error::Other(format!(
                    "item {} has non-object attributes: {other}",
                    self.id
                )));
            }
        };

        Ok(Item {
            id: Some(ItemId(self.id)),
            status: Some(self.status.parse()?),
            run_date: Some(self.run_date),
            heartbeat: self.heartbeat,
            attributes,
        })
    }
}
