//! Postgres backend: connection pool, collection setup, health check.
//!
//! A collection maps to a table; its logical database maps to a schema.
//! Both are created on first open.

pub mod items;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::error::Result;
use crate::store::{Backend, Collection};

pub use items::PgStore;

/// Database handle. Owns the connection pool shared by every collection
/// opened through it. Clones share the pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema, table and claim index for `collection` if they do
    /// not exist yet.
    pub async fn ensure_collection(&self, collection: &Collection) -> Result<()> {
        let schema = quote(collection.database());
        let table = items::table_ref(collection);
        let index = quote(&format!("{}_claim_idx", collection.name()));

        // DDL with IF NOT EXISTS still races on the catalog, so concurrent
        // openers serialize on an advisory lock for the schema.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(collection.database())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id          UUID PRIMARY KEY,
                status      TEXT NOT NULL CHECK (status IN ('pending', 'processing')),
                run_date    TIMESTAMPTZ NOT NULL,
                heartbeat   TIMESTAMPTZ,
                attributes  JSONB NOT NULL DEFAULT '{{}}'::jsonb
            )"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (status, run_date, id)"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(%collection, "collection ready");
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Backend for Db {
    type Store = PgStore;

    async fn open(&self, location: &Collection) -> Result<PgStore> {
        self.ensure_collection(location).await?;
        Ok(PgStore::new(self.pool().clone(), location))
    }
}

/// Quote an identifier. `Collection` has already restricted names to
/// `[A-Za-z_][A-Za-z0-9_]*`.
fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}
