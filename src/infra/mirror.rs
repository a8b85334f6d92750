//! Postgres-backed cache mirror.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query,
};
use tracing::debug;

use crate::cache::{MirrorError, MirrorStore};

use super::error::InfraError;

#[derive(Clone)]
pub struct PostgresMirrorStore {
    pool: Arc<PgPool>,
}

impl PostgresMirrorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, InfraError> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(Into::into)
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), InfraError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}

#[async_trait]
impl MirrorStore for PostgresMirrorStore {
    async fn purge(&self, pattern: &str) -> Result<u64, MirrorError> {
        let result = query("DELETE FROM cache_mirror WHERE cache_key LIKE $1")
            .bind(pattern)
            .execute(self.pool())
            .await
            .map_err(|err| MirrorError::Purge(err.to_string()))?;
        let removed = result.rows_affected();
        debug!(pattern, removed, "cache mirror purged");
        Ok(removed)
    }
}
