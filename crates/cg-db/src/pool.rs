use std::time::Duration;

use cg_core::rotation::model::{EncryptedModel, StoreError};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::FromRow;
use thiserror::Error;
use tracing::info;

use crate::store::MySqlModelStore;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Database {
    pub pool: MySqlPool,
}

impl Database {
    /// Connect to the application database.
    /// The URL carries credentials; it is never logged.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(url)
            .await?;

        info!("Connected to application database");
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Rotation store over `M`'s table in this database.
    pub fn store<M>(&self) -> Result<MySqlModelStore<M>, DbError>
    where
        M: EncryptedModel + for<'r> FromRow<'r, MySqlRow> + Unpin,
    {
        Ok(MySqlModelStore::new(self.pool.clone())?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connections", &self.pool.size())
            .finish()
    }
}
