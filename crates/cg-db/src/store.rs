//! `sqlx`-backed implementation of the rotation store seam.
//!
//! Table and column names come from model descriptors, not user input, but
//! they are still interpolated into SQL text, so every identifier is checked
//! against [`IDENTIFIER_RE`] and backquoted.

use std::marker::PhantomData;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::FromRow;
use tracing::debug;

use cg_core::rotation::model::{EncryptedModel, ModelStore, StoreError};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap());

pub fn validate_identifier(name: &str) -> Result<&str, StoreError> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Precomputed statements for one model's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSql {
    pub count: String,
    pub select_page: String,
    pub update: String,
}

impl TableSql {
    pub fn for_model<M: EncryptedModel>() -> Result<Self, StoreError> {
        let table = validate_identifier(M::table_name())?;
        let pk = validate_identifier(M::primary_key())?;

        let fields = M::encrypted_fields();
        if fields.is_empty() {
            return Err(StoreError::InvalidIdentifier(format!(
                "{} has no encrypted columns",
                table
            )));
        }
        let assignments = fields
            .iter()
            .map(|f| validate_identifier(f.name).map(|c| format!("`{}` = ?", c)))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        Ok(Self {
            count: format!("SELECT COUNT(*) FROM `{}`", table),
            select_page: format!("SELECT * FROM `{}` ORDER BY `{}` LIMIT ? OFFSET ?", table, pk),
            update: format!("UPDATE `{}` SET {} WHERE `{}` = ?", table, assignments, pk),
        })
    }
}

pub struct MySqlModelStore<M> {
    pool: MySqlPool,
    sql: TableSql,
    _model: PhantomData<fn() -> M>,
}

impl<M> MySqlModelStore<M>
where
    M: EncryptedModel + for<'r> FromRow<'r, MySqlRow> + Unpin,
{
    pub fn new(pool: MySqlPool) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            sql: TableSql::for_model::<M>()?,
            _model: PhantomData,
        })
    }

    pub fn sql(&self) -> &TableSql {
        &self.sql
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl<M> ModelStore<M> for MySqlModelStore<M>
where
    M: EncryptedModel + for<'r> FromRow<'r, MySqlRow> + Unpin,
{
    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&self.sql.count)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_batch(&self, offset: u64, limit: usize) -> Result<Vec<M>, StoreError> {
        let rows = sqlx::query_as::<_, M>(&self.sql.select_page)
            .bind(limit as u64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        debug!(table = M::table_name(), offset, fetched = rows.len(), "Fetched batch");
        Ok(rows)
    }

    async fn save(&self, record: &M) -> Result<(), StoreError> {
        let id = record.record_id();
        let mut query = sqlx::query(&self.sql.update);
        for field in M::encrypted_fields() {
            query = query.bind(field.stored(record));
        }
        query.bind(id.as_str()).execute(&self.pool).await.map_err(backend)?;

        debug!(table = M::table_name(), record_id = %id, "Saved record");
        Ok(())
    }
}

impl<M> std::fmt::Debug for MySqlModelStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlModelStore")
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}
