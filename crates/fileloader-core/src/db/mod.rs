//! Database access
//!
//! One process-wide pool over sqlx's `Any` driver, with the dialect chosen
//! from the connection URL at startup. Every statement in this crate is
//! built at runtime (stage tables are per-file, column sets are per-source),
//! so queries go through the non-macro API with a small bind-value
//! vocabulary shared by all three dialects.

pub mod dialect;
pub mod retry;
pub mod schema;

use std::future::Future;
use std::time::Duration;

use fileloader_common::LoadError;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

pub use dialect::{sanitize_identifier, stage_table_name, Dialect};
pub use retry::{is_transient_db_error, with_retry, RetryPolicy};

/// Bindable value. Temporal and uuid values are bound as their canonical
/// text form; the `Any` driver carries bool/i64/f64/text natively on all
/// enabled backends.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl SqlValue {
    pub fn from_field(value: &crate::sources::FieldValue) -> Self {
        use crate::sources::FieldValue;
        match value {
            FieldValue::Null => SqlValue::Null,
            FieldValue::Int(i) => SqlValue::Int(*i),
            FieldValue::Float(f) => SqlValue::Float(*f),
            FieldValue::Bool(b) => SqlValue::Bool(*b),
            FieldValue::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
            FieldValue::DateTime(dt) => SqlValue::Text(dt.to_rfc3339()),
            FieldValue::Text(s) => SqlValue::Text(s.clone()),
        }
    }
}

/// Attach bind values to a runtime query in order.
pub fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    values: &[SqlValue],
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

/// Wrap a database future with the per-call timeout and classify failures.
/// Timeout expiry is transient by contract.
pub async fn timed<T>(
    timeout: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, LoadError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(classify(operation, e)),
        Err(_) => Err(LoadError::database(
            operation,
            format!("statement timed out after {}s", timeout.as_secs()),
            true,
        )),
    }
}

/// Map a sqlx error onto the load-error taxonomy.
pub fn classify(operation: &str, error: sqlx::Error) -> LoadError {
    let transient = is_transient_db_error(&error);
    LoadError::database(operation, error.to_string(), transient)
}

/// Process-wide database handle: pool + dialect + per-call timeout.
#[derive(Clone)]
pub struct Db {
    pool: AnyPool,
    dialect: Dialect,
    statement_timeout: Duration,
}

impl Db {
    /// Connect a pool for the URL, selecting the dialect from its scheme.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        statement_timeout: Duration,
    ) -> Result<Self, LoadError> {
        static INSTALL_DRIVERS: std::sync::Once = std::sync::Once::new();
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let dialect = Dialect::from_url(url)?;

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| classify("connect pool", e))?;

        tracing::info!(dialect = dialect.as_str(), "Database pool connected");

        Ok(Self {
            pool,
            dialect,
            statement_timeout,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    pub async fn execute(
        &self,
        operation: &str,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<u64, LoadError> {
        let result = timed(
            self.statement_timeout,
            operation,
            bind_values(sqlx::query(sql), binds).execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_one(
        &self,
        operation: &str,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<AnyRow, LoadError> {
        timed(
            self.statement_timeout,
            operation,
            bind_values(sqlx::query(sql), binds).fetch_one(&self.pool),
        )
        .await
    }

    pub async fn fetch_optional(
        &self,
        operation: &str,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<Option<AnyRow>, LoadError> {
        timed(
            self.statement_timeout,
            operation,
            bind_values(sqlx::query(sql), binds).fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn fetch_all(
        &self,
        operation: &str,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<Vec<AnyRow>, LoadError> {
        timed(
            self.statement_timeout,
            operation,
            bind_values(sqlx::query(sql), binds).fetch_all(&self.pool),
        )
        .await
    }
}

/// Best-effort string form of a result cell, across backend type quirks
/// (SQLite integers where Postgres has text, and so on).
pub fn cell_to_string(row: &AnyRow, index: usize) -> String {
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return v;
    }
    String::new()
}

/// Read a result cell as an integer where any backend may hand back int,
/// bool, or numeric text.
pub fn cell_to_i64(row: &AnyRow, index: usize) -> Option<i64> {
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Some(v);
    }
    if let Ok(v) = row.try_get::<i32, _>(index) {
        return Some(v as i64);
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return Some(v as i64);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        if v.fract() == 0.0 {
            return Some(v as i64);
        }
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return v.trim().parse::<i64>().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::FieldValue;
    use chrono::NaiveDate;

    #[test]
    fn field_values_bind_as_portable_scalars() {
        assert_eq!(SqlValue::from_field(&FieldValue::Int(5)), SqlValue::Int(5));
        assert_eq!(
            SqlValue::from_field(&FieldValue::Date(
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()
            )),
            SqlValue::Text("2024-01-31".to_string())
        );
        assert_eq!(SqlValue::from_field(&FieldValue::Null), SqlValue::Null);
    }
}
