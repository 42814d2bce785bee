//! Staging manager
//!
//! Owns the per-file stage table: creates it after header validation,
//! buffers validated records, flushes multi-row inserts in short
//! transactions with retry, and tears the table down on every exit path.

use std::sync::Arc;

use fileloader_common::LoadError;
use sha2::{Digest, Sha256};

use crate::db::schema;
use crate::db::{bind_values, stage_table_name, timed, with_retry, Db, RetryPolicy, SqlValue};
use crate::sources::SourceConfig;
use crate::validate::TypedRecord;

pub struct StagingManager {
    db: Db,
    table: String,
    columns: Vec<String>,
    buffer: Vec<Vec<SqlValue>>,
    batch_size: usize,
    staged: i64,
}

impl StagingManager {
    /// Create the stage table and an empty buffer for one file.
    pub async fn create(
        db: &Db,
        source: &SourceConfig,
        file_name: &str,
        batch_size: usize,
    ) -> Result<Self, LoadError> {
        let table = stage_table_name(db.dialect(), file_name);
        let columns = schema::create_stage_table(db, source, &table).await?;

        tracing::debug!(stage_table = %table, "Stage table created");

        Ok(Self {
            db: db.clone(),
            table,
            columns,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            staged: 0,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn staged(&self) -> i64 {
        self.staged
    }

    /// Buffer one validated record; flushes when the batch fills.
    pub async fn push(
        &mut self,
        record: &TypedRecord,
        file_name: &str,
        row_number: i64,
    ) -> Result<(), LoadError> {
        let mut row: Vec<SqlValue> = Vec::with_capacity(self.columns.len());
        for (_, value) in &record.values {
            row.push(SqlValue::from_field(value));
        }
        row.push(SqlValue::Text(row_digest(record)));
        row.push(SqlValue::Text(file_name.to_string()));
        row.push(SqlValue::Int(row_number));
        self.buffer.push(row);

        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flush any partial batch and report the total staged row count.
    pub async fn commit(&mut self) -> Result<i64, LoadError> {
        self.flush().await?;
        Ok(self.staged)
    }

    async fn flush(&mut self) -> Result<(), LoadError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = Arc::new(std::mem::take(&mut self.buffer));
        let inserted = insert_rows(&self.db, &self.table, &self.columns, rows).await?;
        self.staged += inserted;
        tracing::debug!(
            stage_table = %self.table,
            batch = inserted,
            staged = self.staged,
            "Stage batch flushed"
        );
        Ok(())
    }

    /// Tear the stage table down. Best-effort: failures are logged, not
    /// raised, because this runs on already-failing paths.
    pub async fn drop_table(db: &Db, table: &str) {
        match schema::drop_stage_table(db, table).await {
            Ok(()) => tracing::debug!(stage_table = %table, "Stage table dropped"),
            Err(e) => {
                tracing::warn!(stage_table = %table, error = %e, "Failed to drop stage table")
            },
        }
    }
}

/// Insert rows as one short transaction of multi-row statements, chunked
/// under the dialect's bind-parameter ceiling, retried on transient errors.
async fn insert_rows(
    db: &Db,
    table: &str,
    columns: &[String],
    rows: Arc<Vec<Vec<SqlValue>>>,
) -> Result<i64, LoadError> {
    let dialect = db.dialect();
    let ncols = columns.len().max(1);
    let rows_per_statement = (dialect.max_bind_params() / ncols).max(1);

    with_retry(RetryPolicy::default(), "stage batch insert", || {
        let rows = Arc::clone(&rows);
        async move {
            let mut tx = db
                .pool()
                .begin()
                .await
                .map_err(|e| crate::db::classify("begin stage insert", e))?;

            let mut inserted = 0i64;
            for chunk in rows.chunks(rows_per_statement) {
                let mut tuples = Vec::with_capacity(chunk.len());
                let mut ordinal = 1usize;
                for _ in chunk {
                    tuples.push(format!("({})", dialect.placeholders(ordinal, ncols)));
                    ordinal += ncols;
                }
                let sql = format!(
                    "INSERT INTO {table} ({}) VALUES {}",
                    columns.join(", "),
                    tuples.join(", ")
                );
                let flat: Vec<SqlValue> = chunk.iter().flatten().cloned().collect();

                let result = timed(
                    db.statement_timeout(),
                    "stage batch insert",
                    bind_values(sqlx::query(&sql), &flat).execute(&mut *tx),
                )
                .await?;
                inserted += result.rows_affected() as i64;
            }

            tx.commit()
                .await
                .map_err(|e| crate::db::classify("commit stage insert", e))?;
            Ok(inserted)
        }
    })
    .await
}

/// Digest of a record's canonical field text, order-independent. The merge
/// counts an update only when the digest changed, so reloading identical
/// content reports zero updates.
pub fn row_digest(record: &TypedRecord) -> String {
    let mut parts: Vec<(&str, String)> = record
        .values
        .iter()
        .map(|(name, value)| (name.as_str(), value.canonical_text()))
        .collect();
    parts.sort_by(|a, b| a.0.cmp(b.0));

    let joined = parts
        .iter()
        .map(|(_, text)| text.as_str())
        .collect::<Vec<_>>()
        .join("|");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    format!("{:x}", hasher.finalize())
}
