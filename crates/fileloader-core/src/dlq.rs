//! Dead-letter queue writer
//!
//! Buffers per-row validation failures and lands them in `file_load_dlq`
//! with the same batching and retry discipline as the staging writer. On a
//! successful reprocessing run, rows left behind by earlier runs of the same
//! file are deleted in batches after the merge.

use std::sync::Arc;

use chrono::Utc;
use fileloader_common::LoadError;
use uuid::Uuid;

use crate::db::schema::DLQ_TABLE;
use crate::db::{bind_values, timed, with_retry, Db, RetryPolicy, SqlValue};
use crate::validate::ValidationError;

/// One dead-lettered row, pending insert.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub file_row_number: i64,
    /// Subset of the failing record: grain fields plus errored fields.
    pub record_data: serde_json::Value,
    pub validation_errors: Vec<ValidationError>,
}

pub struct DlqWriter {
    db: Db,
    file_name: String,
    log_id: Uuid,
    target_table: String,
    buffer: Vec<DlqEntry>,
    batch_size: usize,
    written: i64,
}

impl DlqWriter {
    pub fn new(
        db: &Db,
        file_name: &str,
        log_id: Uuid,
        target_table: &str,
        batch_size: usize,
    ) -> Self {
        Self {
            db: db.clone(),
            file_name: file_name.to_string(),
            log_id,
            target_table: target_table.to_string(),
            buffer: Vec::new(),
            batch_size,
            written: 0,
        }
    }

    pub fn written(&self) -> i64 {
        self.written
    }

    pub async fn push(&mut self, entry: DlqEntry) -> Result<(), LoadError> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flush any partial batch and report the total dead-lettered count.
    pub async fn commit(&mut self) -> Result<i64, LoadError> {
        self.flush().await?;
        Ok(self.written)
    }

    async fn flush(&mut self) -> Result<(), LoadError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let entries = std::mem::take(&mut self.buffer);
        let failed_at = Utc::now().to_rfc3339();
        let rows: Vec<Vec<SqlValue>> = entries
            .iter()
            .map(|entry| {
                let errors: Vec<serde_json::Value> =
                    entry.validation_errors.iter().map(|e| e.as_json()).collect();
                vec![
                    SqlValue::Text(Uuid::new_v4().to_string()),
                    SqlValue::Text(self.file_name.clone()),
                    SqlValue::Int(entry.file_row_number),
                    SqlValue::Text(entry.record_data.to_string()),
                    SqlValue::Text(serde_json::Value::Array(errors).to_string()),
                    SqlValue::Text(self.log_id.to_string()),
                    SqlValue::Text(self.target_table.clone()),
                    SqlValue::Text(failed_at.clone()),
                ]
            })
            .collect();

        let inserted = insert_dlq_rows(&self.db, Arc::new(rows)).await?;
        self.written += inserted;
        tracing::debug!(
            file = %self.file_name,
            batch = inserted,
            dead_lettered = self.written,
            "DLQ batch flushed"
        );
        Ok(())
    }
}

const DLQ_COLUMNS: &[&str] = &[
    "id",
    "source_filename",
    "file_row_number",
    "record_data",
    "validation_errors",
    "file_load_log_id",
    "target_table_name",
    "failed_at",
];

async fn insert_dlq_rows(db: &Db, rows: Arc<Vec<Vec<SqlValue>>>) -> Result<i64, LoadError> {
    let dialect = db.dialect();
    let ncols = DLQ_COLUMNS.len();
    let rows_per_statement = (dialect.max_bind_params() / ncols).max(1);

    with_retry(RetryPolicy::default(), "dlq batch insert", || {
        let rows = Arc::clone(&rows);
        async move {
            let mut tx = db
                .pool()
                .begin()
                .await
                .map_err(|e| crate::db::classify("begin dlq insert", e))?;

            let mut inserted = 0i64;
            for chunk in rows.chunks(rows_per_statement) {
                let mut tuples = Vec::with_capacity(chunk.len());
                let mut ordinal = 1usize;
                for _ in chunk {
                    tuples.push(format!("({})", dialect.placeholders(ordinal, ncols)));
                    ordinal += ncols;
                }
                let sql = format!(
                    "INSERT INTO {DLQ_TABLE} ({}) VALUES {}",
                    DLQ_COLUMNS.join(", "),
                    tuples.join(", ")
                );
                let flat: Vec<SqlValue> = chunk.iter().flatten().cloned().collect();

                let result = timed(
                    db.statement_timeout(),
                    "dlq batch insert",
                    bind_values(sqlx::query(&sql), &flat).execute(&mut *tx),
                )
                .await?;
                inserted += result.rows_affected() as i64;
            }

            tx.commit()
                .await
                .map_err(|e| crate::db::classify("commit dlq insert", e))?;
            Ok(inserted)
        }
    })
    .await
}

/// Delete DLQ rows this file left behind in earlier runs, in batches. Runs
/// only after a successful merge; the current run's rows are preserved.
pub async fn delete_prior_entries(
    db: &Db,
    file_name: &str,
    current_log_id: Uuid,
    batch_size: usize,
) -> Result<i64, LoadError> {
    let dialect = db.dialect();
    let p1 = dialect.placeholder(1);
    let p2 = dialect.placeholder(2);
    let p3 = dialect.placeholder(3);

    let probe_sql = format!(
        "SELECT 1 FROM {DLQ_TABLE} WHERE source_filename = {p1} AND file_load_log_id <> {p2} LIMIT 1"
    );
    let binds = [
        SqlValue::Text(file_name.to_string()),
        SqlValue::Text(current_log_id.to_string()),
    ];
    let prior = with_retry(RetryPolicy::default(), "dlq reprocessing probe", || async {
        db.fetch_optional("dlq reprocessing probe", &probe_sql, &binds)
            .await
    })
    .await?;

    if prior.is_none() {
        return Ok(0);
    }

    // The double-nested select keeps the LIMIT portable: MySQL rejects a
    // plain IN (... LIMIT ...) subquery.
    let delete_sql = format!(
        "DELETE FROM {DLQ_TABLE} WHERE id IN (\
         SELECT id FROM (\
         SELECT id FROM {DLQ_TABLE} \
         WHERE source_filename = {p1} AND file_load_log_id <> {p2} LIMIT {p3}\
         ) AS prior_rows)"
    );

    let mut total_deleted = 0i64;
    loop {
        let delete_binds = [
            SqlValue::Text(file_name.to_string()),
            SqlValue::Text(current_log_id.to_string()),
            SqlValue::Int(batch_size as i64),
        ];
        let deleted = with_retry(RetryPolicy::default(), "dlq cleanup", || async {
            db.execute("dlq cleanup", &delete_sql, &delete_binds).await
        })
        .await?;

        if deleted == 0 {
            break;
        }
        total_deleted += deleted as i64;
    }

    if total_deleted > 0 {
        tracing::info!(
            file = file_name,
            deleted = total_deleted,
            "Deleted DLQ rows from prior runs"
        );
    }
    Ok(total_deleted)
}
