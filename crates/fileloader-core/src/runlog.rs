//! Run log recorder
//!
//! One `file_load_log` row per discovered file. The row is inserted as
//! `pending` before any other work, phase metrics are written as idempotent
//! field updates, and the terminal update (status + ended_at) lands before
//! any notification goes out. Rows stuck in `pending` after a crash are left
//! for the operator; reprocessing happens by restoring the archived copy.

use chrono::{DateTime, Utc};
use fileloader_common::{ErrorKind, LoadError};
use uuid::Uuid;

use crate::db::schema::LOG_TABLE;
use crate::db::{with_retry, Db, RetryPolicy, SqlValue};

/// Terminal and non-terminal run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Success,
    Failed,
    DuplicateSkipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::DuplicateSkipped => "duplicate-skipped",
        }
    }
}

/// Start/end/success triple for one pipeline phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimes {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
}

impl PhaseTimes {
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, success: bool) {
        self.ended_at = Some(Utc::now());
        self.success = Some(success);
    }
}

/// In-memory image of one run-log row; owned by a single pipeline.
#[derive(Debug, Clone)]
pub struct RunLog {
    pub id: Uuid,
    pub file_name: String,
    pub source_name: String,
    pub target_table: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub archive_copy: PhaseTimes,
    pub processing: PhaseTimes,
    pub stage_load: PhaseTimes,
    pub audit: PhaseTimes,
    pub merge: PhaseTimes,
    pub records_processed: Option<i64>,
    pub validation_errors: Option<i64>,
    pub records_staged: Option<i64>,
    pub target_inserts: Option<i64>,
    pub target_updates: Option<i64>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl RunLog {
    fn new(file_name: &str, source_name: &str, target_table: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            source_name: source_name.to_string(),
            target_table: target_table.to_string(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            archive_copy: PhaseTimes::default(),
            processing: PhaseTimes::default(),
            stage_load: PhaseTimes::default(),
            audit: PhaseTimes::default(),
            merge: PhaseTimes::default(),
            records_processed: None,
            validation_errors: None,
            records_staged: None,
            target_inserts: None,
            target_updates: None,
            error_kind: None,
            error_message: None,
        }
    }
}

pub struct LogRecorder {
    db: Db,
}

impl LogRecorder {
    pub fn new(db: &Db) -> Self {
        Self { db: db.clone() }
    }

    /// Insert the pending row and hand the pipeline its log image.
    pub async fn start(
        &self,
        file_name: &str,
        source_name: &str,
        target_table: &str,
    ) -> Result<RunLog, LoadError> {
        let log = RunLog::new(file_name, source_name, target_table);
        let dialect = self.db.dialect();

        let sql = format!(
            "INSERT INTO {LOG_TABLE} (id, file_name, source_name, target_table, status, started_at) \
             VALUES ({})",
            dialect.placeholders(1, 6)
        );
        let binds = [
            SqlValue::Text(log.id.to_string()),
            SqlValue::Text(log.file_name.clone()),
            SqlValue::Text(log.source_name.clone()),
            SqlValue::Text(log.target_table.clone()),
            SqlValue::Text(log.status.as_str().to_string()),
            SqlValue::Text(log.started_at.to_rfc3339()),
        ];

        with_retry(RetryPolicy::default(), "log start", || async {
            self.db.execute("log start", &sql, &binds).await
        })
        .await?;

        tracing::info!(log_id = %log.id, file = file_name, "Run log opened");
        Ok(log)
    }

    /// Persist the mutable phase and counter fields. Idempotent: the same
    /// image can be written any number of times.
    pub async fn update(&self, log: &RunLog) -> Result<(), LoadError> {
        let dialect = self.db.dialect();
        let phases = [
            ("archive_copy", &log.archive_copy),
            ("processing", &log.processing),
            ("stage_load", &log.stage_load),
            ("audit", &log.audit),
            ("merge", &log.merge),
        ];

        let mut sets: Vec<String> = Vec::new();
        let mut binds: Vec<SqlValue> = Vec::new();
        let mut ordinal = 1usize;
        let mut push = |sets: &mut Vec<String>, binds: &mut Vec<SqlValue>, col: &str, value: SqlValue| {
            sets.push(format!("{col} = {}", dialect.placeholder(ordinal)));
            binds.push(value);
            ordinal += 1;
        };

        for (name, phase) in phases {
            push(&mut sets, &mut binds, &format!("{name}_started_at"), opt_time(phase.started_at));
            push(&mut sets, &mut binds, &format!("{name}_ended_at"), opt_time(phase.ended_at));
            push(&mut sets, &mut binds, &format!("{name}_success"), opt_bool(phase.success));
        }
        push(&mut sets, &mut binds, "records_processed", opt_i64(log.records_processed));
        push(&mut sets, &mut binds, "validation_errors", opt_i64(log.validation_errors));
        push(&mut sets, &mut binds, "records_staged", opt_i64(log.records_staged));
        push(&mut sets, &mut binds, "target_inserts", opt_i64(log.target_inserts));
        push(&mut sets, &mut binds, "target_updates", opt_i64(log.target_updates));

        let sql = format!(
            "UPDATE {LOG_TABLE} SET {} WHERE id = {}",
            sets.join(", "),
            dialect.placeholder(ordinal)
        );
        binds.push(SqlValue::Text(log.id.to_string()));

        with_retry(RetryPolicy::default(), "log update", || async {
            self.db.execute("log update", &sql, &binds).await
        })
        .await
        .map(|_| ())
    }

    /// Terminal update: status, end timestamp, and error fields in one
    /// statement. After this the row is immutable.
    pub async fn finish(&self, log: &mut RunLog, status: RunStatus) -> Result<(), LoadError> {
        log.status = status;
        log.ended_at = Some(Utc::now());
        self.update(log).await?;

        let dialect = self.db.dialect();
        let sql = format!(
            "UPDATE {LOG_TABLE} SET status = {}, ended_at = {}, error_kind = {}, error_message = {} \
             WHERE id = {}",
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
            dialect.placeholder(4),
            dialect.placeholder(5),
        );
        let binds = [
            SqlValue::Text(status.as_str().to_string()),
            opt_time(log.ended_at),
            match log.error_kind {
                Some(kind) => SqlValue::Text(kind.as_str().to_string()),
                None => SqlValue::Null,
            },
            match &log.error_message {
                Some(message) => SqlValue::Text(message.clone()),
                None => SqlValue::Null,
            },
            SqlValue::Text(log.id.to_string()),
        ];

        with_retry(RetryPolicy::default(), "log finish", || async {
            self.db.execute("log finish", &sql, &binds).await
        })
        .await?;

        tracing::info!(
            log_id = %log.id,
            file = %log.file_name,
            status = status.as_str(),
            "Run log finalized"
        );
        Ok(())
    }
}

fn opt_time(value: Option<DateTime<Utc>>) -> SqlValue {
    match value {
        Some(t) => SqlValue::Text(t.to_rfc3339()),
        None => SqlValue::Null,
    }
}

fn opt_bool(value: Option<bool>) -> SqlValue {
    match value {
        Some(b) => SqlValue::Bool(b),
        None => SqlValue::Null,
    }
}

fn opt_i64(value: Option<i64>) -> SqlValue {
    match value {
        Some(i) => SqlValue::Int(i),
        None => SqlValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_the_log_contract() {
        assert_eq!(RunStatus::Pending.as_str(), "pending");
        assert_eq!(RunStatus::DuplicateSkipped.as_str(), "duplicate-skipped");
    }

    #[test]
    fn phase_times_capture_order() {
        let mut phase = PhaseTimes::default();
        phase.start();
        phase.finish(true);
        assert!(phase.started_at.unwrap() <= phase.ended_at.unwrap());
        assert_eq!(phase.success, Some(true));
    }
}
