//! Per-file pipeline
//!
//! The state machine that takes one discovered file end to end:
//!
//! ```text
//! DISCOVERED -> DEDUPE_CHECK
//!   duplicate -> DUPLICATE_MOVE -> DONE(duplicate-skipped)
//!   fresh     -> ARCHIVE_COPY -> READER_OPEN -> HEADER_VALIDATE
//!                -> STREAM (validate -> stage | dlq)
//!                -> STAGE_COMMIT -> GRAIN_AUDIT -> USER_AUDIT
//!                -> MERGE -> DLQ_CLEANUP -> STAGE_DROP -> FILE_DELETE -> DONE
//! ```
//!
//! Every non-success terminal still drops the stage table but leaves the
//! source file in place for the operator. The archive copy precedes all
//! database mutations, and the final log write precedes any notification.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fileloader_common::{ErrorKind, LoadError};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::Db;
use crate::dlq::{self, DlqEntry, DlqWriter};
use crate::notify::{duplicate_file_message, FileProblem, InternalProblem, Notifier};
use crate::readers::{self, RawRow};
use crate::runlog::{LogRecorder, RunLog, RunStatus};
use crate::sources::SourceConfig;
use crate::stage::StagingManager;
use crate::validate::{self, ValidationError};
use crate::{audit, merge};

/// Shared dependencies for all pipelines of one scheduler run.
pub struct PipelineContext {
    pub db: Db,
    pub batch_size: usize,
    pub archive_dir: PathBuf,
    pub duplicates_dir: PathBuf,
    pub notifier: Arc<dyn Notifier>,
    pub cancel: CancellationToken,
}

/// Terminal summary of one file run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub file_name: String,
    pub log_id: Option<Uuid>,
    pub status: RunStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, RunStatus::Success | RunStatus::DuplicateSkipped)
    }
}

struct RunState {
    stage_table: Option<String>,
}

/// Run one file to a terminal state. Never panics outward; every exit paths
/// through the run log and, where configured, a notification.
pub async fn run_file(
    ctx: Arc<PipelineContext>,
    source: Arc<SourceConfig>,
    path: PathBuf,
) -> PipelineOutcome {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let recorder = LogRecorder::new(&ctx.db);
    let mut log = match recorder
        .start(&file_name, &source.name, &source.table_name)
        .await
    {
        Ok(log) => log,
        Err(e) => {
            tracing::error!(file = %file_name, error = %e, "Failed to open run log");
            ctx.notifier
                .internal_error(InternalProblem {
                    message: format!("failed to open run log for {file_name}: {e}"),
                    file_name: Some(file_name.clone()),
                    log_id: None,
                })
                .await;
            return PipelineOutcome {
                file_name,
                log_id: None,
                status: RunStatus::Failed,
                error_kind: Some(e.kind()),
                error_message: Some(e.to_string()),
            };
        },
    };

    // Dedupe guard runs before any streaming or staging.
    match merge::file_already_loaded(&ctx.db, &source, &file_name).await {
        Ok(true) => return duplicate_terminal(&ctx, &source, &path, &recorder, &mut log).await,
        Ok(false) => {},
        Err(e) => return failed_terminal(&ctx, &source, &recorder, &mut log, e).await,
    }

    let mut state = RunState { stage_table: None };
    let result = drive(&ctx, &source, &path, &mut log, &recorder, &mut state).await;

    // STAGE_DROP runs on every exit path once the stage exists.
    if let Some(table) = &state.stage_table {
        StagingManager::drop_table(&ctx.db, table).await;
    }

    match result {
        Ok(()) => {
            // FILE_DELETE only after a fully successful publish.
            if let Err(e) = std::fs::remove_file(&path) {
                return failed_terminal(&ctx, &source, &recorder, &mut log, LoadError::Io(e)).await;
            }
            tracing::info!(log_id = %log.id, file = %log.file_name, "Deleted source file");

            match recorder.finish(&mut log, RunStatus::Success).await {
                Ok(()) => PipelineOutcome {
                    file_name: log.file_name.clone(),
                    log_id: Some(log.id),
                    status: RunStatus::Success,
                    error_kind: None,
                    error_message: None,
                },
                Err(e) => failed_terminal(&ctx, &source, &recorder, &mut log, e).await,
            }
        },
        Err(e) => failed_terminal(&ctx, &source, &recorder, &mut log, e).await,
    }
}

/// The fresh-file path: archive, stream, stage, audit, merge, clean up DLQ.
async fn drive(
    ctx: &PipelineContext,
    source: &SourceConfig,
    path: &Path,
    log: &mut RunLog,
    recorder: &LogRecorder,
    state: &mut RunState,
) -> Result<(), LoadError> {
    let file_name = log.file_name.clone();

    if ctx.cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
    }

    // ARCHIVE_COPY: if this fails nothing has touched the database yet.
    log.archive_copy.start();
    let archive_path = ctx.archive_dir.join(&file_name);
    if let Err(e) = tokio::fs::copy(path, &archive_path).await {
        log.archive_copy.finish(false);
        tracing::error!(log_id = %log.id, file = %file_name, error = %e, "Failed to copy to archive");
        return Err(LoadError::Io(e));
    }
    log.archive_copy.finish(true);
    recorder.update(log).await?;
    tracing::info!(log_id = %log.id, file = %file_name, archive = %archive_path.display(), "Copied to archive");

    // READER_OPEN and HEADER_VALIDATE.
    let mut reader = readers::open_reader(path, source)?;
    let required = source.model.required_aliases();
    readers::validate_header(reader.as_mut(), &required, &file_name)?;

    // Stage table exists only after the header proved loadable.
    log.stage_load.start();
    let mut stage = StagingManager::create(&ctx.db, source, &file_name, ctx.batch_size).await?;
    state.stage_table = Some(stage.table().to_string());
    let mut dlq = DlqWriter::new(&ctx.db, &file_name, log.id, &source.table_name, ctx.batch_size);

    // STREAM: the reader drives; the writers block it at each batch flush.
    log.processing.start();
    let mut processed = 0i64;
    let mut errors = 0i64;
    let mut samples: Vec<serde_json::Value> = Vec::new();

    while let Some(item) = reader.next_row() {
        if ctx.cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        let row = item?;
        processed += 1;

        match row {
            RawRow::Record(record) => match validate::validate_record(&source.model, &record) {
                Ok(typed) => {
                    stage.push(&typed, &file_name, record.row_number).await?;
                },
                Err(row_errors) => {
                    errors += 1;
                    tracing::debug!(
                        log_id = %log.id,
                        row = record.row_number,
                        "Validation failed for row"
                    );
                    if samples.len() < 5 {
                        samples.push(json!({
                            "file_row_number": record.row_number,
                            "validation_errors": row_errors.iter().map(|e| e.as_json()).collect::<Vec<_>>(),
                        }));
                    }
                    let payload =
                        validate::dlq_payload(&source.model, &source.grain, &record, &row_errors);
                    dlq.push(DlqEntry {
                        file_row_number: record.row_number,
                        record_data: payload,
                        validation_errors: row_errors,
                    })
                    .await?;
                },
            },
            RawRow::Defect {
                row_number,
                column_name,
                column_value,
                error_type,
                error_msg,
            } => {
                errors += 1;
                let error = ValidationError {
                    column_name,
                    column_value,
                    error_type: error_type.to_string(),
                    error_msg,
                };
                if samples.len() < 5 {
                    samples.push(json!({
                        "file_row_number": row_number,
                        "validation_errors": [error.as_json()],
                    }));
                }
                dlq.push(DlqEntry {
                    file_row_number: row_number,
                    record_data: json!({}),
                    validation_errors: vec![error],
                })
                .await?;
            },
        }
    }

    log.records_processed = Some(processed);
    log.validation_errors = Some(errors);

    // Threshold is evaluated once, at end of stream. Staged rows die with
    // the stage table; DLQ rows are committed because they document the
    // failure.
    let error_rate = if processed > 0 {
        errors as f64 / processed as f64
    } else {
        0.0
    };
    if error_rate > source.validation_error_threshold {
        dlq.commit().await?;
        log.processing.finish(false);
        recorder.update(log).await?;
        return Err(LoadError::ThresholdExceeded {
            rate: error_rate * 100.0,
            threshold: source.validation_error_threshold * 100.0,
            processed,
            errors,
            samples: serde_json::Value::Array(samples).to_string(),
        });
    }
    log.processing.finish(true);

    // STAGE_COMMIT.
    let staged = stage.commit().await?;
    dlq.commit().await?;
    log.records_staged = Some(staged);
    log.stage_load.finish(true);
    recorder.update(log).await?;
    tracing::info!(
        log_id = %log.id,
        file = %file_name,
        staged,
        dead_lettered = dlq.written(),
        "Staging committed"
    );

    // GRAIN_AUDIT then USER_AUDIT; the user audit never runs when the grain
    // gate fails.
    log.audit.start();
    if let Err(e) = audit::check_grain(&ctx.db, source, stage.table(), &file_name).await {
        log.audit.finish(false);
        recorder.update(log).await.ok();
        return Err(e);
    }
    if let Err(e) = audit::run_user_audit(&ctx.db, source, stage.table(), &file_name).await {
        log.audit.finish(false);
        recorder.update(log).await.ok();
        return Err(e);
    }
    log.audit.finish(true);

    if ctx.cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
    }

    // MERGE.
    log.merge.start();
    let outcome = match merge::merge_stage_to_target(&ctx.db, source, stage.table(), staged).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log.merge.finish(false);
            recorder.update(log).await.ok();
            return Err(e);
        },
    };
    log.target_inserts = Some(outcome.inserted);
    log.target_updates = Some(outcome.updated);
    log.merge.finish(true);
    recorder.update(log).await?;
    tracing::info!(
        log_id = %log.id,
        file = %file_name,
        inserted = outcome.inserted,
        updated = outcome.updated,
        "Merged stage into target"
    );

    // DLQ_CLEANUP: a successful rerun erases the file's older dead letters.
    dlq::delete_prior_entries(&ctx.db, &file_name, log.id, ctx.batch_size).await?;

    Ok(())
}

/// Terminal path for a file whose rows are already in the target.
async fn duplicate_terminal(
    ctx: &PipelineContext,
    source: &SourceConfig,
    path: &Path,
    recorder: &LogRecorder,
    log: &mut RunLog,
) -> PipelineOutcome {
    tracing::warn!(
        log_id = %log.id,
        file = %log.file_name,
        "File already processed, moving to duplicates directory"
    );

    if let Err(e) = move_to_duplicates(path, &ctx.duplicates_dir) {
        return failed_terminal(ctx, source, recorder, log, LoadError::Io(e)).await;
    }

    if let Err(e) = recorder.finish(log, RunStatus::DuplicateSkipped).await {
        return failed_terminal(ctx, source, recorder, log, e).await;
    }

    ctx.notifier
        .file_problem(FileProblem {
            file_name: log.file_name.clone(),
            error_kind: ErrorKind::DuplicateFile.as_str(),
            message: duplicate_file_message(&log.file_name, &source.table_name),
            log_id: Some(log.id),
            recipients: source.notification_recipients.clone(),
        })
        .await;

    PipelineOutcome {
        file_name: log.file_name.clone(),
        log_id: Some(log.id),
        status: RunStatus::DuplicateSkipped,
        error_kind: Some(ErrorKind::DuplicateFile),
        error_message: None,
    }
}

/// Terminal path for any failure: final log write first, notification after,
/// source file left in place.
async fn failed_terminal(
    ctx: &PipelineContext,
    source: &SourceConfig,
    recorder: &LogRecorder,
    log: &mut RunLog,
    error: LoadError,
) -> PipelineOutcome {
    let kind = error.kind();
    let message = error.to_string();
    log.error_kind = Some(kind);
    log.error_message = Some(message.clone());

    tracing::error!(
        log_id = %log.id,
        file = %log.file_name,
        error_kind = kind.as_str(),
        "Pipeline failed: {message}"
    );

    if let Err(e) = recorder.finish(log, RunStatus::Failed).await {
        tracing::error!(log_id = %log.id, error = %e, "Failed to finalize run log");
    }

    if kind.is_file_problem() {
        ctx.notifier
            .file_problem(FileProblem {
                file_name: log.file_name.clone(),
                error_kind: kind.as_str(),
                message: message.clone(),
                log_id: Some(log.id),
                recipients: source.notification_recipients.clone(),
            })
            .await;
    } else if kind != ErrorKind::Cancelled {
        ctx.notifier
            .internal_error(InternalProblem {
                message: message.clone(),
                file_name: Some(log.file_name.clone()),
                log_id: Some(log.id),
            })
            .await;
    }

    PipelineOutcome {
        file_name: log.file_name.clone(),
        log_id: Some(log.id),
        status: RunStatus::Failed,
        error_kind: Some(kind),
        error_message: Some(message),
    }
}

/// Move a duplicate delivery out of the watch directory, timestamping the
/// name when an earlier duplicate already sits there.
fn move_to_duplicates(path: &Path, duplicates_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(duplicates_dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let mut destination = duplicates_dir.join(file_name);

    if destination.exists() {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let (stem, suffix) = match file_name.split_once('.') {
            Some((stem, rest)) => (stem, format!(".{rest}")),
            None => (file_name, String::new()),
        };
        destination = duplicates_dir.join(format!("{stem}_{timestamp}{suffix}"));
    }

    match std::fs::rename(path, &destination) {
        Ok(()) => Ok(()),
        // Cross-device moves fall back to copy + remove.
        Err(_) => {
            std::fs::copy(path, &destination)?;
            std::fs::remove_file(path)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_to_duplicates_timestamps_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("watch");
        let dups = dir.path().join("dups");
        std::fs::create_dir_all(&watch).unwrap();

        let file = watch.join("widgets.csv");
        std::fs::write(&file, "id\n1\n").unwrap();
        move_to_duplicates(&file, &dups).unwrap();
        assert!(!file.exists());
        assert!(dups.join("widgets.csv").exists());

        std::fs::write(&file, "id\n2\n").unwrap();
        move_to_duplicates(&file, &dups).unwrap();
        let entries: Vec<_> = std::fs::read_dir(&dups).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }
}
