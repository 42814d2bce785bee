//! Schema management
//!
//! Creates the persistent tables at startup (targets for every registered
//! source, the run log, the dead-letter queue) and the ephemeral per-file
//! stage tables. All DDL is create-if-not-exists so restarts are cheap.

use fileloader_common::LoadError;

use super::dialect::{sanitize_identifier, Dialect};
use super::Db;
use crate::sources::{SourceConfig, SourceRegistry};

/// Provenance column added to every target and stage table.
pub const SOURCE_FILENAME_COL: &str = "source_filename";
/// Row digest column used to count real updates during the merge.
pub const ROW_DIGEST_COL: &str = "row_digest";
/// 1-based source row index, stage tables only.
pub const FILE_ROW_NUMBER_COL: &str = "file_row_number";
/// Merge timestamp column on target tables.
pub const LOADED_AT_COL: &str = "etl_loaded_at";

pub const LOG_TABLE: &str = "file_load_log";
pub const DLQ_TABLE: &str = "file_load_dlq";

/// Create target tables, the run log, and the DLQ, with their indexes.
pub async fn ensure_tables(db: &Db, registry: &SourceRegistry) -> Result<(), LoadError> {
    create_log_table(db).await?;
    create_dlq_table(db).await?;

    for source in registry.iter() {
        create_target_table(db, source).await?;
    }

    tracing::info!(sources = registry.len(), "Database schema ensured");
    Ok(())
}

async fn create_target_table(db: &Db, source: &SourceConfig) -> Result<(), LoadError> {
    let dialect = db.dialect();
    let mut columns: Vec<String> = source
        .model
        .fields
        .iter()
        .map(|f| {
            let null = if f.required { " NOT NULL" } else { "" };
            format!("{} {}{null}", f.name, dialect.column_type(f.semantic_type))
        })
        .collect();
    columns.push(format!("{ROW_DIGEST_COL} {}", text_type(dialect)));
    columns.push(format!("{SOURCE_FILENAME_COL} {}", text_type(dialect)));
    columns.push(format!("{LOADED_AT_COL} {}", text_type(dialect)));

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        source.table_name,
        columns.join(", ")
    );
    db.execute("create target table", &sql, &[]).await?;

    // The merge upserts against this uniqueness; the dedupe check and purge
    // path lean on the filename index.
    create_index(
        db,
        &index_name(dialect, "uq", &source.table_name, "grain"),
        &source.table_name,
        &source.grain.join(", "),
        true,
    )
    .await?;
    create_index(
        db,
        &index_name(dialect, "ix", &source.table_name, SOURCE_FILENAME_COL),
        &source.table_name,
        SOURCE_FILENAME_COL,
        false,
    )
    .await?;

    Ok(())
}

async fn create_log_table(db: &Db) -> Result<(), LoadError> {
    let dialect = db.dialect();
    let text = text_type(dialect);
    let long = dialect.long_text_type();

    let phase_columns: String = ["archive_copy", "processing", "stage_load", "audit", "merge"]
        .iter()
        .map(|phase| {
            format!(
                "{phase}_started_at {text}, {phase}_ended_at {text}, {phase}_success BOOLEAN, "
            )
        })
        .collect();

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {LOG_TABLE} (\
         id {text} PRIMARY KEY, \
         file_name {text} NOT NULL, \
         source_name {text}, \
         target_table {text}, \
         status {text} NOT NULL, \
         started_at {text} NOT NULL, \
         ended_at {text}, \
         {phase_columns}\
         records_processed BIGINT, \
         validation_errors BIGINT, \
         records_staged BIGINT, \
         target_inserts BIGINT, \
         target_updates BIGINT, \
         error_kind {text}, \
         error_message {long})"
    );
    db.execute("create log table", &sql, &[]).await
        .map(|_| ())
}

async fn create_dlq_table(db: &Db) -> Result<(), LoadError> {
    let dialect = db.dialect();
    let text = text_type(dialect);
    let long = dialect.long_text_type();

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {DLQ_TABLE} (\
         id {text} PRIMARY KEY, \
         {SOURCE_FILENAME_COL} {text} NOT NULL, \
         {FILE_ROW_NUMBER_COL} BIGINT NOT NULL, \
         record_data {long}, \
         validation_errors {long}, \
         file_load_log_id {text} NOT NULL, \
         target_table_name {text}, \
         failed_at {text} NOT NULL)"
    );
    db.execute("create dlq table", &sql, &[]).await?;

    create_index(
        db,
        &index_name(dialect, "ix", DLQ_TABLE, "log_id"),
        DLQ_TABLE,
        "file_load_log_id",
        false,
    )
    .await?;
    create_index(
        db,
        &index_name(dialect, "ix", DLQ_TABLE, SOURCE_FILENAME_COL),
        DLQ_TABLE,
        SOURCE_FILENAME_COL,
        false,
    )
    .await?;

    Ok(())
}

/// Create the stage table for one file: target columns plus the row number,
/// no indexes. Returns the column list in insert order.
pub async fn create_stage_table(
    db: &Db,
    source: &SourceConfig,
    stage_table: &str,
) -> Result<Vec<String>, LoadError> {
    let dialect = db.dialect();
    let mut columns: Vec<String> = source
        .model
        .fields
        .iter()
        .map(|f| format!("{} {}", f.name, dialect.column_type(f.semantic_type)))
        .collect();
    columns.push(format!("{ROW_DIGEST_COL} {}", text_type(dialect)));
    columns.push(format!("{SOURCE_FILENAME_COL} {}", text_type(dialect)));
    columns.push(format!("{FILE_ROW_NUMBER_COL} BIGINT"));

    // A stale stage table from a crashed run must not poison this one.
    drop_stage_table(db, stage_table).await?;

    let sql = format!(
        "CREATE TABLE {stage_table} ({})",
        columns.join(", ")
    );
    db.execute("create stage table", &sql, &[]).await?;

    let mut names: Vec<String> = source.model.field_names().map(str::to_string).collect();
    names.push(ROW_DIGEST_COL.to_string());
    names.push(SOURCE_FILENAME_COL.to_string());
    names.push(FILE_ROW_NUMBER_COL.to_string());
    Ok(names)
}

pub async fn drop_stage_table(db: &Db, stage_table: &str) -> Result<(), LoadError> {
    let sql = format!("DROP TABLE IF EXISTS {stage_table}");
    db.execute("drop stage table", &sql, &[]).await.map(|_| ())
}

async fn create_index(
    db: &Db,
    name: &str,
    table: &str,
    columns: &str,
    unique: bool,
) -> Result<(), LoadError> {
    let unique_kw = if unique { "UNIQUE " } else { "" };
    let sql = match db.dialect() {
        // MySQL has no CREATE INDEX IF NOT EXISTS; the duplicate-name error
        // is swallowed below instead.
        Dialect::MySql => format!("CREATE {unique_kw}INDEX {name} ON {table} ({columns})"),
        _ => format!("CREATE {unique_kw}INDEX IF NOT EXISTS {name} ON {table} ({columns})"),
    };

    match db.execute("create index", &sql, &[]).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let message = e.to_string().to_lowercase();
            if message.contains("duplicate key name") || message.contains("already exists") {
                Ok(())
            } else {
                Err(e)
            }
        },
    }
}

fn index_name(dialect: Dialect, prefix: &str, table: &str, suffix: &str) -> String {
    let mut name = format!("{prefix}_{}_{}", sanitize_identifier(table), sanitize_identifier(suffix));
    name.truncate(dialect.max_identifier_len());
    name
}

fn text_type(dialect: Dialect) -> &'static str {
    dialect.column_type(crate::sources::SemanticType::Text)
}
