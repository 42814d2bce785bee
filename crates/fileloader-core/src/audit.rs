//! Stage auditing
//!
//! Two read-only gates run after the staging commit: grain uniqueness, then
//! the source's audit query. The user audit never runs when the grain gate
//! fails, and both leave the stage table untouched.

use fileloader_common::LoadError;
use sqlx::{Column, Row};

use crate::db::{cell_to_i64, cell_to_string, with_retry, Db, RetryPolicy};
use crate::sources::SourceConfig;

/// Gate 1: every grain tuple in the stage table must be unique.
pub async fn check_grain(
    db: &Db,
    source: &SourceConfig,
    stage_table: &str,
    file_name: &str,
) -> Result<(), LoadError> {
    let grain_cols = source.grain.join(", ");
    let count_sql = format!(
        "SELECT COUNT(*) - (SELECT COUNT(*) FROM (SELECT DISTINCT {grain_cols} FROM {stage_table}) AS distinct_grains) \
         FROM {stage_table}"
    );

    let row = with_retry(RetryPolicy::default(), "grain audit", || async {
        db.fetch_one("grain audit", &count_sql, &[]).await
    })
    .await?;
    let duplicates = cell_to_i64(&row, 0).unwrap_or(0);

    if duplicates == 0 {
        return Ok(());
    }

    // Collect a few offending grain tuples for the failure message, with
    // their source-file column names so the file's owner can find them.
    let examples_sql = format!(
        "SELECT {grain_cols}, COUNT(*) AS duplicate_count FROM {stage_table} \
         GROUP BY {grain_cols} HAVING COUNT(*) > 1 LIMIT 5"
    );
    let rows = db
        .fetch_all("grain audit examples", &examples_sql, &[])
        .await
        .unwrap_or_default();

    let mut examples = Vec::new();
    for row in &rows {
        let mut parts: Vec<String> = source
            .grain
            .iter()
            .enumerate()
            .map(|(i, field)| format!("{}: {}", source.model.alias_of(field), cell_to_string(row, i)))
            .collect();
        parts.push(format!(
            "duplicate_count: {}",
            cell_to_i64(row, source.grain.len()).unwrap_or(0)
        ));
        examples.push(format!("  - {}", parts.join(", ")));
    }

    let grain_aliases: Vec<&str> = source.grain.iter().map(|g| source.model.alias_of(g)).collect();

    Err(LoadError::GrainDuplicates {
        file: file_name.to_string(),
        table: stage_table.to_string(),
        grain: grain_aliases.join(", "),
        duplicates,
        examples: examples.join("\n"),
    })
}

/// Gate 2: run the source's audit query against the stage table. The query
/// must return exactly one row whose columns all read as integer 1.
pub async fn run_user_audit(
    db: &Db,
    source: &SourceConfig,
    stage_table: &str,
    file_name: &str,
) -> Result<(), LoadError> {
    let Some(template) = &source.audit_query else {
        return Ok(());
    };
    let audit_sql = template.replace("{table}", stage_table).trim().to_string();

    let rows = with_retry(RetryPolicy::default(), "user audit", || async {
        db.fetch_all("user audit", &audit_sql, &[]).await
    })
    .await?;

    if rows.len() != 1 {
        return Err(LoadError::AuditFailed {
            file: file_name.to_string(),
            table: stage_table.to_string(),
            failed: vec![format!("audit query returned {} rows, expected 1", rows.len())],
        });
    }

    let row = &rows[0];
    let mut failed = Vec::new();
    for (index, column) in row.columns().iter().enumerate() {
        match cell_to_i64(row, index) {
            Some(1) => {},
            Some(0) => failed.push(column.name().to_string()),
            _ => failed.push(format!("{} (not a 0/1 value)", column.name())),
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(LoadError::AuditFailed {
            file: file_name.to_string(),
            table: stage_table.to_string(),
            failed,
        })
    }
}
