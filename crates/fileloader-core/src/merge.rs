//! Merge: publish stage rows into the target
//!
//! The WAP publish step. An idempotent upsert keyed on the grain runs in a
//! single transaction; matched rows update their non-grain columns, the
//! rest insert. Counters are measured against the target before the upsert
//! so re-runs of identical content report zero inserts and zero updates.
//!
//! The duplicate-file guard also lives here: it is the same
//! `source_filename` provenance the merge writes.

use chrono::Utc;
use fileloader_common::LoadError;

use crate::db::schema::{LOADED_AT_COL, ROW_DIGEST_COL, SOURCE_FILENAME_COL};
use crate::db::{bind_values, cell_to_i64, timed, with_retry, Db, RetryPolicy, SqlValue};
use crate::sources::SourceConfig;

/// Merge counters reported into the run log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: i64,
    pub updated: i64,
}

/// Early dedupe guard: has any row of this file already been published?
pub async fn file_already_loaded(
    db: &Db,
    source: &SourceConfig,
    file_name: &str,
) -> Result<bool, LoadError> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE {SOURCE_FILENAME_COL} = {} LIMIT 1",
        source.table_name,
        db.dialect().placeholder(1)
    );
    let binds = [SqlValue::Text(file_name.to_string())];

    let row = with_retry(RetryPolicy::default(), "duplicate file check", || async {
        db.fetch_optional("duplicate file check", &sql, &binds).await
    })
    .await?;
    Ok(row.is_some())
}

/// Upsert the stage table into the target, atomically.
pub async fn merge_stage_to_target(
    db: &Db,
    source: &SourceConfig,
    stage_table: &str,
    staged: i64,
) -> Result<MergeOutcome, LoadError> {
    let dialect = db.dialect();
    let target = source.table_name.as_str();

    let join_condition = source
        .grain
        .iter()
        .map(|g| format!("target.{g} = stage.{g}"))
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut insert_columns: Vec<String> = source.model.field_names().map(str::to_string).collect();
    insert_columns.push(ROW_DIGEST_COL.to_string());
    insert_columns.push(SOURCE_FILENAME_COL.to_string());

    let mut select_exprs = insert_columns.clone();
    insert_columns.push(LOADED_AT_COL.to_string());
    let now_iso = Utc::now().to_rfc3339();
    select_exprs.push(format!("'{now_iso}'"));

    let update_columns: Vec<String> = insert_columns
        .iter()
        .filter(|c| !source.grain.contains(c))
        .cloned()
        .collect();

    let matched_sql = format!(
        "SELECT COUNT(*) FROM {stage_table} AS stage \
         WHERE EXISTS (SELECT 1 FROM {target} AS target WHERE {join_condition})"
    );
    let changed_sql = format!(
        "SELECT COUNT(*) FROM {stage_table} AS stage \
         WHERE EXISTS (SELECT 1 FROM {target} AS target WHERE {join_condition} \
         AND target.{ROW_DIGEST_COL} <> stage.{ROW_DIGEST_COL})"
    );
    let upsert_sql = dialect.upsert_from_stage(
        target,
        stage_table,
        &insert_columns,
        &select_exprs,
        &source.grain,
        &update_columns,
    );

    with_retry(RetryPolicy::default(), "merge stage to target", || {
        let matched_sql = matched_sql.clone();
        let changed_sql = changed_sql.clone();
        let upsert_sql = upsert_sql.clone();
        async move {
            let mut tx = db
                .pool()
                .begin()
                .await
                .map_err(|e| crate::db::classify("begin merge", e))?;

            let matched_row = timed(
                db.statement_timeout(),
                "merge insert estimate",
                bind_values(sqlx::query(&matched_sql), &[]).fetch_one(&mut *tx),
            )
            .await?;
            let matched = cell_to_i64(&matched_row, 0).unwrap_or(0);

            let changed_row = timed(
                db.statement_timeout(),
                "merge update estimate",
                bind_values(sqlx::query(&changed_sql), &[]).fetch_one(&mut *tx),
            )
            .await?;
            let updated = cell_to_i64(&changed_row, 0).unwrap_or(0);

            timed(
                db.statement_timeout(),
                "merge upsert",
                bind_values(sqlx::query(&upsert_sql), &[]).execute(&mut *tx),
            )
            .await?;

            tx.commit()
                .await
                .map_err(|e| crate::db::classify("commit merge", e))?;

            Ok(MergeOutcome {
                inserted: staged - matched,
                updated,
            })
        }
    })
    .await
}
