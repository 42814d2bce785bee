//! End-to-end pipeline tests over the SQLite dialect
//!
//! These exercise the same code path production uses (Any-driver pool,
//! runtime SQL, batched staging, audits, merge) against a file-backed
//! SQLite database with real watch/archive/duplicates directories.

mod common;

use common::{widgets_source, TestEnv};
use fileloader_core::db::SqlValue;
use fileloader_core::sources::{FieldSpec, RowModel, SemanticType, SourceConfig, SourceFormat};

fn stage_table_for(file_name: &str) -> String {
    fileloader_core::db::stage_table_name(
        fileloader_core::db::Dialect::Sqlite,
        file_name,
    )
}

#[tokio::test]
async fn clean_file_loads_into_target() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;
    env.write_file("widgets_ok.csv", "id,name\n1,a\n2,b\n3,c\n");

    let outcomes = env.run().await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].succeeded(), "{:?}", outcomes[0]);

    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 3);
    let names = env
        .strings("SELECT name FROM widgets ORDER BY id")
        .await;
    assert_eq!(names, vec!["a", "b", "c"]);

    let (status, processed, errors, staged, inserts, updates) =
        env.log_row("widgets_ok.csv").await;
    assert_eq!(status, "success");
    assert_eq!(processed, 3);
    assert_eq!(errors, 0);
    assert_eq!(staged, 3);
    assert_eq!(inserts, 3);
    assert_eq!(updates, 0);

    // Post-success invariants: stage gone, source gone, archive kept.
    assert!(!env.table_exists(&stage_table_for("widgets_ok.csv")).await);
    assert!(!env.watch.join("widgets_ok.csv").exists());
    assert!(env.archive.join("widgets_ok.csv").exists());
}

#[tokio::test]
async fn failing_rows_dead_letter_under_threshold() {
    // One bad row out of three stays under a 50% threshold.
    let env = TestEnv::new(vec![widgets_source(0.5)]).await;
    env.write_file("widgets_partial.csv", "id,name\n1,a\nx,b\n3,c\n");

    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded(), "{:?}", outcomes[0]);

    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 2);
    let names = env.strings("SELECT name FROM widgets ORDER BY id").await;
    assert_eq!(names, vec!["a", "c"]);

    let (status, processed, errors, staged, ..) = env.log_row("widgets_partial.csv").await;
    assert_eq!(status, "success");
    assert_eq!(processed, 3);
    assert_eq!(errors, 1);
    assert_eq!(staged, 2);

    // The dead letter points at the failing row with its parse error kind.
    assert_eq!(env.scalar("SELECT COUNT(*) FROM file_load_dlq").await, 1);
    assert_eq!(
        env.scalar("SELECT file_row_number FROM file_load_dlq").await,
        2
    );
    let errors_json = env
        .strings("SELECT validation_errors FROM file_load_dlq")
        .await;
    assert!(errors_json[0].contains("int_parsing"), "{}", errors_json[0]);

    // Every processed record landed exactly once: two published, one
    // dead-lettered, none in both.
    let dlq_rows = env
        .scalar("SELECT COUNT(DISTINCT file_row_number) FROM file_load_dlq")
        .await;
    let target_rows = env.scalar("SELECT COUNT(*) FROM widgets").await;
    assert_eq!(dlq_rows + target_rows, 3);
}

#[tokio::test]
async fn threshold_exceeded_discards_stage_but_keeps_dlq() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;
    env.write_file("widgets_overrun.csv", "id,name\n1,a\nx,b\ny,c\nz,d\n");

    let outcomes = env.run().await;
    assert!(!outcomes[0].succeeded());
    assert_eq!(
        outcomes[0].error_kind,
        Some(fileloader_core::ErrorKind::ThresholdExceeded)
    );

    // Target untouched, stage dropped, source file still in place.
    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 0);
    assert!(!env.table_exists(&stage_table_for("widgets_overrun.csv")).await);
    assert!(env.watch.join("widgets_overrun.csv").exists());

    // The three dead letters documenting the failure survive.
    assert_eq!(env.scalar("SELECT COUNT(*) FROM file_load_dlq").await, 3);

    let (status, processed, errors, ..) = env.log_row("widgets_overrun.csv").await;
    assert_eq!(status, "failed");
    assert_eq!(processed, 4);
    assert_eq!(errors, 3);

    // Threshold failures are business notifications.
    let problems = env.notifier.file_problems.lock().await;
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].error_kind, "threshold-exceeded");
}

#[tokio::test]
async fn threshold_exactly_met_still_succeeds() {
    // 1 error / 2 processed == 0.5 threshold: not exceeded.
    let env = TestEnv::new(vec![widgets_source(0.5)]).await;
    env.write_file("widgets_boundary.csv", "id,name\n1,a\nx,b\n");

    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded(), "{:?}", outcomes[0]);
    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 1);
}

#[tokio::test]
async fn duplicate_grain_fails_before_merge() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;
    env.write_file("widgets_dupkey.csv", "id,name\n1,a\n1,b\n");

    let outcomes = env.run().await;
    assert!(!outcomes[0].succeeded());
    assert_eq!(
        outcomes[0].error_kind,
        Some(fileloader_core::ErrorKind::GrainDuplicates)
    );

    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 0);
    assert!(!env.table_exists(&stage_table_for("widgets_dupkey.csv")).await);
    assert!(env.watch.join("widgets_dupkey.csv").exists());

    let problems = env.notifier.file_problems.lock().await;
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].error_kind, "grain-duplicates");
    assert!(problems[0].message.contains("duplicate_count"));
}

#[tokio::test]
async fn reprocessed_file_is_duplicate_skipped() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;
    env.write_file("widgets_ok.csv", "id,name\n1,a\n2,b\n3,c\n");

    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded());

    // Operator restores the archived copy into the watch directory.
    std::fs::copy(
        env.archive.join("widgets_ok.csv"),
        env.watch.join("widgets_ok.csv"),
    )
    .unwrap();

    let outcomes = env.run().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, fileloader_core::runlog::RunStatus::DuplicateSkipped);

    // File moved out of watch into duplicates; target unchanged.
    assert!(!env.watch.join("widgets_ok.csv").exists());
    assert!(env.duplicates.join("widgets_ok.csv").exists());
    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 3);

    let (status, ..) = env.log_row("widgets_ok.csv").await;
    assert_eq!(status, "duplicate-skipped");

    let problems = env.notifier.file_problems.lock().await;
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].error_kind, "duplicate-file");
    assert!(problems[0].message.contains("already been processed"));
}

#[tokio::test]
async fn merge_by_grain_is_idempotent_and_counts_updates() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;

    env.write_file("widgets_first.csv", "id,name\n1,a\n2,b\n");
    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded());
    let (_, _, _, _, inserts, updates) = env.log_row("widgets_first.csv").await;
    assert_eq!((inserts, updates), (2, 0));

    // Same grain from a second file: row 1 identical, row 2 changed.
    env.write_file("widgets_second.csv", "id,name\n1,a\n2,x\n");
    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded());

    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 2);
    let names = env.strings("SELECT name FROM widgets ORDER BY id").await;
    assert_eq!(names, vec!["a", "x"]);

    let (_, _, _, _, inserts, updates) = env.log_row("widgets_second.csv").await;
    assert_eq!(inserts, 0);
    // Only the row whose content actually changed counts as an update.
    assert_eq!(updates, 1);
}

#[tokio::test]
async fn successful_rerun_purges_prior_dead_letters() {
    let env = TestEnv::new(vec![widgets_source(0.5)]).await;
    env.write_file("widgets_partial.csv", "id,name\n1,a\nx,b\n3,c\n");
    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded());
    assert_eq!(env.scalar("SELECT COUNT(*) FROM file_load_dlq").await, 1);
    let first_log_id = env
        .strings("SELECT file_load_log_id FROM file_load_dlq")
        .await;

    // Runbook: remove the file's rows from the target, then restore the
    // archive copy into the watch directory.
    env.db
        .execute(
            "test purge",
            "DELETE FROM widgets WHERE source_filename = ?",
            &[SqlValue::Text("widgets_partial.csv".to_string())],
        )
        .await
        .unwrap();
    std::fs::copy(
        env.archive.join("widgets_partial.csv"),
        env.watch.join("widgets_partial.csv"),
    )
    .unwrap();

    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded(), "{:?}", outcomes[0]);

    // The rerun dead-letters its own failing row and deletes the old one.
    assert_eq!(env.scalar("SELECT COUNT(*) FROM file_load_dlq").await, 1);
    let second_log_id = env
        .strings("SELECT file_load_log_id FROM file_load_dlq")
        .await;
    assert_ne!(first_log_id, second_log_id);
}

#[tokio::test]
async fn empty_file_after_header_succeeds_with_zero_counts() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;
    env.write_file("widgets_empty.csv", "id,name\n");

    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded(), "{:?}", outcomes[0]);

    let (status, processed, errors, staged, inserts, _) =
        env.log_row("widgets_empty.csv").await;
    assert_eq!(status, "success");
    assert_eq!((processed, errors, staged, inserts), (0, 0, 0, 0));
    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 0);
}

#[tokio::test]
async fn headerless_file_fails_with_missing_header() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;
    env.write_file("widgets_blank.csv", "");

    let outcomes = env.run().await;
    assert!(!outcomes[0].succeeded());
    assert_eq!(
        outcomes[0].error_kind,
        Some(fileloader_core::ErrorKind::MissingHeader)
    );
    assert!(env.watch.join("widgets_blank.csv").exists());
}

#[tokio::test]
async fn missing_columns_fail_before_staging() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;
    env.write_file("widgets_wrong.csv", "id,label\n1,a\n");

    let outcomes = env.run().await;
    assert!(!outcomes[0].succeeded());
    assert_eq!(
        outcomes[0].error_kind,
        Some(fileloader_core::ErrorKind::MissingColumns)
    );
    assert!(!env.table_exists(&stage_table_for("widgets_wrong.csv")).await);

    let problems = env.notifier.file_problems.lock().await;
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].error_kind, "missing-columns");
    assert!(problems[0].message.contains("name"));
}

#[tokio::test]
async fn failing_user_audit_blocks_the_merge() {
    let mut source = widgets_source(0.1);
    source.audit_query = Some(
        "SELECT CASE WHEN COUNT(*) > 5 THEN 1 ELSE 0 END AS enough_rows, \
         CASE WHEN COUNT(DISTINCT name) > 0 THEN 1 ELSE 0 END AS has_names \
         FROM {table}"
            .to_string(),
    );
    let env = TestEnv::new(vec![source]).await;
    env.write_file("widgets_audited.csv", "id,name\n1,a\n2,b\n");

    let outcomes = env.run().await;
    assert!(!outcomes[0].succeeded());
    assert_eq!(
        outcomes[0].error_kind,
        Some(fileloader_core::ErrorKind::AuditFailed)
    );
    assert!(outcomes[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("enough_rows"));
    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 0);
}

#[tokio::test]
async fn passing_user_audit_lets_the_merge_through() {
    let mut source = widgets_source(0.1);
    source.audit_query = Some(
        "SELECT CASE WHEN COUNT(*) > 0 THEN 1 ELSE 0 END AS has_rows FROM {table}".to_string(),
    );
    let env = TestEnv::new(vec![source]).await;
    env.write_file("widgets_audited.csv", "id,name\n1,a\n2,b\n");

    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded(), "{:?}", outcomes[0]);
    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 2);
}

#[tokio::test]
async fn concurrent_files_isolate_failures() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;

    // Eight clean files plus two with a missing required column.
    for i in 0..8 {
        env.write_file(
            &format!("widgets_good_{i}.csv"),
            &format!("id,name\n{},a{i}\n{},b{i}\n", i * 2 + 1, i * 2 + 2),
        );
    }
    env.write_file("widgets_bad_0.csv", "id,label\n97,a\n");
    env.write_file("widgets_bad_1.csv", "id,label\n98,a\n");

    let outcomes = env.run().await;
    assert_eq!(outcomes.len(), 10);
    assert_eq!(outcomes.iter().filter(|o| o.succeeded()).count(), 8);

    // Sixteen rows from the good files, nothing from the bad ones.
    assert_eq!(env.scalar("SELECT COUNT(*) FROM widgets").await, 16);

    // One terminal log row per discovered file.
    assert_eq!(env.scalar("SELECT COUNT(*) FROM file_load_log").await, 10);
    assert_eq!(
        env.scalar("SELECT COUNT(*) FROM file_load_log WHERE status = 'success'").await,
        8
    );
    assert_eq!(
        env.scalar("SELECT COUNT(*) FROM file_load_log WHERE status = 'failed'").await,
        2
    );
    assert_eq!(
        env.scalar("SELECT COUNT(*) FROM file_load_log WHERE status = 'pending'").await,
        0
    );
}

#[tokio::test]
async fn json_files_flow_through_the_same_pipeline() {
    let source = SourceConfig {
        name: "gadgets".to_string(),
        file_pattern: "gadgets*.json".to_string(),
        model: RowModel::new(vec![
            FieldSpec::new("id", SemanticType::Integer),
            FieldSpec::new("name", SemanticType::Text),
            FieldSpec::new("price", SemanticType::Float).optional(),
        ]),
        table_name: "gadgets".to_string(),
        grain: vec!["id".to_string()],
        audit_query: None,
        validation_error_threshold: 0.0,
        notification_recipients: vec![],
        format: SourceFormat::Json {
            array_path: None,
            skip_rows: 0,
        },
    };
    let env = TestEnv::new(vec![source]).await;
    env.write_file(
        "gadgets_1.json",
        r#"[{"id": 1, "name": "a", "price": 9.5}, {"id": 2, "name": "b", "price": null}]"#,
    );

    let outcomes = env.run().await;
    assert!(outcomes[0].succeeded(), "{:?}", outcomes[0]);
    assert_eq!(env.scalar("SELECT COUNT(*) FROM gadgets").await, 2);
    let (status, processed, _, staged, inserts, _) = env.log_row("gadgets_1.json").await;
    assert_eq!(status, "success");
    assert_eq!((processed, staged, inserts), (2, 2, 2));
}

#[tokio::test]
async fn unmatched_files_are_left_alone() {
    let env = TestEnv::new(vec![widgets_source(0.1)]).await;
    env.write_file("orders_2024.csv", "id\n1\n");

    let outcomes = env.run().await;
    assert!(outcomes.is_empty());
    assert!(env.watch.join("orders_2024.csv").exists());
    assert_eq!(env.scalar("SELECT COUNT(*) FROM file_load_log").await, 0);
}
