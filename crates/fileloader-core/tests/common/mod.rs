//! Shared harness for end-to-end pipeline tests
//!
//! Each test gets its own temp directory tree (watch/archive/duplicates), a
//! file-backed SQLite database reached through the same `Any`-driver code
//! path production uses, and a recording notifier to assert on channel
//! routing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fileloader_core::db::{schema, Db, SqlValue};
use fileloader_core::notify::{FileProblem, InternalProblem, Notifier};
use fileloader_core::pipeline::{PipelineContext, PipelineOutcome};
use fileloader_core::scheduler::Scheduler;
use fileloader_core::sources::{
    FieldSpec, RowModel, SemanticType, SourceConfig, SourceFormat, SourceRegistry,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Notifier that records every call for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub file_problems: Mutex<Vec<FileProblem>>,
    pub internal_errors: Mutex<Vec<InternalProblem>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn file_problem(&self, problem: FileProblem) {
        self.file_problems.lock().await.push(problem);
    }

    async fn internal_error(&self, problem: InternalProblem) {
        self.internal_errors.lock().await.push(problem);
    }
}

pub struct TestEnv {
    _dir: tempfile::TempDir,
    pub watch: PathBuf,
    pub archive: PathBuf,
    pub duplicates: PathBuf,
    pub db: Db,
    pub registry: Arc<SourceRegistry>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: Arc<PipelineContext>,
    workers: usize,
}

impl TestEnv {
    pub async fn new(sources: Vec<SourceConfig>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let watch = dir.path().join("watch");
        let archive = dir.path().join("archive");
        let duplicates = dir.path().join("duplicates");
        std::fs::create_dir_all(&watch).unwrap();
        std::fs::create_dir_all(&archive).unwrap();
        std::fs::create_dir_all(&duplicates).unwrap();

        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("fileloader_test.db").display()
        );
        let db = Db::connect(&url, 5, Duration::from_secs(10), Duration::from_secs(30))
            .await
            .expect("connect test database");

        let registry = Arc::new(SourceRegistry::new(sources).expect("valid sources"));
        schema::ensure_tables(&db, &registry).await.expect("ensure tables");

        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = Arc::new(PipelineContext {
            db: db.clone(),
            batch_size: 100,
            archive_dir: archive.clone(),
            duplicates_dir: duplicates.clone(),
            notifier: notifier.clone(),
            cancel: CancellationToken::new(),
        });

        Self {
            _dir: dir,
            watch,
            archive,
            duplicates,
            db,
            registry,
            notifier,
            ctx,
            workers: 4,
        }
    }

    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.watch.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// One scheduler pass over the watch directory.
    pub async fn run(&self) -> Vec<PipelineOutcome> {
        Scheduler::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.registry),
            self.watch.clone(),
            self.workers,
        )
        .run()
        .await
        .expect("scheduler run")
    }

    pub async fn scalar(&self, sql: &str) -> i64 {
        let row = self.db.fetch_one("test scalar", sql, &[]).await.expect(sql);
        fileloader_core::db::cell_to_i64(&row, 0).unwrap_or_default()
    }

    pub async fn scalar_bound(&self, sql: &str, binds: &[SqlValue]) -> i64 {
        let row = self
            .db
            .fetch_one("test scalar", sql, binds)
            .await
            .expect(sql);
        fileloader_core::db::cell_to_i64(&row, 0).unwrap_or_default()
    }

    pub async fn strings(&self, sql: &str) -> Vec<String> {
        self.db
            .fetch_all("test strings", sql, &[])
            .await
            .expect(sql)
            .iter()
            .map(|row| fileloader_core::db::cell_to_string(row, 0))
            .collect()
    }

    /// Whether a table exists in the SQLite catalog (stage-table checks).
    pub async fn table_exists(&self, name: &str) -> bool {
        let count = self
            .scalar_bound(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                &[SqlValue::Text(name.to_string())],
            )
            .await;
        count > 0
    }

    /// Run-log row for a file as (status, processed, errors, staged,
    /// inserts, updates).
    pub async fn log_row(&self, file_name: &str) -> (String, i64, i64, i64, i64, i64) {
        let row = self
            .db
            .fetch_one(
                "test log row",
                "SELECT status, records_processed, validation_errors, records_staged, \
                 target_inserts, target_updates \
                 FROM file_load_log WHERE file_name = ? ORDER BY started_at DESC LIMIT 1",
                &[SqlValue::Text(file_name.to_string())],
            )
            .await
            .expect("log row");
        (
            fileloader_core::db::cell_to_string(&row, 0),
            fileloader_core::db::cell_to_i64(&row, 1).unwrap_or_default(),
            fileloader_core::db::cell_to_i64(&row, 2).unwrap_or_default(),
            fileloader_core::db::cell_to_i64(&row, 3).unwrap_or_default(),
            fileloader_core::db::cell_to_i64(&row, 4).unwrap_or_default(),
            fileloader_core::db::cell_to_i64(&row, 5).unwrap_or_default(),
        )
    }
}

/// The widgets source used across scenarios: grain `[id]`, target
/// `widgets(id BIGINT, name TEXT)`.
pub fn widgets_source(threshold: f64) -> SourceConfig {
    SourceConfig {
        name: "widgets".to_string(),
        file_pattern: "widgets*.csv".to_string(),
        model: RowModel::new(vec![
            FieldSpec::new("id", SemanticType::Integer),
            FieldSpec::new("name", SemanticType::Text),
        ]),
        table_name: "widgets".to_string(),
        grain: vec!["id".to_string()],
        audit_query: None,
        validation_error_threshold: threshold,
        notification_recipients: vec!["owner@example.com".to_string()],
        format: SourceFormat::Delimited {
            delimiter: ',',
            encoding: "utf-8".to_string(),
            skip_rows: 0,
        },
    }
}
