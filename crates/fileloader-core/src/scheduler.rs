//! Scheduler
//!
//! Discovers loadable files in the watch directory and runs one pipeline
//! per file on a bounded worker pool. Pipelines are isolated: a panic or
//! error in one file never touches another. The scheduler returns once
//! every discovered file has reached a terminal state.

use std::path::PathBuf;
use std::sync::Arc;

use fileloader_common::{ErrorKind, LoadError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::notify::InternalProblem;
use crate::pipeline::{self, PipelineContext, PipelineOutcome};
use crate::readers;
use crate::runlog::RunStatus;
use crate::sources::SourceRegistry;

pub struct Scheduler {
    ctx: Arc<PipelineContext>,
    registry: Arc<SourceRegistry>,
    watch_dir: PathBuf,
    workers: usize,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<PipelineContext>,
        registry: Arc<SourceRegistry>,
        watch_dir: PathBuf,
        workers: usize,
    ) -> Self {
        Self {
            ctx,
            registry,
            watch_dir,
            workers,
        }
    }

    /// One polling pass over the watch directory. Hidden files and
    /// unsupported extensions are excluded before discovery, so they get no
    /// run-log row. Order is filesystem-defined and not part of the
    /// contract.
    pub fn discover(&self) -> Result<Vec<PathBuf>, LoadError> {
        if !self.watch_dir.is_dir() {
            return Err(LoadError::Config(format!(
                "watch directory {} does not exist or is not a directory",
                self.watch_dir.display()
            )));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.watch_dir)? {
            let entry = entry?;
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if path.is_file() && !hidden && readers::supported_path(&path) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Run pipelines for every discovered file and wait for all terminals.
    pub async fn run(&self) -> Result<Vec<PipelineOutcome>, LoadError> {
        let files = self.discover()?;
        if files.is_empty() {
            tracing::warn!(dir = %self.watch_dir.display(), "No files found in watch directory");
            return Ok(Vec::new());
        }

        tracing::info!(
            files = files.len(),
            workers = self.workers,
            "Starting file pipelines"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<PipelineOutcome> = JoinSet::new();

        for path in files {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            let Some(source) = self.registry.match_file(&file_name) else {
                tracing::warn!(file = %file_name, "No source configuration matches file, skipping");
                continue;
            };
            let source = Arc::new(source.clone());
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                // The semaphore lives as long as the scheduler; it is never
                // closed while tasks run.
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                pipeline::run_file(ctx, source, path).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => {
                    // A panicking pipeline is isolated to its own file; the
                    // run is recorded as an unhandled internal failure.
                    tracing::error!(error = %join_error, "File pipeline panicked");
                    self.ctx
                        .notifier
                        .internal_error(InternalProblem {
                            message: format!("file pipeline panicked: {join_error}"),
                            file_name: None,
                            log_id: None,
                        })
                        .await;
                    outcomes.push(PipelineOutcome {
                        file_name: String::new(),
                        log_id: None,
                        status: RunStatus::Failed,
                        error_kind: Some(ErrorKind::Io),
                        error_message: Some(join_error.to_string()),
                    });
                },
            }
        }

        let successful = outcomes.iter().filter(|o| o.succeeded()).count();
        tracing::info!(
            processed = outcomes.len(),
            successful,
            failed = outcomes.len() - successful,
            "All file pipelines terminal"
        );

        Ok(outcomes)
    }
}
