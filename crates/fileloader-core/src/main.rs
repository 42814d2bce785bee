//! Fileloader - tabular file ingestion engine

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fileloader_common::logging::{init_logging, LogConfig, LogLevel};
use fileloader_core::config::Config;
use fileloader_core::db::{schema, Db};
use fileloader_core::notify::{InternalProblem, Notifier, WebhookNotifier};
use fileloader_core::pipeline::PipelineContext;
use fileloader_core::scheduler::Scheduler;
use fileloader_core::sources::SourceRegistry;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fileloader")]
#[command(author, version, about = "Directory-watching tabular file loader")]
struct Cli {
    /// Override the source definitions file
    #[arg(long)]
    sources: Option<std::path::PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env().unwrap_or_default();
    let log_config = if cli.verbose {
        log_config.with_level(LogLevel::Debug)
    } else {
        log_config
    };
    init_logging(&log_config)?;

    let mut config = Config::load()?;
    if let Some(sources) = cli.sources {
        config.paths.sources_path = sources;
    }

    info!(env = config.env_state.as_str(), "Starting fileloader");

    let registry = Arc::new(
        SourceRegistry::from_json_file(&config.paths.sources_path)
            .context("Failed to load source definitions")?,
    );

    let db = Db::connect(
        &config.database.url,
        config.database.max_connections,
        config.database.acquire_timeout,
        config.database.statement_timeout,
    )
    .await
    .context("Failed to connect database pool")?;

    schema::ensure_tables(&db, &registry)
        .await
        .context("Failed to create tables")?;

    tokio::fs::create_dir_all(&config.paths.archive_dir).await?;
    tokio::fs::create_dir_all(&config.paths.duplicates_dir).await?;

    let notifier = Arc::new(WebhookNotifier::new(
        config.notify.webhook_url.clone(),
        config.notify.data_team_address.clone(),
    ));

    // Ctrl-C stops new pipelines and cancels running ones at their next
    // I/O boundary.
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Shutdown signal received, cancelling pipelines");
            shutdown.cancel();
        }
    });

    let ctx = Arc::new(PipelineContext {
        db,
        batch_size: config.batch_size,
        archive_dir: config.paths.archive_dir.clone(),
        duplicates_dir: config.paths.duplicates_dir.clone(),
        notifier: notifier.clone(),
        cancel,
    });

    let scheduler = Scheduler::new(
        ctx,
        registry,
        config.paths.watch_dir.clone(),
        config.workers,
    );

    let outcomes = match scheduler.run().await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            notifier
                .internal_error(InternalProblem {
                    message: e.to_string(),
                    file_name: None,
                    log_id: None,
                })
                .await;
            return Err(e.into());
        },
    };

    // File problems were already notified per pipeline; a run summary of
    // code failures goes to the internal channel.
    let code_failures: Vec<_> = outcomes
        .iter()
        .filter(|o| {
            !o.succeeded() && !o.error_kind.map(|k| k.is_file_problem()).unwrap_or(false)
        })
        .collect();

    if !code_failures.is_empty() {
        let details: Vec<String> = code_failures
            .iter()
            .map(|o| {
                let mut line = format!("• {}", o.file_name);
                if let Some(id) = o.log_id {
                    line.push_str(&format!(" (log_id: {id})"));
                }
                if let Some(kind) = o.error_kind {
                    line.push_str(&format!(": {kind}"));
                }
                if let Some(message) = &o.error_message {
                    let mut message = message.clone();
                    if message.len() > 200 {
                        message.truncate(200);
                        message.push_str("...");
                    }
                    line.push_str(&format!(" - {message}"));
                }
                line
            })
            .collect();

        notifier
            .internal_error(InternalProblem {
                message: format!(
                    "File processing completed with {} failure(s) out of {} file(s).\n\nFailed files:\n{}",
                    code_failures.len(),
                    outcomes.len(),
                    details.join("\n")
                ),
                file_name: None,
                log_id: None,
            })
            .await;
    }

    info!("Processing complete");
    Ok(())
}
