//! Notification boundary
//!
//! Two channels, called once per terminal failure: file problems go to the
//! business recipients configured on the source (the data-team address is
//! always included), internal errors go to an operations webhook. Transport
//! beyond the webhook lives outside this crate; the trait is the seam.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

/// A problem with the file itself: missing columns, threshold exceeded,
/// failed audits, duplicate delivery.
#[derive(Debug, Clone)]
pub struct FileProblem {
    pub file_name: String,
    pub error_kind: &'static str,
    pub message: String,
    pub log_id: Option<Uuid>,
    pub recipients: Vec<String>,
}

/// A problem with the system: unreachable database, unhandled error.
#[derive(Debug, Clone)]
pub struct InternalProblem {
    pub message: String,
    pub file_name: Option<String>,
    pub log_id: Option<Uuid>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn file_problem(&self, problem: FileProblem);
    async fn internal_error(&self, problem: InternalProblem);
}

/// Production notifier: posts internal errors to a webhook and hands file
/// problems to the mail relay boundary (logged here with their recipient
/// list; the relay consumes the same structured payload).
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    data_team_address: Option<String>,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>, data_team_address: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
            data_team_address,
        }
    }

    fn full_recipients(&self, problem: &FileProblem) -> Vec<String> {
        let mut recipients = problem.recipients.clone();
        if let Some(team) = &self.data_team_address {
            if !recipients.iter().any(|r| r.eq_ignore_ascii_case(team)) {
                recipients.push(team.clone());
            }
        }
        recipients
    }

    async fn post(&self, text: String) {
        let Some(url) = &self.webhook_url else {
            tracing::warn!("Webhook url not configured, skipping internal notification");
            return;
        };

        let payload = json!({ "text": text });
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("Sent internal error notification");
            },
            Ok(response) => {
                tracing::error!(
                    status = %response.status(),
                    "Webhook rejected internal error notification"
                );
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to send internal error notification");
            },
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn file_problem(&self, problem: FileProblem) {
        let recipients = self.full_recipients(&problem);
        if recipients.is_empty() {
            tracing::warn!(
                file = %problem.file_name,
                "No recipients configured for file problem notification, skipping"
            );
            return;
        }

        // The structured payload is what the mail relay consumes; emitting it
        // here keeps the channel observable without owning SMTP.
        tracing::warn!(
            file = %problem.file_name,
            error_kind = problem.error_kind,
            log_id = ?problem.log_id,
            recipients = recipients.join(", "),
            "File problem notification: {}",
            problem.message
        );
    }

    async fn internal_error(&self, problem: InternalProblem) {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let mut lines = vec![
            "*Fileloader - Internal Processing Error*".to_string(),
            format!("*Timestamp:* {timestamp}"),
            format!("*Message:* {}", problem.message),
        ];
        if let Some(file) = &problem.file_name {
            lines.push(format!("• *File:* {file}"));
        }
        if let Some(log_id) = problem.log_id {
            lines.push(format!("• *Log ID:* {log_id}"));
        }
        self.post(lines.join("\n")).await;
    }
}

/// Builds the duplicate-file message with its reprocessing runbook.
pub fn duplicate_file_message(file_name: &str, table: &str) -> String {
    format!(
        "The file {file_name} has already been processed and has been moved to the duplicates directory.\n\n\
         To reprocess this file:\n\
         1. Remove existing records from {table} where source_filename = '{file_name}'\n\
         2. Move the file from the duplicates directory back into the watch directory"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_team_address_is_always_included() {
        let notifier = WebhookNotifier::new(None, Some("data-team@example.com".to_string()));
        let problem = FileProblem {
            file_name: "widgets.csv".to_string(),
            error_kind: "audit-failed",
            message: "boom".to_string(),
            log_id: None,
            recipients: vec!["owner@example.com".to_string()],
        };
        let recipients = notifier.full_recipients(&problem);
        assert_eq!(recipients.len(), 2);
        assert!(recipients.contains(&"data-team@example.com".to_string()));

        // No duplicate when the source already lists the team address.
        let problem = FileProblem {
            recipients: vec!["Data-Team@example.com".to_string()],
            ..problem
        };
        assert_eq!(notifier.full_recipients(&problem).len(), 1);
    }

    #[test]
    fn duplicate_message_carries_the_runbook() {
        let message = duplicate_file_message("widgets.csv", "widgets");
        assert!(message.contains("source_filename = 'widgets.csv'"));
        assert!(message.contains("duplicates directory"));
    }
}
