//! Error/ticket correlation.
//!
//! Turns ingested error reports into tickets: one critical ticket per critical
//! report, and one recurring-issue ticket per (client, kind) per window once a
//! kind shows up more often than the configured threshold.

use std::fmt::Write as _;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use shared::types::{ErrorKind, ErrorReport};
use uuid::Uuid;
use crate::clock::Clock;
use crate::config::CorrelationConfig;
use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::model::{CommentAuthor, Ticket, TicketPriority};
use crate::store_manager::StoreHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// What correlating one report did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Correlation {
    pub created: Vec<Uuid>,
    pub commented: Option<Uuid>,
}

pub struct CorrelationEngine {
    store: StoreHandle,
    config: CorrelationConfig,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks<Uuid>,
}

impl CorrelationEngine {
    pub fn new(store: StoreHandle, config: CorrelationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    pub fn classify(&self, report: &ErrorReport) -> Severity {
        match report.kind {
            ErrorKind::Fatal | ErrorKind::Parse | ErrorKind::Core => Severity::Critical,
            ErrorKind::Warning | ErrorKind::Notice | ErrorKind::Deprecated => Severity::Warning,
            ErrorKind::Http => self.config.http_severity,
            ErrorKind::Database => self.config.database_severity,
        }
    }

    /// Correlate a report that is already in the error log
    pub async fn correlate(&self, client_id: Uuid, client_name: &str, report: &ErrorReport) -> Result<Correlation> {
        let severity = self.classify(report);
        if severity == Severity::Info {
            tracing::debug!(client_id = %client_id, kind = report.kind.as_str(), "Informational report, not correlated");
            return Ok(Correlation::default());
        }

        let _guard = self.locks.lock(&client_id).await;
        let mut outcome = Correlation::default();

        if severity == Severity::Critical {
            let (ticket, created) = self.critical_ticket_locked(client_id, client_name, report).await?;
            if created {
                outcome.created.push(ticket.id);
            }
        }

        let now = self.clock.now();
        let since = now - self.config.window();
        let occurrences = self.store.count_errors(client_id, report.kind, since).await?;
        if occurrences <= u64::from(self.config.recurring_threshold) {
            return Ok(outcome);
        }

        let fingerprint = format!("recurring:{}", report.kind.as_str());
        match self.store.find_ticket(client_id, fingerprint.clone(), Some(since)).await? {
            Some(mut ticket) => {
                ticket.add_comment(
                    CommentAuthor::System,
                    format!(
                        "Still recurring: {} occurrences in the last {} hours. Latest: {}",
                        occurrences, self.config.window_hours, report.message
                    ),
                    now,
                );
                let id = ticket.id;
                self.store.put_ticket(ticket).await?;
                outcome.commented = Some(id);
                tracing::debug!(client_id = %client_id, ticket_id = %id, occurrences, "Appended to recurring ticket");
            }
            None => {
                let mut ticket = Ticket::new(
                    format!("Recurring {} errors on {}", report.kind.as_str(), client_name),
                    format!(
                        "{} {} errors in the last {} hours (threshold {}).\n\nLatest: {}",
                        occurrences,
                        report.kind.as_str(),
                        self.config.window_hours,
                        self.config.recurring_threshold,
                        report.message
                    ),
                    TicketPriority::High,
                    Some(client_id),
                    now,
                );
                ticket.fingerprint = Some(fingerprint);
                ticket.add_comment(
                    CommentAuthor::System,
                    "Created automatically after the error rate crossed the recurring-issue threshold."
                        .to_string(),
                    now,
                );
                let id = ticket.id;
                self.store.put_ticket(ticket).await?;
                outcome.created.push(id);
                tracing::info!(client_id = %client_id, ticket_id = %id, occurrences, kind = report.kind.as_str(), "Opened recurring-issue ticket");
            }
        }

        Ok(outcome)
    }

    /// Critical ticket for one report, created at most once per report id.
    /// Returns the ticket and whether this call created it.
    pub async fn critical_ticket(
        &self,
        client_id: Uuid,
        client_name: &str,
        report: &ErrorReport,
    ) -> Result<(Ticket, bool)> {
        let _guard = self.locks.lock(&client_id).await;
        self.critical_ticket_locked(client_id, client_name, report).await
    }

    async fn critical_ticket_locked(
        &self,
        client_id: Uuid,
        client_name: &str,
        report: &ErrorReport,
    ) -> Result<(Ticket, bool)> {
        let fingerprint = format!("critical:{}", report.report_id);
        if let Some(existing) = self.store.find_ticket(client_id, fingerprint.clone(), None).await? {
            return Ok((existing, false));
        }

        let now = self.clock.now();
        let mut ticket = Ticket::new(
            format!("Critical {} error on {}", report.kind.as_str(), client_name),
            describe(report),
            TicketPriority::Critical,
            Some(client_id),
            now,
        );
        ticket.fingerprint = Some(fingerprint);
        ticket.add_comment(
            CommentAuthor::System,
            format!("Created automatically from critical error report {}.", report.report_id),
            now,
        );

        self.store.put_ticket(ticket.clone()).await?;
        tracing::info!(client_id = %client_id, ticket_id = %ticket.id, kind = report.kind.as_str(), "Opened critical ticket");
        Ok((ticket, true))
    }
}

/// Ticket body: message, location, request URL and stack trace
fn describe(report: &ErrorReport) -> String {
    let mut out = report.message.clone();
    out.push_str("\n\n");

    match (&report.file, report.line) {
        (Some(file), Some(line)) => {
            let _ = writeln!(out, "Location: {}:{}", file, line);
        }
        (Some(file), None) => {
            let _ = writeln!(out, "Location: {}", file);
        }
        _ => {}
    }
    if let Some(url) = &report.request.url {
        let _ = writeln!(out, "Request: {}", url);
    }
    if let Some(status) = report.http_status {
        let _ = writeln!(out, "HTTP status: {}", status);
    }
    let _ = writeln!(out, "Occurred: {}", report.timestamp.to_rfc3339());

    if !report.stack.is_empty() {
        out.push_str("\nStack trace:\n");
        for (i, frame) in report.stack.iter().enumerate() {
            let _ = writeln!(
                out,
                "#{} {} {}:{}",
                i,
                frame.function.as_deref().unwrap_or("{main}"),
                frame.file.as_deref().unwrap_or("[internal]"),
                frame.line.map(|l| l.to_string()).unwrap_or_default()
            );
        }
    }
    out
}
