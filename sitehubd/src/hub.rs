//! Hub operations behind the agent and operator APIs.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use shared::types::{
    AgentEvent, AutoTicketAck, ClientStatus, ErrorAck, ErrorReport, ErrorSubmission, EventAck,
    EventBatch, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, ScanAck,
    ScanResults, UpdateAck, UpdateResults,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::clock::Clock;
use crate::commands::{AgentTransport, Dispatcher};
use crate::config::Config;
use crate::correlation::{CorrelationEngine, Severity};
use crate::dns::address::DnsQueue;
use crate::error::{HubError, Result};
use crate::model::{Client, CommentAuthor, FaultKind, Ticket, TicketPriority, TicketStatus, UpdateReport};
use crate::monitor::compute_status;
use crate::registry::Registry;
use crate::store::hash::inventory_digest;
use crate::store_manager::StoreHandle;

pub struct Hub {
    pub name: String,
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub store: StoreHandle,
    pub correlation: Arc<CorrelationEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub dns: Option<DnsQueue>,
}

/// Ticket fields an operator may change
#[derive(Debug, Default, Clone)]
pub struct TicketPatch {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
}

/// Record a successful contact. An offline client comes back with whatever
/// status its latest payloads imply.
fn touch(client: &mut Client, now: DateTime<Utc>, hub: &Hub) {
    client.last_seen = Some(now);
    if client.status == ClientStatus::Offline {
        client.status = compute_status(client, &hub.config.monitor);
    }
}

/// The body must name the same client the headers authenticated
fn ensure_same_client(authenticated: Uuid, claimed: Uuid) -> Result<()> {
    if authenticated != claimed {
        tracing::warn!(client_id = %authenticated, claimed = %claimed, "Body client id does not match credentials");
        return Err(HubError::Unauthorized);
    }
    Ok(())
}

fn log_transition(client_id: Uuid, before: ClientStatus, after: ClientStatus) {
    if before != after {
        tracing::info!(client_id = %client_id, from = before.as_str(), to = after.as_str(), "Client status changed");
    }
}

impl Hub {
    /// Wire the components together, hydrating the registry from `store`
    pub async fn new(
        config: Arc<Config>,
        store: StoreHandle,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn AgentTransport>,
        dns: Option<DnsQueue>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::load(store.clone(), clock.clone()).await?);
        let correlation = Arc::new(CorrelationEngine::new(
            store.clone(),
            config.correlation.clone(),
            clock,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            transport,
            config.monitor.clone(),
            &config.agents,
            shutdown,
        ));

        Ok(Self {
            name: config.hub_name(),
            config,
            registry,
            store,
            correlation,
            dispatcher,
            dns,
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.registry.clock().now()
    }

    pub fn authenticate(&self, client_id: Uuid, token: &str) -> Result<()> {
        if self.registry.authenticate(client_id, token) {
            Ok(())
        } else {
            Err(HubError::Unauthorized)
        }
    }

    // Operator operations

    pub async fn issue_client(&self, name: &str, site_url: &str) -> Result<Client> {
        let client = self.registry.issue(name, site_url).await?;
        if let Some(dns) = &self.dns {
            dns.publish(client.id);
        }
        Ok(client)
    }

    pub async fn remove_client(&self, client_id: Uuid) -> Result<Client> {
        let client = self.registry.revoke(client_id).await?;
        if let Some(dns) = &self.dns {
            dns.unpublish(client.subdomain());
        }
        Ok(client)
    }

    pub async fn client(&self, client_id: Uuid) -> Result<Client> {
        self.registry
            .find(client_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("client {}", client_id)))
    }

    pub async fn recent_errors(&self, client_id: Uuid, limit: u32) -> Result<Vec<ErrorReport>> {
        self.client(client_id).await?;
        Ok(self.store.recent_errors(client_id, limit.clamp(1, 500)).await?)
    }

    pub async fn tickets(&self, client_id: Option<Uuid>) -> Result<Vec<Ticket>> {
        Ok(self.store.list_tickets(client_id).await?)
    }

    pub async fn update_ticket(&self, ticket_id: Uuid, patch: TicketPatch) -> Result<Ticket> {
        let mut ticket = self.ticket(ticket_id).await?;

        if let Some(status) = patch.status {
            if !ticket.status.can_transition_to(status) {
                return Err(HubError::Validation(format!(
                    "ticket cannot move from {} to {}",
                    ticket.status.as_str(),
                    status.as_str()
                )));
            }
            ticket.status = status;
        }
        if let Some(priority) = patch.priority {
            ticket.priority = priority;
        }
        ticket.updated_at = self.now();

        self.store.put_ticket(ticket.clone()).await?;
        tracing::info!(ticket_id = %ticket_id, status = ticket.status.as_str(), priority = ticket.priority.as_str(), "Ticket updated");
        Ok(ticket)
    }

    pub async fn comment_ticket(&self, ticket_id: Uuid, body: &str) -> Result<Ticket> {
        let body = body.trim();
        if body.is_empty() {
            return Err(HubError::Validation("comment body must not be empty".to_string()));
        }
        let mut ticket = self.ticket(ticket_id).await?;
        ticket.add_comment(CommentAuthor::Operator, body.to_string(), self.now());
        self.store.put_ticket(ticket.clone()).await?;
        Ok(ticket)
    }

    async fn ticket(&self, ticket_id: Uuid) -> Result<Ticket> {
        self.store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("ticket {}", ticket_id)))
    }

    // Agent operations

    pub async fn register(&self, client_id: Uuid, req: RegisterRequest) -> Result<RegisterResponse> {
        ensure_same_client(client_id, req.client_id)?;
        if req.wp_version.trim().is_empty() || req.php_version.trim().is_empty() {
            return Err(HubError::Validation("wpVersion and phpVersion are required".to_string()));
        }

        let now = self.now();
        let monitor = &self.config.monitor;
        let (client, before) = self
            .registry
            .update(client_id, |c| {
                let before = c.status;
                c.meta = Some(req.meta());
                if c.registered_at.is_none() {
                    c.registered_at = Some(now);
                }
                c.last_seen = Some(now);
                c.status = compute_status(c, monitor);
                Ok(before)
            })
            .await?;

        log_transition(client_id, before, client.status);
        if client.dns_hostname.is_none() {
            if let Some(dns) = &self.dns {
                dns.publish(client_id);
            }
        }

        Ok(RegisterResponse {
            client_id,
            status: client.status,
            registered_at: client.registered_at.unwrap_or(now),
        })
    }

    pub async fn heartbeat(&self, client_id: Uuid, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        ensure_same_client(client_id, req.client_id)?;
        let now = self.now();
        let (client, before) = self
            .registry
            .update(client_id, |c| {
                let before = c.status;
                touch(c, now, self);
                Ok(before)
            })
            .await?;
        log_transition(client_id, before, client.status);

        Ok(HeartbeatResponse {
            status: "ok".to_string(),
            timestamp: now,
        })
    }

    /// Replace inventory and metrics wholesale and recompute status
    pub async fn ingest_scan(&self, client_id: Uuid, scan: ScanResults) -> Result<ScanAck> {
        ensure_same_client(client_id, scan.client_id)?;
        scan.metrics.validate().map_err(|e| {
            tracing::warn!(client_id = %client_id, "Rejected scan results: {}", e);
            HubError::Validation(e)
        })?;

        let now = self.now();
        let digest = inventory_digest(&scan.plugins, &scan.themes)?;
        let monitor = &self.config.monitor;
        let (client, (before, changed)) = self
            .registry
            .update(client_id, |c| {
                let before = c.status;
                let changed = c.inventory_digest.as_deref() != Some(digest.as_str());
                c.plugins = scan.plugins;
                c.themes = scan.themes;
                c.metrics = Some(scan.metrics);
                c.inventory_digest = Some(digest);
                if c.upstream_fault.as_ref().is_some_and(|f| f.kind == FaultKind::Agent) {
                    c.upstream_fault = None;
                }
                c.last_seen = Some(now);
                c.status = compute_status(c, monitor);
                Ok((before, changed))
            })
            .await?;

        log_transition(client_id, before, client.status);
        tracing::debug!(client_id = %client_id, inventory_changed = changed, plugins = client.plugins.len(), themes = client.themes.len(), "Ingested scan results");

        let metrics = client
            .metrics
            .clone()
            .ok_or_else(|| HubError::Internal("metrics missing after scan".to_string()))?;
        Ok(ScanAck {
            client_id,
            status: client.status,
            plugins: client.plugins,
            themes: client.themes,
            metrics,
        })
    }

    /// Record update outcomes and ask the agent for a fresh scan
    pub async fn ingest_update_results(&self, client_id: Uuid, results: UpdateResults) -> Result<UpdateAck> {
        ensure_same_client(client_id, results.client_id)?;
        let now = self.now();
        let accepted = results.results.len();

        let (client, ()) = self
            .registry
            .update(client_id, |c| {
                c.last_update = Some(UpdateReport {
                    received_at: now,
                    outcomes: results.results,
                });
                touch(c, now, self);
                Ok(())
            })
            .await?;

        let failed = client.last_update.as_ref().map_or(0, UpdateReport::failed);
        tracing::info!(client_id = %client_id, accepted, failed, "Ingested update results");

        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            // Failure is already recorded on the client by the dispatcher
            let _ = dispatcher.request_scan(client_id).await;
        });

        Ok(UpdateAck {
            accepted,
            rescan_requested: true,
        })
    }

    /// Append error reports and correlate the new ones, critical first
    /// A single report must be valid. In a batch, invalid reports are skipped
    /// and counted so one bad entry never costs the agent the rest.
    pub async fn ingest_errors(&self, client_id: Uuid, submission: ErrorSubmission) -> Result<ErrorAck> {
        ensure_same_client(client_id, submission.client_id())?;
        let (reports, rejected) = match submission {
            ErrorSubmission::Single(report) => (self.validate_reports(client_id, vec![report])?, 0),
            ErrorSubmission::Batch(batch) => self.partition_reports(client_id, batch.reports)?,
        };

        let mut ack = if reports.is_empty() {
            self.contact(client_id, self.now()).await?;
            ErrorAck { accepted: 0, duplicates: 0, tickets_created: 0, rejected: 0 }
        } else {
            self.append_and_correlate(client_id, reports).await?
        };
        ack.rejected = rejected;
        Ok(ack)
    }

    pub async fn ingest_events(&self, client_id: Uuid, batch: EventBatch) -> Result<EventAck> {
        ensure_same_client(client_id, batch.client_id)?;

        let mut reports = Vec::new();
        let mut activity = Vec::new();
        for event in batch.events {
            match event {
                AgentEvent::Error(report) => reports.push(report),
                other => activity.push(other),
            }
        }
        let (reports, rejected) = self.partition_reports(client_id, reports)?;
        let now = self.now();

        let activity_count = activity.len();
        if !activity.is_empty() {
            self.store.append_events(client_id, activity, now).await?;
        }

        let errors = if reports.is_empty() {
            self.contact(client_id, now).await?;
            ErrorAck { accepted: 0, duplicates: 0, tickets_created: 0, rejected: 0 }
        } else {
            self.append_and_correlate(client_id, reports).await?
        };

        Ok(EventAck {
            accepted: activity_count + errors.accepted,
            errors: errors.accepted,
            tickets_created: errors.tickets_created,
            rejected,
        })
    }

    /// The agent's critical bypass: store the report and make sure it has a
    /// critical ticket. Safe to call for a report also sent through the error log.
    pub async fn auto_ticket(&self, client_id: Uuid, report: ErrorReport) -> Result<AutoTicketAck> {
        let mut reports = self.validate_reports(client_id, vec![report])?;
        let report = reports
            .pop()
            .ok_or_else(|| HubError::Internal("report lost during validation".to_string()))?;
        if self.correlation.classify(&report) != Severity::Critical {
            return Err(HubError::Validation(format!(
                "{} reports are not critical and cannot open tickets directly",
                report.kind.as_str()
            )));
        }

        let now = self.now();
        let client = self.contact(client_id, now).await?;
        let fresh = self.store.append_errors(vec![report.clone()], now).await?;

        let mut created_ids = Vec::new();
        if fresh.first().copied().unwrap_or(false) {
            created_ids = self.correlation.correlate(client_id, &client.name, &report).await?.created;
        }
        let (ticket, created_now) = self.correlation.critical_ticket(client_id, &client.name, &report).await?;

        Ok(AutoTicketAck {
            ticket_id: ticket.id,
            created: created_now || created_ids.contains(&ticket.id),
        })
    }

    fn validate_reports(&self, client_id: Uuid, reports: Vec<ErrorReport>) -> Result<Vec<ErrorReport>> {
        reports
            .into_iter()
            .map(|mut report| {
                ensure_same_client(client_id, report.client_id)?;
                report.normalize().map_err(|e| {
                    tracing::warn!(client_id = %client_id, "Rejected error report: {}", e);
                    HubError::Validation(e)
                })?;
                Ok(report)
            })
            .collect()
    }

    /// Split a batch into valid reports and a count of invalid ones. A report
    /// naming another client still fails the whole request.
    fn partition_reports(&self, client_id: Uuid, reports: Vec<ErrorReport>) -> Result<(Vec<ErrorReport>, usize)> {
        let mut valid = Vec::with_capacity(reports.len());
        let mut rejected = 0;
        for mut report in reports {
            ensure_same_client(client_id, report.client_id)?;
            match report.normalize() {
                Ok(()) => valid.push(report),
                Err(e) => {
                    rejected += 1;
                    tracing::warn!(client_id = %client_id, report_id = %report.report_id, "Skipped invalid error report: {}", e);
                }
            }
        }
        Ok((valid, rejected))
    }

    async fn contact(&self, client_id: Uuid, now: DateTime<Utc>) -> Result<Client> {
        let (client, before) = self
            .registry
            .update(client_id, |c| {
                let before = c.status;
                touch(c, now, self);
                Ok(before)
            })
            .await?;
        log_transition(client_id, before, client.status);
        Ok(client)
    }

    async fn append_and_correlate(&self, client_id: Uuid, reports: Vec<ErrorReport>) -> Result<ErrorAck> {
        let now = self.now();
        let client = self.contact(client_id, now).await?;
        let fresh = self.store.append_errors(reports.clone(), now).await?;

        let submitted = reports.len();
        let mut new_reports: Vec<ErrorReport> = reports
            .into_iter()
            .zip(fresh)
            .filter_map(|(report, is_new)| is_new.then_some(report))
            .collect();
        let duplicates = submitted - new_reports.len();
        if duplicates > 0 {
            tracing::debug!(client_id = %client_id, duplicates, "Ignored resubmitted error reports");
        }

        new_reports.sort_by_key(|r| std::cmp::Reverse(self.correlation.classify(r)));

        let mut tickets_created = 0;
        for report in &new_reports {
            match self.correlation.correlate(client_id, &client.name, report).await {
                Ok(outcome) => tickets_created += outcome.created.len(),
                // The report is durable; a later report re-evaluates the window
                Err(e) => tracing::error!(client_id = %client_id, report_id = %report.report_id, "Correlation failed: {}", e),
            }
        }

        Ok(ErrorAck {
            accepted: new_reports.len(),
            duplicates,
            tickets_created,
            rejected: 0,
        })
    }
}
