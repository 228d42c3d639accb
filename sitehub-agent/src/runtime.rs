//! The long-running side of an agent: heartbeats, queue flushing, hook
//! dispatch and execution of hub commands.

use std::time::Duration;
use chrono::Utc;
use parking_lot::Mutex;
use shared::protocol::HEARTBEAT_INTERVAL_SECS;
use shared::types::{
    AgentCommand, AgentEvent, ErrorReport, HealthMetrics, InventoryItem, ScanAck, ScanResults,
    UpdateItem, UpdateOutcome,
};
use tokio_util::sync::CancellationToken;
use crate::client::HubClient;
use crate::error::Result;
use crate::hooks::{Hook, HookContext, HookTable};
use crate::queue::{ErrorQueue, Routing};

/// What the agent needs from the site it runs in
pub trait Site: Send + Sync {
    /// Installed plugins and themes
    fn inventory(&self) -> (Vec<InventoryItem>, Vec<InventoryItem>);
    fn metrics(&self) -> HealthMetrics;
    fn apply_update(&self, item: &UpdateItem) -> UpdateOutcome;
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat_interval: Duration,
    /// How often the queue is checked for a due batch
    pub flush_check_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            flush_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub errors_sent: usize,
    pub events_sent: usize,
}

pub struct Agent<S> {
    client: HubClient,
    site: S,
    hooks: HookTable,
    queue: ErrorQueue,
    events: Mutex<Vec<AgentEvent>>,
    config: AgentConfig,
}

impl<S: Site> Agent<S> {
    pub fn new(client: HubClient, site: S, hooks: HookTable, queue: ErrorQueue, config: AgentConfig) -> Self {
        Self {
            client,
            site,
            hooks,
            queue,
            events: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn client(&self) -> &HubClient {
        &self.client
    }

    pub fn queue(&self) -> &ErrorQueue {
        &self.queue
    }

    pub fn pending_events(&self) -> usize {
        self.events.lock().len()
    }

    /// Run the bindings for a fired hook. Errors go through the queue,
    /// everything else waits for the next flush.
    pub async fn fire(&self, hook: Hook) {
        let ctx = HookContext {
            client_id: self.client.client_id(),
            now: Utc::now(),
        };
        for event in self.hooks.fire(&hook, &ctx) {
            match event {
                AgentEvent::Error(report) => self.report(report).await,
                other => self.events.lock().push(other),
            }
        }
    }

    pub async fn report(&self, report: ErrorReport) {
        if let Routing::Immediate(report) = self.queue.push(report) {
            self.send_critical(report).await;
        }
    }

    async fn send_critical(&self, report: ErrorReport) {
        if let Err(e) = self.client.report_error(&report).await {
            tracing::debug!(report_id = %report.report_id, "Critical report not delivered; queued for the next batch: {}", e);
            self.queue.requeue(vec![report.clone()]);
        }
        match self.client.auto_ticket(&report).await {
            Ok(ack) => {
                tracing::info!(report_id = %report.report_id, ticket_id = %ack.ticket_id, created = ack.created, "Critical error ticketed");
            }
            Err(e) => tracing::debug!(report_id = %report.report_id, "Auto-ticket failed: {}", e),
        }
    }

    /// Send queued errors and buffered events. Anything the hub did not take
    /// because it was unreachable stays for the next attempt.
    pub async fn flush(&self) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();

        let reports = self.queue.take();
        if !reports.is_empty() {
            let count = reports.len();
            match self.client.report_errors(reports.clone()).await {
                Ok(ack) => {
                    outcome.errors_sent = count;
                    tracing::debug!(sent = count, duplicates = ack.duplicates, tickets = ack.tickets_created, "Flushed error queue");
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(count, "Hub unreachable; keeping error batch: {}", e);
                    self.queue.requeue(reports);
                }
                Err(e) => tracing::warn!(count, "Hub refused error batch; dropping it: {}", e),
            }
        }

        let events = std::mem::take(&mut *self.events.lock());
        if !events.is_empty() {
            let count = events.len();
            match self.client.events(events.clone()).await {
                Ok(_) => outcome.events_sent = count,
                Err(e) if e.is_transient() => {
                    tracing::debug!(count, "Hub unreachable; keeping events: {}", e);
                    let mut buffered = self.events.lock();
                    let newer = std::mem::replace(&mut *buffered, events);
                    buffered.extend(newer);
                }
                Err(e) => tracing::warn!(count, "Hub refused events; dropping them: {}", e),
            }
        }

        outcome
    }

    /// One heartbeat. Failure is expected while the hub is away and is only
    /// logged at debug.
    pub async fn heartbeat(&self) -> bool {
        match self.client.heartbeat().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Heartbeat failed: {}", e);
                false
            }
        }
    }

    /// Check the credentials on an inbound hub command
    pub fn authorize_command(&self, client_id: &str, token: &str) -> bool {
        self.client.credentials().verify(client_id, token)
    }

    pub async fn scan(&self) -> Result<ScanAck> {
        let (plugins, themes) = self.site.inventory();
        let scan = ScanResults {
            client_id: self.client.client_id(),
            plugins,
            themes,
            metrics: self.site.metrics(),
        };
        self.client.scan_results(&scan).await
    }

    /// Carry out a command and report its results through the ingestion calls
    pub async fn handle_command(&self, command: AgentCommand) -> Result<()> {
        tracing::info!(command = command.name(), "Hub command received");
        match command {
            AgentCommand::Scan { .. } => {
                self.scan().await?;
            }
            AgentCommand::Update { items, .. } => {
                let outcomes: Vec<UpdateOutcome> = items.iter().map(|item| self.site.apply_update(item)).collect();
                let failed = outcomes.iter().filter(|o| !o.succeeded).count();
                if failed > 0 {
                    tracing::warn!(failed, total = outcomes.len(), "Some updates failed");
                }
                self.client.update_results(outcomes).await?;
            }
        }
        Ok(())
    }

    /// Heartbeat and flush until cancelled, then flush one last time
    pub async fn run(&self, cancel: CancellationToken) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut flush_check = tokio::time::interval(self.config.flush_check_interval);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
                _ = flush_check.tick() => {
                    if self.queue.is_due() || self.pending_events() > 0 {
                        self.flush().await;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        let outcome = self.flush().await;
        tracing::info!(errors = outcome.errors_sent, events = outcome.events_sent, "Agent stopped");
    }
}
