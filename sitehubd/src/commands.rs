//! Hub to agent command dispatch.
//!
//! Commands are fire-and-forget: the agent acknowledges receipt and reports
//! results later through the ingestion endpoints.

use std::sync::Arc;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use shared::protocol::{HEADER_CLIENT_ID, HEADER_TOKEN};
use shared::types::{AgentCommand, UpdateItem};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::config::{AgentsConfig, MonitorConfig};
use crate::error::{HubError, Result};
use crate::model::{Client, FaultKind, UpstreamFault};
use crate::monitor::compute_status;
use crate::registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum AgentCallError {
    #[error("agent did not answer in time")]
    Timeout,

    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("agent rejected command with HTTP {0}")]
    Rejected(u16),
}

/// Outbound channel to an agent's command endpoint
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, client: &Client, command: &AgentCommand) -> std::result::Result<(), AgentCallError>;
}

pub struct HttpAgentTransport {
    http: reqwest::Client,
    command_path: String,
}

impl HttpAgentTransport {
    pub fn new(config: &AgentsConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build agent HTTP client: {}", e))?;
        Ok(Self {
            http,
            command_path: config.command_path.clone(),
        })
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn send(&self, client: &Client, command: &AgentCommand) -> std::result::Result<(), AgentCallError> {
        let url = format!("{}{}", client.site_url.trim_end_matches('/'), self.command_path);
        let response = self
            .http
            .post(&url)
            .header(HEADER_CLIENT_ID, client.id.to_string())
            .header(HEADER_TOKEN, client.token.expose())
            .json(command)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentCallError::Timeout
                } else {
                    AgentCallError::Unreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(AgentCallError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Outcome of a scan-all run. Partial completion is normal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanAllReport {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

enum Outcome {
    Sent,
    Failed,
    Skipped,
}

struct ScanAllRun {
    generation: u64,
    cancel: CancellationToken,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    transport: Arc<dyn AgentTransport>,
    monitor: MonitorConfig,
    max_concurrent: usize,
    shutdown: CancellationToken,
    running: Mutex<Option<ScanAllRun>>,
    generation: Mutex<u64>,
    last_report: Mutex<Option<ScanAllReport>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn AgentTransport>,
        monitor: MonitorConfig,
        agents: &AgentsConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            transport,
            monitor,
            max_concurrent: agents.max_concurrent.max(1),
            shutdown,
            running: Mutex::new(None),
            generation: Mutex::new(0),
            last_report: Mutex::new(None),
        }
    }

    /// Send one command. A failure is recorded on the client as an agent fault
    /// and returned as an upstream error.
    pub async fn dispatch(&self, client_id: Uuid, command: AgentCommand) -> Result<()> {
        let client = self
            .registry
            .find(client_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("client {}", client_id)))?;

        match self.transport.send(&client, &command).await {
            Ok(()) => {
                tracing::info!(client_id = %client_id, command = command.name(), "Command delivered");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(client_id = %client_id, command = command.name(), "Command failed: {}", e);
                self.record_fault(client_id, &e).await;
                Err(HubError::Upstream(e.to_string()))
            }
        }
    }

    async fn record_fault(&self, client_id: Uuid, err: &AgentCallError) {
        let now = self.registry.clock().now();
        let monitor = &self.monitor;
        let result = self
            .registry
            .update(client_id, |c| {
                c.upstream_fault = Some(UpstreamFault {
                    kind: FaultKind::Agent,
                    message: err.to_string(),
                    at: now,
                });
                if c.status != shared::types::ClientStatus::Offline {
                    c.status = compute_status(c, monitor);
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::debug!(client_id = %client_id, "Could not record agent fault: {}", e);
        }
    }

    pub async fn request_scan(&self, client_id: Uuid) -> Result<()> {
        self.dispatch(client_id, AgentCommand::scan()).await
    }

    pub async fn request_update(&self, client_id: Uuid, items: Vec<UpdateItem>) -> Result<()> {
        if items.is_empty() {
            return Err(HubError::Validation("update needs at least one item".to_string()));
        }
        self.dispatch(client_id, AgentCommand::update(items)).await
    }

    /// Ask every active client to scan, at most `max_concurrent` at a time.
    /// Once `cancel` fires no new request starts; requests already in flight
    /// finish so no client record is left half-written.
    pub async fn scan_all(&self, cancel: CancellationToken) -> ScanAllReport {
        let ids = self.registry.ids();
        let mut report = ScanAllReport {
            requested: ids.len(),
            ..ScanAllReport::default()
        };

        let mut outcomes = stream::iter(ids)
            .map(|id| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Outcome::Skipped;
                    }
                    match self.request_scan(id).await {
                        Ok(()) => Outcome::Sent,
                        Err(_) => Outcome::Failed,
                    }
                }
            })
            .buffer_unordered(self.max_concurrent);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Outcome::Sent => report.succeeded += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped => report.cancelled += 1,
            }
        }

        tracing::info!(
            requested = report.requested,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "Scan-all finished"
        );
        report
    }

    /// Start a background scan-all. Only one runs at a time.
    pub fn start_scan_all(self: &Arc<Self>) -> Result<usize> {
        let (generation, cancel) = {
            let mut running = self.running.lock();
            if running.is_some() {
                return Err(HubError::Conflict("a scan-all is already running".to_string()));
            }
            let generation = {
                let mut g = self.generation.lock();
                *g += 1;
                *g
            };
            let cancel = self.shutdown.child_token();
            *running = Some(ScanAllRun {
                generation,
                cancel: cancel.clone(),
            });
            (generation, cancel)
        };

        let requested = self.registry.len();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let report = this.scan_all(cancel).await;
            *this.last_report.lock() = Some(report);
            let mut running = this.running.lock();
            if running.as_ref().is_some_and(|r| r.generation == generation) {
                *running = None;
            }
        });
        Ok(requested)
    }

    /// Cancel the running scan-all, if any
    pub fn cancel_scan_all(&self) -> bool {
        match self.running.lock().as_ref() {
            Some(run) => {
                run.cancel.cancel();
                tracing::info!("Scan-all cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn scan_all_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn last_scan_all(&self) -> Option<ScanAllReport> {
        self.last_report.lock().clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use shared::types::ClientStatus;
    use crate::clock::SystemClock;
    use crate::store_manager::StoreHandle;

    /// Records every command; fails for the listed clients; optionally slow
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<(Uuid, AgentCommand)>>,
        pub failing: Mutex<Vec<Uuid>>,
        pub delay: Option<Duration>,
    }

    #[async_trait]
    impl AgentTransport for RecordingTransport {
        async fn send(&self, client: &Client, command: &AgentCommand) -> std::result::Result<(), AgentCallError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().contains(&client.id) {
                return Err(AgentCallError::Unreachable("connection refused".to_string()));
            }
            self.sent.lock().push((client.id, command.clone()));
            Ok(())
        }
    }

    async fn setup(transport: Arc<RecordingTransport>, max_concurrent: usize) -> (Arc<Dispatcher>, Arc<Registry>) {
        let store = StoreHandle::open(":memory:").unwrap();
        let registry = Arc::new(Registry::load(store, Arc::new(SystemClock)).await.unwrap());
        let agents = AgentsConfig {
            max_concurrent,
            ..AgentsConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            transport,
            MonitorConfig::default(),
            &agents,
            CancellationToken::new(),
        ));
        (dispatcher, registry)
    }

    #[tokio::test]
    async fn test_failed_dispatch_flags_client_warning() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, registry) = setup(transport.clone(), 4).await;
        let client = registry.issue("Shop", "https://shop.example").await.unwrap();
        registry
            .update(client.id, |c| {
                c.registered_at = Some(chrono::Utc::now());
                c.status = ClientStatus::Healthy;
                Ok(())
            })
            .await
            .unwrap();

        transport.failing.lock().push(client.id);
        let err = dispatcher.request_scan(client.id).await.unwrap_err();
        assert!(matches!(err, HubError::Upstream(_)));

        let stored = registry.find(client.id).await.unwrap();
        assert_eq!(stored.status, ClientStatus::Warning);
        assert_eq!(stored.upstream_fault.map(|f| f.kind), Some(FaultKind::Agent));
    }

    #[tokio::test]
    async fn test_scan_all_counts_partial_failure() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, registry) = setup(transport.clone(), 2).await;
        let a = registry.issue("A", "https://a.example").await.unwrap();
        registry.issue("B", "https://b.example").await.unwrap();
        registry.issue("C", "https://c.example").await.unwrap();
        transport.failing.lock().push(a.id);

        let report = dispatcher.scan_all(CancellationToken::new()).await;
        assert_eq!(
            report,
            ScanAllReport { requested: 3, succeeded: 2, failed: 1, cancelled: 0 }
        );
        assert!(transport.sent.lock().iter().all(|(_, c)| c.name() == "scan"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_all_cancellation_stops_new_requests() {
        let transport = Arc::new(RecordingTransport {
            delay: Some(Duration::from_millis(50)),
            ..RecordingTransport::default()
        });
        let (dispatcher, registry) = setup(transport.clone(), 1).await;
        for i in 0..3 {
            registry.issue(&format!("S{}", i), &format!("https://s{}.example", i)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            async move { dispatcher.scan_all(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let report = run.await.unwrap();
        assert_eq!(report.requested, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.cancelled, 2);
    }

    #[tokio::test]
    async fn test_only_one_background_scan_all() {
        let transport = Arc::new(RecordingTransport {
            delay: Some(Duration::from_millis(200)),
            ..RecordingTransport::default()
        });
        let (dispatcher, registry) = setup(transport, 1).await;
        registry.issue("A", "https://a.example").await.unwrap();

        assert_eq!(dispatcher.start_scan_all().unwrap(), 1);
        assert!(matches!(dispatcher.start_scan_all(), Err(HubError::Conflict(_))));
        assert!(dispatcher.cancel_scan_all());
    }

    #[tokio::test]
    async fn test_empty_update_rejected() {
        let (dispatcher, registry) = setup(Arc::new(RecordingTransport::default()), 1).await;
        let client = registry.issue("A", "https://a.example").await.unwrap();
        assert!(matches!(
            dispatcher.request_update(client.id, vec![]).await,
            Err(HubError::Validation(_))
        ));
    }
}
