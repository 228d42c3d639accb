//! Background DNS work: a bounded job queue drained by a fixed worker pool,
//! and a watcher that re-publishes every client when the hub's address moves.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use super::Publisher;
use shared::types::ClientStatus;
use crate::config::{HubConfig, MonitorConfig};
use crate::model::{FaultKind, UpstreamFault};
use crate::monitor::compute_status;
use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsJob {
    Publish(Uuid),
    /// Carries the subdomain because the client is already gone from the registry
    Unpublish(String),
}

/// Producer side of the DNS job queue. Enqueueing never waits: a full queue
/// drops the job with a warning and the next address check re-enqueues it.
#[derive(Clone)]
pub struct DnsQueue {
    tx: flume::Sender<DnsJob>,
}

impl DnsQueue {
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<DnsJob>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }

    pub fn publish(&self, client_id: Uuid) {
        self.enqueue(DnsJob::Publish(client_id));
    }

    pub fn unpublish(&self, subdomain: String) {
        self.enqueue(DnsJob::Unpublish(subdomain));
    }

    fn enqueue(&self, job: DnsJob) {
        if let Err(e) = self.tx.try_send(job) {
            tracing::warn!(job = ?e.into_inner(), "DNS job queue full or closed; dropping job");
        }
    }
}

/// What a worker needs to carry out a job
#[derive(Clone)]
pub struct DnsWorkerContext {
    pub registry: Arc<Registry>,
    pub publisher: Arc<Publisher>,
    pub address: watch::Receiver<Option<IpAddr>>,
    pub port: u16,
    pub monitor: MonitorConfig,
}

/// Spawn `workers` tasks draining the queue until cancelled
pub fn spawn_workers(
    workers: usize,
    rx: flume::Receiver<DnsJob>,
    ctx: DnsWorkerContext,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        job = rx.recv_async() => match job {
                            Ok(job) => process(&ctx, job).await,
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
                tracing::debug!(worker, "DNS worker stopped");
            })
        })
        .collect()
}

/// Run one job. Failures are recorded on the client and logged, never returned.
pub async fn process(ctx: &DnsWorkerContext, job: DnsJob) {
    match job {
        DnsJob::Publish(client_id) => {
            let Some(address) = *ctx.address.borrow() else {
                tracing::debug!(client_id = %client_id, "Hub address not known yet; skipping publish");
                return;
            };
            let Some(client) = ctx.registry.find(client_id).await else {
                return;
            };

            let result = ctx.publisher.publish(&client.subdomain(), address, ctx.port).await;
            let now = ctx.registry.clock().now();
            let recorded = ctx
                .registry
                .update(client_id, |c| {
                    match &result {
                        Ok(published) => {
                            c.dns_hostname = Some(published.hostname.clone());
                            if c.upstream_fault.as_ref().is_some_and(|f| f.kind == FaultKind::Dns) {
                                c.upstream_fault = None;
                            }
                        }
                        // An agent fault drives status; keep it visible over a DNS fault
                        Err(e) if !c.upstream_fault.as_ref().is_some_and(|f| f.kind == FaultKind::Agent) => {
                            c.upstream_fault = Some(UpstreamFault {
                                kind: FaultKind::Dns,
                                message: e.to_string(),
                                at: now,
                            });
                        }
                        Err(_) => {}
                    }
                    // Offline only clears on contact from the agent itself
                    let before = c.status;
                    if before != ClientStatus::Offline {
                        c.status = compute_status(c, &ctx.monitor);
                    }
                    Ok(before)
                })
                .await;

            if let Err(e) = &result {
                tracing::warn!(client_id = %client_id, "DNS publish failed: {}", e);
            }
            match recorded {
                Ok((client, before)) if client.status != before => {
                    tracing::info!(client_id = %client_id, from = before.as_str(), to = client.status.as_str(), "Client status changed after DNS publish");
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(client_id = %client_id, "Could not record DNS outcome: {}", e),
            }
        }
        DnsJob::Unpublish(subdomain) => {
            if let Err(e) = ctx.publisher.unpublish(&subdomain).await {
                tracing::warn!(subdomain = %subdomain, "DNS unpublish failed: {}", e);
            }
        }
    }
}

/// Where the hub's public address comes from
pub enum AddressSource {
    Static(IpAddr),
    Echo { http: reqwest::Client, url: String },
    Unknown,
}

impl AddressSource {
    pub fn from_config(config: &HubConfig, timeout: Duration) -> Result<Self> {
        if let Some(address) = config.public_address {
            return Ok(AddressSource::Static(address));
        }
        match &config.address_echo_url {
            Some(url) => {
                let http = reqwest::Client::builder()
                    .timeout(timeout)
                    .build()
                    .context("Failed to build address HTTP client")?;
                Ok(AddressSource::Echo { http, url: url.clone() })
            }
            None => Ok(AddressSource::Unknown),
        }
    }

    pub async fn resolve(&self) -> Result<Option<IpAddr>> {
        match self {
            AddressSource::Static(address) => Ok(Some(*address)),
            AddressSource::Echo { http, url } => {
                let body = http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .with_context(|| format!("Address echo request to {} failed", url))?
                    .text()
                    .await
                    .context("Failed to read address echo response")?;
                let trimmed = body.trim();
                match trimmed.parse::<IpAddr>() {
                    Ok(address) => Ok(Some(address)),
                    Err(_) => bail!("Address echo returned '{}', not an IP address", trimmed),
                }
            }
            AddressSource::Unknown => Ok(None),
        }
    }
}

/// Poll the hub's public address; on every change publish the new value and
/// enqueue a publish for each active client.
pub async fn watch_address(
    source: AddressSource,
    interval: Duration,
    tx: watch::Sender<Option<IpAddr>>,
    registry: Arc<Registry>,
    queue: DnsQueue,
    cancel: CancellationToken,
) {
    if matches!(source, AddressSource::Unknown) {
        tracing::warn!("No public address or echo URL configured; DNS records will not be published");
        return;
    }

    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match source.resolve().await {
                    Ok(Some(address)) => {
                        let changed = tx.send_if_modified(|current| {
                            if *current == Some(address) {
                                false
                            } else {
                                *current = Some(address);
                                true
                            }
                        });
                        if changed {
                            let ids = registry.ids();
                            tracing::info!(%address, clients = ids.len(), "Hub address changed; re-publishing");
                            for id in ids {
                                queue.publish(id);
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Address check failed: {:#}", e),
                }
                if matches!(source, AddressSource::Static(_)) {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("Address watcher stopped");
}
