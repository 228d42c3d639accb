use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use shared::protocol::SRV_SERVICE;
use super::{DnsError, DnsProvider, DnsRecord, RecordKind};
use crate::config::DnsConfig;
use crate::locks::KeyedLocks;

const SRV_PRIORITY: u16 = 0;
const SRV_WEIGHT: u16 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedHostname {
    pub hostname: String,
    pub address_record_id: String,
    pub srv_record_id: String,
    /// Provider writes this call needed; zero when everything was current
    pub writes: u32,
}

/// Read-before-write upserts of a client's address and SRV records
pub struct Publisher {
    provider: Arc<dyn DnsProvider>,
    zone: String,
    ttl: u32,
    max_attempts: u32,
    base_backoff: Duration,
    call_timeout: Duration,
    locks: KeyedLocks<String>,
}

impl Publisher {
    pub fn new(provider: Arc<dyn DnsProvider>, config: &DnsConfig) -> Self {
        Self {
            provider,
            zone: config.zone.trim_matches('.').to_string(),
            ttl: config.ttl,
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            call_timeout: config.request_timeout(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn hostname(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.zone)
    }

    pub fn srv_name(&self, subdomain: &str) -> String {
        format!("{}.{}", SRV_SERVICE, self.hostname(subdomain))
    }

    /// Point `<subdomain>.<zone>` at the hub and advertise its port. Calls for
    /// the same subdomain are serialized; different subdomains run in parallel.
    pub async fn publish(
        &self,
        subdomain: &str,
        address: IpAddr,
        port: u16,
    ) -> Result<PublishedHostname, DnsError> {
        let hostname = self.hostname(subdomain);
        let _guard = self.locks.lock(&hostname).await;

        let (kind, stale_kind) = match address {
            IpAddr::V4(_) => (RecordKind::A, RecordKind::Aaaa),
            IpAddr::V6(_) => (RecordKind::Aaaa, RecordKind::A),
        };

        let mut writes = 0;
        let (address_record_id, wrote) = self
            .upsert(&hostname, kind, &hostname, address.to_string())
            .await?;
        writes += wrote as u32;

        // A hub that moved between address families leaves the old record behind
        if let Some(stale) = self.call(&hostname, || self.provider.find(stale_kind, &hostname)).await? {
            if let Some(id) = stale.id {
                self.call(&hostname, || self.provider.delete(&id)).await?;
                writes += 1;
            }
        }

        let srv_content = format!("{} {} {} {}", SRV_PRIORITY, SRV_WEIGHT, port, hostname);
        let srv_name = self.srv_name(subdomain);
        let (srv_record_id, wrote) = self
            .upsert(&hostname, RecordKind::Srv, &srv_name, srv_content)
            .await?;
        writes += wrote as u32;

        if writes > 0 {
            tracing::info!(hostname = %hostname, %address, port, writes, "Published DNS records");
        } else {
            tracing::debug!(hostname = %hostname, "DNS records already current");
        }

        Ok(PublishedHostname {
            hostname,
            address_record_id,
            srv_record_id,
            writes,
        })
    }

    /// Remove every record published for `subdomain`
    pub async fn unpublish(&self, subdomain: &str) -> Result<(), DnsError> {
        let hostname = self.hostname(subdomain);
        let _guard = self.locks.lock(&hostname).await;
        let srv_name = self.srv_name(subdomain);

        for (kind, name) in [
            (RecordKind::A, &hostname),
            (RecordKind::Aaaa, &hostname),
            (RecordKind::Srv, &srv_name),
        ] {
            let found = self.call(&hostname, || self.provider.find(kind, name)).await?;
            if let Some(id) = found.and_then(|r| r.id) {
                self.call(&hostname, || self.provider.delete(&id)).await?;
            }
        }

        tracing::info!(hostname = %hostname, "Removed DNS records");
        Ok(())
    }

    /// Returns the record id and whether a write was needed
    async fn upsert(
        &self,
        hostname: &str,
        kind: RecordKind,
        name: &str,
        content: String,
    ) -> Result<(String, bool), DnsError> {
        let desired = DnsRecord::new(kind, name, content, self.ttl);
        let existing = self.call(hostname, || self.provider.find(kind, name)).await?;

        match existing {
            Some(current) => {
                let id = current
                    .id
                    .clone()
                    .ok_or_else(|| DnsError::Provider(format!("{} record {} has no id", kind, name)))?;
                if current.content == desired.content && current.ttl == desired.ttl {
                    return Ok((id, false));
                }
                self.call(hostname, || self.provider.update(&id, &desired)).await?;
                Ok((id, true))
            }
            None => {
                let id = self.create_once(hostname, &desired).await?;
                Ok((id, true))
            }
        }
    }

    /// Create with retries that never duplicate: a create whose response was
    /// lost may still have landed, so every retry looks for the record first.
    async fn create_once(&self, hostname: &str, desired: &DnsRecord) -> Result<String, DnsError> {
        let attempted = &AtomicBool::new(false);
        let provider = &self.provider;
        self.call(hostname, || async move {
            if attempted.swap(true, Ordering::SeqCst) {
                if let Some(id) = provider.find(desired.kind, &desired.name).await?.and_then(|r| r.id) {
                    tracing::debug!(hostname, name = %desired.name, "Earlier create landed; reusing record");
                    return Ok(id);
                }
            }
            provider.create(desired).await
        })
        .await
    }

    /// One provider call with a timeout per attempt and exponential backoff
    /// between attempts
    async fn call<T, F, Fut>(&self, hostname: &str, op: F) -> Result<T, DnsError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DnsError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => DnsError::Timeout,
            };

            if attempt >= self.max_attempts {
                tracing::warn!(hostname, attempts = attempt, "DNS provider call failed: {}", err);
                return Err(DnsError::PublishFailed {
                    hostname: hostname.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let backoff = self.base_backoff * 2u32.saturating_pow(attempt - 1);
            tracing::debug!(hostname, attempt, ?backoff, "Retrying DNS provider call: {}", err);
            tokio::time::sleep(backoff).await;
        }
    }
}
