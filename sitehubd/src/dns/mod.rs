//! DNS publication of client hostnames.
//!
//! Providers expose plain record CRUD; the publisher composes read-before-write
//! upserts with retry on top, and the address module keeps every active client
//! pointed at the hub's current public address.

pub mod address;
pub mod cloudflare;
pub mod memory;
pub mod publisher;

use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::config::{DnsConfig, DnsProviderKind};

pub use cloudflare::CloudflareProvider;
pub use memory::MemoryDnsProvider;
pub use publisher::{PublishedHostname, Publisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
    #[serde(rename = "SRV")]
    Srv,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::A => "A",
            RecordKind::Aaaa => "AAAA",
            RecordKind::Srv => "SRV",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-side record. SRV content is `"<priority> <weight> <port> <target>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: Option<String>,
    pub kind: RecordKind,
    pub name: String,
    pub content: String,
    pub ttl: u32,
}

impl DnsRecord {
    pub fn new(kind: RecordKind, name: impl Into<String>, content: impl Into<String>, ttl: u32) -> Self {
        Self {
            id: None,
            kind,
            name: name.into(),
            content: content.into(),
            ttl,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DnsError {
    #[error("provider rejected credentials")]
    Unauthorized,

    #[error("provider rate limit hit")]
    RateLimited,

    #[error("provider request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("publishing {hostname} failed after {attempts} attempts: {last}")]
    PublishFailed {
        hostname: String,
        attempts: u32,
        last: Box<DnsError>,
    },
}

/// Record CRUD against one zone
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn find(&self, kind: RecordKind, name: &str) -> Result<Option<DnsRecord>, DnsError>;

    /// Returns the provider's id for the new record
    async fn create(&self, record: &DnsRecord) -> Result<String, DnsError>;

    async fn update(&self, id: &str, record: &DnsRecord) -> Result<(), DnsError>;

    async fn delete(&self, id: &str) -> Result<(), DnsError>;
}

/// Provider selected in configuration; `None` when publication is disabled
pub fn provider_from_config(config: &DnsConfig) -> anyhow::Result<Option<Arc<dyn DnsProvider>>> {
    match config.provider {
        DnsProviderKind::None => Ok(None),
        DnsProviderKind::Memory => {
            tracing::warn!("Using in-memory DNS provider; records are not published anywhere");
            Ok(Some(Arc::new(MemoryDnsProvider::new())))
        }
        DnsProviderKind::Cloudflare => Ok(Some(Arc::new(CloudflareProvider::from_config(config)?))),
    }
}
