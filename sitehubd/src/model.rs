//! Hub-side records: clients and tickets

use std::fmt;
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use shared::types::{ClientStatus, HealthMetrics, InventoryItem, SiteMeta, UpdateOutcome};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Opaque per-client credential. Formatting only ever shows a short prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// 32 bytes from the OS RNG, hex encoded
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    /// The full token. Only for persistence, outbound agent calls and the
    /// one-time issue response.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented token
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "{}…", prefix)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Dns,
    Agent,
}

/// Last failure talking to something outside the hub on behalf of a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamFault {
    pub kind: FaultKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub received_at: DateTime<Utc>,
    pub outcomes: Vec<UpdateOutcome>,
}

impl UpdateReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.succeeded).count()
    }
}

/// One managed site
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub site_url: String,
    #[serde(skip_serializing)]
    pub token: AuthToken,
    pub status: ClientStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub meta: Option<SiteMeta>,
    pub plugins: Vec<InventoryItem>,
    pub themes: Vec<InventoryItem>,
    pub inventory_digest: Option<String>,
    pub metrics: Option<HealthMetrics>,
    pub dns_hostname: Option<String>,
    pub last_update: Option<UpdateReport>,
    pub upstream_fault: Option<UpstreamFault>,
    pub created_at: DateTime<Utc>,
    pub registered_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Client {
    pub fn new(name: String, site_url: String, token: AuthToken, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            site_url,
            token,
            status: ClientStatus::Pending,
            last_seen: None,
            meta: None,
            plugins: Vec::new(),
            themes: Vec::new(),
            inventory_digest: None,
            metrics: None,
            dns_hostname: None,
            last_update: None,
            upstream_fault: None,
            created_at: now,
            registered_at: None,
            revoked_at: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered_at.is_some()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// DNS label for this client: slugified name plus a short id suffix
    pub fn subdomain(&self) -> String {
        let mut slug = String::new();
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        let mut slug = slug.trim_end_matches('-').to_string();
        slug.truncate(40);
        let slug = slug.trim_end_matches('-');
        let slug = if slug.is_empty() { "site" } else { slug };
        let id = self.id.simple().to_string();
        format!("{}-{}", slug, &id[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Completed,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Completed => "completed",
            TicketStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(TicketStatus::Open),
            "in_progress" => Some(TicketStatus::InProgress),
            "completed" => Some(TicketStatus::Completed),
            "closed" => Some(TicketStatus::Closed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TicketStatus::Open | TicketStatus::InProgress)
    }

    /// Forward moves plus reopening a finished ticket
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Open, InProgress | Completed | Closed) => true,
            (InProgress, Completed | Closed | Open) => true,
            (Completed | Closed, Open) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::Low => "low",
            TicketPriority::Medium => "medium",
            TicketPriority::High => "high",
            TicketPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TicketPriority::Low),
            "medium" => Some(TicketPriority::Medium),
            "high" => Some(TicketPriority::High),
            "critical" => Some(TicketPriority::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentAuthor {
    System,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketComment {
    pub author: CommentAuthor,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub client_id: Option<Uuid>,
    /// Dedup key for auto-created tickets
    pub fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub comments: Vec<TicketComment>,
}

impl Ticket {
    pub fn new(
        title: String,
        description: String,
        priority: TicketPriority,
        client_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            description,
            status: TicketStatus::Open,
            priority,
            client_id,
            fingerprint: None,
            created_at: now,
            updated_at: now,
            comments: Vec::new(),
        }
    }

    pub fn add_comment(&mut self, author: CommentAuthor, body: String, now: DateTime<Utc>) {
        self.comments.push(TicketComment {
            author,
            body,
            created_at: now,
        });
        self.updated_at = now;
    }
}
