use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::MAX_STACK_FRAMES;

/// Lifecycle status of a managed site as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Pending,
    Healthy,
    Warning,
    Critical,
    Offline,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Pending => "pending",
            ClientStatus::Healthy => "healthy",
            ClientStatus::Warning => "warning",
            ClientStatus::Critical => "critical",
            ClientStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ClientStatus::Pending),
            "healthy" => Some(ClientStatus::Healthy),
            "warning" => Some(ClientStatus::Warning),
            "critical" => Some(ClientStatus::Critical),
            "offline" => Some(ClientStatus::Offline),
            _ => None,
        }
    }
}

/// A plugin or theme installed on a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub name: String,
    pub slug: String,
    pub version: String,
    /// Version offered by the update channel, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_available: Option<String>,
    #[serde(default)]
    pub active: bool,
}

impl InventoryItem {
    /// True when the update channel offers a version other than the installed one.
    pub fn has_update(&self) -> bool {
        self.update_available
            .as_deref()
            .is_some_and(|v| !v.is_empty() && v != self.version)
    }
}

/// Point-in-time health snapshot reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    /// Ratios in [0, 1]
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub security_issues: u32,
    pub timestamp: DateTime<Utc>,
}

impl HealthMetrics {
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("cpuUsage", self.cpu_usage),
            ("memoryUsage", self.memory_usage),
            ("diskUsage", self.disk_usage),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be a ratio in [0, 1], got {}", field, value));
            }
        }
        Ok(())
    }
}

/// Site metadata supplied at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteMeta {
    pub wp_version: String,
    pub php_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub client_id: Uuid,
    pub client_name: String,
    pub site_url: String,
    pub wp_version: String,
    pub php_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,
}

impl RegisterRequest {
    pub fn meta(&self) -> SiteMeta {
        SiteMeta {
            wp_version: self.wp_version.clone(),
            php_version: self.php_version.clone(),
            admin_email: self.admin_email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub client_id: Uuid,
    pub status: ClientStatus,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub client_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Full inventory snapshot. Replaces whatever the hub held before.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResults {
    pub client_id: Uuid,
    #[serde(default)]
    pub plugins: Vec<InventoryItem>,
    #[serde(default)]
    pub themes: Vec<InventoryItem>,
    pub metrics: HealthMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanAck {
    pub client_id: Uuid,
    pub status: ClientStatus,
    pub plugins: Vec<InventoryItem>,
    pub themes: Vec<InventoryItem>,
    pub metrics: HealthMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Plugin,
    Theme,
    Core,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItem {
    pub kind: ItemKind,
    pub slug: String,
}

/// Result of one item of a previously issued update command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub kind: ItemKind,
    pub slug: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResults {
    pub client_id: Uuid,
    pub results: Vec<UpdateOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAck {
    pub accepted: usize,
    pub rescan_requested: bool,
}

/// Structural classification of a PHP/WordPress error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fatal,
    Parse,
    Core,
    Warning,
    Notice,
    Deprecated,
    Http,
    Database,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fatal => "fatal",
            ErrorKind::Parse => "parse",
            ErrorKind::Core => "core",
            ErrorKind::Warning => "warning",
            ErrorKind::Notice => "notice",
            ErrorKind::Deprecated => "deprecated",
            ErrorKind::Http => "http",
            ErrorKind::Database => "database",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fatal" => Some(ErrorKind::Fatal),
            "parse" => Some(ErrorKind::Parse),
            "core" => Some(ErrorKind::Core),
            "warning" => Some(ErrorKind::Warning),
            "notice" => Some(ErrorKind::Notice),
            "deprecated" => Some(ErrorKind::Deprecated),
            "http" => Some(ErrorKind::Http),
            "database" => Some(ErrorKind::Database),
            _ => None,
        }
    }

    /// Kinds the hub treats as critical under its default severity map. The
    /// agent uses this to decide which reports bypass its queue.
    pub fn is_critical_by_default(&self) -> bool {
        matches!(
            self,
            ErrorKind::Fatal | ErrorKind::Parse | ErrorKind::Core | ErrorKind::Database
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// Best-effort request context; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Agent-assigned id; the same report submitted twice is stored once
    #[serde(default = "Uuid::new_v4")]
    pub report_id: Uuid,
    pub client_id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
    #[serde(default)]
    pub request: RequestContext,
    #[serde(default)]
    pub memory_usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(client_id: Uuid, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            report_id: Uuid::new_v4(),
            client_id,
            kind,
            message: message.into(),
            file: None,
            line: None,
            stack: Vec::new(),
            request: RequestContext::default(),
            memory_usage: 0,
            http_status: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_stack(mut self, stack: Vec<StackFrame>) -> Self {
        self.stack = stack;
        self
    }

    /// Boundary validation. Oversized stacks are truncated rather than rejected.
    pub fn normalize(&mut self) -> Result<(), String> {
        if self.message.trim().is_empty() {
            return Err("error report message must not be empty".to_string());
        }
        self.stack.truncate(MAX_STACK_FRAMES);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBatch {
    pub client_id: Uuid,
    pub reports: Vec<ErrorReport>,
}

/// Body of the error-report endpoint: a batch flushed from the agent queue, or a
/// single report sent straight away.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorSubmission {
    Batch(ErrorBatch),
    Single(ErrorReport),
}

impl ErrorSubmission {
    pub fn client_id(&self) -> Uuid {
        match self {
            ErrorSubmission::Batch(batch) => batch.client_id,
            ErrorSubmission::Single(report) => report.client_id,
        }
    }

    pub fn into_reports(self) -> Vec<ErrorReport> {
        match self {
            ErrorSubmission::Batch(batch) => batch.reports,
            ErrorSubmission::Single(report) => vec![report],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAck {
    pub accepted: usize,
    pub duplicates: usize,
    pub tickets_created: usize,
    /// Reports in a batch that failed validation and were skipped
    #[serde(default)]
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTicketAck {
    pub ticket_id: Uuid,
    pub created: bool,
}

/// Site activity reported by the agent's hook bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Error(ErrorReport),
    Activated {
        timestamp: DateTime<Utc>,
    },
    Deactivated {
        timestamp: DateTime<Utc>,
    },
    PluginActivated {
        slug: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        timestamp: DateTime<Utc>,
    },
    PluginDeactivated {
        slug: String,
        timestamp: DateTime<Utc>,
    },
    ThemeSwitched {
        slug: String,
        timestamp: DateTime<Utc>,
    },
    CoreUpdated {
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Error(_) => "error",
            AgentEvent::Activated { .. } => "activated",
            AgentEvent::Deactivated { .. } => "deactivated",
            AgentEvent::PluginActivated { .. } => "plugin_activated",
            AgentEvent::PluginDeactivated { .. } => "plugin_deactivated",
            AgentEvent::ThemeSwitched { .. } => "theme_switched",
            AgentEvent::CoreUpdated { .. } => "core_updated",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AgentEvent::Error(report) => report.timestamp,
            AgentEvent::Activated { timestamp }
            | AgentEvent::Deactivated { timestamp }
            | AgentEvent::PluginActivated { timestamp, .. }
            | AgentEvent::PluginDeactivated { timestamp, .. }
            | AgentEvent::ThemeSwitched { timestamp, .. }
            | AgentEvent::CoreUpdated { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub client_id: Uuid,
    pub events: Vec<AgentEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    pub accepted: usize,
    pub errors: usize,
    pub tickets_created: usize,
    #[serde(default)]
    pub rejected: usize,
}

/// Command the hub sends to an agent's REST surface. Results come back through
/// the ingestion endpoints, never in the response to this call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    Scan {
        #[serde(rename = "requestId")]
        request_id: Uuid,
    },
    Update {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        items: Vec<UpdateItem>,
    },
}

impl AgentCommand {
    pub fn scan() -> Self {
        AgentCommand::Scan {
            request_id: Uuid::new_v4(),
        }
    }

    pub fn update(items: Vec<UpdateItem>) -> Self {
        AgentCommand::Update {
            request_id: Uuid::new_v4(),
            items,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::Scan { .. } => "scan",
            AgentCommand::Update { .. } => "update",
        }
    }
}

/// JSON body of every non-2xx hub response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    pub code: u16,
}
