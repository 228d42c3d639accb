use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use crate::correlation::Severity;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hub: HubConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Defaults to the system hostname
    #[serde(default)]
    pub name: Option<String>,
    /// Fixed public address; when unset the address is discovered via `address_echo_url`
    #[serde(default)]
    pub public_address: Option<IpAddr>,
    #[serde(default)]
    pub address_echo_url: Option<String>,
    #[serde(default = "default_address_check_interval")]
    pub address_check_interval_secs: u64,
    /// Port agents reach the hub on, published in the SRV record
    #[serde(default = "default_public_port")]
    pub public_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bearer token for the operator API; the operator API is closed when unset
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_staleness_window")]
    pub staleness_window_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_usage_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_usage_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_usage_threshold")]
    pub disk_threshold: f64,
    #[serde(default = "default_error_count_threshold")]
    pub error_count_threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsProviderKind {
    None,
    Memory,
    Cloudflare,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_provider")]
    pub provider: DnsProviderKind,
    /// Zone under which client hostnames are published, e.g. "hub.example.com"
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default = "default_cloudflare_base")]
    pub api_base: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_recurring_threshold")]
    pub recurring_threshold: u32,
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
    #[serde(default = "default_http_severity")]
    pub http_severity: Severity,
    #[serde(default = "default_database_severity")]
    pub database_severity: Severity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_command_path")]
    pub command_path: String,
}

fn default_address_check_interval() -> u64 {
    300
}

fn default_public_port() -> u16 {
    8443
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/sitehub/hub.db")
}

fn default_heartbeat_interval() -> u64 {
    shared::protocol::HEARTBEAT_INTERVAL_SECS
}

fn default_staleness_window() -> u64 {
    3 * default_heartbeat_interval()
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_usage_threshold() -> f64 {
    0.9
}

fn default_error_count_threshold() -> u32 {
    10
}

fn default_dns_provider() -> DnsProviderKind {
    DnsProviderKind::None
}

fn default_cloudflare_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_ttl() -> u32 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    10
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_recurring_threshold() -> u32 {
    3
}

fn default_window_hours() -> u32 {
    24
}

fn default_http_severity() -> Severity {
    Severity::Warning
}

fn default_database_severity() -> Severity {
    Severity::Critical
}

fn default_max_concurrent() -> usize {
    8
}

fn default_command_path() -> String {
    shared::protocol::AGENT_COMMAND_PATH.to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_token: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            staleness_window_secs: default_staleness_window(),
            sweep_interval_secs: default_sweep_interval(),
            cpu_threshold: default_usage_threshold(),
            memory_threshold: default_usage_threshold(),
            disk_threshold: default_usage_threshold(),
            error_count_threshold: default_error_count_threshold(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            provider: default_dns_provider(),
            zone: String::new(),
            api_token: None,
            zone_id: None,
            api_base: default_cloudflare_base(),
            ttl: default_ttl(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            request_timeout_secs: default_request_timeout(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            recurring_threshold: default_recurring_threshold(),
            window_hours: default_window_hours(),
            http_severity: default_http_severity(),
            database_severity: default_database_severity(),
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_concurrent: default_max_concurrent(),
            command_path: default_command_path(),
        }
    }
}

impl MonitorConfig {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_window_secs as i64)
    }
}

impl DnsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl CorrelationConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours as i64)
    }
}

impl AgentsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.monitor.staleness_window_secs < self.monitor.heartbeat_interval_secs {
            bail!("monitor.staleness_window_secs must be at least one heartbeat interval");
        }
        if self.dns.provider != DnsProviderKind::None && self.dns.zone.is_empty() {
            bail!("dns.zone is required when a DNS provider is configured");
        }
        if self.dns.provider == DnsProviderKind::Cloudflare
            && (self.dns.api_token.is_none() || self.dns.zone_id.is_none())
        {
            bail!("dns.api_token and dns.zone_id are required for the cloudflare provider");
        }
        if self.api.tls_cert.is_some() != self.api.tls_key.is_some() {
            bail!("api.tls_cert and api.tls_key must be set together");
        }
        if self.dns.max_attempts == 0 || self.agents.max_concurrent == 0 || self.dns.workers == 0 {
            bail!("attempt, worker and concurrency limits must be positive");
        }
        if self.monitor.sweep_interval_secs == 0 || self.hub.address_check_interval_secs == 0 {
            bail!("monitor.sweep_interval_secs and hub.address_check_interval_secs must be positive");
        }
        Ok(())
    }

    /// Hub name used in logs and the health endpoint
    pub fn hub_name(&self) -> String {
        self.hub.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "sitehub".to_string())
        })
    }

    /// Configuration with defaults everywhere, used by tests
    pub fn for_tests() -> Self {
        Self {
            hub: HubConfig {
                name: Some("test-hub".to_string()),
                public_address: None,
                address_echo_url: None,
                address_check_interval_secs: default_address_check_interval(),
                public_port: default_public_port(),
            },
            api: ApiConfig {
                admin_token: Some("admin-secret".to_string()),
                ..ApiConfig::default()
            },
            store: StoreConfig {
                db_path: PathBuf::from(":memory:"),
            },
            monitor: MonitorConfig::default(),
            dns: DnsConfig::default(),
            correlation: CorrelationConfig::default(),
            agents: AgentsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse("[hub]\npublic_port = 9443\n").unwrap();
        assert_eq!(config.hub.public_port, 9443);
        assert_eq!(config.monitor.staleness_window_secs, 900);
        assert_eq!(config.correlation.recurring_threshold, 3);
        assert_eq!(config.correlation.http_severity, Severity::Warning);
        assert_eq!(config.correlation.database_severity, Severity::Critical);
        assert_eq!(config.dns.provider, DnsProviderKind::None);
        assert!(config.api.admin_token.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [hub]
            name = "hub-1"
            public_address = "203.0.113.7"

            [api]
            listen = "0.0.0.0:9443"
            admin_token = "s3cret"

            [dns]
            provider = "cloudflare"
            zone = "hub.example.com"
            api_token = "tok"
            zone_id = "zone"

            [correlation]
            http_severity = "info"
            "#,
        )
        .unwrap();
        assert_eq!(config.hub_name(), "hub-1");
        assert_eq!(config.dns.provider, DnsProviderKind::Cloudflare);
        assert_eq!(config.correlation.http_severity, Severity::Info);
    }

    #[test]
    fn test_rejects_inconsistent_config() {
        assert!(Config::parse("[hub]\n[dns]\nprovider = \"memory\"\n").is_err());
        assert!(Config::parse("[hub]\n[dns]\nprovider = \"cloudflare\"\nzone = \"z\"\n").is_err());
        assert!(Config::parse("[hub]\n[monitor]\nstaleness_window_secs = 10\n").is_err());
        assert!(Config::parse("[hub]\n[api]\ntls_cert = \"/tmp/c.pem\"\n").is_err());
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let err = Config::parse("[hub]\n[monitor]\nsweep_interval_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("sweep_interval_secs"));
        assert!(Config::parse("[hub]\naddress_check_interval_secs = 0\n").is_err());
        assert!(Config::parse("[hub]\naddress_check_interval_secs = 1\n[monitor]\nsweep_interval_secs = 1\n").is_ok());
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::parse(include_str!("../sitehubd.example.toml")).unwrap();
        assert_eq!(config.monitor.staleness_window_secs, 900);
        assert_eq!(config.agents.command_path, shared::protocol::AGENT_COMMAND_PATH);
    }
}
