/// Header carrying the agent's client identifier on every call
pub const HEADER_CLIENT_ID: &str = "x-sitehub-client";

/// Header carrying the agent's issued token on every call
pub const HEADER_TOKEN: &str = "x-sitehub-token";

/// Agent -> hub endpoints
pub const PATH_REGISTER: &str = "/api/register";
pub const PATH_HEARTBEAT: &str = "/api/heartbeat";
pub const PATH_SCAN_RESULTS: &str = "/api/scan-results";
pub const PATH_UPDATE_RESULTS: &str = "/api/update-results";
pub const PATH_EVENTS: &str = "/api/events";
pub const PATH_ERROR_REPORT: &str = "/api/error-report";
pub const PATH_AUTO_TICKET: &str = "/api/auto-ticket";

/// Hub -> agent command endpoint, relative to the site base URL
pub const AGENT_COMMAND_PATH: &str = "/wp-json/sitehub/v1/command";

/// SRV service label the hub publishes for each client hostname
pub const SRV_SERVICE: &str = "_sitehub._tcp";

/// Upper bound on stack frames kept per error report
pub const MAX_STACK_FRAMES: usize = 50;

/// How long the agent holds non-critical error reports before flushing
pub const ERROR_QUEUE_WINDOW_SECS: u64 = 300;

/// Default agent heartbeat cadence
pub const HEARTBEAT_INTERVAL_SECS: u64 = 300;
