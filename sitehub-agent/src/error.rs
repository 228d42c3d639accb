use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The hub could not be reached at all
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("hub rejected credentials")]
    Unauthorized,

    /// Non-2xx answer carrying the hub's error body
    #[error("hub returned {status} ({kind}): {message}")]
    Hub {
        status: u16,
        kind: String,
        message: String,
    },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("activation state: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether the call can be repeated later unchanged
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Connection(_) | AgentError::Timeout => true,
            AgentError::Hub { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentError::Timeout
        } else if err.is_decode() {
            AgentError::Decode(err.to_string())
        } else {
            AgentError::Connection(err.to_string())
        }
    }
}
