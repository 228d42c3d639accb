//! Outbound calls from a site to its hub

use std::fmt;
use std::time::Duration;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::protocol::{
    HEADER_CLIENT_ID, HEADER_TOKEN, PATH_AUTO_TICKET, PATH_ERROR_REPORT, PATH_EVENTS,
    PATH_HEARTBEAT, PATH_REGISTER, PATH_SCAN_RESULTS, PATH_UPDATE_RESULTS,
};
use shared::types::{
    AgentEvent, AutoTicketAck, ErrorAck, ErrorBatch, ErrorBody, ErrorReport, ErrorSubmission,
    EventAck, EventBatch, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    ScanAck, ScanResults, UpdateAck, UpdateOutcome, UpdateResults,
};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use crate::error::{AgentError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The identity a hub issued to this site
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: Uuid,
    pub token: String,
}

impl Credentials {
    pub fn new(client_id: Uuid, token: impl Into<String>) -> Self {
        Self {
            client_id,
            token: token.into(),
        }
    }

    /// Constant-time check of a presented pair, used for inbound hub commands
    pub fn verify(&self, client_id: &str, token: &str) -> bool {
        let id_ok = client_id.trim().eq_ignore_ascii_case(&self.client_id.to_string());
        let token_ok: bool = self.token.as_bytes().ct_eq(token.as_bytes()).into();
        id_ok & token_ok
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.token.chars().take(6).collect();
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("token", &format_args!("{}…", prefix))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HubClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Result<Self> {
        Self::with_timeout(base_url, credentials, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, credentials: Credentials, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn client_id(&self) -> Uuid {
        self.credentials.client_id
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        self.post(PATH_REGISTER, request).await
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatResponse> {
        let body = HeartbeatRequest {
            client_id: self.client_id(),
            timestamp: chrono::Utc::now(),
        };
        self.post(PATH_HEARTBEAT, &body).await
    }

    pub async fn scan_results(&self, scan: &ScanResults) -> Result<ScanAck> {
        self.post(PATH_SCAN_RESULTS, scan).await
    }

    pub async fn update_results(&self, results: Vec<UpdateOutcome>) -> Result<UpdateAck> {
        let body = UpdateResults {
            client_id: self.client_id(),
            results,
        };
        self.post(PATH_UPDATE_RESULTS, &body).await
    }

    pub async fn events(&self, events: Vec<AgentEvent>) -> Result<EventAck> {
        let body = EventBatch {
            client_id: self.client_id(),
            events,
        };
        self.post(PATH_EVENTS, &body).await
    }

    pub async fn report_error(&self, report: &ErrorReport) -> Result<ErrorAck> {
        self.post(PATH_ERROR_REPORT, &ErrorSubmission::Single(report.clone())).await
    }

    pub async fn report_errors(&self, reports: Vec<ErrorReport>) -> Result<ErrorAck> {
        let body = ErrorSubmission::Batch(ErrorBatch {
            client_id: self.client_id(),
            reports,
        });
        self.post(PATH_ERROR_REPORT, &body).await
    }

    pub async fn auto_ticket(&self, report: &ErrorReport) -> Result<AutoTicketAck> {
        self.post(PATH_AUTO_TICKET, report).await
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header(HEADER_CLIENT_ID, self.credentials.client_id.to_string())
            .header(HEADER_TOKEN, &self.credentials.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response.json::<R>().await.map_err(|e| AgentError::Decode(e.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(AgentError::Unauthorized);
        }

        let text = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => AgentError::Hub {
                status: status.as_u16(),
                kind: body.kind,
                message: body.error,
            },
            Err(_) => AgentError::Hub {
                status: status.as_u16(),
                kind: "unknown".to_string(),
                message: text,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_verify() {
        let id = Uuid::new_v4();
        let creds = Credentials::new(id, "a1b2c3d4e5f6");

        assert!(creds.verify(&id.to_string(), "a1b2c3d4e5f6"));
        assert!(creds.verify(&id.to_string().to_uppercase(), "a1b2c3d4e5f6"));
        assert!(!creds.verify(&id.to_string(), "a1b2c3d4e5f7"));
        assert!(!creds.verify(&Uuid::new_v4().to_string(), "a1b2c3d4e5f6"));
        assert!(!creds.verify("", ""));
    }

    #[test]
    fn test_debug_hides_token() {
        let creds = Credentials::new(Uuid::new_v4(), "a1b2c3d4e5f6a7b8");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("a1b2c3"));
        assert!(!shown.contains("a1b2c3d4e5f6a7b8"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = HubClient::new("https://hub.example.com/", Credentials::new(Uuid::new_v4(), "t")).unwrap();
        assert_eq!(client.base_url(), "https://hub.example.com");
    }
}
