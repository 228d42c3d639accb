//! Activation state persisted next to the site, so registration happens once

use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::RegisterRequest;
use uuid::Uuid;
use crate::client::{Credentials, HubClient};
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationState {
    pub hub_url: String,
    pub client_id: Uuid,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

impl ActivationState {
    pub fn new(hub_url: impl Into<String>, credentials: &Credentials) -> Self {
        Self {
            hub_url: hub_url.into(),
            client_id: credentials.client_id,
            token: credentials.token.clone(),
            registered_at: None,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.client_id, self.token.clone())
    }

    pub fn is_registered(&self) -> bool {
        self.registered_at.is_some()
    }
}

pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<ActivationState>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AgentError::State(format!("read {}: {}", self.path.display(), e))),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| AgentError::State(format!("parse {}: {}", self.path.display(), e)))
    }

    /// Write through a sibling temp file so a crash never leaves half a state file
    pub fn save(&self, state: &ActivationState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| AgentError::State(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::State(format!("create {}: {}", parent.display(), e)))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| AgentError::State(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| AgentError::State(format!("rename to {}: {}", self.path.display(), e)))
    }
}

/// Register with the hub unless this site already has. Returns whether a
/// register call was made.
pub async fn ensure_registered(
    file: &StateFile,
    state: &mut ActivationState,
    client: &HubClient,
    request: &RegisterRequest,
) -> Result<bool> {
    if state.is_registered() {
        tracing::debug!(client_id = %state.client_id, "Already registered; skipping");
        return Ok(false);
    }

    let response = client.register(request).await?;
    state.registered_at = Some(response.registered_at);
    file.save(state)?;
    tracing::info!(client_id = %state.client_id, status = response.status.as_str(), "Registered with hub");
    Ok(true)
}
