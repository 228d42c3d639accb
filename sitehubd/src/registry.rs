//! Credential registry: the authoritative set of managed clients.
//!
//! Every client lives behind its own async mutex so ingestion for one site is
//! serialized while different sites proceed independently. The outer maps use
//! short synchronous locks that are never held across an await.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;
use crate::clock::Clock;
use crate::error::{HubError, Result};
use crate::model::{AuthToken, Client};
use crate::store_manager::StoreHandle;

const MAX_TOKEN_DRAWS: usize = 4;

pub struct Registry {
    clients: RwLock<HashMap<Uuid, Arc<AsyncMutex<Client>>>>,
    credentials: RwLock<HashMap<Uuid, AuthToken>>,
    /// Compared against when the presented id is unknown
    decoy: AuthToken,
    issue_lock: AsyncMutex<()>,
    store: StoreHandle,
    clock: Arc<dyn Clock>,
}

impl Registry {
    /// Hydrate the active set from the store
    pub async fn load(store: StoreHandle, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let stored = store.load_clients().await?;

        let mut clients = HashMap::with_capacity(stored.len());
        let mut credentials = HashMap::with_capacity(stored.len());
        for client in stored {
            credentials.insert(client.id, client.token.clone());
            clients.insert(client.id, Arc::new(AsyncMutex::new(client)));
        }
        tracing::info!(clients = clients.len(), "Loaded client registry");

        Ok(Self {
            clients: RwLock::new(clients),
            credentials: RwLock::new(credentials),
            decoy: AuthToken::generate(),
            issue_lock: AsyncMutex::new(()),
            store,
            clock,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create a client with a fresh identity and token. The record is durable
    /// before this returns.
    pub async fn issue(&self, name: &str, site_url: &str) -> Result<Client> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::Validation("client name must not be empty".to_string()));
        }
        let site_url = normalize_site_url(site_url)?;

        let _guard = self.issue_lock.lock().await;

        for existing in self.list().await {
            if existing.site_url == site_url {
                return Err(HubError::Conflict(format!(
                    "site {} is already managed as client {}",
                    site_url, existing.id
                )));
            }
        }

        let token = self.draw_token().await?;
        let client = Client::new(name.to_string(), site_url, token, self.clock.now());
        self.store.put_client(client.clone()).await?;

        self.credentials.write().insert(client.id, client.token.clone());
        self.clients
            .write()
            .insert(client.id, Arc::new(AsyncMutex::new(client.clone())));

        tracing::info!(client_id = %client.id, name = %client.name, token = %client.token, "Issued client credentials");
        Ok(client)
    }

    /// Tokens are unique across every client ever issued, revoked ones included
    async fn draw_token(&self) -> Result<AuthToken> {
        for _ in 0..MAX_TOKEN_DRAWS {
            let token = AuthToken::generate();
            if !self.store.token_exists(token.expose().to_string()).await? {
                return Ok(token);
            }
            tracing::warn!("Generated token collided with an existing one; drawing again");
        }
        Err(HubError::Internal("could not draw a unique token".to_string()))
    }

    /// Revoke a client's credentials. The token stops authenticating before
    /// anything else happens.
    pub async fn revoke(&self, id: Uuid) -> Result<Client> {
        let entry = self.entry(id)?;
        self.credentials.write().remove(&id);

        let mut guard = entry.lock().await;
        let mut revoked = guard.clone();
        revoked.revoked_at = Some(self.clock.now());

        if let Err(e) = self.store.put_client(revoked.clone()).await {
            // The credential stays removed from memory either way
            tracing::error!(client_id = %id, "Failed to persist revocation: {:#}", e);
            return Err(e.into());
        }
        *guard = revoked.clone();
        drop(guard);

        self.clients.write().remove(&id);
        tracing::info!(client_id = %id, "Revoked client");
        Ok(revoked)
    }

    pub async fn find(&self, id: Uuid) -> Option<Client> {
        let entry = self.clients.read().get(&id).cloned()?;
        let client = entry.lock().await.clone();
        Some(client)
    }

    /// Active clients, oldest first
    pub async fn list(&self) -> Vec<Client> {
        let entries: Vec<_> = self.clients.read().values().cloned().collect();
        let mut clients = Vec::with_capacity(entries.len());
        for entry in entries {
            clients.push(entry.lock().await.clone());
        }
        clients.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        clients
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.clients.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constant-time check of a presented credential pair
    pub fn authenticate(&self, id: Uuid, presented: &str) -> bool {
        let credentials = self.credentials.read();
        match credentials.get(&id) {
            Some(token) => token.matches(presented),
            None => {
                let _ = self.decoy.matches(presented);
                false
            }
        }
    }

    /// Serialized read-modify-write of one client. `f` works on a copy; the copy
    /// is persisted and only then becomes the live record. When `f` fails or
    /// leaves the record unchanged nothing is written.
    pub async fn update<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Client) -> Result<R>,
    ) -> Result<(Client, R)> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        if guard.is_revoked() {
            return Err(HubError::NotFound(format!("client {}", id)));
        }

        let mut next = guard.clone();
        let out = f(&mut next)?;

        if next != *guard {
            self.store.put_client(next.clone()).await?;
            *guard = next.clone();
        }
        Ok((next, out))
    }

    fn entry(&self, id: Uuid) -> Result<Arc<AsyncMutex<Client>>> {
        self.clients
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("client {}", id)))
    }
}

/// Accept only absolute http(s) URLs; drop any trailing slash so the same
/// site cannot be issued twice under two spellings.
fn normalize_site_url(raw: &str) -> Result<String> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| HubError::Validation(format!("invalid site URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(HubError::Validation("site URL must be http(s) with a host".to_string()));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}
