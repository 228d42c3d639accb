use std::thread;
use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::types::{AgentEvent, ErrorKind, ErrorReport};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use crate::model::{Client, Ticket};
use crate::store::db::HubDb;

/// Commands sent to the store thread
pub enum StoreCommand {
    PutClient(Box<Client>, oneshot::Sender<Result<()>>),
    LoadClients(oneshot::Sender<Result<Vec<Client>>>),
    GetClient(Uuid, oneshot::Sender<Result<Option<Client>>>),
    TokenExists(String, oneshot::Sender<Result<bool>>),
    AppendErrors {
        reports: Vec<ErrorReport>,
        received_at: DateTime<Utc>,
        reply: oneshot::Sender<Result<Vec<bool>>>,
    },
    CountErrors {
        client_id: Uuid,
        kind: ErrorKind,
        since: DateTime<Utc>,
        reply: oneshot::Sender<Result<u64>>,
    },
    RecentErrors {
        client_id: Uuid,
        limit: u32,
        reply: oneshot::Sender<Result<Vec<ErrorReport>>>,
    },
    AppendEvents {
        client_id: Uuid,
        events: Vec<AgentEvent>,
        received_at: DateTime<Utc>,
        reply: oneshot::Sender<Result<()>>,
    },
    PutTicket(Box<Ticket>, oneshot::Sender<Result<()>>),
    GetTicket(Uuid, oneshot::Sender<Result<Option<Ticket>>>),
    FindTicket {
        client_id: Uuid,
        fingerprint: String,
        active_since: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<Option<Ticket>>>,
    },
    ListTickets(Option<Uuid>, oneshot::Sender<Result<Vec<Ticket>>>),
    Shutdown,
}

/// Handle to the single thread that owns the database connection
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread around an open database
    pub fn spawn(db: HubDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::PutClient(client, reply) => {
                        let _ = reply.send(db.put_client(&client));
                    }
                    StoreCommand::LoadClients(reply) => {
                        let _ = reply.send(db.load_active_clients());
                    }
                    StoreCommand::GetClient(id, reply) => {
                        let _ = reply.send(db.get_client(id));
                    }
                    StoreCommand::TokenExists(token, reply) => {
                        let _ = reply.send(db.token_exists(&token));
                    }
                    StoreCommand::AppendErrors { reports, received_at, reply } => {
                        let result = reports
                            .iter()
                            .map(|r| db.insert_error(r, received_at))
                            .collect::<Result<Vec<_>>>();
                        let _ = reply.send(result);
                    }
                    StoreCommand::CountErrors { client_id, kind, since, reply } => {
                        let _ = reply.send(db.count_errors_since(client_id, kind, since));
                    }
                    StoreCommand::RecentErrors { client_id, limit, reply } => {
                        let _ = reply.send(db.recent_errors(client_id, limit));
                    }
                    StoreCommand::AppendEvents { client_id, events, received_at, reply } => {
                        let result = events
                            .iter()
                            .try_for_each(|e| db.insert_event(client_id, e, received_at));
                        let _ = reply.send(result);
                    }
                    StoreCommand::PutTicket(ticket, reply) => {
                        let _ = reply.send(db.put_ticket(&ticket));
                    }
                    StoreCommand::GetTicket(id, reply) => {
                        let _ = reply.send(db.get_ticket(id));
                    }
                    StoreCommand::FindTicket { client_id, fingerprint, active_since, reply } => {
                        let result =
                            db.find_ticket_by_fingerprint(client_id, &fingerprint, active_since);
                        let _ = reply.send(result);
                    }
                    StoreCommand::ListTickets(client_id, reply) => {
                        let _ = reply.send(db.list_tickets(client_id));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Open `path` and spawn the store thread
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::spawn(HubDb::open(path)?))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> StoreCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| anyhow::anyhow!("store thread is gone"))?;
        rx.await?
    }

    /// Persist a client. Returns once the row is durable.
    pub async fn put_client(&self, client: Client) -> Result<()> {
        self.request(|reply| StoreCommand::PutClient(Box::new(client), reply)).await
    }

    pub async fn load_clients(&self) -> Result<Vec<Client>> {
        self.request(StoreCommand::LoadClients).await
    }

    pub async fn get_client(&self, id: Uuid) -> Result<Option<Client>> {
        self.request(|reply| StoreCommand::GetClient(id, reply)).await
    }

    pub async fn token_exists(&self, token: String) -> Result<bool> {
        self.request(|reply| StoreCommand::TokenExists(token, reply)).await
    }

    /// Append reports; each flag says whether that report was new
    pub async fn append_errors(
        &self,
        reports: Vec<ErrorReport>,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<bool>> {
        self.request(|reply| StoreCommand::AppendErrors { reports, received_at, reply })
            .await
    }

    pub async fn count_errors(
        &self,
        client_id: Uuid,
        kind: ErrorKind,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        self.request(|reply| StoreCommand::CountErrors { client_id, kind, since, reply })
            .await
    }

    pub async fn recent_errors(&self, client_id: Uuid, limit: u32) -> Result<Vec<ErrorReport>> {
        self.request(|reply| StoreCommand::RecentErrors { client_id, limit, reply })
            .await
    }

    pub async fn append_events(
        &self,
        client_id: Uuid,
        events: Vec<AgentEvent>,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        self.request(|reply| StoreCommand::AppendEvents {
            client_id,
            events,
            received_at,
            reply,
        })
        .await
    }

    pub async fn put_ticket(&self, ticket: Ticket) -> Result<()> {
        self.request(|reply| StoreCommand::PutTicket(Box::new(ticket), reply)).await
    }

    pub async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>> {
        self.request(|reply| StoreCommand::GetTicket(id, reply)).await
    }

    pub async fn find_ticket(
        &self,
        client_id: Uuid,
        fingerprint: String,
        active_since: Option<DateTime<Utc>>,
    ) -> Result<Option<Ticket>> {
        self.request(|reply| StoreCommand::FindTicket {
            client_id,
            fingerprint,
            active_since,
            reply,
        })
        .await
    }

    pub async fn list_tickets(&self, client_id: Option<Uuid>) -> Result<Vec<Ticket>> {
        self.request(|reply| StoreCommand::ListTickets(client_id, reply)).await
    }

    /// Stop the store thread after queued commands drain
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("store thread is gone"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthToken, TicketPriority};

    #[tokio::test]
    async fn test_handle_round_trips_through_thread() {
        let store = StoreHandle::open(":memory:").unwrap();
        let client = Client::new(
            "Shop".to_string(),
            "https://shop.example".to_string(),
            AuthToken::generate(),
            Utc::now(),
        );
        store.put_client(client.clone()).await.unwrap();

        let loaded = store.load_clients().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(store.token_exists(client.token.expose().to_string()).await.unwrap());

        let report = ErrorReport::new(client.id, ErrorKind::Notice, "notice");
        let flags = store
            .append_errors(vec![report.clone(), report], Utc::now())
            .await
            .unwrap();
        assert_eq!(flags, vec![true, false]);

        let ticket = Ticket::new("t".into(), "d".into(), TicketPriority::Low, Some(client.id), Utc::now());
        store.put_ticket(ticket.clone()).await.unwrap();
        assert_eq!(store.get_ticket(ticket.id).await.unwrap().unwrap().id, ticket.id);

        store.shutdown().await.unwrap();
    }
}
