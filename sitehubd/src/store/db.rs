use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use shared::types::{AgentEvent, ClientStatus, ErrorKind, ErrorReport};
use uuid::Uuid;
use crate::model::{AuthToken, Client, Ticket, TicketPriority, TicketStatus};

const CLIENT_COLUMNS: &str = "id, name, site_url, token, status, last_seen, meta, plugins, themes,
     inventory_digest, metrics, dns_hostname, last_update, upstream_fault,
     created_at, registered_at, revoked_at";

const TICKET_COLUMNS: &str = "id, title, description, status, priority, client_id, fingerprint,
     created_at, updated_at, comments";

pub struct HubDb {
    conn: Connection,
}

impl HubDb {
    /// Open or create the SQLite database with WAL mode and full fsync
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Credentials handed to an agent must survive a crash right after issue
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .context("Failed to configure journal")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS clients (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                site_url         TEXT NOT NULL,
                token            TEXT NOT NULL UNIQUE,
                status           TEXT NOT NULL,
                last_seen        TEXT,
                meta             TEXT,
                plugins          TEXT NOT NULL,
                themes           TEXT NOT NULL,
                inventory_digest TEXT,
                metrics          TEXT,
                dns_hostname     TEXT,
                last_update      TEXT,
                upstream_fault   TEXT,
                created_at       TEXT NOT NULL,
                registered_at    TEXT,
                revoked_at       TEXT
            );

            CREATE TABLE IF NOT EXISTS error_reports (
                report_id   TEXT PRIMARY KEY,
                client_id   TEXT NOT NULL,
                kind        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                received_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_errors_client_kind
                ON error_reports(client_id, kind, received_at);

            CREATE TABLE IF NOT EXISTS agent_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id   TEXT NOT NULL,
                kind        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                received_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tickets (
                id          TEXT PRIMARY KEY,
                title       TEXT NOT NULL,
                description TEXT NOT NULL,
                status      TEXT NOT NULL,
                priority    TEXT NOT NULL,
                client_id   TEXT,
                fingerprint TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                comments    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tickets_fingerprint ON tickets(client_id, fingerprint);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert or replace a client row
    pub fn put_client(&self, client: &Client) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO clients (
                id, name, site_url, token, status, last_seen, meta, plugins, themes,
                inventory_digest, metrics, dns_hostname, last_update, upstream_fault,
                created_at, registered_at, revoked_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                site_url = excluded.site_url,
                token = excluded.token,
                status = excluded.status,
                last_seen = excluded.last_seen,
                meta = excluded.meta,
                plugins = excluded.plugins,
                themes = excluded.themes,
                inventory_digest = excluded.inventory_digest,
                metrics = excluded.metrics,
                dns_hostname = excluded.dns_hostname,
                last_update = excluded.last_update,
                upstream_fault = excluded.upstream_fault,
                registered_at = excluded.registered_at,
                revoked_at = excluded.revoked_at
            "#,
            params![
                client.id.to_string(),
                &client.name,
                &client.site_url,
                client.token.expose(),
                client.status.as_str(),
                client.last_seen.map(ts),
                to_json_opt(&client.meta)?,
                serde_json::to_string(&client.plugins).context("Failed to serialize plugins")?,
                serde_json::to_string(&client.themes).context("Failed to serialize themes")?,
                &client.inventory_digest,
                to_json_opt(&client.metrics)?,
                &client.dns_hostname,
                to_json_opt(&client.last_update)?,
                to_json_opt(&client.upstream_fault)?,
                ts(client.created_at),
                client.registered_at.map(ts),
                client.revoked_at.map(ts),
            ],
        )
        .context("Failed to persist client")?;
        Ok(())
    }

    /// All clients that have not been revoked
    pub fn load_active_clients(&self) -> Result<Vec<Client>> {
        let sql = format!(
            "SELECT {} FROM clients WHERE revoked_at IS NULL ORDER BY created_at",
            CLIENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare query")?;

        let clients = stmt
            .query_map([], |row| Self::row_to_client(row))
            .context("Failed to query clients")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect clients")?;

        Ok(clients)
    }

    /// Get a client by id, revoked or not
    pub fn get_client(&self, id: Uuid) -> Result<Option<Client>> {
        let sql = format!("SELECT {} FROM clients WHERE id = ?1", CLIENT_COLUMNS);
        self.conn
            .query_row(&sql, params![id.to_string()], |row| Self::row_to_client(row))
            .optional()
            .context("Failed to query client")
    }

    /// True if any client, including revoked ones, was ever issued this token
    pub fn token_exists(&self, token: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM clients WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .context("Failed to check token uniqueness")?;
        Ok(count > 0)
    }

    /// Append an error report. Returns false if the report id was already stored.
    pub fn insert_error(&self, report: &ErrorReport, received_at: DateTime<Utc>) -> Result<bool> {
        let payload = serde_json::to_string(report).context("Failed to serialize error report")?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO error_reports
                    (report_id, client_id, kind, payload, occurred_at, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    report.report_id.to_string(),
                    report.client_id.to_string(),
                    report.kind.as_str(),
                    payload,
                    ts(report.timestamp),
                    ts(received_at),
                ],
            )
            .context("Failed to append error report")?;
        Ok(inserted > 0)
    }

    /// Occurrences of one error kind for one client received at or after `since`
    pub fn count_errors_since(
        &self,
        client_id: Uuid,
        kind: ErrorKind,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM error_reports
                 WHERE client_id = ?1 AND kind = ?2 AND received_at >= ?3",
                params![client_id.to_string(), kind.as_str(), ts(since)],
                |row| row.get(0),
            )
            .context("Failed to count error reports")?;
        Ok(count as u64)
    }

    /// Most recent error reports for a client, newest first
    pub fn recent_errors(&self, client_id: Uuid, limit: u32) -> Result<Vec<ErrorReport>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT payload FROM error_reports WHERE client_id = ?1
                 ORDER BY received_at DESC, occurred_at DESC LIMIT ?2",
            )
            .context("Failed to prepare query")?;

        let reports = stmt
            .query_map(params![client_id.to_string(), limit], |row| json_col(row, 0))
            .context("Failed to query error reports")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect error reports")?;

        Ok(reports)
    }

    /// Append a non-error activity event
    pub fn insert_event(
        &self,
        client_id: Uuid,
        event: &AgentEvent,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        let payload = serde_json::to_string(event).context("Failed to serialize event")?;
        self.conn
            .execute(
                "INSERT INTO agent_events (client_id, kind, payload, occurred_at, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    client_id.to_string(),
                    event.kind(),
                    payload,
                    ts(event.timestamp()),
                    ts(received_at),
                ],
            )
            .context("Failed to append event")?;
        Ok(())
    }

    pub fn count_events(&self, client_id: Uuid) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM agent_events WHERE client_id = ?1",
                params![client_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to count events")?;
        Ok(count as u64)
    }

    /// Insert or replace a ticket row
    pub fn put_ticket(&self, ticket: &Ticket) -> Result<()> {
        let comments =
            serde_json::to_string(&ticket.comments).context("Failed to serialize comments")?;
        self.conn
            .execute(
                r#"
                INSERT INTO tickets (
                    id, title, description, status, priority, client_id, fingerprint,
                    created_at, updated_at, comments
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    status = excluded.status,
                    priority = excluded.priority,
                    updated_at = excluded.updated_at,
                    comments = excluded.comments
                "#,
                params![
                    ticket.id.to_string(),
                    &ticket.title,
                    &ticket.description,
                    ticket.status.as_str(),
                    ticket.priority.as_str(),
                    ticket.client_id.map(|id| id.to_string()),
                    &ticket.fingerprint,
                    ts(ticket.created_at),
                    ts(ticket.updated_at),
                    comments,
                ],
            )
            .context("Failed to persist ticket")?;
        Ok(())
    }

    pub fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>> {
        let sql = format!("SELECT {} FROM tickets WHERE id = ?1", TICKET_COLUMNS);
        self.conn
            .query_row(&sql, params![id.to_string()], |row| Self::row_to_ticket(row))
            .optional()
            .context("Failed to query ticket")
    }

    /// Newest ticket for a client with the given fingerprint. With `active_since`
    /// set, only open/in-progress tickets created at or after that instant match.
    pub fn find_ticket_by_fingerprint(
        &self,
        client_id: Uuid,
        fingerprint: &str,
        active_since: Option<DateTime<Utc>>,
    ) -> Result<Option<Ticket>> {
        let result = match active_since {
            Some(since) => {
                let sql = format!(
                    "SELECT {} FROM tickets
                     WHERE client_id = ?1 AND fingerprint = ?2 AND created_at >= ?3
                       AND status IN ('open', 'in_progress')
                     ORDER BY created_at DESC LIMIT 1",
                    TICKET_COLUMNS
                );
                self.conn
                    .query_row(
                        &sql,
                        params![client_id.to_string(), fingerprint, ts(since)],
                        |row| Self::row_to_ticket(row),
                    )
                    .optional()
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM tickets WHERE client_id = ?1 AND fingerprint = ?2
                     ORDER BY created_at DESC LIMIT 1",
                    TICKET_COLUMNS
                );
                self.conn
                    .query_row(&sql, params![client_id.to_string(), fingerprint], |row| {
                        Self::row_to_ticket(row)
                    })
                    .optional()
            }
        };
        result.context("Failed to query ticket by fingerprint")
    }

    /// Tickets, newest first, optionally for one client
    pub fn list_tickets(&self, client_id: Option<Uuid>) -> Result<Vec<Ticket>> {
        let tickets = match client_id {
            Some(id) => {
                let sql = format!(
                    "SELECT {} FROM tickets WHERE client_id = ?1 ORDER BY created_at DESC",
                    TICKET_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql).context("Failed to prepare query")?;
                let rows = stmt
                    .query_map(params![id.to_string()], |row| Self::row_to_ticket(row))
                    .context("Failed to query tickets")?
                    .collect::<Result<Vec<_>, _>>();
                rows
            }
            None => {
                let sql = format!("SELECT {} FROM tickets ORDER BY created_at DESC", TICKET_COLUMNS);
                let mut stmt = self.conn.prepare(&sql).context("Failed to prepare query")?;
                let rows = stmt
                    .query_map([], |row| Self::row_to_ticket(row))
                    .context("Failed to query tickets")?
                    .collect::<Result<Vec<_>, _>>();
                rows
            }
        };
        tickets.context("Failed to collect tickets")
    }

    fn row_to_client(row: &rusqlite::Row) -> Result<Client, rusqlite::Error> {
        let status_str: String = row.get(4)?;
        let status = ClientStatus::parse(&status_str).ok_or_else(|| bad_value(4, &status_str))?;

        Ok(Client {
            id: uuid_col(row, 0)?,
            name: row.get(1)?,
            site_url: row.get(2)?,
            token: AuthToken::from_stored(row.get(3)?),
            status,
            last_seen: ts_col_opt(row, 5)?,
            meta: json_col_opt(row, 6)?,
            plugins: json_col(row, 7)?,
            themes: json_col(row, 8)?,
            inventory_digest: row.get(9)?,
            metrics: json_col_opt(row, 10)?,
            dns_hostname: row.get(11)?,
            last_update: json_col_opt(row, 12)?,
            upstream_fault: json_col_opt(row, 13)?,
            created_at: ts_col(row, 14)?,
            registered_at: ts_col_opt(row, 15)?,
            revoked_at: ts_col_opt(row, 16)?,
        })
    }

    fn row_to_ticket(row: &rusqlite::Row) -> Result<Ticket, rusqlite::Error> {
        let status_str: String = row.get(3)?;
        let priority_str: String = row.get(4)?;
        let client_id: Option<String> = row.get(5)?;
        let client_id = client_id
            .map(|s| Uuid::parse_str(&s).map_err(|e| conversion_failure(5, e)))
            .transpose()?;

        Ok(Ticket {
            id: uuid_col(row, 0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            status: TicketStatus::parse(&status_str).ok_or_else(|| bad_value(3, &status_str))?,
            priority: TicketPriority::parse(&priority_str)
                .ok_or_else(|| bad_value(4, &priority_str))?,
            client_id,
            fingerprint: row.get(6)?,
            created_at: ts_col(row, 7)?,
            updated_at: ts_col(row, 8)?,
            comments: json_col(row, 9)?,
        })
    }
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize column")
}

fn conversion_failure(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn bad_value(idx: usize, value: &str) -> rusqlite::Error {
    conversion_failure(
        idx,
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected value '{}'", value),
        ),
    )
}

fn uuid_col(row: &rusqlite::Row, idx: usize) -> Result<Uuid, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_failure(idx, e))
}

fn ts_col(row: &rusqlite::Row, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

fn ts_col_opt(row: &rusqlite::Row, idx: usize) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_failure(idx, e))
    })
    .transpose()
}

fn json_col<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> Result<T, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_failure(idx, e))
}

fn json_col_opt<T: DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> Result<Option<T>, rusqlite::Error> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use shared::types::{HealthMetrics, InventoryItem};
    use crate::model::CommentAuthor;

    fn test_client() -> Client {
        let mut client = Client::new(
            "Bakery".to_string(),
            "https://bakery.example".to_string(),
            AuthToken::generate(),
            Utc::now(),
        );
        client.plugins = vec![InventoryItem {
            name: "Akismet".to_string(),
            slug: "akismet".to_string(),
            version: "5.3".to_string(),
            update_available: Some("5.4".to_string()),
            active: true,
        }];
        client.metrics = Some(HealthMetrics {
            cpu_usage: 0.2,
            memory_usage: 0.3,
            disk_usage: 0.4,
            uptime_secs: 3600,
            error_count: 1,
            security_issues: 0,
            timestamp: Utc::now(),
        });
        client
    }

    #[test]
    fn test_client_round_trip_and_update() {
        let db = HubDb::open(":memory:").unwrap();
        let mut client = test_client();
        db.put_client(&client).unwrap();

        let loaded = db.get_client(client.id).unwrap().unwrap();
        assert_eq!(loaded.token, client.token);
        assert_eq!(loaded.plugins, client.plugins);
        assert_eq!(loaded.status, ClientStatus::Pending);

        client.status = ClientStatus::Warning;
        client.dns_hostname = Some("bakery-1234.hub.example.com".to_string());
        db.put_client(&client).unwrap();

        let loaded = db.get_client(client.id).unwrap().unwrap();
        assert_eq!(loaded.status, ClientStatus::Warning);
        assert_eq!(loaded.dns_hostname, client.dns_hostname);
    }

    #[test]
    fn test_revoked_clients_not_loaded_but_token_remembered() {
        let db = HubDb::open(":memory:").unwrap();
        let mut revoked = test_client();
        revoked.revoked_at = Some(Utc::now());
        let active = test_client();

        db.put_client(&revoked).unwrap();
        db.put_client(&active).unwrap();

        let loaded = db.load_active_clients().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, active.id);

        assert!(db.token_exists(revoked.token.expose()).unwrap());
        assert!(!db.token_exists("nope").unwrap());
    }

    #[test]
    fn test_error_reports_are_idempotent_and_counted_in_window() {
        let db = HubDb::open(":memory:").unwrap();
        let client_id = Uuid::new_v4();
        let now = Utc::now();

        let report = ErrorReport::new(client_id, ErrorKind::Warning, "Undefined index");
        assert!(db.insert_error(&report, now).unwrap());
        assert!(!db.insert_error(&report, now).unwrap(), "duplicate id must be ignored");

        let old = ErrorReport::new(client_id, ErrorKind::Warning, "Undefined index");
        db.insert_error(&old, now - Duration::hours(30)).unwrap();
        let other_kind = ErrorReport::new(client_id, ErrorKind::Notice, "Notice");
        db.insert_error(&other_kind, now).unwrap();

        let count = db
            .count_errors_since(client_id, ErrorKind::Warning, now - Duration::hours(24))
            .unwrap();
        assert_eq!(count, 1);

        let recent = db.recent_errors(client_id, 10).unwrap();
        assert_eq!(recent.len(), 3);
    }

    #[test]
    fn test_ticket_fingerprint_lookup() {
        let db = HubDb::open(":memory:").unwrap();
        let client_id = Uuid::new_v4();
        let now = Utc::now();

        let mut ticket = Ticket::new(
            "Recurring warning".to_string(),
            "desc".to_string(),
            TicketPriority::High,
            Some(client_id),
            now,
        );
        ticket.fingerprint = Some("recurring:warning".to_string());
        ticket.add_comment(CommentAuthor::System, "created".to_string(), now);
        db.put_ticket(&ticket).unwrap();

        let found = db
            .find_ticket_by_fingerprint(client_id, "recurring:warning", Some(now - Duration::hours(1)))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, ticket.id);
        assert_eq!(found.comments.len(), 1);

        ticket.status = TicketStatus::Closed;
        db.put_ticket(&ticket).unwrap();
        assert!(db
            .find_ticket_by_fingerprint(client_id, "recurring:warning", Some(now - Duration::hours(1)))
            .unwrap()
            .is_none());
        assert!(db
            .find_ticket_by_fingerprint(client_id, "recurring:warning", None)
            .unwrap()
            .is_some());

        assert_eq!(db.list_tickets(Some(client_id)).unwrap().len(), 1);
        assert_eq!(db.list_tickets(Some(Uuid::new_v4())).unwrap().len(), 0);
    }

    #[test]
    fn test_events_appended() {
        let db = HubDb::open(":memory:").unwrap();
        let client_id = Uuid::new_v4();
        let event = AgentEvent::ThemeSwitched {
            slug: "twentytwentyfour".to_string(),
            timestamp: Utc::now(),
        };
        db.insert_event(client_id, &event, Utc::now()).unwrap();
        db.insert_event(client_id, &event, Utc::now()).unwrap();
        assert_eq!(db.count_events(client_id).unwrap(), 2);
    }
}
