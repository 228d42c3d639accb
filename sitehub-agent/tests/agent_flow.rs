//! Agent behaviour against an in-process stub hub

use std::sync::Arc;
use std::time::Duration;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::protocol::{
    HEADER_CLIENT_ID, HEADER_TOKEN, PATH_AUTO_TICKET, PATH_ERROR_REPORT, PATH_EVENTS,
    PATH_HEARTBEAT, PATH_REGISTER, PATH_SCAN_RESULTS, PATH_UPDATE_RESULTS,
};
use shared::types::{
    AgentCommand, HealthMetrics, InventoryItem, ItemKind, RegisterRequest, RequestContext,
    UpdateItem, UpdateOutcome,
};
use sitehub_agent::hooks::{Hook, HookTable};
use sitehub_agent::queue::ErrorQueue;
use sitehub_agent::state::{ensure_registered, ActivationState, StateFile};
use sitehub_agent::{Agent, AgentConfig, AgentError, Credentials, HubClient, Site};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Received {
    path: String,
    client_id: Option<String>,
    token: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct StubHub {
    credentials: Credentials,
    received: Arc<Mutex<Vec<Received>>>,
}

impl StubHub {
    fn paths(&self) -> Vec<String> {
        self.received.lock().iter().map(|r| r.path.clone()).collect()
    }

    fn bodies(&self, path: &str) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .map(|r| r.body.clone())
            .collect()
    }
}

async fn stub(
    State(hub): State<StubHub>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    let client_id = header(HEADER_CLIENT_ID);
    let token = header(HEADER_TOKEN);

    let authorized = hub
        .credentials
        .verify(client_id.as_deref().unwrap_or(""), token.as_deref().unwrap_or(""));
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed", "kind": "authentication_failure", "code": 401})),
        );
    }

    let path = uri.path().to_string();
    hub.received.lock().push(Received {
        path: path.clone(),
        client_id,
        token,
        body: body.clone(),
    });

    let now = Utc::now();
    let reply = match path.as_str() {
        PATH_REGISTER => json!({"clientId": body["clientId"], "status": "healthy", "registeredAt": now}),
        PATH_HEARTBEAT => json!({"status": "ok", "timestamp": now}),
        PATH_SCAN_RESULTS => json!({
            "clientId": body["clientId"],
            "status": "healthy",
            "plugins": body["plugins"],
            "themes": body["themes"],
            "metrics": body["metrics"]
        }),
        PATH_UPDATE_RESULTS => json!({"accepted": body["results"].as_array().map_or(0, Vec::len), "rescanRequested": true}),
        PATH_EVENTS => json!({"accepted": body["events"].as_array().map_or(0, Vec::len), "errors": 0, "ticketsCreated": 0}),
        PATH_ERROR_REPORT => {
            let accepted = body["reports"].as_array().map_or(1, Vec::len);
            json!({"accepted": accepted, "duplicates": 0, "ticketsCreated": 0})
        }
        PATH_AUTO_TICKET => json!({"ticketId": Uuid::new_v4(), "created": true}),
        _ => return (StatusCode::NOT_FOUND, Json(json!({"error": "no route", "kind": "not_found", "code": 404}))),
    };
    (StatusCode::OK, Json(reply))
}

async fn spawn_hub(credentials: Credentials) -> (String, StubHub) {
    let hub = StubHub {
        credentials,
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let mut app = Router::new();
    for path in [
        PATH_REGISTER,
        PATH_HEARTBEAT,
        PATH_SCAN_RESULTS,
        PATH_UPDATE_RESULTS,
        PATH_EVENTS,
        PATH_ERROR_REPORT,
        PATH_AUTO_TICKET,
    ] {
        app = app.route(path, post(stub));
    }
    let app = app.with_state(hub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), hub)
}

struct FakeSite;

impl Site for FakeSite {
    fn inventory(&self) -> (Vec<InventoryItem>, Vec<InventoryItem>) {
        let plugin = InventoryItem {
            name: "Akismet".to_string(),
            slug: "akismet".to_string(),
            version: "5.3".to_string(),
            update_available: None,
            active: true,
        };
        (vec![plugin], Vec::new())
    }

    fn metrics(&self) -> HealthMetrics {
        HealthMetrics {
            cpu_usage: 0.1,
            memory_usage: 0.2,
            disk_usage: 0.3,
            uptime_secs: 60,
            error_count: 0,
            security_issues: 0,
            timestamp: Utc::now(),
        }
    }

    fn apply_update(&self, item: &UpdateItem) -> UpdateOutcome {
        UpdateOutcome {
            kind: item.kind,
            slug: item.slug.clone(),
            succeeded: item.slug != "broken",
            message: None,
            new_version: Some("9.9".to_string()),
        }
    }
}

fn credentials() -> Credentials {
    Credentials::new(Uuid::new_v4(), "f00dfeedf00dfeed")
}

fn agent(base: &str, credentials: Credentials) -> Agent<FakeSite> {
    let client = HubClient::with_timeout(base, credentials, Duration::from_secs(2)).unwrap();
    Agent::new(client, FakeSite, HookTable::default(), ErrorQueue::default(), AgentConfig::default())
}

fn php_error(level: u32, message: &str) -> Hook {
    Hook::PhpError {
        level,
        message: message.to_string(),
        file: Some("wp-content/plugins/shop/cart.php".to_string()),
        line: Some(88),
        stack: Vec::new(),
        request: RequestContext::default(),
        memory_usage: 0,
    }
}

#[tokio::test]
async fn test_registers_exactly_once() {
    let creds = credentials();
    let (base, hub) = spawn_hub(creds.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let file = StateFile::new(dir.path().join("sitehub.json"));
    let client = HubClient::new(&base, creds.clone()).unwrap();
    let request = RegisterRequest {
        client_id: creds.client_id,
        client_name: "Shop".to_string(),
        site_url: "https://shop.example".to_string(),
        wp_version: "6.5.2".to_string(),
        php_version: "8.2.18".to_string(),
        admin_email: None,
    };

    let mut state = ActivationState::new(&base, &creds);
    assert!(ensure_registered(&file, &mut state, &client, &request).await.unwrap());

    // A later activation starts from the persisted state
    let mut reloaded = file.load().unwrap().unwrap();
    assert!(reloaded.is_registered());
    assert!(!ensure_registered(&file, &mut reloaded, &client, &request).await.unwrap());

    assert_eq!(hub.paths(), vec![PATH_REGISTER.to_string()]);
}

#[tokio::test]
async fn test_critical_errors_bypass_queue() {
    let creds = credentials();
    let (base, hub) = spawn_hub(creds.clone()).await;
    let agent = agent(&base, creds.clone());

    agent.fire(php_error(1, "Allowed memory size exhausted")).await;
    assert_eq!(hub.paths(), vec![PATH_ERROR_REPORT.to_string(), PATH_AUTO_TICKET.to_string()]);
    assert!(agent.queue().is_empty());

    agent.fire(php_error(8, "Undefined index: foo")).await;
    agent.fire(php_error(2, "Division by zero")).await;
    assert_eq!(hub.paths().len(), 2);
    assert_eq!(agent.queue().len(), 2);

    let outcome = agent.flush().await;
    assert_eq!(outcome.errors_sent, 2);
    let batches = hub.bodies(PATH_ERROR_REPORT);
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1]["reports"].as_array().unwrap().len(), 2);

    for received in hub.received.lock().iter() {
        assert_eq!(received.client_id.as_deref(), Some(creds.client_id.to_string().as_str()));
        assert_eq!(received.token.as_deref(), Some(creds.token.as_str()));
    }
}

#[tokio::test]
async fn test_database_errors_are_ticketed_immediately() {
    let creds = credentials();
    let (base, hub) = spawn_hub(creds.clone()).await;
    let agent = agent(&base, creds);

    agent
        .fire(Hook::DatabaseError {
            message: "Table 'wp_options' is marked as crashed".to_string(),
            request: RequestContext::default(),
        })
        .await;

    assert_eq!(hub.paths(), vec![PATH_ERROR_REPORT.to_string(), PATH_AUTO_TICKET.to_string()]);
    assert!(agent.queue().is_empty());
    assert_eq!(hub.bodies(PATH_AUTO_TICKET)[0]["kind"], "database");
}

#[tokio::test]
async fn test_activity_events_are_batched() {
    let creds = credentials();
    let (base, hub) = spawn_hub(creds.clone()).await;
    let agent = agent(&base, creds);

    agent
        .fire(Hook::PluginActivated {
            slug: "woocommerce".to_string(),
            version: Some("8.9.1".to_string()),
        })
        .await;
    agent.fire(Hook::ThemeSwitched { slug: "astra".to_string() }).await;
    assert!(hub.paths().is_empty());

    assert_eq!(agent.flush().await.events_sent, 2);
    let events = hub.bodies(PATH_EVENTS);
    assert_eq!(events[0]["events"][0]["type"], "plugin_activated");
    assert_eq!(events[0]["events"][1]["type"], "theme_switched");
    assert_eq!(agent.pending_events(), 0);
}

#[tokio::test]
async fn test_unreachable_hub_is_tolerated() {
    // Nothing listens on the discard port
    let agent = agent("http://127.0.0.1:9", credentials());

    assert!(!agent.heartbeat().await);

    agent.fire(php_error(8, "Undefined variable")).await;
    let outcome = agent.flush().await;
    assert_eq!(outcome.errors_sent, 0);
    assert_eq!(agent.queue().len(), 1);
}

#[tokio::test]
async fn test_rejected_credentials_surface_as_unauthorized() {
    let (base, hub) = spawn_hub(credentials()).await;
    let client = HubClient::new(&base, credentials()).unwrap();

    assert!(matches!(client.heartbeat().await, Err(AgentError::Unauthorized)));
    assert!(hub.paths().is_empty());
}

#[tokio::test]
async fn test_commands_report_back_through_ingestion() {
    let creds = credentials();
    let (base, hub) = spawn_hub(creds.clone()).await;
    let agent = agent(&base, creds.clone());

    assert!(agent.authorize_command(&creds.client_id.to_string(), &creds.token));
    assert!(!agent.authorize_command(&creds.client_id.to_string(), "wrong"));

    agent.handle_command(AgentCommand::scan()).await.unwrap();
    let scans = hub.bodies(PATH_SCAN_RESULTS);
    assert_eq!(scans[0]["plugins"][0]["slug"], "akismet");

    let items = vec![
        UpdateItem { kind: ItemKind::Plugin, slug: "akismet".to_string() },
        UpdateItem { kind: ItemKind::Plugin, slug: "broken".to_string() },
    ];
    agent.handle_command(AgentCommand::update(items)).await.unwrap();
    let results = hub.bodies(PATH_UPDATE_RESULTS);
    assert_eq!(results[0]["results"][0]["succeeded"], true);
    assert_eq!(results[0]["results"][1]["succeeded"], false);
}

#[tokio::test]
async fn test_shutdown_flushes_queue() {
    let creds = credentials();
    let (base, hub) = spawn_hub(creds.clone()).await;
    let agent = Arc::new(agent(&base, creds));
    agent.fire(php_error(8192, "Function create_function() is deprecated")).await;

    let cancel = CancellationToken::new();
    let running = {
        let agent = agent.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    running.await.unwrap();

    assert!(agent.queue().is_empty());
    assert_eq!(hub.bodies(PATH_ERROR_REPORT).len(), 1);
    assert!(hub.paths().contains(&PATH_HEARTBEAT.to_string()));
}
