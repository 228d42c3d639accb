use std::any::Any;
use std::sync::Arc;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Serialize;
use shared::protocol::{
    PATH_AUTO_TICKET, PATH_ERROR_REPORT, PATH_EVENTS, PATH_HEARTBEAT, PATH_REGISTER,
    PATH_SCAN_RESULTS, PATH_UPDATE_RESULTS,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use super::{admin, agent};
use crate::error::HubError;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub hub: String,
    pub clients: usize,
}

pub fn router(state: AppState) -> Router {
    let agent_routes = Router::new()
        .route(PATH_REGISTER, post(agent::register))
        .route(PATH_HEARTBEAT, post(agent::heartbeat))
        .route(PATH_SCAN_RESULTS, post(agent::scan_results))
        .route(PATH_UPDATE_RESULTS, post(agent::update_results))
        .route(PATH_EVENTS, post(agent::events))
        .route(PATH_ERROR_REPORT, post(agent::error_report))
        .route(PATH_AUTO_TICKET, post(agent::auto_ticket));

    let admin_routes = Router::new()
        .route("/admin/clients", post(admin::issue_client).get(admin::list_clients))
        .route("/admin/clients/:id", get(admin::get_client).delete(admin::remove_client))
        .route("/admin/clients/:id/errors", get(admin::client_errors))
        .route("/admin/clients/:id/scan", post(admin::scan_client))
        .route("/admin/clients/:id/update", post(admin::update_client))
        .route("/admin/scan-all", post(admin::start_scan_all).get(admin::scan_all_status))
        .route("/admin/scan-all/cancel", post(admin::cancel_scan_all))
        .route("/admin/tickets", get(admin::list_tickets))
        .route("/admin/tickets/:id", patch(admin::patch_ticket))
        .route("/admin/tickets/:id/comments", post(admin::comment_ticket));

    Router::new()
        .route("/health", get(health))
        .merge(agent_routes)
        .merge(admin_routes)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        hub: state.hub.name.clone(),
        clients: state.hub.registry.len(),
    })
}

/// A panicking handler still answers with the usual JSON error body
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    HubError::Internal(format!("handler panicked: {}", detail)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use shared::protocol::{HEADER_CLIENT_ID, HEADER_TOKEN};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use crate::clock::SystemClock;
    use crate::commands::tests::RecordingTransport;
    use crate::config::Config;
    use crate::store_manager::StoreHandle;

    async fn app() -> (Router, Arc<Hub>) {
        let store = StoreHandle::open(":memory:").unwrap();
        let hub = Hub::new(
            Arc::new(Config::for_tests()),
            store,
            Arc::new(SystemClock),
            Arc::new(RecordingTransport::default()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let hub = Arc::new(hub);
        (router(AppState { hub: hub.clone() }), hub)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn heartbeat(client_id: &str, token: &str) -> Request<Body> {
        Request::post(PATH_HEARTBEAT)
            .header(header::CONTENT_TYPE, "application/json")
            .header(HEADER_CLIENT_ID, client_id)
            .header(HEADER_TOKEN, token)
            .body(Body::from(
                json!({"clientId": client_id, "timestamp": "2024-05-01T10:00:00Z"}).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["hub"], "test-hub");
        assert_eq!(body["clients"], 0);
    }

    #[tokio::test]
    async fn test_bad_credentials_share_one_response() {
        let (app, hub) = app().await;
        let client = hub.issue_client("Shop", "https://shop.example").await.unwrap();
        let id = client.id.to_string();

        let wrong_token = app.clone().oneshot(heartbeat(&id, "nope")).await.unwrap();
        let unknown_id = app
            .clone()
            .oneshot(heartbeat(&uuid::Uuid::new_v4().to_string(), client.token.expose()))
            .await
            .unwrap();
        let garbage_id = app.clone().oneshot(heartbeat("not-a-uuid", "x")).await.unwrap();

        let mut bodies = Vec::new();
        for response in [wrong_token, unknown_id, garbage_id] {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            bodies.push(body_json(response).await);
        }
        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(bodies[1], bodies[2]);
        assert_eq!(bodies[0]["kind"], "authentication_failure");

        let ok = app.oneshot(heartbeat(&id, client.token.expose())).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_body_is_validation_failure() {
        let (app, hub) = app().await;
        let client = hub.issue_client("Shop", "https://shop.example").await.unwrap();

        let request = Request::post(PATH_SCAN_RESULTS)
            .header(header::CONTENT_TYPE, "application/json")
            .header(HEADER_CLIENT_ID, client.id.to_string())
            .header(HEADER_TOKEN, client.token.expose())
            .body(Body::from(r#"{"clientId": 7}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "validation_failure");
    }

    #[tokio::test]
    async fn test_admin_requires_bearer_token() {
        let (app, _) = app().await;
        let issue = |auth: Option<&str>| {
            let mut builder = Request::post("/admin/clients").header(header::CONTENT_TYPE, "application/json");
            if let Some(auth) = auth {
                builder = builder.header(header::AUTHORIZATION, auth);
            }
            builder
                .body(Body::from(json!({"name": "Blog", "siteUrl": "https://blog.example/"}).to_string()))
                .unwrap()
        };

        let denied = app.clone().oneshot(issue(None)).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        let denied = app.clone().oneshot(issue(Some("Bearer wrong"))).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let created = app.clone().oneshot(issue(Some("Bearer admin-secret"))).await.unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = body_json(created).await;
        assert!(!body["token"].as_str().unwrap().is_empty());
        assert_eq!(body["client"]["siteUrl"], "https://blog.example");

        let listed = app
            .oneshot(
                Request::get("/admin/clients")
                    .header(header::AUTHORIZATION, "Bearer admin-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(listed).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert!(body[0].get("token").is_none());
    }

    #[tokio::test]
    async fn test_bad_path_and_query_are_json_validation_failures() {
        let (app, hub) = app().await;
        let client = hub.issue_client("Shop", "https://shop.example").await.unwrap();
        let admin_get = |uri: String| {
            Request::get(uri)
                .header(header::AUTHORIZATION, "Bearer admin-secret")
                .body(Body::empty())
                .unwrap()
        };

        for uri in [
            "/admin/clients/not-a-uuid".to_string(),
            format!("/admin/clients/{}/errors?limit=lots", client.id),
        ] {
            let response = app.clone().oneshot(admin_get(uri.clone())).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let body = body_json(response).await;
            assert_eq!(body["kind"], "validation_failure", "{}", uri);
            assert_eq!(body["code"], 400);
        }

        // Credentials are still checked before the path is parsed
        let anonymous = app
            .oneshot(Request::get("/admin/clients/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_panic_becomes_json_500() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
