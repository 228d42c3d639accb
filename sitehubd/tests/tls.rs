//! The HTTPS listener comes up from a PEM pair on disk

use std::path::PathBuf;
use axum::routing::get;
use axum::Router;
use sitehubd::api::tls;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[tokio::test]
async fn test_pem_pair_loads() {
    let config = tls::load(&fixture("localhost.cert.pem"), &fixture("localhost.key.pem")).await;
    assert!(config.is_ok(), "{:?}", config.err());
}

#[tokio::test]
async fn test_missing_key_is_an_error() {
    let err = tls::load(&fixture("localhost.cert.pem"), &fixture("absent.key.pem"))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("absent.key.pem"));
}

#[tokio::test]
async fn test_serves_over_https() {
    let config = tls::load(&fixture("localhost.cert.pem"), &fixture("localhost.key.pem"))
        .await
        .unwrap();
    let app = Router::new().route("/ping", get(|| async { "pong" }));

    let handle = axum_server::Handle::new();
    let server = axum_server::bind_rustls("127.0.0.1:0".parse().unwrap(), config)
        .handle(handle.clone())
        .serve(app.into_make_service());
    tokio::spawn(server);
    let addr = handle.listening().await.unwrap();

    // Self-signed fixture; only the handshake and routing are under test
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let body = client
        .get(format!("https://127.0.0.1:{}/ping", addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "pong");

    handle.shutdown();
}
