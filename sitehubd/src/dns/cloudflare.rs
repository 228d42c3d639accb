use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use super::{DnsError, DnsProvider, DnsRecord, RecordKind};
use crate::config::DnsConfig;

/// Cloudflare v4 API, bearer-token authenticated
pub struct CloudflareProvider {
    http: reqwest::Client,
    base: String,
    zone_id: String,
    token: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct ApiRecord {
    id: String,
    #[serde(rename = "type")]
    kind: RecordKind,
    name: String,
    #[serde(default)]
    content: String,
    ttl: u32,
    #[serde(default)]
    data: Option<SrvData>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct SrvData {
    priority: u16,
    weight: u16,
    port: u16,
    target: String,
}

impl SrvData {
    fn parse(content: &str) -> Result<Self, DnsError> {
        let parts: Vec<&str> = content.split_whitespace().collect();
        let bad = || DnsError::Provider(format!("malformed SRV content '{}'", content));
        match parts.as_slice() {
            [priority, weight, port, target] => Ok(Self {
                priority: priority.parse().map_err(|_| bad())?,
                weight: weight.parse().map_err(|_| bad())?,
                port: port.parse().map_err(|_| bad())?,
                target: target.to_string(),
            }),
            _ => Err(bad()),
        }
    }

    fn content(&self) -> String {
        format!("{} {} {} {}", self.priority, self.weight, self.port, self.target)
    }
}

impl From<ApiRecord> for DnsRecord {
    fn from(r: ApiRecord) -> Self {
        // Cloudflare splits SRV priority out of `content`; rebuild the full form
        let content = match (&r.kind, &r.data) {
            (RecordKind::Srv, Some(data)) => data.content(),
            _ => r.content,
        };
        DnsRecord {
            id: Some(r.id),
            kind: r.kind,
            name: r.name,
            content,
            ttl: r.ttl,
        }
    }
}

impl CloudflareProvider {
    pub fn from_config(config: &DnsConfig) -> Result<Self> {
        let token = config
            .api_token
            .clone()
            .context("dns.api_token is required for cloudflare")?;
        let zone_id = config
            .zone_id
            .clone()
            .context("dns.zone_id is required for cloudflare")?;
        Self::new(&config.api_base, zone_id, token, config.request_timeout())
    }

    pub fn new(
        base: &str,
        zone_id: String,
        token: String,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build DNS HTTP client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            zone_id,
            token,
        })
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.base, self.zone_id)
    }

    fn body(record: &DnsRecord) -> Result<serde_json::Value, DnsError> {
        Ok(match record.kind {
            RecordKind::Srv => json!({
                "type": record.kind.as_str(),
                "name": record.name,
                "ttl": record.ttl,
                "data": SrvData::parse(&record.content)?,
            }),
            _ => json!({
                "type": record.kind.as_str(),
                "name": record.name,
                "content": record.content,
                "ttl": record.ttl,
                "proxied": false,
            }),
        })
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, DnsError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(DnsError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => return Err(DnsError::RateLimited),
            _ => {}
        }

        let status = response.status();
        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            DnsError::Provider(format!("unreadable response (HTTP {}): {}", status, e))
        })?;

        if !envelope.success {
            let detail = envelope
                .errors
                .iter()
                .map(|e| format!("{} {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DnsError::Provider(format!("HTTP {}: {}", status, detail)));
        }
        Ok(envelope.result)
    }
}

fn transport_error(err: reqwest::Error) -> DnsError {
    if err.is_timeout() {
        DnsError::Timeout
    } else {
        DnsError::Transport(err.to_string())
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    async fn find(&self, kind: RecordKind, name: &str) -> Result<Option<DnsRecord>, DnsError> {
        let request = self
            .http
            .get(self.records_url())
            .query(&[("type", kind.as_str()), ("name", name)]);
        let records: Option<Vec<ApiRecord>> = self.send(request).await?;
        Ok(records
            .unwrap_or_default()
            .into_iter()
            .find(|r| r.kind == kind && r.name.eq_ignore_ascii_case(name))
            .map(DnsRecord::from))
    }

    async fn create(&self, record: &DnsRecord) -> Result<String, DnsError> {
        let request = self.http.post(self.records_url()).json(&Self::body(record)?);
        let created: Option<ApiRecord> = self.send(request).await?;
        created
            .map(|r| r.id)
            .ok_or_else(|| DnsError::Provider("create returned no record".to_string()))
    }

    async fn update(&self, id: &str, record: &DnsRecord) -> Result<(), DnsError> {
        let url = format!("{}/{}", self.records_url(), id);
        let request = self.http.put(url).json(&Self::body(record)?);
        let _: Option<serde_json::Value> = self.send(request).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), DnsError> {
        let url = format!("{}/{}", self.records_url(), id);
        let _: Option<serde_json::Value> = self.send(self.http.delete(url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use axum::{
        extract::{Path, Query, State},
        http::HeaderMap,
        routing::{get, put},
        Json, Router,
    };
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeZone {
        records: Mutex<Vec<Value>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer cf-token")
    }

    async fn list(
        State(zone): State<Arc<FakeZone>>,
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        if !authorized(&headers) {
            return (StatusCode::FORBIDDEN, Json(json!({"success": false, "errors": []})));
        }
        let records: Vec<Value> = zone
            .records
            .lock()
            .iter()
            .filter(|r| r["type"] == q["type"] && r["name"] == q["name"])
            .cloned()
            .collect();
        (StatusCode::OK, Json(json!({"success": true, "errors": [], "result": records})))
    }

    async fn create(
        State(zone): State<Arc<FakeZone>>,
        Json(mut body): Json<Value>,
    ) -> Json<Value> {
        let mut records = zone.records.lock();
        body["id"] = json!(format!("rec-{}", records.len() + 1));
        if body["type"] == "SRV" {
            let d = body["data"].clone();
            body["content"] = json!(format!("{} {} {}", d["weight"], d["port"], d["target"].as_str().unwrap()));
        }
        records.push(body.clone());
        Json(json!({"success": true, "errors": [], "result": body}))
    }

    async fn update(Path(id): Path<String>) -> Json<Value> {
        Json(json!({"success": true, "errors": [], "result": {"id": id}}))
    }

    async fn serve(zone: Arc<FakeZone>) -> String {
        let app = Router::new()
            .route("/zones/z1/dns_records", get(list).post(create))
            .route("/zones/z1/dns_records/:id", put(update).delete(update))
            .with_state(zone);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_create_then_find_srv_reassembles_content() {
        let zone = Arc::new(FakeZone::default());
        let base = serve(zone.clone()).await;
        let provider = CloudflareProvider::new(
            &base,
            "z1".into(),
            "cf-token".into(),
            std::time::Duration::from_secs(5),
        )
        .unwrap();

        let name = "_sitehub._tcp.shop.hub.example.com";
        assert!(provider.find(RecordKind::Srv, name).await.unwrap().is_none());

        let record = DnsRecord::new(RecordKind::Srv, name, "0 5 8443 shop.hub.example.com", 120);
        let id = provider.create(&record).await.unwrap();
        assert_eq!(id, "rec-1");

        let found = provider.find(RecordKind::Srv, name).await.unwrap().unwrap();
        assert_eq!(found.content, "0 5 8443 shop.hub.example.com");
        assert_eq!(found.id.as_deref(), Some("rec-1"));

        provider.update("rec-1", &record).await.unwrap();
        provider.delete("rec-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_token_is_unauthorized() {
        let zone = Arc::new(FakeZone::default());
        let base = serve(zone).await;
        let provider = CloudflareProvider::new(
            &base,
            "z1".into(),
            "wrong".into(),
            std::time::Duration::from_secs(5),
        )
        .unwrap();

        let err = provider.find(RecordKind::A, "shop.hub.example.com").await.unwrap_err();
        assert!(matches!(err, DnsError::Unauthorized));
    }

    #[test]
    fn test_srv_content_parsing() {
        let data = SrvData::parse("0 5 8443 shop.hub.example.com").unwrap();
        assert_eq!(data.port, 8443);
        assert_eq!(data.content(), "0 5 8443 shop.hub.example.com");
        assert!(SrvData::parse("5 8443").is_err());
    }
}
