use std::sync::Arc;
use std::time::Duration;
use shared::types::ClientStatus;
use tokio_util::sync::CancellationToken;
use crate::config::MonitorConfig;
use crate::model::{Client, FaultKind};
use crate::registry::Registry;

/// Status implied by a client's latest payloads. Never yields `Offline`; only
/// the sweep does that, and any later contact recomputes from here.
pub fn compute_status(client: &Client, config: &MonitorConfig) -> ClientStatus {
    if !client.is_registered() {
        return ClientStatus::Pending;
    }

    if let Some(m) = &client.metrics {
        if m.error_count > config.error_count_threshold || m.security_issues > 0 {
            return ClientStatus::Critical;
        }
    }

    let update_available = client
        .plugins
        .iter()
        .chain(client.themes.iter())
        .any(|item| item.has_update());

    let over_threshold = client.metrics.as_ref().is_some_and(|m| {
        m.cpu_usage > config.cpu_threshold
            || m.memory_usage > config.memory_threshold
            || m.disk_usage > config.disk_threshold
    });

    // Agent and DNS faults both leave the site unreachable through the hub
    let unreachable = client.upstream_fault.is_some();

    if update_available || over_threshold || unreachable {
        ClientStatus::Warning
    } else {
        ClientStatus::Healthy
    }
}

/// Mark every registered client without contact inside the staleness window as
/// offline. Returns how many clients changed.
pub async fn sweep(registry: &Registry, config: &MonitorConfig) -> usize {
    let now = registry.clock().now();
    let window = config.staleness_window();
    let mut marked = 0;

    for id in registry.ids() {
        let result = registry
            .update(id, |client| {
                let stale = client.is_registered()
                    && client.status != ClientStatus::Offline
                    && client.last_seen.is_some_and(|seen| now - seen > window);
                if stale {
                    client.status = ClientStatus::Offline;
                }
                Ok(stale)
            })
            .await;

        match result {
            Ok((client, true)) => {
                marked += 1;
                tracing::warn!(client_id = %id, last_seen = ?client.last_seen, "Client went offline");
            }
            Ok(_) => {}
            // Revoked between listing and update
            Err(crate::error::HubError::NotFound(_)) => {}
            Err(e) => tracing::error!(client_id = %id, "Offline sweep failed: {}", e),
        }
    }

    marked
}

/// Periodic offline sweep
pub async fn run(registry: Arc<Registry>, config: MonitorConfig, cancel: CancellationToken) {
    // Config validation rejects zero; a hand-built config must not panic the task
    let mut interval = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let marked = sweep(&registry, &config).await;
                if marked > 0 {
                    tracing::info!(marked, "Offline sweep complete");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Offline sweep shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use shared::types::{HealthMetrics, InventoryItem};
    use crate::clock::ManualClock;
    use crate::model::{AuthToken, UpstreamFault};
    use crate::store_manager::StoreHandle;

    fn registered_client() -> Client {
        let now = Utc::now();
        let mut client = Client::new("A".into(), "https://a.example".into(), AuthToken::generate(), now);
        client.registered_at = Some(now);
        client.metrics = Some(HealthMetrics {
            cpu_usage: 0.1,
            memory_usage: 0.1,
            disk_usage: 0.1,
            uptime_secs: 1,
            error_count: 0,
            security_issues: 0,
            timestamp: now,
        });
        client
    }

    #[test]
    fn test_status_rules() {
        let config = MonitorConfig::default();

        let mut client = registered_client();
        assert_eq!(compute_status(&client, &config), ClientStatus::Healthy);

        client.plugins.push(InventoryItem {
            name: "X".into(),
            slug: "x".into(),
            version: "1.0".into(),
            update_available: Some("1.1".into()),
            active: true,
        });
        assert_eq!(compute_status(&client, &config), ClientStatus::Warning);

        client.plugins.clear();
        if let Some(m) = client.metrics.as_mut() {
            m.disk_usage = 0.95;
        }
        assert_eq!(compute_status(&client, &config), ClientStatus::Warning);

        if let Some(m) = client.metrics.as_mut() {
            m.disk_usage = 0.2;
            m.security_issues = 1;
        }
        assert_eq!(compute_status(&client, &config), ClientStatus::Critical);

        if let Some(m) = client.metrics.as_mut() {
            m.security_issues = 0;
        }
        client.upstream_fault = Some(UpstreamFault {
            kind: FaultKind::Agent,
            message: "timeout".into(),
            at: Utc::now(),
        });
        assert_eq!(compute_status(&client, &config), ClientStatus::Warning);

        client.upstream_fault = Some(UpstreamFault {
            kind: FaultKind::Dns,
            message: "rate limited".into(),
            at: Utc::now(),
        });
        assert_eq!(compute_status(&client, &config), ClientStatus::Warning);

        client.upstream_fault = None;
        assert_eq!(compute_status(&client, &config), ClientStatus::Healthy);

        client.registered_at = None;
        assert_eq!(compute_status(&client, &config), ClientStatus::Pending);
    }

    #[tokio::test]
    async fn test_sweep_marks_stale_clients_offline_by_clock() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = StoreHandle::open(":memory:").unwrap();
        let registry = Registry::load(store, clock.clone()).await.unwrap();
        let config = MonitorConfig::default();

        let seen = registry.issue("Seen", "https://seen.example").await.unwrap();
        let pending = registry.issue("Pending", "https://pending.example").await.unwrap();
        registry
            .update(seen.id, |c| {
                c.registered_at = Some(start);
                c.last_seen = Some(start);
                c.status = ClientStatus::Healthy;
                Ok(())
            })
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(config.staleness_window_secs as i64));
        assert_eq!(sweep(&registry, &config).await, 0, "exactly at the window is not stale");

        clock.advance(ChronoDuration::seconds(1));
        assert_eq!(sweep(&registry, &config).await, 1);
        assert_eq!(registry.find(seen.id).await.unwrap().status, ClientStatus::Offline);
        assert_eq!(registry.find(pending.id).await.unwrap().status, ClientStatus::Pending);

        assert_eq!(sweep(&registry, &config).await, 0, "already offline");
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_does_not_kill_task() {
        let store = StoreHandle::open(":memory:").unwrap();
        let registry = Arc::new(Registry::load(store, Arc::new(ManualClock::new(Utc::now()))).await.unwrap());
        let config = MonitorConfig {
            sweep_interval_secs: 0,
            ..MonitorConfig::default()
        };
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(registry, config, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(task.await.is_ok());
    }
}
