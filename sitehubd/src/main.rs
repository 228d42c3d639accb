use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use sitehubd::api::{self, tls};
use sitehubd::clock::SystemClock;
use sitehubd::commands::HttpAgentTransport;
use sitehubd::config::Config;
use sitehubd::dns::{self, address, Publisher};
use sitehubd::hub::Hub;
use sitehubd::monitor;
use sitehubd::store_manager::StoreHandle;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sitehubd=info,tower_http=info")),
        )
        .init();
    tls::install_crypto_provider();

    tracing::info!("Starting sitehubd {}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/sitehub/sitehubd.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    tracing::info!("Loaded config from {}", config_path);
    let config = Arc::new(config);

    if config.api.admin_token.is_none() {
        tracing::warn!("No admin token configured; operator endpoints will reject every request");
    }

    let store = StoreHandle::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let cancel = CancellationToken::new();

    // DNS queue exists before the hub so issue/register can enqueue from the start
    let provider = dns::provider_from_config(&config.dns)?;
    let (dns_queue, dns_rx) = match &provider {
        Some(_) => {
            let (queue, rx) = address::DnsQueue::bounded(config.dns.queue_capacity);
            (Some(queue), Some(rx))
        }
        None => {
            tracing::info!("DNS publication disabled");
            (None, None)
        }
    };

    let transport = Arc::new(HttpAgentTransport::new(&config.agents)?);
    let hub = Arc::new(
        Hub::new(
            config.clone(),
            store.clone(),
            Arc::new(SystemClock),
            transport,
            dns_queue.clone(),
            cancel.clone(),
        )
        .await?,
    );
    tracing::info!(hub = %hub.name, clients = hub.registry.len(), "Registry loaded");

    let mut tasks = Vec::new();

    if let (Some(provider), Some(queue), Some(rx)) = (provider, dns_queue, dns_rx) {
        let publisher = Arc::new(Publisher::new(provider, &config.dns));
        let (address_tx, address_rx) = watch::channel(None);
        let ctx = address::DnsWorkerContext {
            registry: hub.registry.clone(),
            publisher,
            address: address_rx,
            port: config.hub.public_port,
            monitor: config.monitor.clone(),
        };
        tasks.extend(address::spawn_workers(config.dns.workers, rx, ctx, cancel.clone()));

        let source = address::AddressSource::from_config(&config.hub, config.dns.request_timeout())?;
        tasks.push(tokio::spawn(address::watch_address(
            source,
            Duration::from_secs(config.hub.address_check_interval_secs),
            address_tx,
            hub.registry.clone(),
            queue,
            cancel.clone(),
        )));
    }

    tasks.push(tokio::spawn(monitor::run(
        hub.registry.clone(),
        config.monitor.clone(),
        cancel.clone(),
    )));

    let app = api::routes::router(api::routes::AppState { hub: hub.clone() });
    let listen: std::net::SocketAddr = config
        .api
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.api.listen))?;

    let server_cancel = cancel.clone();
    let server = match (&config.api.tls_cert, &config.api.tls_key) {
        (Some(cert), Some(key)) => {
            let tls_config = tls::load(cert, key).await?;
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                server_cancel.cancelled().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
            });
            tracing::info!("API listening on https://{}", listen);
            tokio::spawn(async move {
                if let Err(e) = axum_server::bind_rustls(listen, tls_config)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                {
                    tracing::error!("Server error: {}", e);
                }
            })
        }
        _ => {
            tracing::warn!("No TLS material configured; serving plain HTTP. Terminate TLS in front of the hub.");
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("Failed to bind to {}", listen))?;
            tracing::info!("API listening on http://{}", listen);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                    .await
                {
                    tracing::error!("Server error: {}", e);
                }
            })
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    hub.dispatcher.cancel_scan_all();

    let _ = server.await;
    for task in tasks {
        let _ = task.await;
    }

    // Store goes last so in-flight requests can still persist
    drop(hub);
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shut down store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
