use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use concierge::catalog::{AmenityCatalog, StaticCatalog};
use concierge::config::Config;
use concierge::directory::{Directory, StaticDirectory};
use concierge::engine::Engine;
use concierge::limits::OUTBOX_CAPACITY;
use concierge::notify::{Dispatcher, Outbox, TracingMailer, TracingNotifier};
use concierge::{sweep, wire};

/// How often the compactor checks the append counter.
const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    concierge::observability::init(config.metrics_port);

    let tls_acceptor = config.tls.as_ref().map(|files| files.acceptor()).transpose()?;

    std::fs::create_dir_all(&config.data_dir)?;

    let catalog = StaticCatalog::load(&config.catalog_path)?;
    let directory = StaticDirectory::load(&config.directory_path)?;
    info!("catalog: {} amenities, directory: {} users", catalog.len(), directory.len());
    let catalog: Arc<dyn AmenityCatalog> = Arc::new(catalog);
    let directory: Arc<dyn Directory> = Arc::new(directory);

    let (outbox, outbox_rx) = Outbox::with_capacity(OUTBOX_CAPACITY);
    let dispatcher = Dispatcher::new(
        Arc::new(TracingNotifier),
        Arc::new(TracingMailer),
        directory.clone(),
        config.zone,
    );
    tokio::spawn(dispatcher.run(outbox_rx));

    let engine = Arc::new(Engine::new(config.wal_path(), catalog, outbox, config.zone)?);
    tokio::spawn(sweep::run_sweep(engine.clone(), config.sweep_interval));
    tokio::spawn(sweep::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACT_CHECK_PERIOD,
    ));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("concierge listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  reservations: {}", engine.reservation_count());
    info!("  utc offset: {} minutes", config.zone.offset_minutes());
    info!("  sweep interval: {}s", config.sweep_interval.as_secs());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable ({e}), waiting for ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(concierge::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(concierge::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(concierge::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let directory = directory.clone();
                let password = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, directory, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(concierge::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("concierge stopped");
    Ok(())
}
