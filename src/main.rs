use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use berth::clock::SystemClock;
use berth::config::Config;
use berth::delivery::{self, LogNotifier};
use berth::engine::Engine;
use berth::ratelimit::RateLimiter;
use berth::{observability, tasks, tls, wire};

const COMPACTION_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// `--config <path>` is the only flag; everything else comes from the config layers.
fn config_path() -> Result<Option<PathBuf>, String> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => args
            .next()
            .map(|p| Some(PathBuf::from(p)))
            .ok_or_else(|| "--config needs a path".to_string()),
        Some(other) => Err(format!("unknown argument: {other}")),
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path()?.as_deref())?;
    observability::init_tracing();
    observability::init(config.metrics_port)?;

    let tls_acceptor = tls::load_tls_acceptor(
        config.server.tls_cert.as_deref(),
        config.server.tls_key.as_deref(),
    )?;

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let engine = Arc::new(Engine::new(
        config.storage.wal_path(),
        config.engine_settings(),
        Arc::new(SystemClock),
    )?);
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));

    tokio::spawn(delivery::run_delivery_worker(
        engine.clone(),
        Arc::new(LogNotifier),
        config.outbox.clone(),
    ));
    tokio::spawn(tasks::run_reminder_scheduler(engine.clone(), config.reminders.clone()));
    tokio::spawn(tasks::run_compactor(
        engine.clone(),
        config.storage.compact_threshold,
        COMPACTION_CHECK_INTERVAL,
    ));
    let pruned = limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            pruned.prune(std::time::Instant::now());
        }
    });

    let max_connections = config.server.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("berth listening on {addr}");
    info!("  data_dir: {}", config.storage.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = shutdown_signal();
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

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    tracing::warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let limiter = limiter.clone();
                let password = config.server.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine, limiter, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    tracing::error!("signal handler failed: {e}");
                }
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(DRAIN_TIMEOUT);
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

    info!("berth stopped");
    Ok(())
}
