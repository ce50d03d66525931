use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use baybook::config::Config;
use baybook::engine::{Engine, EngineConfig};
use baybook::labels::Labels;
use baybook::notifier::{Announcer, LogNotifier, Notifier, TelegramNotifier};
use baybook::notify::NotifyHub;
use baybook::wire::{self, AppContext};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    baybook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let labels = match &config.labels_file {
        Some(path) => Labels::load(path)?,
        None => Labels::default(),
    };
    let labels = Arc::new(labels);

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::with_config(
        config.data_dir.join("baybook.wal"),
        notify.clone(),
        EngineConfig {
            lock_timeout: config.lock_timeout,
        },
    )?);

    let (notifier, template): (Arc<dyn Notifier>, Option<String>) = match &config.telegram {
        Some(tg) => (
            Arc::new(TelegramNotifier::new(&tg.token, tg.chat_id.clone())?),
            tg.template.clone(),
        ),
        None => (Arc::new(LogNotifier), None),
    };
    let announcer = Arc::new(Announcer::new(
        engine.clone(),
        labels.clone(),
        notifier,
        template,
        config.display_offset,
    ));
    tokio::spawn(announcer.run(notify.subscribe_all()));
    tokio::spawn(baybook::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    let ctx = Arc::new(AppContext {
        engine,
        tokens: config.tokens.clone(),
        labels,
        display_offset: config.display_offset,
    });
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("baybook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tokens: {}", config.tokens.len());
    info!("  notifications: {}", if config.telegram.is_some() { "telegram" } else { "log" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
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
                        metrics::counter!(baybook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(baybook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(baybook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, ctx).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(baybook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
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

    info!("baybook stopped");
    Ok(())
}
