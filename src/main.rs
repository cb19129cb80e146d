use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomhold::availability::{CacheSource, Layered, LiveSource};
use roomhold::cache::EventCache;
use roomhold::clock::{Clock, SystemClock};
use roomhold::config::Config;
use roomhold::engine::Engine;
use roomhold::gateway::{MemoryCalendar, MemoryPayments, StaticDirectory};
use roomhold::lifecycle::{BookingService, Collaborators};
use roomhold::notify::NotifyHub;
use roomhold::reaper::{self, RefreshTarget};
use roomhold::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    roomhold::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.data_dir.join("roomhold.wal"), notify)?);
    let room = &config.room;
    if engine
        .ensure_resource(room.id, room.name.clone(), room.calendar_id.clone(), room.hours)
        .await?
    {
        info!("created room {} ({})", room.name, room.id);
    }

    let directory = match &config.members_file {
        Some(path) => {
            let dir = StaticDirectory::from_json_file(path)?;
            info!("loaded {} members from {}", dir.len(), path.display());
            dir
        }
        None => StaticDirectory::new(),
    };
    tracing::warn!("calendar and payment gateways are in-memory sandboxes");
    let calendar = Arc::new(MemoryCalendar::new());
    let payments = Arc::new(MemoryPayments::new());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(EventCache::new());
    let source = Layered::new(
        CacheSource::new(cache.clone()),
        LiveSource::new(calendar.clone(), config.policy.gateway_timeout),
    );
    let service = Arc::new(BookingService::new(
        engine.clone(),
        cache.clone(),
        Arc::new(source),
        Collaborators {
            calendar: calendar.clone(),
            payments,
            directory: Arc::new(directory),
        },
        clock.clone(),
        config.policy.clone(),
    ));

    // Background tasks
    tokio::spawn(reaper::run_sweeper(engine.clone(), clock.clone()));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));
    tokio::spawn(reaper::run_cache_refresher(
        calendar,
        cache,
        clock.clone(),
        RefreshTarget {
            calendar_id: room.calendar_id.clone(),
            horizon_days: u64::try_from(config.cache_horizon_days).unwrap_or(1),
            timeout: config.policy.gateway_timeout,
        },
        config.cache_refresh_interval,
    ));
    if let Some(ttl) = config.policy.pending_payment_ttl {
        tokio::spawn(reaper::run_pending_release(service.clone(), clock.clone(), ttl));
    }

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("roomhold listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!(
        "  opening hours: {}-{}",
        room.hours.opens.format("%H:%M"),
        room.hours.closes.format("%H:%M")
    );
    info!(
        "  pending payment ttl: {}",
        config
            .policy
            .pending_payment_ttl
            .map_or("disabled".to_string(), |t| format!("{}s", t.as_secs()))
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
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
                        metrics::counter!(roomhold::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(roomhold::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(roomhold::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let service = service.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, service).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(roomhold::observability::CONNECTIONS_ACTIVE).decrement(1.0);
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
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
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
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("roomhold stopped");
    Ok(())
}
