use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use slotlock::config::Config;
use slotlock::coordinator::{BookingCoordinator, LogNotifier, MemoryPersistence};
use slotlock::http::{self, AppState};
use slotlock::ledger::Ledger;
use slotlock::lock::LockManager;
use slotlock::notify::RoomHub;
use slotlock::store::MemoryStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotlock::observability::init(config.metrics_port);

    if config.store_endpoint != "memory" {
        return Err(format!(
            "unsupported STORE_ENDPOINT {:?} (only \"memory\" is available)",
            config.store_endpoint
        )
        .into());
    }

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let ledger_path = config.data_dir.join("ledger.wal");
    let ledger = Arc::new(Ledger::open(&ledger_path, &config.ledger_genesis_hash)?);
    info!("ledger replayed: {} entries", ledger.len().await);

    let locks = Arc::new(LockManager::new(Arc::new(MemoryStore::new())));
    let rooms = Arc::new(RoomHub::new());
    let coordinator = Arc::new(BookingCoordinator::new(
        locks,
        ledger.clone(),
        rooms.clone(),
        Arc::new(MemoryPersistence::new()),
        Arc::new(LogNotifier),
        config.lock_ttl,
        config.confirm_window,
    ));

    let app = http::router(AppState {
        coordinator,
        rooms,
        ledger,
    });

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotlock listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lock_ttl: {}s", config.lock_ttl.as_secs());
    info!("  confirm_window: {}s", config.confirm_window.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!(
                "http://0.0.0.0:{p}/metrics"
            ))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight requests
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        info!("shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("slotlock stopped");
    Ok(())
}
