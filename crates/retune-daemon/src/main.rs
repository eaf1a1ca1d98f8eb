use retune_daemon::adapter::MpvBackend;
use retune_daemon::engine::EngineCore;
use retune_daemon::relay::StreamRelay;
use retune_daemon::{http, socket, BroadcastLayer, BroadcastMessage, EngineEvent};
use retune_proto::config::Config;
use retune_proto::state::StateManager;
use retune_proto::{platform, station};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    // Setup file logging + broadcast layer
    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,retune_daemon=debug,retune_proto=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let stations = station::load_stations(&config.stations).await;
    info!("Loaded {} stations", stations.len());

    let state_manager = Arc::new(StateManager::new(
        config.daemon.state_file.clone(),
        stations,
    ));

    // Event channel — all external inputs funnel into the engine loop
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<EngineEvent>(256);

    // Stream relay (always on — the recovery ladder points the player here
    // for access-restricted candidates)
    let relay = StreamRelay::new();
    let _relay_handle = retune_daemon::relay::start_server(
        config.daemon.bind_address.clone(),
        config.relay.port,
        relay.clone(),
    );

    let backend = MpvBackend::new(
        config.player.clone(),
        config.recovery.clone(),
        event_tx.clone(),
    )?;

    let engine = EngineCore::new(
        config.clone(),
        state_manager.clone(),
        backend,
        relay,
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    // Start TCP control socket
    let _socket_handle = socket::start_server(
        config.daemon.bind_address.clone(),
        config.daemon.control_port,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    // Start HTTP API if enabled
    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
        );
    }

    // Ctrl-C drains through the same channel as everything else
    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(EngineEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    engine.run(event_rx).await?;

    Ok(())
}
