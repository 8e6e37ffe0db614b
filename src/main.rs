use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use neopad_link::config::Config;
use neopad_link::coordinator::ServiceCoordinator;
use neopad_link::discovery::MdnsBrowser;
use neopad_link::persistence::SessionStore;
use neopad_link::session::{ConnectionStatus, TcpConnector};
use tokio::sync::watch;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

type Coordinator = ServiceCoordinator<TcpConnector, MdnsBrowser>;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = Config::load_or_default().await;
    info!("Using configuration: {:?}", config);

    let sessions = SessionStore::load_default()
        .await
        .map_err(|e| eyre!("Failed to load session store: {}", e))?;
    info!(
        "Device id {} as {}",
        sessions.device_id().await,
        sessions.username().await
    );

    let browser = MdnsBrowser::new().map_err(|e| eyre!("Failed to start mDNS: {}", e))?;
    let coordinator: Arc<Coordinator> = Arc::new(ServiceCoordinator::new(
        config,
        TcpConnector::default(),
        browser,
        sessions,
    ));

    spawn_stream_loggers(&coordinator);
    coordinator.start().await;
    let auto_connect = tokio::spawn(auto_connect(Arc::clone(&coordinator)));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to wait for ctrl-c: {}", e))?;
    info!("Ctrl-C received");

    auto_connect.abort();
    coordinator.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn spawn_stream_loggers(coordinator: &Arc<Coordinator>) {
    log_changes(coordinator.status(), |status| info!("Status: {}", status));
    log_changes(coordinator.connection_info(), |connection| match connection {
        Some(connection) => info!(
            "Connected to {} as {} (session {})",
            connection.host_display_name, connection.username, connection.session_id
        ),
        None => debug!("No active connection"),
    });
    log_changes(coordinator.roster(), |roster| {
        info!("{} devices on host", roster.len());
        for device in roster {
            info!(
                "  #{} {} {:?} ({})",
                device.id, device.name, device.kind, device.client_ref_id
            );
        }
    });
    log_changes(coordinator.streaming_failure(), |failure| {
        if let Some(reason) = failure {
            warn!("Input is not reaching the host: {}", reason);
        }
    });
    log_changes(coordinator.hosts(), |hosts| {
        info!("{} hosts available", hosts.len());
        for host in hosts {
            info!("  {} at {}:{}", host.display_name, host.address, host.port);
        }
    });
}

fn log_changes<T, F>(mut receiver: watch::Receiver<T>, log: F)
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    tokio::spawn(async move {
        while receiver.changed().await.is_ok() {
            log(&receiver.borrow_and_update());
        }
    });
}

/// Connects to the first host that shows up while nothing else is going on
async fn auto_connect(coordinator: Arc<Coordinator>) {
    let mut hosts = coordinator.hosts();
    loop {
        let first = hosts.borrow_and_update().first().cloned();
        if let Some(host) = first {
            if coordinator.current_status() == ConnectionStatus::NotConnected {
                if let Err(e) = coordinator.connect_to(&host).await {
                    warn!("Auto-connect to {} failed: {}", host.display_name, e);
                }
            }
        }
        if hosts.changed().await.is_err() {
            break;
        }
    }
}
