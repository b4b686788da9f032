use rt_broker::{Hub, HubConfig};
use rt_store::{Config as StoreConfig, Store};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct EnvConfig {
    debug: bool,
    follow: Option<String>,
    auth_dsn: PathBuf,
    event_dsn: PathBuf,
    addr: String,
    gc_duration: Duration,
}

impl EnvConfig {
    fn from_env() -> Self {
        let debug = env::var("DEBUG").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let follow = env::var("FOLLOW").ok().filter(|v| !v.is_empty());
        let auth_dsn = env::var("AUTH_DSN").unwrap_or_else(|_| "auth.sqlite3".to_owned()).into();
        let event_dsn = env::var("EVENT_DSN").unwrap_or_else(|_| "events.sqlite3".to_owned()).into();
        let addr = env::var("ADDR").unwrap_or_else(|_| "0.0.0.0:7899".to_owned());
        let gc_duration = env::var("GC_DURATION")
            .ok()
            .and_then(|v| humantime::parse_duration(&v).ok())
            .unwrap_or(Duration::from_secs(3600));

        EnvConfig { debug, follow, auth_dsn, event_dsn, addr, gc_duration }
    }
}

#[tokio::main]
async fn main() {
    let log_level = if env::var("DEBUG").map(|v| v == "1").unwrap_or(false) { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    let cfg = EnvConfig::from_env();

    let store = Store::open(StoreConfig {
        auth_dsn: cfg.auth_dsn.clone(),
        event_dsn: cfg.event_dsn.clone(),
        gc_duration: cfg.gc_duration,
    })
    .unwrap_or_else(|e| {
        eprintln!("FATAL: failed to open store: {e}");
        std::process::exit(1);
    });
    store.integrity_check().await.unwrap_or_else(|e| {
        eprintln!("FATAL: store integrity check failed: {e}");
        std::process::exit(1);
    });

    let hub = Hub::new(store, HubConfig { join_delay: Duration::from_secs(3), verbose: cfg.debug });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    if let Some(addr) = cfg.follow.clone() {
        let follower_hub = hub.clone();
        let follower_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            rt_broker::follower::run(follower_hub, addr, follower_shutdown).await;
        });
    }

    let serve_hub = hub.clone();
    let addr = cfg.addr.clone();
    let server = tokio::spawn(async move { serve_hub.listen_and_serve(&addr, shutdown_rx).await });

    info!(addr = %cfg.addr, follow = ?cfg.follow, "broker starting");
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Ok(())) => info!("broker shut down cleanly"),
        Ok(Err(e)) => eprintln!("broker error: {e}"),
        Err(e) => eprintln!("broker task panicked: {e}"),
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
