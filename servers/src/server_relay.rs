use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

mod relay_logic;
use relay_logic::{config, gateway, logger};

use lib_relay::{BroadcastHub, FeedModule, FeedSupervisor, ModuleSet, WssConfig, WssConnector};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    logger::setup_logging(&settings.log_dir, settings.log_level)?;

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    log::info!("Starting price feed relay, release {}", settings.release);

    let hub = Arc::new(BroadcastHub::new());

    let connector = WssConnector::new(WssConfig {
        url: settings.upstream_url.clone(),
        peer: settings.peer.clone(),
        ..WssConfig::default()
    });
    let supervisor = Arc::new(FeedSupervisor::new(connector, Arc::clone(&hub), settings.feed.clone()));
    let feed = Arc::new(FeedModule::new(supervisor, settings.reconnect.clone()));

    let gateway = Arc::new(gateway::Gateway::new(
        gateway::GatewayConfig {
            port: settings.port,
            cors_allowed: settings.cors_allowed.clone(),
            peer: settings.peer.clone(),
        },
        hub,
    ));

    let modules = ModuleSet::new(settings.lifecycle.clone())
        .with(feed)
        .with(gateway);

    // run_all stops every module once the signal fires or a module fails
    modules.run_all(shutdown_signal()).await?;

    log::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Ctrl-C received, initiating shutdown.");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    // On non-unix platforms, just wait forever.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
