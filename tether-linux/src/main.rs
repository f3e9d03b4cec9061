// Tether Linux: discovery, LAN transport and trust store around tether-core.

mod config;
mod discovery;
mod keys;
mod lan;
mod sink;
mod store;

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context;
use tether_core::plugins::builtin;
use tether_core::TetherCore;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("tether-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let keypair = keys::load_or_create(&cfg.identity_path())?;
    let trust = store::FileTrustStore::open(cfg.trust_store_path())
        .with_context(|| format!("opening {}", cfg.trust_store_path().display()))?;
    let core = TetherCore::new(
        keypair,
        cfg.core_config(),
        Arc::new(trust),
        builtin(Arc::new(sink::LogNotificationSink)),
    )?;
    info!(
        version = VERSION,
        device_id = %core.device_id(),
        name = %cfg.device_name,
        "tether starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.transport_port))
            .await
            .with_context(|| format!("binding transport port {}", cfg.transport_port))?;
        let (connect_tx, connect_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = lan::LanTransport::new(core.clone(), cfg.transport_port);
        tokio::spawn(async move {
            if let Err(e) = transport.run(listener, connect_rx).await {
                error!(error = %e, "lan transport stopped");
            }
        });
        let disc_core = core.clone();
        let disc_port = cfg.discovery_port;
        let transport_port = cfg.transport_port;
        tokio::spawn(async move {
            if let Err(e) =
                discovery::run_discovery(disc_core, disc_port, transport_port, connect_tx).await
            {
                error!(error = %e, "discovery stopped");
            }
        });
        shutdown_signal().await?;
        info!("shutting down");
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit; systemd may restart if configured.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
