//! peerlink dataplane binary.
//!
//! Runs the SNI demultiplexer, the dataplane server and the discovery client
//! until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use peerlink_dataplane::{
    Config, ControlPlaneClient, DataplaneServer, DiscoveryClient, EndpointRegistry, GrpcConnector,
    ServerTimeouts, SniProxy, SniProxyConfig, TlsIdentity,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PEERLINK_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting peerlink dataplane");
    info!(
        peer = %config.peer_name,
        controlplane_addr = %config.controlplane_addr,
        sni_listen_addr = %config.sni_listen_addr,
        dataplane_listen_addr = %config.dataplane_listen_addr,
        "Configuration loaded"
    );

    let identity = TlsIdentity::load(&config.ca_file, &config.cert_file, &config.key_file)
        .context("Failed to load TLS identity")?;

    let registry = Arc::new(EndpointRegistry::new());
    let control_plane = ControlPlaneClient::new(
        config.control_plane_url(),
        config.authz_timeout,
        Some(&identity),
    )?;
    let server = DataplaneServer::with_timeouts(
        config.peer_name.clone(),
        Arc::clone(&registry),
        control_plane,
        &identity,
        ServerTimeouts {
            handoff: config.handoff_timeout,
            ..ServerTimeouts::default()
        },
    )?;

    let https_listener = DataplaneServer::bind(config.dataplane_listen_addr).await?;
    let sni_proxy = SniProxy::bind(SniProxyConfig::new(config.sni_listen_addr, config.sni_routes()))
        .await
        .with_context(|| format!("Failed to bind SNI port {}", config.sni_listen_addr))?;

    let connector = GrpcConnector::new(
        &config.controlplane_addr,
        config.peer_name.clone(),
        Some(identity.grpc_tls_config()),
    )?;
    let discovery = DiscoveryClient::new(Arc::new(connector), registry, Arc::new(server.clone()))
        .with_retry_interval(config.retry_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = Arc::new(sni_proxy).run().await {
            error!(error = %e, "SNI proxy failed");
        }
    });

    let https_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = https_server.run(https_listener).await {
            error!(error = %e, "Dataplane server failed");
        }
    });

    let discovery_run = discovery.run(shutdown_rx);
    tokio::pin!(discovery_run);

    tokio::select! {
        result = &mut discovery_run => {
            result.context("Discovery stopped")?;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    }

    discovery_run.await.context("Discovery stopped")?;
    info!("peerlink dataplane stopped");
    Ok(())
}
