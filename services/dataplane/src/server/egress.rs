//! Egress listeners: one TCP listener per imported service.
//!
//! Each accepted local connection is authorized, handed off to the remote
//! peer's dataplane over mTLS, then forwarded. Failures close the local
//! connection; the client is expected to reconnect. Tearing a listener down
//! stops its accept loop and closes its socket only: connections already
//! forwarding keep running.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, error, info, warn, Instrument};

use super::http::{send_handoff, Handoff};
use super::DataplaneServer;
use crate::api;
use crate::authz::EgressGrant;
use crate::discovery::ListenerManager;
use crate::error::DataplaneError;
use crate::forwarder::forward;
use crate::registry::{ListenerEntry, ListenerSpec};
use crate::tls;

#[async_trait]
impl ListenerManager for DataplaneServer {
    async fn create_listener(&self, spec: ListenerSpec) -> Result<SocketAddr, DataplaneError> {
        let registry = &self.inner.registry;
        if registry.has_listener(&spec.name).await {
            return Err(DataplaneError::ListenerExists(spec.name));
        }

        let bind_target = spec.bind_target();
        let listener = TcpListener::bind(&bind_target)
            .await
            .map_err(|source| DataplaneError::Bind {
                addr: bind_target.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        // Losing a concurrent create drops the socket just bound.
        registry
            .register_listener(ListenerEntry::new(
                spec.clone(),
                local_addr,
                stop_tx,
                stopped_rx,
            ))
            .await?;

        info!(listener = %spec.name, bind = %bind_target, local_addr = %local_addr, "Egress listener bound");

        let span = tracing::info_span!("egress_listener", import = %spec.name);
        tokio::spawn(
            self.clone()
                .run_egress_listener(spec.name, listener, stop_rx, stopped_tx)
                .instrument(span),
        );

        Ok(local_addr)
    }

    async fn delete_listener(&self, name: &str) -> Result<(), DataplaneError> {
        let entry = self
            .inner
            .registry
            .remove_listener(name)
            .await
            .ok_or_else(|| DataplaneError::UnknownListener(name.to_string()))?;

        let local_addr = entry.local_addr;
        // Returns once the socket is closed, so the address can be rebound.
        let signalled = entry.stop().await;
        info!(listener = name, local_addr = %local_addr, signalled, "Egress listener torn down");
        Ok(())
    }
}

impl DataplaneServer {
    async fn run_egress_listener(
        self,
        import: String,
        listener: TcpListener,
        mut stop: oneshot::Receiver<()>,
        stopped: oneshot::Sender<()>,
    ) {
        loop {
            tokio::select! {
                // A dropped sender stops the loop as well.
                _ = &mut stop => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let server = self.clone();
                        let import = import.clone();
                        let span = tracing::info_span!("connection", peer = %peer_addr);
                        tokio::spawn(
                            async move { server.handle_egress(&import, stream, peer_addr).await }
                                .instrument(span),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        drop(stopped);
        info!("Egress listener stopped");
    }

    async fn handle_egress(&self, import: &str, mut client: TcpStream, peer_addr: SocketAddr) {
        let stats = &self.inner.stats;
        stats.egress_accepted.fetch_add(1, Ordering::Relaxed);
        let client_ip = peer_addr.ip();

        let grant = match self.inner.control_plane.authorize_egress(import, client_ip).await {
            Ok(grant) => grant,
            Err(e) => {
                stats.egress_denied.fetch_add(1, Ordering::Relaxed);
                info!(
                    import,
                    client_ip = %client_ip,
                    status = e.client_status().as_u16(),
                    error = %e,
                    "Egress denied"
                );
                return;
            }
        };

        info!(import, client_ip = %client_ip, target_peer = %grant.target_peer, "Egress authorized");

        let (peer, leftover) = match self.hand_off(import, client_ip, &grant).await {
            Ok(handed_off) => handed_off,
            Err(e) => {
                stats.egress_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    import,
                    target_peer = %grant.target_peer,
                    error = %e,
                    reason = e.reason_code(),
                    "Egress handoff failed; closing"
                );
                return;
            }
        };

        if !leftover.is_empty() {
            if let Err(e) = client.write_all(&leftover).await {
                debug!(error = %e, "Client gone before forwarding");
                return;
            }
        }

        stats.egress_forwarded.fetch_add(1, Ordering::Relaxed);
        let mut transferred = forward(client, peer).await;
        transferred.b_to_a += leftover.len() as u64;
        stats.record_transfer(transferred);

        info!(
            import,
            target_peer = %grant.target_peer,
            bytes_to_target = transferred.a_to_b,
            bytes_from_target = transferred.b_to_a,
            "Egress connection closed"
        );
    }

    /// Dial the peer's dataplane and complete the handoff.
    async fn hand_off(
        &self,
        import: &str,
        client_ip: IpAddr,
        grant: &EgressGrant,
    ) -> Result<(TlsStream<TcpStream>, Bytes), DataplaneError> {
        let (tcp, endpoint) = self.inner.registry.dial(&grant.cluster_name()).await?;

        let host = api::dataplane_server_name(&grant.target_peer);
        let mut peer = timeout(
            self.inner.timeouts.handshake,
            self.inner.connector.connect(tls::server_name(&host)?, tcp),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timeout"))??;

        debug!(endpoint = %endpoint, server_name = %host, "Peer dataplane connected");

        let handoff = Handoff {
            host: &host,
            access_token: &grant.access_token,
            import_name: import,
            client_ip,
        };
        let leftover = timeout(
            self.inner.timeouts.handoff,
            send_handoff(&mut peer, &handoff),
        )
        .await
        .map_err(|_| DataplaneError::HandoffTimeout)??;

        Ok((peer, leftover))
    }
}
