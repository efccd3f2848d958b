//! Ingress flow: authorize the peer's handoff, hijack, dial, forward.

use std::sync::atomic::Ordering;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use super::http::{Hijack, HttpConn, RequestHead};
use super::DataplaneServer;
use crate::api;
use crate::error::DataplaneError;
use crate::forwarder::forward;

impl DataplaneServer {
    pub(crate) async fn handle_ingress<S>(
        &self,
        conn: HttpConn<S>,
        head: RequestHead,
        body: Bytes,
    ) -> Result<(), DataplaneError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let stats = &self.inner.stats;
        stats.ingress_accepted.fetch_add(1, Ordering::Relaxed);

        let import = head
            .header(api::IMPORT_NAME_HEADER)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();

        let grant = match self.inner.control_plane.authorize_ingress(&head, body).await {
            Ok(grant) => grant,
            Err(e) => {
                stats.ingress_denied.fetch_add(1, Ordering::Relaxed);
                let status = e.client_status();
                info!(
                    import = %import,
                    status = status.as_u16(),
                    error = %e,
                    "Ingress denied"
                );
                conn.respond(status).await?;
                return Ok(());
            }
        };

        info!(import = %import, target_cluster = %grant.target_cluster, "Ingress authorized");

        let hijacked = conn.hijack(StatusCode::OK).await?;

        let (mut upstream, endpoint) = match self.inner.registry.dial(&grant.target_cluster).await {
            Ok(dialed) => dialed,
            Err(e) => {
                stats.ingress_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target_cluster = %grant.target_cluster,
                    error = %e,
                    reason = e.reason_code(),
                    "Ingress dial failed; closing"
                );
                return Ok(());
            }
        };

        if !hijacked.leftover.is_empty() {
            upstream.write_all(&hijacked.leftover).await?;
        }

        stats.ingress_forwarded.fetch_add(1, Ordering::Relaxed);
        let mut transferred = forward(hijacked.io, upstream).await;
        transferred.a_to_b += hijacked.leftover.len() as u64;
        stats.record_transfer(transferred);

        info!(
            import = %import,
            target_cluster = %grant.target_cluster,
            endpoint = %endpoint,
            bytes_to_target = transferred.a_to_b,
            bytes_from_target = transferred.b_to_a,
            "Ingress connection closed"
        );
        Ok(())
    }
}
