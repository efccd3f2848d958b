//! Authorization calls to the local control plane.
//!
//! Both directions ask the control plane before any traffic moves. Ingress
//! relays the incoming request's headers and body; egress sends the import
//! name and the local client's address. Any failure to get a positive answer
//! is a denial.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use reqwest::StatusCode;
use tracing::debug;

use crate::api;
use crate::error::DataplaneError;
use crate::server::http::RequestHead;
use crate::tls::TlsIdentity;

/// Default authorization request timeout.
pub const DEFAULT_AUTHZ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    #[error("control plane denied the request ({0})")]
    Denied(StatusCode),

    #[error("control plane response missing {0} header")]
    MissingHeader(&'static str),

    #[error("control plane did not answer in time")]
    Timeout,

    #[error("control plane request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

impl AuthzError {
    /// Status to relay to the party that asked.
    pub fn client_status(&self) -> StatusCode {
        match self {
            AuthzError::Denied(status) => *status,
            _ => StatusCode::FORBIDDEN,
        }
    }
}

impl From<reqwest::Error> for AuthzError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AuthzError::Timeout
        } else {
            AuthzError::Transport(e)
        }
    }
}

/// Positive ingress decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressGrant {
    pub target_cluster: String,
}

/// Positive egress decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressGrant {
    pub target_peer: String,
    pub access_token: String,
}

impl EgressGrant {
    /// Cluster holding the peer's dataplane endpoints.
    pub fn cluster_name(&self) -> String {
        api::remote_peer_cluster_name(&self.target_peer)
    }
}

/// HTTP client for the control plane authorization endpoints.
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// Build a client. With an identity, the client presents the local
    /// certificate and trusts only the local CA.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        identity: Option<&TlsIdentity>,
    ) -> Result<Self, DataplaneError> {
        let mut builder = reqwest::Client::builder().timeout(timeout).use_rustls_tls();

        if let Some(identity) = identity {
            let (client_identity, ca) = identity.http_identity()?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(ca)
                .identity(client_identity);
        }

        let client = builder
            .build()
            .map_err(|e| DataplaneError::Identity(format!("failed to build authz client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Ask whether an incoming dataplane request may proceed.
    pub async fn authorize_ingress(
        &self,
        head: &RequestHead,
        body: Bytes,
    ) -> Result<IngressGrant, AuthzError> {
        let url = format!("{}{}", self.base_url, api::CONTROLPLANE_INGRESS_AUTHZ_PATH);

        let mut headers = HeaderMap::new();
        for (name, value) in &head.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if name == HOST || name == CONTENT_LENGTH {
                continue;
            }
            let Ok(value) = HeaderValue::from_bytes(value) else {
                continue;
            };
            headers.append(name, value);
        }

        let response = self.client.post(&url).headers(headers).body(body).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            debug!(status = %status, "Ingress authorization denied");
            return Err(AuthzError::Denied(status));
        }

        let target_cluster = required_header(response.headers(), api::TARGET_CLUSTER_HEADER)?;
        Ok(IngressGrant { target_cluster })
    }

    /// Ask whether a local client may reach an import.
    pub async fn authorize_egress(
        &self,
        import_name: &str,
        client_ip: IpAddr,
    ) -> Result<EgressGrant, AuthzError> {
        let url = format!("{}{}", self.base_url, api::CONTROLPLANE_EGRESS_AUTHZ_PATH);

        let response = self
            .client
            .post(&url)
            .header(api::IMPORT_NAME_HEADER, import_name)
            .header(api::CLIENT_IP_HEADER, client_ip.to_string())
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            debug!(status = %status, import = import_name, "Egress authorization denied");
            return Err(AuthzError::Denied(status));
        }

        let headers = response.headers();
        Ok(EgressGrant {
            target_peer: required_header(headers, api::TARGET_PEER_HEADER)?,
            access_token: required_header(headers, api::ACCESS_TOKEN_HEADER)?,
        })
    }
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, AuthzError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(AuthzError::MissingHeader(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ControlPlaneClient {
        ControlPlaneClient::new(server.uri(), DEFAULT_AUTHZ_TIMEOUT, None).unwrap()
    }

    fn head() -> RequestHead {
        RequestHead {
            method: "POST".to_string(),
            path: api::DATAPLANE_INGRESS_PATH.to_string(),
            headers: vec![
                ("Host".to_string(), b"dataplane.peerb".to_vec()),
                ("Authorization".to_string(), b"tok-1".to_vec()),
                ("x-import-name".to_string(), b"db".to_vec()),
                ("Content-Length".to_string(), b"4".to_vec()),
            ],
        }
    }

    #[tokio::test]
    async fn test_ingress_grant_relays_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(api::CONTROLPLANE_INGRESS_AUTHZ_PATH))
            .and(header("authorization", "tok-1"))
            .and(header("x-import-name", "db"))
            .and(body_bytes(b"ping".to_vec()))
            .respond_with(ResponseTemplate::new(200).insert_header(api::TARGET_CLUSTER_HEADER, "db-cluster"))
            .expect(1)
            .mount(&server)
            .await;

        let grant = client(&server)
            .authorize_ingress(&head(), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(grant.target_cluster, "db-cluster");
    }

    #[tokio::test]
    async fn test_ingress_denial_relays_status() {
        let server = MockServer::start().await;
        Mock::given(path(api::CONTROLPLANE_INGRESS_AUTHZ_PATH))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server)
            .authorize_ingress(&head(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Denied(StatusCode::UNAUTHORIZED)));
        assert_eq!(err.client_status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ingress_grant_without_cluster_is_denied() {
        let server = MockServer::start().await;
        Mock::given(path(api::CONTROLPLANE_INGRESS_AUTHZ_PATH))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = client(&server)
            .authorize_ingress(&head(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::MissingHeader(api::TARGET_CLUSTER_HEADER)));
        assert_eq!(err.client_status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_slow_control_plane_times_out() {
        let server = MockServer::start().await;
        Mock::given(path(api::CONTROLPLANE_EGRESS_AUTHZ_PATH))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = client(&server)
            .authorize_egress("db", "127.0.0.1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Timeout));
        assert_eq!(err.client_status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_egress_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(api::CONTROLPLANE_EGRESS_AUTHZ_PATH))
            .and(header("x-import-name", "db"))
            .and(header("x-client-ip", "10.0.0.7"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(api::TARGET_PEER_HEADER, "peerb")
                    .insert_header(api::ACCESS_TOKEN_HEADER, "tok-9"),
            )
            .mount(&server)
            .await;

        let grant = client(&server)
            .authorize_egress("db", "10.0.0.7".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(grant.target_peer, "peerb");
        assert_eq!(grant.access_token, "tok-9");
        assert_eq!(grant.cluster_name(), "remote-peer-peerb");
    }

    #[tokio::test]
    async fn test_egress_grant_requires_token() {
        let server = MockServer::start().await;
        Mock::given(path(api::CONTROLPLANE_EGRESS_AUTHZ_PATH))
            .and(header_exists("x-client-ip"))
            .respond_with(ResponseTemplate::new(200).insert_header(api::TARGET_PEER_HEADER, "peerb"))
            .mount(&server)
            .await;

        let err = client(&server)
            .authorize_egress("db", "10.0.0.7".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::MissingHeader(api::ACCESS_TOKEN_HEADER)));
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ControlPlaneClient::new(format!("http://{addr}"), DEFAULT_AUTHZ_TIMEOUT, None).unwrap();
        let err = client
            .authorize_egress("db", "10.0.0.7".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Transport(_) | AuthzError::Timeout));
        assert_eq!(err.client_status(), StatusCode::FORBIDDEN);
    }
}
