mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{eventually, DataplaneHandle, Pki, TcpEchoBackend};
use peerlink_dataplane::{Cluster, ClusterEndpoint, DataplaneError, ListenerManager, ListenerSpec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn import_spec(name: &str) -> ListenerSpec {
    ListenerSpec {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
    }
}

/// Two sites: peera imports `db`, exported by peerb as cluster `svc-x`.
struct TwoSites {
    _pki: Pki,
    local: DataplaneHandle,
    remote: DataplaneHandle,
    _local_control_plane: MockServer,
    _remote_control_plane: MockServer,
    backend: TcpEchoBackend,
}

async fn two_sites(egress_status: u16, handoff_status: u16) -> TwoSites {
    let pki = Pki::new();

    let local_control_plane = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authz/egress"))
        .and(header("x-import-name", "db"))
        .and(header("x-client-ip", "127.0.0.1"))
        .respond_with(
            ResponseTemplate::new(egress_status)
                .insert_header("x-target-peer", "peerb")
                .insert_header("x-access-token", "abc"),
        )
        .mount(&local_control_plane)
        .await;

    let remote_control_plane = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authz/ingress"))
        .and(header("authorization", "abc"))
        .and(header("x-import-name", "db"))
        .respond_with(ResponseTemplate::new(handoff_status).insert_header("x-target-cluster", "svc-x"))
        .mount(&remote_control_plane)
        .await;

    let local = DataplaneHandle::spawn("peera", &pki, &local_control_plane.uri()).await;
    let remote = DataplaneHandle::spawn("peerb", &pki, &remote_control_plane.uri()).await;

    let backend = TcpEchoBackend::spawn().await.unwrap();
    remote.registry.upsert_cluster(backend.cluster("svc-x"));

    // The remote peer is reached through its public SNI port.
    local.registry.upsert_cluster(
        Cluster::new(
            "remote-peer-peerb",
            vec![ClusterEndpoint::new("127.0.0.1", remote.sni_addr.port())],
        )
        .unwrap(),
    );

    TwoSites {
        _pki: pki,
        local,
        remote,
        _local_control_plane: local_control_plane,
        _remote_control_plane: remote_control_plane,
        backend,
    }
}

async fn read_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    let _ = timeout(TEST_TIMEOUT, stream.read_to_end(&mut rest))
        .await
        .expect("connection must be closed");
    rest
}

#[tokio::test]
async fn egress_is_handed_off_and_forwarded() {
    let sites = two_sites(200, 200).await;
    let addr = sites.local.server.create_listener(import_spec("db")).await.unwrap();

    let echoed = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"select 1;").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        buf
    })
    .await
    .expect("egress round trip timed out");

    assert_eq!(&echoed, b"select 1;");
    assert_eq!(sites.backend.connection_count(), 1);

    let local = sites.local.server.stats();
    assert_eq!(local.egress_accepted.load(Ordering::Relaxed), 1);
    assert_eq!(local.egress_forwarded.load(Ordering::Relaxed), 1);

    let remote = sites.remote.server.stats();
    assert_eq!(remote.ingress_forwarded.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn denied_egress_closes_local_connection() {
    let sites = two_sites(403, 200).await;
    let addr = sites.local.server.create_listener(import_spec("db")).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(read_closed(&mut client).await.is_empty());

    assert_eq!(sites.local.server.stats().egress_denied.load(Ordering::Relaxed), 1);
    assert_eq!(sites.remote.server.stats().ingress_accepted.load(Ordering::Relaxed), 0);
    assert_eq!(sites.backend.connection_count(), 0);
}

#[tokio::test]
async fn rejected_handoff_closes_local_connection() {
    let sites = two_sites(200, 403).await;
    let addr = sites.local.server.create_listener(import_spec("db")).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"never forwarded").await.unwrap();
    assert!(read_closed(&mut client).await.is_empty());

    let local = sites.local.server.stats();
    eventually("egress failure counted", || {
        local.egress_failed.load(Ordering::Relaxed) == 1
    })
    .await;
    assert_eq!(local.egress_forwarded.load(Ordering::Relaxed), 0);
    assert_eq!(sites.backend.connection_count(), 0);
}

#[tokio::test]
async fn unknown_peer_cluster_closes_local_connection() {
    let sites = two_sites(200, 200).await;
    sites.local.registry.remove_cluster("remote-peer-peerb");
    let addr = sites.local.server.create_listener(import_spec("db")).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(read_closed(&mut client).await.is_empty());
    assert_eq!(sites.local.server.stats().egress_failed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn duplicate_listener_is_rejected_without_side_effects() {
    let sites = two_sites(200, 200).await;
    let server = &sites.local.server;

    let addr = server.create_listener(import_spec("db")).await.unwrap();
    let err = server.create_listener(import_spec("db")).await.unwrap_err();
    assert!(matches!(err, DataplaneError::ListenerExists(name) if name == "db"));

    assert_eq!(sites.local.registry.listener_addr("db").await, Some(addr));

    // The original listener still serves.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ok?").await.unwrap();
    let mut buf = [0u8; 3];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ok?");
}

#[tokio::test]
async fn deleted_listener_keeps_inflight_connections() {
    let sites = two_sites(200, 200).await;
    let server = &sites.local.server;
    let addr = server.create_listener(import_spec("db")).await.unwrap();

    let mut inflight = TcpStream::connect(addr).await.unwrap();
    inflight.write_all(b"first").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(TEST_TIMEOUT, inflight.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    server.delete_listener("db").await.unwrap();
    assert!(!sites.local.registry.has_listener("db").await);

    // The socket is closed by the time the delete returns.
    assert!(
        TcpStream::connect(addr).await.is_err(),
        "listener socket must be released"
    );

    inflight.write_all(b"again").await.unwrap();
    timeout(TEST_TIMEOUT, inflight.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"again");

    let err = server.delete_listener("db").await.unwrap_err();
    assert!(matches!(err, DataplaneError::UnknownListener(_)));
}

#[tokio::test]
async fn deleted_listener_name_can_be_recreated() {
    let sites = two_sites(200, 200).await;
    let server = &sites.local.server;

    server.create_listener(import_spec("db")).await.unwrap();
    server.delete_listener("db").await.unwrap();
    let addr = server.create_listener(import_spec("db")).await.unwrap();

    assert_eq!(sites.local.registry.listener_addr("db").await, Some(addr));
}

#[tokio::test]
async fn listener_moved_to_new_host_on_same_port() {
    let sites = two_sites(200, 200).await;
    let server = &sites.local.server;

    for _ in 0..20 {
        let old = server.create_listener(import_spec("db")).await.unwrap();
        server.delete_listener("db").await.unwrap();

        let moved = ListenerSpec {
            name: "db".to_string(),
            host: "0.0.0.0".to_string(),
            port: old.port(),
        };
        let addr = server
            .create_listener(moved)
            .await
            .expect("same port must be free once the old listener is deleted");
        assert_eq!(addr.port(), old.port());

        server.delete_listener("db").await.unwrap();
    }
}

#[tokio::test]
async fn silent_peer_handoff_times_out_and_closes() {
    let pki = Pki::new();

    let control_plane = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authz/egress"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-target-peer", "peerb")
                .insert_header("x-access-token", "abc"),
        )
        .mount(&control_plane)
        .await;

    let local = DataplaneHandle::spawn("peera", &pki, &control_plane.uri()).await;

    // Completes the mTLS handshake, reads the handoff, never answers.
    let acceptor = pki.identity(&["dataplane.peerb"]).acceptor().unwrap();
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    let (peer_closed_tx, peer_closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (tcp, _) = peer.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let mut sink = Vec::new();
        let _ = tls.read_to_end(&mut sink).await;
        let _ = peer_closed_tx.send(());
    });

    local.registry.upsert_cluster(
        Cluster::new(
            "remote-peer-peerb",
            vec![ClusterEndpoint::new("127.0.0.1", peer_port)],
        )
        .unwrap(),
    );
    let addr = local.server.create_listener(import_spec("db")).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"never forwarded").await.unwrap();
    assert!(read_closed(&mut client).await.is_empty());

    // The outbound TLS connection is released as well.
    timeout(TEST_TIMEOUT, peer_closed_rx)
        .await
        .expect("peer connection must be closed")
        .unwrap();

    let stats = local.server.stats();
    eventually("egress failure counted", || {
        stats.egress_failed.load(Ordering::Relaxed) == 1
    })
    .await;
    assert_eq!(stats.egress_forwarded.load(Ordering::Relaxed), 0);
}
