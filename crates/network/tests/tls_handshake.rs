//! End-to-end mTLS tests over loopback with freshly generated clusters.

use quorum_backoff::ExponentialBackoff;
use quorum_network::{ListenerHandle, OperationState, PeerReconnector, QuorumSocketFactory};
use quorum_security::{
    ClusterPaths, SecureChannelContext, TestCertificateAuthority, TrustMaterial,
    TrustMaterialLoader,
};
use quorum_types::{ErrorKind, PeerId, QuorumPeerAddress, MAX_PEER_PORT};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PASSWORD: &str = "CertPassword1";
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Cluster {
    _dir: TempDir,
    paths: ClusterPaths,
}

impl Cluster {
    fn generate(ca_name: &str, nodes: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCertificateAuthority::generate(ca_name).unwrap();
        let paths = ca.write_cluster(dir.path(), nodes, PASSWORD).unwrap();
        Self { _dir: dir, paths }
    }

    fn material(&self, id: usize) -> TrustMaterial {
        TrustMaterialLoader::new()
            .load_settings(&self.paths.settings_for(id, PASSWORD))
            .unwrap()
    }

    fn factory(&self, id: usize, protocol: &str) -> QuorumSocketFactory {
        tls_factory(self.material(id), protocol)
    }

    /// This cluster's root, but presenting an identity issued by `other`.
    fn factory_with_identity_from(
        &self,
        other: &Cluster,
        id: usize,
        protocol: &str,
    ) -> QuorumSocketFactory {
        let material = TrustMaterial::new(
            other.material(id).identity().cloned(),
            self.material(id).trust_root().cloned(),
        );
        tls_factory(material, protocol)
    }
}

fn tls_factory(material: TrustMaterial, protocol: &str) -> QuorumSocketFactory {
    let context = SecureChannelContext::build(material, protocol).unwrap();
    QuorumSocketFactory::for_tls(Arc::new(context))
}

/// Listen on a random free port within the peer port range.
async fn listen(factory: &QuorumSocketFactory) -> ListenerHandle {
    loop {
        let port = rand::thread_rng().gen_range(20_000..=MAX_PEER_PORT);
        match factory.build_for_server(port, LOCALHOST).await {
            Ok(listener) => return listener,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Bind),
        }
    }
}

fn address_of(listener: &ListenerHandle, id: u64) -> QuorumPeerAddress {
    QuorumPeerAddress::from_resolved(id, listener.local_addr()).unwrap()
}

#[tokio::test]
async fn test_round_trip_between_trusted_peers() {
    let cluster = Cluster::generate("Quorum Test CA", 2);
    let server_factory = cluster.factory(1, "TLSv1.2");
    let client_factory = cluster.factory(2, "TLSv1.2");

    let listener = listen(&server_factory).await;
    let accept = listener.accept();
    let connect = client_factory
        .build_for_client()
        .connect(&address_of(&listener, 1));

    let mut accept_state = accept.subscribe();
    let mut connect_state = connect.subscribe();

    let (server, client) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(accept.outcome(), connect.outcome())
    })
    .await
    .unwrap();
    let server = server.unwrap();
    let client = client.unwrap();

    assert_eq!(*accept_state.borrow_and_update(), OperationState::Completed);
    assert_eq!(*connect_state.borrow_and_update(), OperationState::Completed);

    assert!(server.is_encrypted());
    assert_eq!(server.peer_id(), Some(PeerId(2)));
    assert_eq!(client.peer_id(), Some(PeerId(1)));
    assert_eq!(client.peer_common_name().as_deref(), Some("server.1"));

    let message = "HelloWorld!";
    let written = client.write(message).outcome().await.unwrap();
    assert_eq!(written, message.len());

    let received = server.read_exact(message.len()).outcome().await.unwrap();
    assert_eq!(received, message.as_bytes());

    server.write(received).outcome().await.unwrap();
    let echoed = client.read_exact(message.len()).outcome().await.unwrap();
    assert_eq!(String::from_utf8(echoed).unwrap(), message);
}

#[tokio::test]
async fn test_tls13_only_peers_connect() {
    let cluster = Cluster::generate("Quorum Test CA", 2);
    let listener = listen(&cluster.factory(1, "TLSv1.3")).await;

    let accept = listener.accept();
    let connect = cluster
        .factory(2, "TLSv1.3")
        .build_for_client()
        .connect(&address_of(&listener, 1));

    let (server, client) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(accept.outcome(), connect.outcome())
    })
    .await
    .unwrap();
    assert!(server.is_ok());
    assert!(client.is_ok());
}

async fn assert_untrusted_client_rejected(protocol: &str) {
    let trusted = Cluster::generate("Quorum Test CA", 2);
    let foreign = Cluster::generate("Foreign CA", 2);

    let listener = listen(&trusted.factory(1, protocol)).await;
    let accept = listener.accept();
    // Trusts the server, but its own certificate does not chain to the root.
    let connect = trusted
        .factory_with_identity_from(&foreign, 2, protocol)
        .build_for_client()
        .connect(&address_of(&listener, 1));

    let (server, client) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(accept.outcome(), connect.outcome())
    })
    .await
    .unwrap();

    assert_eq!(server.unwrap_err().kind(), ErrorKind::Handshake);
    let client_err = client.unwrap_err();
    assert_eq!(client_err.kind(), ErrorKind::Handshake, "{}", protocol);
    assert!(!client_err.is_retryable());
}

#[tokio::test]
async fn test_untrusted_client_certificate_fails_both_sides() {
    assert_untrusted_client_rejected("TLSv1").await;
}

#[tokio::test]
async fn test_untrusted_client_certificate_fails_both_sides_tls13() {
    assert_untrusted_client_rejected("TLSv1.3").await;
}

#[tokio::test]
async fn test_untrusted_client_not_retried_by_reconnector() {
    let trusted = Cluster::generate("Quorum Test CA", 2);
    let foreign = Cluster::generate("Foreign CA", 2);

    let listener = listen(&trusted.factory(1, "TLSv1")).await;
    let _accept = listener.accept();

    let mut reconnector = PeerReconnector::new(
        trusted
            .factory_with_identity_from(&foreign, 2, "TLSv1")
            .build_for_client(),
        address_of(&listener, 1),
        Box::new(ExponentialBackoff::new(10, 100).unwrap()),
    )
    .with_max_attempts(5);

    let err = tokio::time::timeout(TEST_TIMEOUT, reconnector.connect())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}

#[tokio::test]
async fn test_client_distrusting_server_fails_handshake() {
    let trusted = Cluster::generate("Quorum Test CA", 1);
    let foreign = Cluster::generate("Foreign CA", 2);

    let listener = listen(&trusted.factory(1, "TLSv1.2")).await;
    let accept = listener.accept();
    let connect = foreign
        .factory(2, "TLSv1.2")
        .build_for_client()
        .connect(&address_of(&listener, 1));

    let (server, client) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(accept.outcome(), connect.outcome())
    })
    .await
    .unwrap();

    assert_eq!(server.unwrap_err().kind(), ErrorKind::Handshake);
    let client_err = client.unwrap_err();
    assert_eq!(client_err.kind(), ErrorKind::Handshake);
    assert!(!client_err.is_retryable());
}

#[tokio::test]
async fn test_plaintext_client_rejected_by_tls_listener() {
    let cluster = Cluster::generate("Quorum Test CA", 1);
    let listener = listen(&cluster.factory(1, "TLSv1.2")).await;
    let accept = listener.accept();

    let client = QuorumSocketFactory::without_tls()
        .build_for_client()
        .connect(&address_of(&listener, 1))
        .outcome()
        .await
        .unwrap();
    assert!(!client.is_encrypted());
    client
        .write("this is not a tls record\r\n\r\n")
        .outcome()
        .await
        .unwrap();

    let err = tokio::time::timeout(TEST_TIMEOUT, accept.outcome())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}

#[tokio::test]
async fn test_reconnector_does_not_retry_handshake_failure() {
    let trusted = Cluster::generate("Quorum Test CA", 1);
    let foreign = Cluster::generate("Foreign CA", 2);

    let listener = listen(&trusted.factory(1, "TLSv1.2")).await;
    let _accept = listener.accept();

    let policy = ExponentialBackoff::new(10, 100).unwrap();
    let mut reconnector = PeerReconnector::new(
        foreign.factory(2, "TLSv1.2").build_for_client(),
        address_of(&listener, 1),
        Box::new(policy),
    )
    .with_max_attempts(5);

    let err = tokio::time::timeout(TEST_TIMEOUT, reconnector.connect())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}

#[tokio::test]
async fn test_connect_timeout_is_transport_failure() {
    let cluster = Cluster::generate("Quorum Test CA", 2);
    // Bound but never accepting: TCP connects, the handshake never starts.
    let silent = listen(&cluster.factory(1, "TLSv1.2")).await;

    let err = cluster
        .factory(2, "TLSv1.2")
        .build_for_client()
        .with_connect_timeout(Duration::from_millis(200))
        .connect(&address_of(&silent, 1))
        .outcome()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_cancelled_accept_leaves_listener_usable() {
    let factory = QuorumSocketFactory::without_tls();
    let listener = listen(&factory).await;

    let first = listener.accept();
    assert!(first.cancel());
    assert_eq!(first.state(), OperationState::Cancelled);
    assert_eq!(
        first.outcome().await.unwrap_err().kind(),
        ErrorKind::Cancelled
    );

    let accept = listener.accept();
    let connect = factory
        .build_for_client()
        .connect(&address_of(&listener, 1));
    let (server, client) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(accept.outcome(), connect.outcome())
    })
    .await
    .unwrap();

    let server = server.unwrap();
    let client = client.unwrap();
    client.write("ping").outcome().await.unwrap();
    assert_eq!(server.read_exact(4).outcome().await.unwrap(), b"ping");
}
