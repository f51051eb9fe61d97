//! Integration tests for the key exchange and session-keyed envelopes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parley_common::{Error, KeyExchangeConfig};
use parley_core::{HandshakeRequest, HandshakeResponse, CANONICAL_CHALLENGE};
use parley_crypto::{
    seal_to, AsymmetricIdentity, ClientError, Ed25519Verifier, EnvelopeError, HandshakeClient,
    HandshakeCoordinator, HandshakeError, HandshakeTransport, IdentityKeypair, IdentitySigner,
    NonceGuard, PreparedExchange, SecureEnvelope, SessionKey, SessionKeyStore, SignatureVerifier,
};
use serde_json::json;

type Server = HandshakeCoordinator<IdentityKeypair, Ed25519Verifier>;
type Client = HandshakeClient<IdentityKeypair, Ed25519Verifier>;

fn spawn_server_with(keypair: IdentityKeypair) -> Arc<Server> {
    let config = KeyExchangeConfig::default();
    Arc::new(HandshakeCoordinator::from_config(
        &config,
        Arc::new(AsymmetricIdentity::generate().unwrap()),
        Arc::new(NonceGuard::from_config(&config).unwrap()),
        Arc::new(SessionKeyStore::new()),
        keypair,
        Ed25519Verifier,
    ))
}

fn spawn_server() -> Arc<Server> {
    spawn_server_with(IdentityKeypair::generate())
}

fn new_client() -> Client {
    HandshakeClient::new(
        IdentityKeypair::generate(),
        Ed25519Verifier,
        Arc::new(SessionKeyStore::new()),
    )
}

/// Passes messages straight to a coordinator, through their JSON wire form.
struct InMemoryTransport {
    server: Arc<Server>,
}

impl HandshakeTransport for InMemoryTransport {
    async fn fetch_public_key(&self) -> parley_common::Result<HandshakeResponse> {
        let advert = self
            .server
            .advertise_public_key()
            .map_err(Error::protocol)?;
        let wire = serde_json::to_vec(&advert)?;
        Ok(serde_json::from_slice(&wire)?)
    }

    async fn exchange_symmetric_key(
        &self,
        request: &HandshakeRequest,
    ) -> parley_common::Result<()> {
        let wire = serde_json::to_vec(request)?;
        let request: HandshakeRequest = serde_json::from_slice(&wire)?;
        self.server
            .accept_session_key(&request)
            .map_err(Error::protocol)
    }
}

/// Never answers in time.
struct StalledTransport;

impl HandshakeTransport for StalledTransport {
    async fn fetch_public_key(&self) -> parley_common::Result<HandshakeResponse> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(Error::protocol("unreachable"))
    }

    async fn exchange_symmetric_key(
        &self,
        _request: &HandshakeRequest,
    ) -> parley_common::Result<()> {
        Ok(())
    }
}

fn signed_request(
    server: &Server,
    client: &IdentityKeypair,
    key: &SessionKey,
    session_id: &str,
    nonce: &str,
) -> HandshakeRequest {
    let advert = server.advertise_public_key().unwrap();
    let public_key: [u8; 32] = advert.public_key.as_slice().try_into().unwrap();
    HandshakeRequest {
        encrypted_symmetric_key: seal_to(&public_key, key.as_bytes()).unwrap(),
        session_id: session_id.into(),
        identity: client.identity(),
        timestamp: Utc::now(),
        nonce: nonce.into(),
        signature: client.sign(CANONICAL_CHALLENGE).unwrap(),
    }
}

/// Handshake by hand, then a sealed command in each direction
#[tokio::test]
async fn test_end_to_end_exchange() {
    let server = spawn_server();
    let alice = IdentityKeypair::generate();
    let key = SessionKey::generate().unwrap();

    let advert = server.advertise_public_key().unwrap();
    assert!(Ed25519Verifier.verify(&advert.identity, CANONICAL_CHALLENGE, &advert.signature));

    server
        .accept_session_key(&signed_request(&server, &alice, &key, "sess-1", "n1"))
        .unwrap();

    // Client side holds the same key under the same pair
    let client_store = Arc::new(SessionKeyStore::new());
    client_store
        .insert("sess-1", &alice.identity(), key)
        .unwrap();
    let client_envelopes = SecureEnvelope::new(client_store);

    let command = client_envelopes
        .seal_json("sess-1", &alice.identity(), &json!({"cmd": "ping"}))
        .unwrap();
    let received: serde_json::Value = server.envelope().open_json(&command).unwrap();
    assert_eq!(received, json!({"cmd": "ping"}));

    let reply = server
        .envelope()
        .seal_json("sess-1", &alice.identity(), &json!({"reply": "pong"}))
        .unwrap();
    let received: serde_json::Value = client_envelopes.open_json(&reply).unwrap();
    assert_eq!(received, json!({"reply": "pong"}));

    server.shutdown().await;
}

/// A captured request replayed verbatim is refused and leaves the session alone
#[tokio::test]
async fn test_replayed_request_rejected() {
    let server = spawn_server();
    let alice = IdentityKeypair::generate();
    let key = SessionKey::generate().unwrap();
    let captured = signed_request(&server, &alice, &key, "sess-1", "n1");

    server.accept_session_key(&captured).unwrap();

    let err = server.accept_session_key(&captured).unwrap_err();
    assert!(matches!(err, HandshakeError::ReplayedNonce));
    assert!(err.is_unauthorized());

    // Replaying under a new session id does not help either
    let mut retargeted = captured.clone();
    retargeted.session_id = "sess-2".into();
    assert!(matches!(
        server.accept_session_key(&retargeted),
        Err(HandshakeError::ReplayedNonce)
    ));

    assert_eq!(server.sessions().len(), 1);
    assert_eq!(server.sessions().lookup("sess-1", &alice.identity()), Some(key));

    server.shutdown().await;
}

/// A third identity can neither look up nor open another identity's session
#[tokio::test]
async fn test_other_identity_cannot_use_session() {
    let server = spawn_server();
    let alice = IdentityKeypair::generate();
    let eve = IdentityKeypair::generate();

    server
        .accept_session_key(&signed_request(
            &server,
            &alice,
            &SessionKey::generate().unwrap(),
            "sess-1",
            "n1",
        ))
        .unwrap();

    assert!(server.sessions().lookup("sess-1", &eve.identity()).is_none());

    let mut sealed = server
        .envelope()
        .seal("sess-1", &alice.identity(), b"for alice")
        .unwrap();
    sealed.identity = eve.identity();
    assert!(matches!(
        server.envelope().open(&sealed),
        Err(EnvelopeError::NoSessionKey)
    ));

    server.shutdown().await;
}

/// Many clients racing through the full client flow all land in one store
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients() {
    let server = spawn_server();

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let transport = InMemoryTransport {
                server: Arc::clone(&server),
            };
            tokio::spawn(async move {
                let client = new_client();
                let session = client.establish(&transport).await.unwrap();
                let sealed = client
                    .envelope()
                    .seal_json(&session.session_id, &session.identity, &json!({"n": i}))
                    .unwrap();
                (session, sealed, i)
            })
        })
        .collect();

    for handle in handles {
        let (session, sealed, i) = handle.await.unwrap();
        let opened: serde_json::Value = server.envelope().open_json(&sealed).unwrap();
        assert_eq!(opened, json!({"n": i}));
        assert!(server
            .sessions()
            .lookup(&session.session_id, &session.identity)
            .is_some());
    }

    assert_eq!(server.sessions().len(), 32);
    assert_eq!(server.nonces().len(), 32);

    server.shutdown().await;
}

/// Two racing acceptances of one session id: exactly one binding survives
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_session_id() {
    let server = spawn_server();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let client = IdentityKeypair::generate();
                let key = SessionKey::generate().unwrap();
                let request =
                    signed_request(&server, &client, &key, "contended", &format!("nonce-{}", i));
                server.accept_session_key(&request).is_ok()
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(server.sessions().len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_establish_with_pinned_server() {
    let server_keypair = IdentityKeypair::generate();
    let pinned = server_keypair.identity();
    let server = spawn_server_with(server_keypair);
    let transport = InMemoryTransport {
        server: Arc::clone(&server),
    };

    let client = new_client().with_expected_server(pinned.clone());
    let session = client.establish(&transport).await.unwrap();
    assert_eq!(session.server, pinned);
    assert_eq!(session.identity, client.identity());

    // Both sides now hold the same key
    let sealed = client
        .envelope()
        .seal(&session.session_id, &session.identity, b"hello")
        .unwrap();
    assert_eq!(server.envelope().open(&sealed).unwrap(), b"hello");

    // A different server is refused before anything is sent
    let impostor = spawn_server();
    let err = client
        .establish(&InMemoryTransport {
            server: Arc::clone(&impostor),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::UntrustedServer { .. }));
    assert!(impostor.sessions().is_empty());

    server.shutdown().await;
    impostor.shutdown().await;
}

/// The client halves can be driven separately over a custom exchange
#[tokio::test]
async fn test_prepared_exchange_submitted_by_hand() {
    let server = spawn_server();
    let client = new_client();

    let advert = server.advertise_public_key().unwrap();
    let server_key = client.verify_advertisement(&advert).unwrap();
    let PreparedExchange { request, key } = client.prepare_exchange(&server_key).unwrap();

    server.accept_session_key(&request).unwrap();
    assert_eq!(
        server
            .sessions()
            .lookup(&request.session_id, &client.identity()),
        Some(key)
    );

    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_client_times_out() {
    let client = new_client().with_timeout(Duration::from_secs(5));

    let err = client.establish(&StalledTransport).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
}
