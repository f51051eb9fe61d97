//! Client side of the key exchange.
//!
//! The client authenticates the server's advertised public key before using
//! it, then submits a fresh session key sealed to that key:
//!
//! 1. Fetch the [`HandshakeResponse`] and verify its signature against the
//!    advertised (and optionally pinned) server identity
//! 2. Generate a random session key, session id and nonce
//! 3. Seal the key to the server, sign the canonical challenge, submit
//! 4. On acknowledgement, bind the key locally under the same session id
//!
//! Network I/O goes through [`HandshakeTransport`]. Every round trip runs
//! under a deadline and fails as a transport error, never as a protocol error.

use chrono::Utc;
use parley_common::KeyExchangeConfig;
use parley_core::{
    HandshakeRequest, HandshakeResponse, Identity, CANONICAL_CHALLENGE, PUBLIC_KEY_LEN,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::asymmetric::{seal_to, SealError};
use crate::envelope::SecureEnvelope;
use crate::identity::{IdentitySigner, SignatureVerifier, SigningError};
use crate::session_store::{AlreadyBound, SessionKey, SessionKeyStore};

/// Carries the two handshake operations to a server.
///
/// Implementations own framing and connection handling. A server rejection
/// should come back as an error; the client treats all of them alike.
pub trait HandshakeTransport {
    fn fetch_public_key(
        &self,
    ) -> impl Future<Output = parley_common::Result<HandshakeResponse>> + Send;

    fn exchange_symmetric_key(
        &self,
        request: &HandshakeRequest,
    ) -> impl Future<Output = parley_common::Result<()>> + Send;
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server advertisement signature is invalid")]
    InvalidAdvertisement,

    #[error("server identity {actual} does not match pinned identity {expected}")]
    UntrustedServer { expected: Identity, actual: Identity },

    #[error("server public key has length {0}, expected {PUBLIC_KEY_LEN}")]
    InvalidPublicKey(usize),

    #[error("entropy source failed: {0}")]
    Entropy(String),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("transport error: {0}")]
    Transport(#[from] parley_common::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error(transparent)]
    SessionIdConflict(#[from] AlreadyBound),
}

/// Result of a completed exchange. The key itself stays in the client's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub session_id: String,
    /// Identity the session key is bound to on both sides.
    pub identity: Identity,
    pub server: Identity,
}

/// A request ready to submit, plus the key it carries.
#[derive(Debug)]
pub struct PreparedExchange {
    pub request: HandshakeRequest,
    pub key: SessionKey,
}

pub struct HandshakeClient<S, V> {
    signer: S,
    verifier: V,
    sessions: Arc<SessionKeyStore>,
    expected_server: Option<Identity>,
    timeout: Duration,
}

impl<S, V> HandshakeClient<S, V>
where
    S: IdentitySigner,
    V: SignatureVerifier,
{
    pub fn new(signer: S, verifier: V, sessions: Arc<SessionKeyStore>) -> Self {
        Self {
            signer,
            verifier,
            sessions,
            expected_server: None,
            timeout: KeyExchangeConfig::default().exchange_timeout(),
        }
    }

    pub fn from_config(
        config: &KeyExchangeConfig,
        signer: S,
        verifier: V,
        sessions: Arc<SessionKeyStore>,
    ) -> Self {
        Self::new(signer, verifier, sessions).with_timeout(config.exchange_timeout())
    }

    /// Only accept advertisements signed by `server`.
    pub fn with_expected_server(mut self, server: Identity) -> Self {
        self.expected_server = Some(server);
        self
    }

    /// Deadline for each network round trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> Identity {
        self.signer.identity()
    }

    /// Envelope sealer/opener over this client's session store.
    pub fn envelope(&self) -> SecureEnvelope {
        SecureEnvelope::new(Arc::clone(&self.sessions))
    }

    /// Check that `advert` was signed by the identity it claims (and by the
    /// pinned server, if any). Returns the authenticated public key.
    pub fn verify_advertisement(
        &self,
        advert: &HandshakeResponse,
    ) -> Result<[u8; PUBLIC_KEY_LEN], ClientError> {
        if let Some(expected) = &self.expected_server {
            if *expected != advert.identity {
                warn!(
                    expected = %expected,
                    actual = %advert.identity,
                    "Advertisement from unexpected server"
                );
                return Err(ClientError::UntrustedServer {
                    expected: expected.clone(),
                    actual: advert.identity.clone(),
                });
            }
        }

        if !self
            .verifier
            .verify(&advert.identity, CANONICAL_CHALLENGE, &advert.signature)
        {
            warn!(server = %advert.identity, "Advertisement signature rejected");
            return Err(ClientError::InvalidAdvertisement);
        }

        advert
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::InvalidPublicKey(advert.public_key.len()))
    }

    /// Build a signed request carrying a fresh session key sealed to `server_public_key`.
    pub fn prepare_exchange(
        &self,
        server_public_key: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<PreparedExchange, ClientError> {
        let key = SessionKey::generate().map_err(|e| ClientError::Entropy(e.to_string()))?;
        let encrypted_symmetric_key = seal_to(server_public_key, key.as_bytes())?;

        let request = HandshakeRequest {
            encrypted_symmetric_key,
            session_id: Uuid::new_v4().to_string(),
            identity: self.signer.identity(),
            timestamp: Utc::now(),
            nonce: Uuid::new_v4().simple().to_string(),
            signature: self.signer.sign(CANONICAL_CHALLENGE)?,
        };

        Ok(PreparedExchange { request, key })
    }

    /// Run the whole exchange over `transport` and bind the key locally.
    pub async fn establish<T>(&self, transport: &T) -> Result<NegotiatedSession, ClientError>
    where
        T: HandshakeTransport,
    {
        let advert = tokio::time::timeout(self.timeout, transport.fetch_public_key())
            .await
            .map_err(|_| ClientError::Timeout {
                operation: "fetch public key",
                timeout: self.timeout,
            })??;

        let server_public_key = self.verify_advertisement(&advert)?;
        let PreparedExchange { request, key } = self.prepare_exchange(&server_public_key)?;

        debug!(
            server = %advert.identity,
            session_id = %request.session_id,
            "Submitting session key"
        );

        tokio::time::timeout(self.timeout, transport.exchange_symmetric_key(&request))
            .await
            .map_err(|_| ClientError::Timeout {
                operation: "exchange symmetric key",
                timeout: self.timeout,
            })??;

        self.sessions
            .insert(&request.session_id, &request.identity, key)?;

        info!(
            server = %advert.identity,
            session_id = %request.session_id,
            "Session established"
        );

        Ok(NegotiatedSession {
            session_id: request.session_id,
            identity: request.identity,
            server: advert.identity,
        })
    }
}
