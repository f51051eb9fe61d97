//! Server side of the key exchange.
//!
//! [`HandshakeCoordinator`] exposes the two handshake operations:
//!
//! 1. [`advertise_public_key`](HandshakeCoordinator::advertise_public_key):
//!    publish the encryption public key, signed as the server identity
//! 2. [`accept_session_key`](HandshakeCoordinator::accept_session_key): take a
//!    client's sealed session key and bind it to `(session_id, identity)`
//!
//! Accepting runs strictly in this order, so a failing stage never leaves
//! partial state behind it:
//!
//! ```text
//! verify signature ─► check nonce/timestamp ─► record nonce ─► decrypt key ─► bind session
//! ```

use chrono::Utc;
use parley_common::KeyExchangeConfig;
use parley_core::{
    HandshakeRequest, HandshakeResponse, Identity, CANONICAL_CHALLENGE, MAX_NONCE_LEN,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::asymmetric::{AsymmetricIdentity, DecryptionError};
use crate::envelope::SecureEnvelope;
use crate::identity::{IdentitySigner, SignatureVerifier, SigningError};
use crate::nonce_guard::NonceGuard;
use crate::session_store::{AlreadyBound, SessionKey, SessionKeyStore};

/// Handshake failures. None of them leave state behind except a recorded
/// nonce once signature and freshness checks have passed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request timestamp outside the accepted window ({skew_secs}s skew)")]
    StaleRequest { skew_secs: u64 },

    #[error("replayed nonce")]
    ReplayedNonce,

    #[error("session key decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    #[error(transparent)]
    SessionIdConflict(#[from] AlreadyBound),

    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl HandshakeError {
    /// Whether a transport should answer with its "unauthorized" status.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature | Self::ReplayedNonce | Self::StaleRequest { .. }
        )
    }
}

/// Server-side handshake state, shared by every request handler.
pub struct HandshakeCoordinator<S, V> {
    encryption: Arc<AsymmetricIdentity>,
    nonces: Arc<NonceGuard>,
    sessions: Arc<SessionKeyStore>,
    signer: S,
    verifier: V,
    max_timestamp_skew: Option<Duration>,
}

impl<S, V> HandshakeCoordinator<S, V>
where
    S: IdentitySigner,
    V: SignatureVerifier,
{
    /// Wire the coordinator. The timestamp bound defaults to
    /// [`default_timestamp_skew`] of the nonce guard's retention window.
    pub fn new(
        encryption: Arc<AsymmetricIdentity>,
        nonces: Arc<NonceGuard>,
        sessions: Arc<SessionKeyStore>,
        signer: S,
        verifier: V,
    ) -> Self {
        let max_timestamp_skew = Some(default_timestamp_skew(nonces.retention()));
        Self {
            encryption,
            nonces,
            sessions,
            signer,
            verifier,
            max_timestamp_skew,
        }
    }

    /// Wire the coordinator with the timestamp bound from `config`.
    pub fn from_config(
        config: &KeyExchangeConfig,
        encryption: Arc<AsymmetricIdentity>,
        nonces: Arc<NonceGuard>,
        sessions: Arc<SessionKeyStore>,
        signer: S,
        verifier: V,
    ) -> Self {
        Self::new(encryption, nonces, sessions, signer, verifier)
            .with_max_timestamp_skew(Some(config.max_timestamp_skew()))
    }

    /// Override the timestamp bound. `None` turns the check off, after which a
    /// request whose nonce has been swept can be accepted again.
    pub fn with_max_timestamp_skew(mut self, skew: Option<Duration>) -> Self {
        if let Some(skew) = skew {
            if skew.saturating_mul(2) >= self.nonces.retention() {
                warn!(
                    skew_ms = skew.as_millis() as u64,
                    retention_ms = self.nonces.retention().as_millis() as u64,
                    "Timestamp skew is not below half the nonce retention; swept nonces may replay"
                );
            }
        }
        self.max_timestamp_skew = skew;
        self
    }

    pub fn server_identity(&self) -> Identity {
        self.signer.identity()
    }

    /// Envelope sealer/opener over this coordinator's session store.
    pub fn envelope(&self) -> SecureEnvelope {
        SecureEnvelope::new(Arc::clone(&self.sessions))
    }

    pub fn sessions(&self) -> &Arc<SessionKeyStore> {
        &self.sessions
    }

    pub fn nonces(&self) -> &Arc<NonceGuard> {
        &self.nonces
    }

    /// Build the public-key advertisement.
    pub fn advertise_public_key(&self) -> Result<HandshakeResponse, HandshakeError> {
        let signature = self.signer.sign(CANONICAL_CHALLENGE)?;

        Ok(HandshakeResponse {
            public_key: self.encryption.public_key().to_vec(),
            timestamp: Utc::now(),
            identity: self.signer.identity(),
            signature,
        })
    }

    /// Accept a client's sealed session key.
    ///
    /// On success the key is bound to `(request.session_id, request.identity)`
    /// and envelopes for that pair can be opened from now on.
    pub fn accept_session_key(&self, request: &HandshakeRequest) -> Result<(), HandshakeError> {
        if !self
            .verifier
            .verify(&request.identity, CANONICAL_CHALLENGE, &request.signature)
        {
            warn!(identity = %request.identity, "Handshake rejected: invalid signature");
            return Err(HandshakeError::InvalidSignature);
        }

        validate_nonce(&request.nonce)?;
        self.check_timestamp(request)?;

        if !self.nonces.is_fresh_and_record(&request.nonce) {
            warn!(
                identity = %request.identity,
                session_id = %request.session_id,
                "Handshake rejected: replayed nonce (possible replay attack)"
            );
            return Err(HandshakeError::ReplayedNonce);
        }

        let decrypted = self
            .encryption
            .decrypt(&request.encrypted_symmetric_key)
            .map_err(|e| {
                debug!(identity = %request.identity, "Session key decryption failed: {}", e);
                e
            })?;
        let key = SessionKey::from_slice(&decrypted).ok_or_else(|| {
            debug!(
                identity = %request.identity,
                len = decrypted.len(),
                "Session key has wrong length"
            );
            HandshakeError::Decryption(DecryptionError::Authentication)
        })?;

        if let Err(conflict) = self
            .sessions
            .insert(&request.session_id, &request.identity, key)
        {
            warn!(
                identity = %request.identity,
                session_id = %request.session_id,
                "Handshake rejected: session id already bound"
            );
            return Err(conflict.into());
        }

        info!(
            identity = %request.identity,
            session_id = %request.session_id,
            "Session key accepted"
        );
        Ok(())
    }

    fn check_timestamp(&self, request: &HandshakeRequest) -> Result<(), HandshakeError> {
        let Some(max_skew) = self.max_timestamp_skew else {
            return Ok(());
        };

        // Past and future alike: a future-dated request must also go stale
        // before its nonce leaves the guard.
        let delta = Utc::now().signed_duration_since(request.timestamp);
        let skew = delta
            .to_std()
            .or_else(|_| (-delta).to_std())
            .unwrap_or(Duration::MAX);
        if skew > max_skew {
            let skew_secs = skew.as_secs();
            warn!(
                identity = %request.identity,
                skew_secs,
                "Handshake rejected: stale timestamp"
            );
            return Err(HandshakeError::StaleRequest { skew_secs });
        }
        Ok(())
    }

    /// Stop the nonce guard's background sweep.
    pub async fn shutdown(&self) {
        self.nonces.shutdown().await;
    }
}

/// Timestamp bound used when none is configured: 40% of the nonce retention
/// window. Anything under half keeps a request stale by the time its nonce
/// can be swept, whichever direction its clock is off.
pub fn default_timestamp_skew(retention: Duration) -> Duration {
    retention / 5 * 2
}

fn validate_nonce(nonce: &str) -> Result<(), HandshakeError> {
    if nonce.is_empty() {
        return Err(HandshakeError::MalformedRequest("empty nonce".into()));
    }
    if nonce.len() > MAX_NONCE_LEN {
        return Err(HandshakeError::MalformedRequest(format!(
            "nonce longer than {} bytes",
            MAX_NONCE_LEN
        )));
    }
    Ok(())
}
