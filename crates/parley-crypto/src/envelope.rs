//! Session-keyed sealed payloads.
//!
//! An [`Envelope`] is XChaCha20-Poly1305 ciphertext under the session key
//! bound to `(session_id, identity)`. The random 24-byte nonce travels with
//! it. Session id and identity are sent in clear so the receiver can pick the
//! key, and are mixed into the associated data so relabelling an envelope
//! breaks authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use parley_core::{Envelope, Identity};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::session_store::{SessionKey, SessionKeyStore};

const ENVELOPE_AAD_LABEL: &[u8] = b"parley/envelope/v1";
const XNONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("no session key for this session id and identity")]
    NoSessionKey,

    #[error("envelope authentication failed")]
    AuthenticationFailed,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("payload encoding failed: {0}")]
    Payload(String),
}

/// Seals and opens payloads with keys from a shared [`SessionKeyStore`].
#[derive(Debug, Clone)]
pub struct SecureEnvelope {
    store: Arc<SessionKeyStore>,
}

impl SecureEnvelope {
    pub fn new(store: Arc<SessionKeyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SessionKeyStore> {
        &self.store
    }

    /// Encrypt `plaintext` under the key bound to `(session_id, owner)`.
    pub fn seal(
        &self,
        session_id: &str,
        owner: &Identity,
        plaintext: &[u8],
    ) -> Result<Envelope, EnvelopeError> {
        let key = self
            .store
            .lookup(session_id, owner)
            .ok_or(EnvelopeError::NoSessionKey)?;

        let mut nonce = [0u8; XNONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;

        let aad = envelope_aad(session_id, owner);
        let ciphertext = cipher_for(&key)
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;

        Ok(Envelope {
            session_id: session_id.to_owned(),
            identity: owner.clone(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt an envelope. Returns no plaintext unless authentication succeeds.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
        let key = self
            .store
            .lookup(&envelope.session_id, &envelope.identity)
            .ok_or(EnvelopeError::NoSessionKey)?;

        if envelope.nonce.len() != XNONCE_LEN {
            debug!(session_id = %envelope.session_id, "Envelope rejected: bad nonce length");
            return Err(EnvelopeError::AuthenticationFailed);
        }

        let aad = envelope_aad(&envelope.session_id, &envelope.identity);
        cipher_for(&key)
            .decrypt(
                XNonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &envelope.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                debug!(
                    session_id = %envelope.session_id,
                    identity = %envelope.identity,
                    "Envelope rejected: authentication failed"
                );
                EnvelopeError::AuthenticationFailed
            })
    }

    /// Serialize `value` as JSON and seal it.
    pub fn seal_json<T: Serialize>(
        &self,
        session_id: &str,
        owner: &Identity,
        value: &T,
    ) -> Result<Envelope, EnvelopeError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| EnvelopeError::Payload(e.to_string()))?;
        self.seal(session_id, owner, &plaintext)
    }

    /// Open an envelope and parse the plaintext as JSON.
    pub fn open_json<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T, EnvelopeError> {
        let plaintext = self.open(envelope)?;
        serde_json::from_slice(&plaintext).map_err(|e| EnvelopeError::Payload(e.to_string()))
    }
}

fn cipher_for(key: &SessionKey) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Length-prefixed so distinct (session id, identity) pairs never collide.
fn envelope_aad(session_id: &str, owner: &Identity) -> Vec<u8> {
    let fields: [&[u8]; 3] = [
        session_id.as_bytes(),
        owner.address().as_bytes(),
        owner.public_key(),
    ];

    let mut aad = Vec::with_capacity(
        ENVELOPE_AAD_LABEL.len() + fields.iter().map(|f| f.len() + 4).sum::<usize>(),
    );
    aad.extend_from_slice(ENVELOPE_AAD_LABEL);
    for field in fields {
        aad.extend_from_slice(&(field.len() as u32).to_be_bytes());
        aad.extend_from_slice(field);
    }
    aad
}
