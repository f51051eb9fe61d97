//! Signing capabilities and the Ed25519 identity keypair.
//!
//! The handshake only needs two capabilities: "sign bytes as my identity" and
//! "check a signature claimed by some identity". They are the
//! [`IdentitySigner`] and [`SignatureVerifier`] traits, so other signature
//! schemes can be plugged in without touching the protocol.
//!
//! # Example
//!
//! ```
//! use parley_crypto::identity::{Ed25519Verifier, IdentityKeypair, IdentitySigner, SignatureVerifier};
//!
//! let keypair = IdentityKeypair::generate();
//! let signature = keypair.sign(b"challenge").unwrap();
//!
//! assert!(Ed25519Verifier.verify(&keypair.identity(), b"challenge", &signature));
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parley_core::Identity;
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("signing failed: {0}")]
pub struct SigningError(pub String);

/// Something that can sign a byte sequence as a long-term identity.
pub trait IdentitySigner: Send + Sync {
    /// The identity signatures from this signer verify under.
    fn identity(&self) -> Identity;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// Something that can check a signature for a given public identity.
pub trait SignatureVerifier: Send + Sync {
    /// Returns false on any malformed input; never panics.
    fn verify(&self, identity: &Identity, message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 identity keypair.
///
/// The signing key is zeroized on drop by `ed25519-dalek`.
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from raw signing key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Get the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }
}

impl IdentitySigner for IdentityKeypair {
    fn identity(&self) -> Identity {
        Identity::from_public_key(&self.public_key_bytes())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// Verifies Ed25519 signatures for self-certifying identities.
///
/// An identity whose address is not derived from its key is rejected, so a
/// caller cannot pair somebody else's address with their own key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, identity: &Identity, message: &[u8], signature: &[u8]) -> bool {
        if !identity.is_self_certifying() {
            return false;
        }
        let key_bytes: [u8; 32] = match identity.public_key().try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let verifying_key = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let sig = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        verifying_key.verify(message, &sig).is_ok()
    }
}
