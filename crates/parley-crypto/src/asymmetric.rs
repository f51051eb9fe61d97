//! Long-lived public-key encryption keypair.
//!
//! Session keys travel to the server sealed under its X25519 public key:
//!
//! ```text
//! [32 bytes: ephemeral public key] [ciphertext] [16 bytes: Poly1305 tag]
//! ```
//!
//! The sender runs X25519 between a fresh ephemeral secret and the recipient's
//! static key, hashes the shared secret together with both public keys into a
//! ChaCha20-Poly1305 key, and encrypts under an all-zero nonce. Every key is
//! used exactly once, so the fixed nonce never repeats under a given key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

/// Domain separation label for the sealing KDF.
const SEAL_KDF_LABEL: &[u8] = b"parley/seal/v1";

/// Bytes added to a plaintext by [`seal_to`].
pub const SEAL_OVERHEAD: usize = 32 + 16;

/// Opening a sealed message failed. The message was not produced for this
/// keypair, or was modified in transit.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("sealed message too short: {0} bytes")]
    TooShort(usize),

    #[error("non-contributory key agreement")]
    WeakKey,

    #[error("authentication failed")]
    Authentication,
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error("recipient public key is a low-order point")]
    WeakRecipientKey,

    #[error("encryption failed: {0}")]
    Encryption(String),
}

/// Server-side encryption keypair.
///
/// Created once per process and read-only afterwards. The secret half is
/// zeroized on drop and never leaves this type.
pub struct AsymmetricIdentity {
    secret: StaticSecret,
    public: PublicKey,
}

impl AsymmetricIdentity {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Result<Self, rand::Error> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        OsRng.try_fill_bytes(&mut bytes[..])?;
        Ok(Self::from_secret_bytes(*bytes))
    }

    /// Restore a keypair from previously materialized secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Open a message produced by [`seal_to`] for this keypair's public key.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(DecryptionError::TooShort(sealed.len()));
        }

        let mut ephemeral_bytes = [0u8; 32];
        ephemeral_bytes.copy_from_slice(&sealed[..32]);
        let ephemeral_public = PublicKey::from(ephemeral_bytes);

        let shared = self.secret.diffie_hellman(&ephemeral_public);
        if !shared.was_contributory() {
            return Err(DecryptionError::WeakKey);
        }

        let key = derive_seal_key(&shared, &ephemeral_public, &self.public);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let aad = seal_aad(&ephemeral_public, &self.public);

        cipher
            .decrypt(
                &Nonce::default(),
                Payload {
                    msg: &sealed[32..],
                    aad: &aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| DecryptionError::Authentication)
    }
}

impl fmt::Debug for AsymmetricIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsymmetricIdentity")
            .field("public", self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Seal `plaintext` so only the holder of `recipient`'s secret key can open it.
pub fn seal_to(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let recipient = PublicKey::from(*recipient);
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(SealError::WeakRecipientKey);
    }

    let key = derive_seal_key(&shared, &ephemeral_public, &recipient);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let aad = seal_aad(&ephemeral_public, &recipient);

    let ciphertext = cipher
        .encrypt(
            &Nonce::default(),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| SealError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(32 + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn derive_seal_key(
    shared: &SharedSecret,
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_KDF_LABEL);
    hasher.update(shared.as_bytes());
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&hasher.finalize());
    key
}

fn seal_aad(ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; 64] {
    let mut aad = [0u8; 64];
    aad[..32].copy_from_slice(ephemeral.as_bytes());
    aad[32..].copy_from_slice(recipient.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let identity = AsymmetricIdentity::generate().unwrap();
        let sealed = seal_to(&identity.public_key(), b"session key bytes").unwrap();

        assert_eq!(sealed.len(), b"session key bytes".len() + SEAL_OVERHEAD);
        let opened = identity.decrypt(&sealed).unwrap();
        assert_eq!(opened.as_slice(), b"session key bytes");
    }

    #[test]
    fn test_public_key_deterministic() {
        let identity = AsymmetricIdentity::generate().unwrap();
        assert_eq!(identity.public_key(), identity.public_key());

        let restored = AsymmetricIdentity::from_secret_bytes(identity.secret.to_bytes());
        assert_eq!(restored.public_key(), identity.public_key());
    }

    #[test]
    fn test_foreign_keypair_rejected() {
        let intended = AsymmetricIdentity::generate().unwrap();
        let other = AsymmetricIdentity::generate().unwrap();

        let sealed = seal_to(&intended.public_key(), b"secret").unwrap();
        assert!(matches!(
            other.decrypt(&sealed),
            Err(DecryptionError::Authentication)
        ));
    }

    #[test]
    fn test_tamper_detection() {
        let identity = AsymmetricIdentity::generate().unwrap();
        let sealed = seal_to(&identity.public_key(), b"secret").unwrap();

        for i in [0, 31, 32, sealed.len() - 1] {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(identity.decrypt(&tampered).is_err(), "byte {} flip accepted", i);
        }
    }

    #[test]
    fn test_short_input_rejected() {
        let identity = AsymmetricIdentity::generate().unwrap();
        assert!(matches!(
            identity.decrypt(&[0u8; 10]),
            Err(DecryptionError::TooShort(10))
        ));
    }

    #[test]
    fn test_low_order_recipient_rejected() {
        assert!(matches!(
            seal_to(&[0u8; 32], b"secret"),
            Err(SealError::WeakRecipientKey)
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let identity = AsymmetricIdentity::generate().unwrap();
        let secret_hex = format!("{:?}", identity.secret.to_bytes());
        assert!(!format!("{:?}", identity).contains(&secret_hex));
    }
}
