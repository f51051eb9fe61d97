//! Cryptographic core for Parley.
//!
//! This crate provides:
//! - Identity signing and verification behind [`IdentitySigner`] / [`SignatureVerifier`]
//! - Sealing of session keys to a server's X25519 public key
//! - A replay guard for handshake nonces with background expiry
//! - A concurrent store of negotiated session keys
//! - Server ([`HandshakeCoordinator`]) and client ([`HandshakeClient`]) halves
//!   of the key exchange
//! - Session-keyed envelopes for application payloads
//!
//! # Design
//!
//! The server advertises its encryption public key signed over a fixed
//! challenge. The client seals a random 32-byte session key to it and signs
//! the same challenge together with a fresh nonce. Once accepted, both sides
//! hold the key under `(session_id, identity)` and exchange
//! XChaCha20-Poly1305 envelopes.
//!
//! Keys and secrets are zeroized on drop and never appear in `Debug` output.

#![forbid(unsafe_code)]

pub mod asymmetric;
pub mod client;
pub mod envelope;
pub mod handshake;
pub mod identity;
pub mod nonce_guard;
pub mod session_store;

pub use asymmetric::{seal_to, AsymmetricIdentity, DecryptionError, SealError};
pub use client::{
    ClientError, HandshakeClient, HandshakeTransport, NegotiatedSession, PreparedExchange,
};
pub use envelope::{EnvelopeError, SecureEnvelope};
pub use handshake::{default_timestamp_skew, HandshakeCoordinator, HandshakeError};
pub use identity::{Ed25519Verifier, IdentityKeypair, IdentitySigner, SignatureVerifier};
pub use nonce_guard::NonceGuard;
pub use session_store::{AlreadyBound, SessionKey, SessionKeyStore};
