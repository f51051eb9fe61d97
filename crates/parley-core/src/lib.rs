//! Core Parley key-exchange types and constants.
//!
//! This crate provides:
//! - The [`Identity`] type shared by both handshake roles
//! - Wire messages for the two handshake operations and sealed payloads
//! - The canonical challenge both sides sign
//!
//! It carries no cryptography of its own; see `parley-crypto`.

#![forbid(unsafe_code)]

pub mod encoding;
pub mod identity;
pub mod protocol;

pub use identity::Identity;
pub use protocol::{Envelope, HandshakeRequest, HandshakeResponse};

/// Message signed by both sides of the handshake.
///
/// Fixed per protocol version. A signature over it is only meaningful to this
/// protocol and never varies per request.
pub const CANONICAL_CHALLENGE: &[u8] = b"parley/key-exchange/v1";

/// Length of a negotiated symmetric session key.
pub const SESSION_KEY_LEN: usize = 32;

/// Length of an X25519 public encryption key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Upper bound on nonce length accepted by a server.
pub const MAX_NONCE_LEN: usize = 256;

/// Request metadata key carrying the session id of a sealed payload.
pub const SESSION_ID_HEADER: &str = "session_id";

/// Request metadata key carrying the owner identity of a sealed payload.
pub const IDENTITY_HEADER: &str = "identity";
