//! Wire messages for the key exchange and sealed payloads.
//!
//! ```text
//! Client                                   Server
//!   |  GET public-encryption-key             |
//!   |--------------------------------------->|
//!   |  HandshakeResponse                     |  public key, signed challenge
//!   |<---------------------------------------|
//!   |                                        |
//!   |  POST exchange-symmetric-key           |
//!   |  HandshakeRequest                      |  sealed session key, nonce,
//!   |--------------------------------------->|  signed challenge
//!   |                                        |
//!   [   Envelopes keyed by (session_id, identity)   ]
//! ```
//!
//! Byte fields travel as standard base64 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;
use crate::identity::Identity;
use crate::{IDENTITY_HEADER, SESSION_ID_HEADER};

/// Server advertisement of its public encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub identity: Identity,
    /// Signature by `identity` over the canonical challenge.
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Client submission of a sealed session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Session key sealed to the server's public encryption key.
    #[serde(with = "base64_bytes")]
    pub encrypted_symmetric_key: Vec<u8>,
    pub session_id: String,
    pub identity: Identity,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
    /// Signature by `identity` over the canonical challenge.
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Payload sealed under a negotiated session key.
///
/// `session_id` and `identity` are sent in clear so the receiver can select the
/// key; they are bound to the ciphertext as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: String,
    pub identity: Identity,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Clear-text request metadata a transport attaches to this payload:
    /// [`SESSION_ID_HEADER`] and [`IDENTITY_HEADER`] (the identity's address).
    pub fn headers(&self) -> [(&'static str, &str); 2] {
        [
            (SESSION_ID_HEADER, self.session_id.as_str()),
            (IDENTITY_HEADER, self.identity.address()),
        ]
    }
}
