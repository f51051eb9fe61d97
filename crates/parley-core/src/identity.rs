//! Long-term participant identity.
//!
//! An [`Identity`] pairs an address-like public identifier with the
//! verification key that checks its signatures. For the default scheme the
//! address is the base64url-encoded public key (32 bytes → 43 characters),
//! which makes the identity self-certifying.
//!
//! # Example
//!
//! ```
//! use parley_core::Identity;
//!
//! let identity = Identity::from_public_key(&[7u8; 32]);
//! assert_eq!(identity.address().len(), 43);
//!
//! let parsed = Identity::parse(identity.address()).unwrap();
//! assert_eq!(parsed, identity);
//! ```

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::encoding::base64_bytes;

/// Public identifier plus verification key. Immutable once observed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    address: String,
    #[serde(with = "base64_bytes")]
    public_key: Vec<u8>,
}

impl Identity {
    /// Pair an arbitrary address with a verification key.
    ///
    /// Whether the two belong together is for the signature verifier to decide.
    pub fn new(address: impl Into<String>, public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            address: address.into(),
            public_key: public_key.into(),
        }
    }

    /// Derive the identity whose address is the base64url encoding of `public_key`.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self {
            address: URL_SAFE_NO_PAD.encode(public_key),
            public_key: public_key.to_vec(),
        }
    }

    /// Parse a self-certifying address back into an identity.
    pub fn parse(address: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(address)
            .context("invalid base64url encoding")?;

        if bytes.len() != 32 {
            anyhow::bail!(
                "invalid identity length: expected 32 bytes, got {}",
                bytes.len()
            );
        }

        Ok(Self {
            address: address.to_string(),
            public_key: bytes,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// True when the address is exactly the base64url encoding of the key.
    pub fn is_self_certifying(&self) -> bool {
        URL_SAFE_NO_PAD.encode(&self.public_key) == self.address
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.address)
    }
}
