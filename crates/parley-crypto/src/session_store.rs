//! Negotiated session keys, addressed by session id and owner identity.
//!
//! Each session id binds exactly once. Re-inserting the identical
//! (owner, key) pair is accepted so a retried handshake completion is
//! harmless; anything else for a bound id is refused and the original binding
//! stays in place.
//!
//! Lookups with the wrong owner look exactly like lookups for an unknown id.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_core::{Identity, SESSION_KEY_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric session key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Fresh random key from the OS CSPRNG.
    pub fn generate() -> Result<Self, rand::Error> {
        let mut key = Self([0u8; SESSION_KEY_LEN]);
        OsRng.try_fill_bytes(&mut key.0)?;
        Ok(key)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// `None` unless `bytes` is exactly [`SESSION_KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; SESSION_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[derive(Debug, Error)]
#[error("session id {session_id:?} is already bound to a different key or identity")]
pub struct AlreadyBound {
    pub session_id: String,
}

struct SessionEntry {
    owner: Identity,
    key: SessionKey,
    created_at: DateTime<Utc>,
}

/// Concurrent map from session id to its owner and key.
///
/// Backed by a sharded `DashMap`: operations on different ids do not block
/// each other, and operations on the same id are serialized by its shard lock.
#[derive(Default)]
pub struct SessionKeyStore {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `session_id` to `(owner, key)`.
    ///
    /// Succeeds if the id is free or already holds this exact pair.
    pub fn insert(
        &self,
        session_id: &str,
        owner: &Identity,
        key: SessionKey,
    ) -> Result<(), AlreadyBound> {
        match self.sessions.entry(session_id.to_owned()) {
            Entry::Occupied(existing) => {
                let entry = existing.get();
                if entry.owner == *owner && entry.key == key {
                    Ok(())
                } else {
                    Err(AlreadyBound {
                        session_id: session_id.to_owned(),
                    })
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    owner: owner.clone(),
                    key,
                    created_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// Key bound to `session_id`, if `owner` is the identity it was bound for.
    pub fn lookup(&self, session_id: &str, owner: &Identity) -> Option<SessionKey> {
        let entry = self.sessions.get(session_id)?;
        if entry.owner != *owner {
            return None;
        }
        Some(entry.key.clone())
    }

    /// When the binding was created, under the same owner rule as [`lookup`](Self::lookup).
    pub fn created_at(&self, session_id: &str, owner: &Identity) -> Option<DateTime<Utc>> {
        let entry = self.sessions.get(session_id)?;
        if entry.owner != *owner {
            return None;
        }
        Some(entry.created_at)
    }

    /// Tear down a session. Returns whether it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Tear down every session created before `cutoff`. Returns how many went.
    pub fn remove_created_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| entry.created_at >= cutoff);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl fmt::Debug for SessionKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
