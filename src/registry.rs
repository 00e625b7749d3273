//! Session registry
//!
//! Maps the identity of every entered session to its routable handle. This is
//! the single source of truth for who is online. It is owned by the
//! `ChatServer` actor, which serializes every read and write.

use std::collections::HashMap;

use crate::session::SessionHandle;
use crate::types::SessionId;

/// Online identities
///
/// An identity appears at most once. It is present exactly while a session
/// with that identity is connected and past entrance.
#[derive(Debug, Default)]
pub struct Registry {
    members: HashMap<String, SessionHandle>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entered session
    ///
    /// Returns false (and leaves the existing entry alone) if the identity
    /// is already online.
    pub fn insert(&mut self, identity: String, handle: SessionHandle) -> bool {
        if self.members.contains_key(&identity) {
            return false;
        }
        self.members.insert(identity, handle);
        true
    }

    /// Remove `identity` if it belongs to `session_id`
    ///
    /// Returns true if an entry was removed.
    pub fn remove(&mut self, identity: &str, session_id: SessionId) -> bool {
        match self.members.get(identity) {
            Some(handle) if handle.id() == session_id => {
                self.members.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Look up an online identity
    pub fn get(&self, identity: &str) -> Option<&SessionHandle> {
        self.members.get(identity)
    }

    /// Check if an identity is online
    pub fn contains(&self, identity: &str) -> bool {
        self.members.contains_key(identity)
    }

    /// All online sessions
    pub fn handles(&self) -> impl Iterator<Item = (&str, &SessionHandle)> {
        self.members.iter().map(|(identity, h)| (identity.as_str(), h))
    }

    /// Number of online identities
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if nobody is online
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
