//! Session struct definition
//!
//! Represents one connected client: its routable handle (outbound channel
//! plus session key) and the identity it entered with, if any.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::crypto::SessionKey;
use crate::error::DeliveryError;
use crate::message::Response;
use crate::types::SessionId;

/// Routable handle to a session's connection
///
/// Cloned into the registry on entrance. Everything pushed through
/// `deliver` is encrypted under this session's own key, so the writer task
/// only ever sees ciphertext.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    sender: mpsc::Sender<Vec<u8>>,
    key: SessionKey,
}

impl SessionHandle {
    /// Create a handle for the session's outbound channel and key
    pub fn new(id: SessionId, sender: mpsc::Sender<Vec<u8>>, key: SessionKey) -> Self {
        Self { id, sender, key }
    }

    /// Session this handle routes to
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Encrypt `plaintext` for this session and queue it for sending
    ///
    /// Never waits: a full queue is reported as a failure for this
    /// recipient only.
    pub fn deliver(&self, plaintext: &str) -> Result<(), DeliveryError> {
        let frame = self.key.encrypt(plaintext.as_bytes())?;
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::ChannelFull,
            TrySendError::Closed(_) => DeliveryError::ChannelClosed,
        })
    }
}

/// Connected session state
#[derive(Debug)]
pub struct Session {
    /// Outbound route to this session
    pub handle: SessionHandle,
    /// Identity (None before a successful entrance)
    pub identity: Option<String>,
}

impl Session {
    /// Create a session that hasn't entered yet
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            identity: None,
        }
    }

    /// Identity if entered, otherwise "Unknown"
    pub fn display_name(&self) -> &str {
        self.identity.as_deref().unwrap_or("Unknown")
    }

    /// Check if this session has entered
    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    /// Record the identity the session entered with
    pub fn set_identity(&mut self, identity: String) {
        self.identity = Some(identity);
    }

    /// Send a server response to this session
    pub fn respond(&self, response: &Response) -> Result<(), DeliveryError> {
        self.handle.deliver(&response.to_string())
    }
}
