//! Message routing
//!
//! Resolves broadcast and private requests into per-recipient deliveries.
//! Callers hold exclusive access to the registry and history for the whole
//! call, so each route sees one consistent membership snapshot.

use tracing::{debug, warn};

use crate::history::HistoryLog;
use crate::message::Response;
use crate::registry::Registry;
use crate::session::SessionHandle;

/// Result of a broadcast fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the message was queued for
    pub delivered: usize,
    /// Sessions whose delivery failed
    pub failed: usize,
}

/// Result of a private message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateOutcome {
    /// Recipient (and sender echo) received the message
    Delivered,
    /// Recipient isn't online
    RecipientMissing,
    /// Recipient is registered but its connection is gone or stalled
    RecipientUnreachable,
}

/// Send `BROADCAST:<sender>:<body>` to every online session, then record it
pub fn broadcast(
    registry: &Registry,
    history: &mut HistoryLog,
    sender: &str,
    body: &str,
) -> BroadcastReport {
    let payload = Response::Broadcast {
        sender: sender.to_string(),
        body: body.to_string(),
    }
    .to_string();

    let mut report = BroadcastReport::default();
    for (identity, handle) in registry.handles() {
        match handle.deliver(&payload) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!("Broadcast from '{}' to '{}' failed: {}", sender, identity, e);
                report.failed += 1;
            }
        }
    }

    history.append(sender, body);
    report
}

/// Send `PRIVATE:<sender>:<body>` to `recipient` and echo it on `reply`
///
/// `reply` is the requesting session. It gets the not-found marker instead
/// when the recipient can't be reached.
pub fn private(
    registry: &Registry,
    reply: &SessionHandle,
    sender: &str,
    recipient: &str,
    body: &str,
) -> PrivateOutcome {
    let Some(target) = registry.get(recipient) else {
        debug!("Private message from '{}': '{}' not online", sender, recipient);
        notify_not_found(reply);
        return PrivateOutcome::RecipientMissing;
    };

    let payload = Response::Private {
        sender: sender.to_string(),
        body: body.to_string(),
    }
    .to_string();

    if let Err(e) = target.deliver(&payload) {
        warn!("Private message from '{}' to '{}' failed: {}", sender, recipient, e);
        notify_not_found(reply);
        return PrivateOutcome::RecipientUnreachable;
    }

    // Messaging yourself delivers once
    if target.id() != reply.id() {
        if let Err(e) = reply.deliver(&payload) {
            warn!("Private echo to '{}' failed: {}", sender, e);
        }
    }

    PrivateOutcome::Delivered
}

fn notify_not_found(reply: &SessionHandle) {
    if let Err(e) = reply.deliver(&Response::UserNotFound.to_string()) {
        warn!("Failed to report missing recipient: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;
    use crate::message::USER_NOT_FOUND;
    use crate::types::SessionId;
    use tokio::sync::mpsc;

    struct Peer {
        handle: SessionHandle,
        key: SessionKey,
        rx: mpsc::Receiver<Vec<u8>>,
    }

    impl Peer {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(8);
            let key = SessionKey::generate();
            let handle = SessionHandle::new(SessionId::new(), tx, key.clone());
            Self { handle, key, rx }
        }

        /// Decrypt everything queued so far
        fn drain(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                let plain = self.key.decrypt(&frame).unwrap();
                out.push(String::from_utf8(plain).unwrap());
            }
            out
        }
    }

    #[test]
    fn test_broadcast_reaches_every_member() {
        let mut alice = Peer::new();
        let mut bob = Peer::new();
        let mut carol = Peer::new();
        let mut registry = Registry::new();
        registry.insert("alice".to_string(), alice.handle.clone());
        registry.insert("bob".to_string(), bob.handle.clone());
        let mut history = HistoryLog::new();

        let report = broadcast(&registry, &mut history, "alice", "hello");

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 0 });
        assert_eq!(alice.drain(), vec!["BROADCAST:alice:hello"]);
        assert_eq!(bob.drain(), vec!["BROADCAST:alice:hello"]);
        // Not registered, gets nothing
        assert!(carol.drain().is_empty());
        assert_eq!(history.snapshot(), "alice: hello\n");
    }

    #[test]
    fn test_broadcast_skips_dead_member() {
        let mut alice = Peer::new();
        let bob = Peer::new();
        let mut registry = Registry::new();
        registry.insert("alice".to_string(), alice.handle.clone());
        registry.insert("bob".to_string(), bob.handle.clone());
        drop(bob.rx);
        let mut history = HistoryLog::new();

        let report = broadcast(&registry, &mut history, "alice", "still here");

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(alice.drain(), vec!["BROADCAST:alice:still here"]);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_private_delivered_to_both() {
        let mut alice = Peer::new();
        let mut bob = Peer::new();
        let mut carol = Peer::new();
        let mut registry = Registry::new();
        registry.insert("alice".to_string(), alice.handle.clone());
        registry.insert("bob".to_string(), bob.handle.clone());
        registry.insert("carol".to_string(), carol.handle.clone());

        let outcome = private(&registry, &alice.handle, "alice", "bob", "psst");

        assert_eq!(outcome, PrivateOutcome::Delivered);
        assert_eq!(alice.drain(), vec!["PRIVATE:alice:psst"]);
        assert_eq!(bob.drain(), vec!["PRIVATE:alice:psst"]);
        assert!(carol.drain().is_empty());
    }

    #[test]
    fn test_private_to_absent_user() {
        let mut alice = Peer::new();
        let mut registry = Registry::new();
        registry.insert("alice".to_string(), alice.handle.clone());

        let outcome = private(&registry, &alice.handle, "alice", "carol", "hello?");

        assert_eq!(outcome, PrivateOutcome::RecipientMissing);
        assert_eq!(alice.drain(), vec![USER_NOT_FOUND]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_private_to_disconnected_recipient() {
        let mut alice = Peer::new();
        let bob = Peer::new();
        let mut registry = Registry::new();
        registry.insert("alice".to_string(), alice.handle.clone());
        registry.insert("bob".to_string(), bob.handle.clone());
        drop(bob.rx);

        let outcome = private(&registry, &alice.handle, "alice", "bob", "you there?");

        assert_eq!(outcome, PrivateOutcome::RecipientUnreachable);
        assert_eq!(alice.drain(), vec![USER_NOT_FOUND]);
    }

    #[test]
    fn test_private_to_self_delivers_once() {
        let mut alice = Peer::new();
        let mut registry = Registry::new();
        registry.insert("alice".to_string(), alice.handle.clone());

        let outcome = private(&registry, &alice.handle, "alice", "alice", "note to self");

        assert_eq!(outcome, PrivateOutcome::Delivered);
        assert_eq!(alice.drain(), vec!["PRIVATE:alice:note to self"]);
    }
}
