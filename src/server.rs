//! ChatServer Actor implementation
//!
//! The central actor that owns all shared state: connected sessions, the
//! registry of entered identities and the broadcast history. Commands are
//! processed one at a time, which makes every registry and history access
//! mutually exclusive without locks. Credential checks block, so they run
//! off the actor and report back as entrance verdicts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::history::HistoryLog;
use crate::message::{EntranceMode, Request, Response};
use crate::registry::Registry;
use crate::router;
use crate::session::{Session, SessionHandle};
use crate::store::{CredentialStore, StoreError};
use crate::types::SessionId;

/// Commands sent from handlers to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// Key exchange finished, session can receive frames
    Connect { handle: SessionHandle },
    /// Connection closed
    Disconnect { session_id: SessionId },
    /// Register or log in
    Entrance {
        session_id: SessionId,
        mode: EntranceMode,
        username: String,
        password: String,
    },
    /// Message for everyone online
    Broadcast {
        session_id: SessionId,
        sender: String,
        body: String,
    },
    /// Message for one identity
    Private {
        session_id: SessionId,
        sender: String,
        recipient: String,
        body: String,
    },
    /// Frame that couldn't be decoded into a request
    Malformed {
        session_id: SessionId,
        reason: String,
    },
}

impl ServerCommand {
    /// Wrap a decoded request from `session_id`
    pub fn from_request(session_id: SessionId, request: Request) -> Self {
        match request {
            Request::Entrance {
                mode,
                username,
                password,
            } => ServerCommand::Entrance {
                session_id,
                mode,
                username,
                password,
            },
            Request::Broadcast { sender, body } => ServerCommand::Broadcast {
                session_id,
                sender,
                body,
            },
            Request::Private {
                sender,
                recipient,
                body,
            } => ServerCommand::Private {
                session_id,
                sender,
                recipient,
                body,
            },
        }
    }
}

/// Outcome of an off-actor credential check
#[derive(Debug)]
struct EntranceVerdict {
    session_id: SessionId,
    mode: EntranceMode,
    username: String,
    result: Result<(), Response>,
}

/// Bound on credential checks finished but not yet applied
const VERDICT_BUFFER_SIZE: usize = 64;

/// The main ChatServer actor
pub struct ChatServer {
    /// All connected sessions: SessionId -> Session
    sessions: HashMap<SessionId, Session>,
    /// Entered identities: identity -> handle
    registry: Registry,
    /// Broadcast history replayed on entrance
    history: HistoryLog,
    /// Account storage
    credentials: Arc<dyn CredentialStore>,
    /// Sessions with a credential check in flight
    entering: HashSet<SessionId>,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
    /// Credential check results, fed back into the actor
    verdict_tx: mpsc::Sender<EntranceVerdict>,
    verdict_rx: mpsc::Receiver<EntranceVerdict>,
}

impl ChatServer {
    /// Create a ChatServer with the given command receiver and credential store
    pub fn new(receiver: mpsc::Receiver<ServerCommand>, credentials: Arc<dyn CredentialStore>) -> Self {
        let (verdict_tx, verdict_rx) = mpsc::channel(VERDICT_BUFFER_SIZE);
        Self {
            sessions: HashMap::new(),
            registry: Registry::new(),
            history: HistoryLog::new(),
            credentials,
            entering: HashSet::new(),
            receiver,
            verdict_tx,
            verdict_rx,
        }
    }

    /// Keep only the most recent `limit` history lines
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history = HistoryLog::with_limit(limit);
        self
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                // The actor holds a sender, so this never yields None
                Some(verdict) = self.verdict_rx.recv() => {
                    self.handle_verdict(verdict);
                }
            }
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Connect { handle } => {
                self.handle_connect(handle);
            }
            ServerCommand::Disconnect { session_id } => {
                self.handle_disconnect(session_id);
            }
            ServerCommand::Entrance {
                session_id,
                mode,
                username,
                password,
            } => {
                self.handle_entrance(session_id, mode, username, password);
            }
            ServerCommand::Broadcast {
                session_id,
                sender,
                body,
            } => {
                self.handle_broadcast(session_id, &sender, &body);
            }
            ServerCommand::Private {
                session_id,
                sender,
                recipient,
                body,
            } => {
                self.handle_private(session_id, &sender, &recipient, &body);
            }
            ServerCommand::Malformed { session_id, reason } => {
                self.handle_malformed(session_id, &reason);
            }
        }
    }

    /// Handle a session that finished key exchange
    fn handle_connect(&mut self, handle: SessionHandle) {
        let session_id = handle.id();
        info!("Session {} connected", session_id);
        self.sessions.insert(session_id, Session::new(handle));
        debug!(
            "Total sessions: {}, Online: {}",
            self.sessions.len(),
            self.registry.len()
        );
    }

    /// Handle connection close
    ///
    /// Dropping the session drops its outbound sender, which ends the
    /// connection's write task.
    fn handle_disconnect(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        self.entering.remove(&session_id);

        if let Some(identity) = &session.identity {
            self.registry.remove(identity, session_id);
            info!("'{}' left (session {})", identity, session_id);
        } else {
            info!("Session {} disconnected before entrance", session_id);
        }

        debug!(
            "Total sessions: {}, Online: {}",
            self.sessions.len(),
            self.registry.len()
        );
    }

    /// Handle register/login
    ///
    /// Cheap checks run here. The credential store is consulted on the
    /// blocking pool and its answer comes back through `handle_verdict`.
    fn handle_entrance(
        &mut self,
        session_id: SessionId,
        mode: EntranceMode,
        username: String,
        password: String,
    ) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };

        let rejection = if session.has_identity() {
            warn!(
                "Session {} already entered as '{}'",
                session_id,
                session.display_name()
            );
            Some(Response::InvalidRequest)
        } else if self.entering.contains(&session_id) {
            warn!("Session {} sent a second entrance while one is pending", session_id);
            Some(Response::InvalidRequest)
        } else if self.registry.contains(&username) {
            info!("Entrance as '{}' rejected: already online", username);
            Some(Response::UsernameTaken)
        } else {
            None
        };

        if let Some(response) = rejection {
            if let Err(e) = session.respond(&response) {
                warn!("Failed to answer entrance on session {}: {}", session_id, e);
            }
            return;
        }

        self.entering.insert(session_id);
        debug!("Checking credentials for '{}' ({:?})", username, mode);

        let credentials = Arc::clone(&self.credentials);
        let verdicts = self.verdict_tx.clone();
        tokio::spawn(async move {
            let name = username.clone();
            let result = tokio::task::spawn_blocking(move || {
                check_credentials(credentials.as_ref(), mode, &name, &password)
            })
            .await
            .unwrap_or_else(|e| {
                error!("Credential check for '{}' failed: {}", username, e);
                Err(Response::WrongDetails)
            });

            let verdict = EntranceVerdict {
                session_id,
                mode,
                username,
                result,
            };
            if verdicts.send(verdict).await.is_err() {
                debug!("ChatServer gone before entrance of session {} finished", session_id);
            }
        });
    }

    /// Apply a finished credential check
    fn handle_verdict(&mut self, verdict: EntranceVerdict) {
        let EntranceVerdict {
            session_id,
            mode,
            username,
            result,
        } = verdict;

        self.entering.remove(&session_id);
        let Some(session) = self.sessions.get_mut(&session_id) else {
            debug!("Session {} closed during entrance as '{}'", session_id, username);
            return;
        };

        let response = match result {
            Ok(()) => {
                // Registry first, so a broadcast right after can't miss us.
                // The name may have come online while the check ran.
                if self.registry.insert(username.clone(), session.handle.clone()) {
                    info!("Session {} entered as '{}' ({:?})", session_id, username, mode);
                    session.set_identity(username);
                    Response::Entered {
                        history: self.history.snapshot(),
                    }
                } else {
                    info!("Entrance as '{}' rejected: came online during check", username);
                    Response::UsernameTaken
                }
            }
            Err(response) => {
                info!("Entrance as '{}' rejected ({:?})", username, mode);
                response
            }
        };

        if let Err(e) = session.respond(&response) {
            warn!("Failed to answer entrance on session {}: {}", session_id, e);
        }
    }

    /// Handle broadcast message
    fn handle_broadcast(&mut self, session_id: SessionId, sender: &str, body: &str) {
        if !self.sessions.contains_key(&session_id) {
            return;
        }
        let report = router::broadcast(&self.registry, &mut self.history, sender, body);
        debug!(
            "Broadcast from '{}' delivered to {} sessions ({} failed)",
            sender, report.delivered, report.failed
        );
    }

    /// Handle private message
    fn handle_private(&mut self, session_id: SessionId, sender: &str, recipient: &str, body: &str) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        let outcome = router::private(&self.registry, &session.handle, sender, recipient, body);
        debug!("Private message '{}' -> '{}': {:?}", sender, recipient, outcome);
    }

    /// Handle undecodable frame
    fn handle_malformed(&mut self, session_id: SessionId, reason: &str) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };

        warn!("Malformed request from session {}: {}", session_id, reason);

        if let Err(e) = session.respond(&Response::InvalidRequest) {
            warn!("Failed to reject request on session {}: {}", session_id, e);
        }
    }
}

/// Run the store operation for an entrance. Blocks on hashing and disk I/O.
fn check_credentials(
    credentials: &dyn CredentialStore,
    mode: EntranceMode,
    username: &str,
    password: &str,
) -> Result<(), Response> {
    match mode {
        EntranceMode::Register => match credentials.add(username, password) {
            Ok(()) => Ok(()),
            Err(StoreError::UserExists(_)) => Err(Response::UsernameTaken),
            Err(e) => {
                error!("Failed to store account '{}': {}", username, e);
                Err(Response::WrongDetails)
            }
        },
        EntranceMode::Login => {
            if credentials.exists(username, password) {
                Ok(())
            } else {
                Err(Response::WrongDetails)
            }
        }
    }
}
