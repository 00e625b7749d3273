//! WebSocket connection handler
//!
//! Drives one connection through `Connecting -> KeyNegotiated -> Active -> Closed`:
//! key exchange first, then a read task that decrypts and decodes frames into
//! server commands and a write task that sends queued ciphertext.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::crypto::{ServerKeyPair, SessionKey};
use crate::error::{AppError, ParseError};
use crate::message::{Request, KEY_ACK};
use crate::server::ServerCommand;
use crate::session::SessionHandle;
use crate::types::SessionId;

/// Outbound queue size per session
const OUTBOUND_BUFFER_SIZE: usize = 256;

/// Protocol state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// WebSocket open, no session key yet
    Connecting,
    /// Session key installed, no request decrypted yet
    KeyNegotiated,
    /// At least one frame decrypted
    Active,
    /// Transport released
    Closed,
}

/// Accept connections forever, one task per connection
pub async fn serve(
    listener: TcpListener,
    keys: Arc<ServerKeyPair>,
    cmd_tx: mpsc::Sender<ServerCommand>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let keys = Arc::clone(&keys);
                let cmd_tx = cmd_tx.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, keys, cmd_tx).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake and key exchange, registers the session
/// with the ChatServer, then pumps frames until either direction ends.
pub async fn handle_connection(
    stream: TcpStream,
    keys: Arc<ServerKeyPair>,
    cmd_tx: mpsc::Sender<ServerCommand>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("{} {:?}", peer_addr, ConnectionState::Connecting);

    // WebSocket handshake
    let mut ws_stream = tokio_tungstenite::accept_async(stream).await?;

    let key = negotiate_key(&mut ws_stream, &keys).await?;
    let session_id = SessionId::new();
    info!(
        "Session {} from {} {:?}",
        session_id,
        peer_addr,
        ConnectionState::KeyNegotiated
    );

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Channel for server -> client ciphertext
    let (msg_tx, mut msg_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER_SIZE);

    // Register with ChatServer
    let handle = SessionHandle::new(session_id, msg_tx, key.clone());
    if cmd_tx.send(ServerCommand::Connect { handle }).await.is_err() {
        error!("Failed to register session {} - server closed", session_id);
        return Err(AppError::ChannelSend);
    }

    let cmd_tx_read = cmd_tx.clone();

    // Spawn read task (frame -> ServerCommand)
    let mut read_task = tokio::spawn(async move {
        let mut state = ConnectionState::KeyNegotiated;

        while let Some(msg_result) = ws_receiver.next().await {
            let cmd = match msg_result {
                Ok(Message::Binary(data)) => {
                    let plaintext = match key.decrypt(&data) {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            error!("Undecryptable frame from {}: {}", session_id, e);
                            break;
                        }
                    };
                    if state == ConnectionState::KeyNegotiated {
                        state = ConnectionState::Active;
                        debug!("Session {} {:?}", session_id, state);
                    }
                    decode_frame(session_id, plaintext)
                }
                Ok(Message::Text(_)) => {
                    warn!("Plaintext frame from {}", session_id);
                    ServerCommand::Malformed {
                        session_id,
                        reason: ParseError::Unencrypted.to_string(),
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Session {} sent close frame", session_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong is handled automatically by tungstenite
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("WebSocket error for {}: {}", session_id, e);
                    break;
                }
            };

            if cmd_tx_read.send(cmd).await.is_err() {
                debug!("Server closed, ending read task for {}", session_id);
                break;
            }
        }

        debug!("Session {} {:?} -> {:?}", session_id, state, ConnectionState::Closed);
    });

    // Spawn write task (ciphertext -> frame)
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = msg_rx.recv().await {
            if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                debug!("WebSocket send failed, ending write task");
                break;
            }
        }
        debug!("Write task ended for session");

        // Send close frame when done
        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", session_id);
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", session_id);
            read_task.abort();
        }
    }

    // Dropping the session in the server ends the write task
    let _ = cmd_tx.send(ServerCommand::Disconnect { session_id }).await;

    info!("Session {} disconnected", session_id);

    Ok(())
}

/// Exchange the session key
///
/// Sends the server public key, opens the client's sealed session key and
/// acknowledges it in plaintext. Nothing else is decrypted before this
/// completes.
async fn negotiate_key(
    ws: &mut WebSocketStream<TcpStream>,
    keys: &ServerKeyPair,
) -> Result<SessionKey, AppError> {
    ws.send(Message::Binary(keys.public_bytes().to_vec().into()))
        .await?;

    let sealed = loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => break data,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(AppError::Protocol(
                    "connection closed during key exchange".to_string(),
                ))
            }
            Some(Ok(_)) => {
                return Err(AppError::Protocol(
                    "expected a binary sealed key".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e.into()),
        }
    };

    let key = keys.open_session_key(&sealed)?;
    ws.send(Message::Text(KEY_ACK.into())).await?;
    Ok(key)
}

/// Turn a decrypted payload into the command for the ChatServer
fn decode_frame(session_id: SessionId, plaintext: Vec<u8>) -> ServerCommand {
    let request = String::from_utf8(plaintext)
        .map_err(|_| ParseError::NotUtf8)
        .and_then(|text| Request::parse(&text));

    match request {
        Ok(request) => ServerCommand::from_request(session_id, request),
        Err(e) => {
            debug!("Undecodable request from {}: {}", session_id, e);
            ServerCommand::Malformed {
                session_id,
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::client::ChatClient;
    use crate::message::{EntranceMode, INVALID_REQUEST, USERNAME_TAKEN, USER_NOT_FOUND, WRONG_DETAILS};
    use crate::server::ChatServer;
    use crate::store::MemoryCredentialStore;

    async fn start_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(ChatServer::new(cmd_rx, Arc::new(MemoryCredentialStore::with_cost(4))).run());
        tokio::spawn(serve(listener, Arc::new(ServerKeyPair::generate()), cmd_tx));

        format!("ws://{}", addr)
    }

    async fn entered(url: &str, name: &str) -> ChatClient {
        let mut client = ChatClient::connect(url).await.unwrap();
        let reply = client
            .enter(EntranceMode::Register, name, "pw")
            .await
            .unwrap();
        assert!(reply.starts_with("ENTERED SUCCESSFULLY-"), "{}", reply);
        client
    }

    async fn assert_silent(client: &mut ChatClient) {
        let result = tokio::time::timeout(Duration::from_millis(200), client.recv()).await;
        assert!(result.is_err(), "unexpected message: {:?}", result);
    }

    #[test]
    fn test_decode_frame() {
        let id = SessionId::new();
        match decode_frame(id, b"BROADCAST:alice:hi".to_vec()) {
            ServerCommand::Broadcast { sender, body, .. } => {
                assert_eq!(sender, "alice");
                assert_eq!(body, "hi");
            }
            other => panic!("Wrong command: {:?}", other),
        }
        assert!(matches!(
            decode_frame(id, vec![0xff, 0xfe]),
            ServerCommand::Malformed { .. }
        ));
        assert!(matches!(
            decode_frame(id, b"NOPE".to_vec()),
            ServerCommand::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn test_register_broadcast_and_history_replay() {
        let url = start_server().await;

        let mut alice = ChatClient::connect(&url).await.unwrap();
        let reply = alice
            .enter(EntranceMode::Register, "alice", "pw1")
            .await
            .unwrap();
        assert_eq!(reply, "ENTERED SUCCESSFULLY-");

        let mut bob = entered(&url, "bob").await;

        alice.broadcast("alice", "hello").await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), "BROADCAST:alice:hello");
        assert_eq!(bob.recv().await.unwrap(), "BROADCAST:alice:hello");

        let mut carol = ChatClient::connect(&url).await.unwrap();
        let reply = carol
            .enter(EntranceMode::Register, "carol", "pw3")
            .await
            .unwrap();
        assert_eq!(reply, "ENTERED SUCCESSFULLY-alice: hello\n");
    }

    /// Log in, retrying while an earlier connection for `name` is still being torn down
    async fn login_when_offline(client: &mut ChatClient, name: &str, password: &str) -> String {
        loop {
            let reply = client
                .enter(EntranceMode::Login, name, password)
                .await
                .unwrap();
            if reply != USERNAME_TAKEN {
                return reply;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_login_after_register() {
        let url = start_server().await;

        let alice = entered(&url, "alice").await;
        alice.close().await.unwrap();

        let mut again = ChatClient::connect(&url).await.unwrap();
        assert_eq!(login_when_offline(&mut again, "alice", "bad").await, WRONG_DETAILS);
        assert_eq!(
            login_when_offline(&mut again, "alice", "pw").await,
            "ENTERED SUCCESSFULLY-"
        );
    }

    #[tokio::test]
    async fn test_register_existing_account_after_logout() {
        let url = start_server().await;
        let alice = entered(&url, "alice").await;
        alice.close().await.unwrap();

        // Wait until the server has dropped alice from the online set
        let mut bob = entered(&url, "bob").await;
        loop {
            bob.private("bob", "alice", "ping").await.unwrap();
            if bob.recv().await.unwrap() == USER_NOT_FOUND {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut other = ChatClient::connect(&url).await.unwrap();
        assert_eq!(
            other
                .enter(EntranceMode::Register, "alice", "stolen")
                .await
                .unwrap(),
            USERNAME_TAKEN
        );
        // The original password still works on the same connection
        assert_eq!(
            other.enter(EntranceMode::Login, "alice", "pw").await.unwrap(),
            "ENTERED SUCCESSFULLY-"
        );
    }

    #[tokio::test]
    async fn test_private_message_delivery() {
        let url = start_server().await;
        let mut alice = entered(&url, "alice").await;
        let mut bob = entered(&url, "bob").await;
        let mut carol = entered(&url, "carol").await;

        alice.private("alice", "bob", "just us").await.unwrap();

        assert_eq!(alice.recv().await.unwrap(), "PRIVATE:alice:just us");
        assert_eq!(bob.recv().await.unwrap(), "PRIVATE:alice:just us");
        assert_silent(&mut carol).await;
    }

    #[tokio::test]
    async fn test_private_message_to_absent_user() {
        let url = start_server().await;
        let mut alice = entered(&url, "alice").await;
        let mut bob = entered(&url, "bob").await;

        alice.private("alice", "nobody", "hello?").await.unwrap();

        assert_eq!(alice.recv().await.unwrap(), USER_NOT_FOUND);
        assert_silent(&mut bob).await;

        // Private messages never reach the history
        let mut dave = ChatClient::connect(&url).await.unwrap();
        assert_eq!(
            dave.enter(EntranceMode::Register, "dave", "pw").await.unwrap(),
            "ENTERED SUCCESSFULLY-"
        );
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        let url = start_server().await;
        let mut alice = ChatClient::connect(&url).await.unwrap();

        alice.send_raw("HELLO").await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), INVALID_REQUEST);

        alice.send_raw("PRIVATE:alice:no-recipient").await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), INVALID_REQUEST);

        let reply = alice
            .enter(EntranceMode::Register, "alice", "pw")
            .await
            .unwrap();
        assert_eq!(reply, "ENTERED SUCCESSFULLY-");
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let url = start_server().await;
        let _alice = entered(&url, "alice").await;

        let mut imposter = ChatClient::connect(&url).await.unwrap();
        assert_eq!(
            imposter
                .enter(EntranceMode::Login, "alice", "pw")
                .await
                .unwrap(),
            USERNAME_TAKEN
        );
    }

    #[tokio::test]
    async fn test_corrupt_frame_isolated_to_one_connection() {
        let url = start_server().await;
        let mut alice = entered(&url, "alice").await;
        let mut bob = entered(&url, "bob").await;
        let mut mallory = entered(&url, "mallory").await;

        mallory.send_frame(vec![0u8; 64]).await.unwrap();
        // Server closes mallory once the session is dropped
        assert!(mallory.recv().await.is_err());

        alice.private("alice", "mallory", "still there?").await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), USER_NOT_FOUND);

        bob.broadcast("bob", "unaffected").await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), "BROADCAST:bob:unaffected");
        assert_eq!(bob.recv().await.unwrap(), "BROADCAST:bob:unaffected");
    }

    #[tokio::test]
    async fn test_concurrent_broadcasts_all_recorded() {
        let url = start_server().await;
        let mut tasks = Vec::new();

        for i in 0..5 {
            let url = url.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("user{}", i);
                let mut client = entered(&url, &name).await;
                client.broadcast(&name, "hi").await.unwrap();

                // Wait for our own message to come back
                let expected = format!("BROADCAST:{}:hi", name);
                loop {
                    if client.recv().await.unwrap() == expected {
                        break;
                    }
                }
                client
            }));
        }

        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.unwrap());
        }

        let mut late = ChatClient::connect(&url).await.unwrap();
        let reply = late
            .enter(EntranceMode::Register, "late", "pw")
            .await
            .unwrap();
        let history = reply.strip_prefix("ENTERED SUCCESSFULLY-").unwrap();

        let mut lines: Vec<&str> = history.lines().collect();
        lines.sort();
        assert_eq!(
            lines,
            vec!["user0: hi", "user1: hi", "user2: hi", "user3: hi", "user4: hi"]
        );
    }
}
