//! Chat client
//!
//! Client side of the wire protocol: performs the key exchange, then sends
//! encrypted requests and decrypts server payloads.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::crypto::SessionKey;
use crate::error::AppError;
use crate::message::{EntranceMode, Request, KEY_ACK};

/// Connected, key-negotiated client
pub struct ChatClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    key: SessionKey,
}

impl ChatClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:8080`) and negotiate a session key
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(url).await?;

        let server_public = match next_message(&mut ws).await? {
            Message::Binary(data) => data,
            _ => {
                return Err(AppError::Protocol(
                    "expected the server public key".to_string(),
                ))
            }
        };

        let key = SessionKey::generate();
        let sealed = key.seal_for(&server_public)?;
        ws.send(Message::Binary(sealed.into())).await?;

        match next_message(&mut ws).await? {
            Message::Text(text) if text.as_str() == KEY_ACK => {}
            _ => {
                return Err(AppError::Protocol(
                    "missing key acknowledgment".to_string(),
                ))
            }
        }

        debug!("Connected to {}", url);
        Ok(Self { ws, key })
    }

    /// Register or log in; returns the server's answer
    pub async fn enter(
        &mut self,
        mode: EntranceMode,
        username: &str,
        password: &str,
    ) -> Result<String, AppError> {
        self.send_request(&Request::Entrance {
            mode,
            username: username.to_string(),
            password: password.to_string(),
        })
        .await?;
        self.recv().await
    }

    /// Send a message to everyone online
    pub async fn broadcast(&mut self, sender: &str, body: &str) -> Result<(), AppError> {
        self.send_request(&Request::Broadcast {
            sender: sender.to_string(),
            body: body.to_string(),
        })
        .await
    }

    /// Send a message to one identity
    pub async fn private(&mut self, sender: &str, recipient: &str, body: &str) -> Result<(), AppError> {
        self.send_request(&Request::Private {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            body: body.to_string(),
        })
        .await
    }

    /// Encrypt and send a request
    pub async fn send_request(&mut self, request: &Request) -> Result<(), AppError> {
        self.send_raw(&request.to_string()).await
    }

    /// Encrypt and send an arbitrary payload
    pub async fn send_raw(&mut self, payload: &str) -> Result<(), AppError> {
        let frame = self.key.encrypt(payload.as_bytes())?;
        self.send_frame(frame).await
    }

    /// Send an already-encrypted frame
    pub async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), AppError> {
        self.ws.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    /// Wait for the next server payload
    pub async fn recv(&mut self) -> Result<String, AppError> {
        loop {
            match next_message(&mut self.ws).await? {
                Message::Binary(data) => {
                    let plaintext = self.key.decrypt(&data)?;
                    return String::from_utf8(plaintext)
                        .map_err(|_| AppError::Protocol("server payload is not UTF-8".to_string()));
                }
                _ => continue,
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), AppError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

/// Next data or close frame, skipping ping/pong
async fn next_message(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<Message, AppError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(AppError::Protocol("connection closed".to_string()))
            }
            Some(Ok(msg)) => return Ok(msg),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
