//! Encrypted Chat Relay Library
//!
//! A WebSocket chat relay built with tokio-tungstenite. Clients exchange a
//! session key with the server, enter by registering or logging in, then send
//! broadcast or private messages that the server re-encrypts per recipient.
//!
//! # Features
//! - X25519 sealed session key exchange, ChaCha20Poly1305 frames
//! - Register / login against a pluggable credential store
//! - Broadcast to everyone online, with history replayed to newcomers
//! - Private messages echoed to the sender
//! - Disconnection handling
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning sessions, registry and history
//! - Each connection has a `handler` task communicating with the server
//! - No locks needed - all shared state access goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//! use chat_relay::{serve, ChatServer, MemoryCredentialStore, ServerKeyPair};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let (cmd_tx, cmd_rx) = mpsc::channel(256);
//!
//!     tokio::spawn(ChatServer::new(cmd_rx, Arc::new(MemoryCredentialStore::new())).run());
//!     serve(listener, Arc::new(ServerKeyPair::generate()), cmd_tx).await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod history;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use client::ChatClient;
pub use config::ServerConfig;
pub use crypto::{CodecError, ServerKeyPair, SessionKey};
pub use error::{AppError, ConfigError, DeliveryError, ParseError};
pub use handler::{handle_connection, serve, ConnectionState};
pub use history::HistoryLog;
pub use message::{EntranceMode, Request, Response};
pub use registry::Registry;
pub use server::{ChatServer, ServerCommand};
pub use session::{Session, SessionHandle};
pub use store::{CredentialStore, JsonCredentialStore, MemoryCredentialStore, StoreError};
pub use types::SessionId;
