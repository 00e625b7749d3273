//! Encrypted Chat Relay - Entry Point
//!
//! Loads configuration, starts the ChatServer actor and accepts connections.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_relay::{
    serve, ChatServer, CredentialStore, JsonCredentialStore, MemoryCredentialStore, ServerConfig,
    ServerKeyPair,
};

/// Channel buffer size for server commands
const CHANNEL_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let credentials: Arc<dyn CredentialStore> = match &config.credentials_path {
        Some(path) => Arc::new(JsonCredentialStore::open(path)?),
        None => {
            info!("No credential file given, accounts are kept in memory");
            Arc::new(MemoryCredentialStore::new())
        }
    };

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Chat relay listening on {}", config.bind_addr);

    // Create ChatServer actor channel and start
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let mut server = ChatServer::new(cmd_rx, credentials);
    if let Some(limit) = config.history_limit {
        info!("History limited to {} lines", limit);
        server = server.with_history_limit(limit);
    }
    tokio::spawn(server.run());

    info!("ChatServer actor started");

    let keys = Arc::new(ServerKeyPair::generate());
    serve(listener, keys, cmd_tx).await;

    Ok(())
}
