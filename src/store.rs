//! Credential store
//!
//! The relay consumes user accounts through the [`CredentialStore`] trait with
//! two operations. Two implementations ship with the crate: an in-memory map
//! and a JSON file. Passwords are kept as bcrypt hashes.
//!
//! Both operations block (bcrypt is deliberately slow, the JSON store writes
//! to disk), so callers on the async runtime run them via `spawn_blocking`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use bcrypt::{hash, verify, DEFAULT_COST};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Credential store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Username already has an account
    #[error("User already exists: {0}")]
    UserExists(String),

    /// Password could not be hashed
    #[error("Hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    /// Credential file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Credential file is not valid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// User credential capability
pub trait CredentialStore: Send + Sync {
    /// Whether `username` exists with exactly this password.
    fn exists(&self, username: &str, password: &str) -> bool;

    /// Persist a new account. Fails with [`StoreError::UserExists`] if taken.
    fn add(&self, username: &str, password: &str) -> Result<(), StoreError>;
}

/// username -> bcrypt hash
type Accounts = HashMap<String, String>;

/// A poisoned lock only means another thread panicked mid-insert; the map is
/// still a valid map.
fn lock(users: &Mutex<Accounts>) -> MutexGuard<'_, Accounts> {
    users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_password(users: &Mutex<Accounts>, username: &str, password: &str) -> bool {
    // Clone the hash so verification runs without holding the lock
    let Some(password_hash) = lock(users).get(username).cloned() else {
        return false;
    };

    match verify(password, &password_hash) {
        Ok(valid) => valid,
        Err(e) => {
            warn!("Stored hash for '{}' is unusable: {}", username, e);
            false
        }
    }
}

/// In-memory credential store (lost on restart)
#[derive(Debug)]
pub struct MemoryCredentialStore {
    users: Mutex<Accounts>,
    cost: u32,
}

impl MemoryCredentialStore {
    /// Create an empty store hashing at bcrypt's default cost
    pub fn new() -> Self {
        Self::with_cost(DEFAULT_COST)
    }

    /// Create an empty store hashing at `cost`
    pub fn with_cost(cost: u32) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            cost,
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn exists(&self, username: &str, password: &str) -> bool {
        check_password(&self.users, username, password)
    }

    fn add(&self, username: &str, password: &str) -> Result<(), StoreError> {
        if lock(&self.users).contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }

        let password_hash = hash(password, self.cost)?;

        let mut users = lock(&self.users);
        // Re-check: another add may have won while we were hashing
        if users.contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }
        users.insert(username.to_string(), password_hash);
        Ok(())
    }
}

/// Credential store backed by a JSON file
///
/// The whole map is rewritten on every `add` (temp file, then rename).
#[derive(Debug)]
pub struct JsonCredentialStore {
    path: PathBuf,
    users: Mutex<Accounts>,
    cost: u32,
}

impl JsonCredentialStore {
    /// Load the store from `path`, starting empty if the file doesn't exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let users: Accounts = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            HashMap::new()
        };

        info!("Loaded {} accounts from {}", users.len(), path.display());

        Ok(Self {
            path,
            users: Mutex::new(users),
            cost: DEFAULT_COST,
        })
    }

    /// Hash new passwords at `cost` instead of bcrypt's default
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    fn persist(&self, users: &Accounts) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(users)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Wrote {} accounts to {}", users.len(), self.path.display());
        Ok(())
    }
}

impl CredentialStore for JsonCredentialStore {
    fn exists(&self, username: &str, password: &str) -> bool {
        check_password(&self.users, username, password)
    }

    fn add(&self, username: &str, password: &str) -> Result<(), StoreError> {
        if lock(&self.users).contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }

        let password_hash = hash(password, self.cost)?;

        let mut users = lock(&self.users);
        if users.contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }
        users.insert(username.to_string(), password_hash);

        if let Err(e) = self.persist(&users) {
            users.remove(username);
            return Err(e);
        }
        Ok(())
    }
}
