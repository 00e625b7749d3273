//! Codec adapter: key exchange and frame encryption.
//!
//! - The server holds one X25519 key pair for the whole process and sends
//!   its public half to every new connection.
//! - The client generates a random 256-bit session key and seals it to that
//!   public key (ephemeral X25519 ECDH, HKDF-SHA256, ChaCha20Poly1305).
//! - Every later frame is ChaCha20Poly1305 under the session key.
//!
//! Sealed key format: ephemeral_public (32) || nonce (12) || ciphertext (32 + 16 tag)
//! Frame format: nonce (12) || ciphertext (variable, includes auth tag)

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// HKDF info string for deriving the key-wrapping key.
const HKDF_INFO: &[u8] = b"CHAT-RELAY-V1-SESSION-KEY";

/// Nonce size for ChaCha20Poly1305.
const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
const TAG_SIZE: usize = 16;

/// Session key size in bytes.
pub const KEY_SIZE: usize = 32;

/// X25519 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Exact size of a sealed session key on the wire.
pub const SEALED_KEY_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// Errors that can occur while encrypting, decrypting or exchanging keys.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("Key derivation failed")]
    KeyDerivationFailed,

    #[error("Invalid public key length: {0}")]
    InvalidPublicKey(usize),

    #[error("Invalid sealed key length: {0}")]
    InvalidSealedKey(usize),
}

/// The server's long-lived X25519 key pair.
pub struct ServerKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ServerKeyPair {
    /// Generates a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key material sent to clients.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Recovers a client's session key from its sealed form.
    pub fn open_session_key(&self, sealed: &[u8]) -> Result<SessionKey, CodecError> {
        if sealed.len() != SEALED_KEY_SIZE {
            return Err(CodecError::InvalidSealedKey(sealed.len()));
        }

        let mut ephemeral_public = [0u8; PUBLIC_KEY_SIZE];
        ephemeral_public.copy_from_slice(&sealed[..PUBLIC_KEY_SIZE]);

        let shared_secret = self
            .secret
            .diffie_hellman(&PublicKey::from(ephemeral_public));
        let wrapping_key = derive_wrapping_key(shared_secret.as_bytes())?;

        let key_bytes = open(&wrapping_key, &sealed[PUBLIC_KEY_SIZE..])?;
        let key: [u8; KEY_SIZE] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::InvalidSealedKey(sealed.len()))?;

        Ok(SessionKey(key))
    }
}

impl fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Symmetric key shared by the server and one client.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Generates a random session key (client side).
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut key);
        Self(key)
    }

    /// Seals this key to the server's public key (client side).
    pub fn seal_for(&self, server_public: &[u8]) -> Result<Vec<u8>, CodecError> {
        let server_public: [u8; PUBLIC_KEY_SIZE] = server_public
            .try_into()
            .map_err(|_| CodecError::InvalidPublicKey(server_public.len()))?;

        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);
        let shared_secret = ephemeral_secret.diffie_hellman(&PublicKey::from(server_public));
        let wrapping_key = derive_wrapping_key(shared_secret.as_bytes())?;

        let sealed_key = seal(&wrapping_key, &self.0)?;

        let mut result = Vec::with_capacity(SEALED_KEY_SIZE);
        result.extend_from_slice(ephemeral_public.as_bytes());
        result.extend_from_slice(&sealed_key);
        Ok(result)
    }

    /// Encrypts one frame payload.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        seal(&self.0, plaintext)
    }

    /// Decrypts one frame payload.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        open(&self.0, data)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

fn derive_wrapping_key(shared_secret: &[u8]) -> Result<[u8; KEY_SIZE], CodecError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; KEY_SIZE];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|_| CodecError::KeyDerivationFailed)?;
    Ok(key)
}

fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CodecError::EncryptionFailed(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CodecError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn open(key: &[u8; KEY_SIZE], data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CodecError::CiphertextTooShort);
    }

    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CodecError::DecryptionFailed(e.to_string()))?;

    cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|e| CodecError::DecryptionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange_recovers_client_key() {
        let server = ServerKeyPair::generate();
        let client_key = SessionKey::generate();

        let sealed = client_key.seal_for(&server.public_bytes()).unwrap();
        assert_eq!(sealed.len(), SEALED_KEY_SIZE);

        let opened = server.open_session_key(&sealed).unwrap();
        assert_eq!(opened, client_key);
    }

    #[test]
    fn test_sealed_key_for_other_server_fails() {
        let server = ServerKeyPair::generate();
        let other = ServerKeyPair::generate();
        let sealed = SessionKey::generate()
            .seal_for(&other.public_bytes())
            .unwrap();

        assert!(matches!(
            server.open_session_key(&sealed),
            Err(CodecError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_sealed_key_wrong_length() {
        let server = ServerKeyPair::generate();
        assert!(matches!(
            server.open_session_key(&[0u8; 10]),
            Err(CodecError::InvalidSealedKey(10))
        ));
    }

    #[test]
    fn test_seal_for_rejects_short_public_key() {
        let result = SessionKey::generate().seal_for(&[1, 2, 3]);
        assert!(matches!(result, Err(CodecError::InvalidPublicKey(3))));
    }

    #[test]
    fn test_frame_encrypt_decrypt() {
        let key = SessionKey::generate();
        let encrypted = key.encrypt(b"BROADCAST:alice:hello").unwrap();
        assert_eq!(key.decrypt(&encrypted).unwrap(), b"BROADCAST:alice:hello");
    }

    #[test]
    fn test_frame_wrong_key_fails() {
        let encrypted = SessionKey::generate().encrypt(b"secret").unwrap();
        assert!(SessionKey::generate().decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_frame_tampered_fails() {
        let key = SessionKey::generate();
        let mut encrypted = key.encrypt(b"secret").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;
        assert!(key.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_frame_too_short() {
        let key = SessionKey::generate();
        assert!(matches!(
            key.decrypt(&[0u8; 20]),
            Err(CodecError::CiphertextTooShort)
        ));
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", SessionKey::generate()), "SessionKey(..)");
    }
}
