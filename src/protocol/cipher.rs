//! # Cipher Collaborators
//!
//! Frame bodies on the wire are ciphertext. The transport calls a per-connection
//! [`Cipher`] to turn plaintext into a frame body before sending and back after
//! a frame has been assembled. Key exchange and cipher selection happen outside
//! the transport; a [`CipherFactory`] hands the manager a fresh cipher state for
//! every connection.
//!
//! ## Components
//! - **PlainCipher**: identity transform, for unencrypted sessions and tests
//! - **ChaChaCipher**: XChaCha20-Poly1305 AEAD, a random 24-byte nonce prefixed
//!   to every body

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::error::{ProtocolError, Result};
use crate::transport::connection::ConnectionId;

/// Length of the XChaCha20 nonce carried in front of every body
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag
pub const TAG_LEN: usize = 16;

/// Per-connection cipher state.
///
/// Methods take `&mut self` so stream ciphers can advance their keystream.
pub trait Cipher: Send {
    /// Turn a plaintext payload into a frame body.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Turn a frame body back into the plaintext payload.
    fn decrypt(&mut self, body: &[u8]) -> Result<Vec<u8>>;
}

/// Creates cipher state for each new connection.
pub trait CipherFactory: Send + Sync + 'static {
    fn create(&self, connection: ConnectionId) -> Box<dyn Cipher>;
}

impl<F> CipherFactory for F
where
    F: Fn(ConnectionId) -> Box<dyn Cipher> + Send + Sync + 'static,
{
    fn create(&self, connection: ConnectionId) -> Box<dyn Cipher> {
        self(connection)
    }
}

/// Identity cipher
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipher;

impl Cipher for PlainCipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        Ok(body.to_vec())
    }
}

/// Factory handing out [`PlainCipher`] for every connection
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipherFactory;

impl CipherFactory for PlainCipherFactory {
    fn create(&self, _connection: ConnectionId) -> Box<dyn Cipher> {
        Box::new(PlainCipher)
    }
}

/// XChaCha20-Poly1305 with a random nonce per message.
///
/// Body layout: `[nonce: 24][ciphertext + tag]`.
pub struct ChaChaCipher {
    cipher: XChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Generate a random 24-byte nonce using the OS RNG
    pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(nonce)
    }

    /// Factory giving every connection a cipher keyed with `key`.
    pub fn factory(key: [u8; 32]) -> impl CipherFactory {
        move |_connection: ConnectionId| -> Box<dyn Cipher> { Box::new(ChaChaCipher::new(&key)) }
    }
}

impl Cipher for ChaChaCipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::generate_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)?;

        let mut body = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        body.extend_from_slice(&nonce);
        body.extend_from_slice(&ciphertext);
        Ok(body)
    }

    fn decrypt(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

impl std::fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChaChaCipher { .. }")
    }
}
