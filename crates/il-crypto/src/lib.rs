// il-crypto: Symmetric authenticated encryption for message payloads.
//
// The shared secret is stretched with PBKDF2-HMAC-SHA256 (100k iterations,
// 32-byte key) and messages are sealed with AES-256-GCM.  A fresh random
// 96-bit nonce is prepended to every ciphertext; the wire form is URL-safe
// base64 (unpadded) of `nonce || ciphertext`.
//
// The KDF salt is fixed per deployment.  That makes derived keys equal for
// equal secrets across hosts, which is what lets independently configured
// peers interoperate — and it is also a known hazard: rotating the secret is
// the only way to rotate key material.  Use `session_key` to derive
// per-session subkeys where that matters.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// PBKDF2 iteration count, matching the deployment's provisioning tooling.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Fixed per-deployment KDF salt (see module docs for the trade-off).
pub const KDF_SALT: &[u8] = b"interlinq_kdf_salt_v1";

const NONCE_LEN: usize = 12;

/// Errors from the encryption boundary.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no encryption key set")]
    NoKey,
    #[error("encryption failed")]
    Encrypt,
    #[error("ciphertext malformed: {0}")]
    Malformed(String),
    #[error("decryption failed (wrong key or tampered ciphertext)")]
    Decrypt,
    #[error("decrypted payload is not valid UTF-8")]
    NotUtf8,
}

/// Derived key material; zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey([u8; 32]);

/// Encrypts and decrypts serialized messages with a shared secret.
pub struct EncryptionHandler {
    key: Option<DerivedKey>,
    shared_key: Option<String>,
}

impl EncryptionHandler {
    /// A handler with no key; `encrypt_message`/`decrypt_message` fail with
    /// [`CryptoError::NoKey`] until one is set.
    pub fn new() -> Self {
        EncryptionHandler {
            key: None,
            shared_key: None,
        }
    }

    /// A handler keyed by `shared_key` (stretched through the KDF).
    pub fn with_shared_key(shared_key: &str) -> Self {
        let mut handler = Self::new();
        handler.set_shared_key(shared_key);
        handler
    }

    /// Replace the shared secret and re-derive key material.
    pub fn set_shared_key(&mut self, shared_key: &str) {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(shared_key.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
        self.key = Some(DerivedKey(key));
        self.shared_key = Some(shared_key.to_owned());
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Generate a fresh shared secret (32 bytes of OS entropy, URL-safe).
    pub fn generate_shared_key() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Seal a serialized message.  Returns the URL-safe base64 wire form.
    pub fn encrypt_message(&self, plaintext: &str) -> Result<String, CryptoError> {
        let key = self.key.as_ref().ok_or(CryptoError::NoKey)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(wire))
    }

    /// Open a wire-form ciphertext back into the serialized message.
    pub fn decrypt_message(&self, wire: &str) -> Result<String, CryptoError> {
        let key = self.key.as_ref().ok_or(CryptoError::NoKey)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(wire)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        if bytes.len() <= NONCE_LEN {
            return Err(CryptoError::Malformed(format!(
                "ciphertext too short ({} bytes)",
                bytes.len()
            )));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
    }

    /// Derive a session-scoped subkey: SHA-256 over `shared_key:session_id`.
    ///
    /// Without a shared secret this returns fresh random material, so the
    /// result is always usable as key input.
    pub fn session_key(&self, session_id: &str) -> String {
        match &self.shared_key {
            Some(shared) => {
                let digest = Sha256::digest(format!("{shared}:{session_id}").as_bytes());
                hex::encode(digest)
            }
            None => Self::generate_shared_key(),
        }
    }
}

impl Default for EncryptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Integrity hash utilities
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of a message for integrity checks.
pub fn message_hash(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

/// Verify a message against a previously computed [`message_hash`].
pub fn verify_message_hash(message: &str, expected: &str) -> bool {
    message_hash(message) == expected
}
