//! AES-256-GCM sealing of segment blobs.
//!
//! A sealed blob is `nonce (12) || ciphertext || tag (16)`. The string form
//! stored in the database is the standard base64 encoding of those bytes.
//! Every call draws a fresh nonce from the OS RNG, so sealing the same
//! plaintext twice under the same key never yields the same blob.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use crate::constants::{MIN_SEALED_LEN, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext || tag
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the tag to the ciphertext
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < MIN_SEALED_LEN {
        return Err(CryptoError::IntegrityCheckFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::IntegrityCheckFailed)
}

/// Encrypt and base64-encode in one step.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    encrypt(key, plaintext).map(|bytes| STANDARD.encode(bytes))
}

/// Inverse of [`seal`]. Undecodable base64 is reported as an integrity
/// failure: the stored blob is not something [`seal`] produced.
pub fn open(key: &SymmetricKey, blob: &str) -> Result<Vec<u8>, CryptoError> {
    let data = STANDARD
        .decode(blob.trim())
        .map_err(|_| CryptoError::IntegrityCheckFailed)?;
    decrypt(key, &data)
}
