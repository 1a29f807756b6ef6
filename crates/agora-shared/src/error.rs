use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Tag mismatch, truncated blob or undecodable base64. Also what a wrong
    /// key looks like, so callers must verify the PIN before decrypting.
    #[error("Integrity check failed: ciphertext is corrupted or was tampered with")]
    IntegrityCheckFailed,

    /// Stored salt is not base64 or not the expected size.
    #[error("Invalid salt")]
    InvalidSalt,

    #[error("Key derivation failed")]
    KeyDerivationFailed,
}
