//! PIN-based key derivation for protected segments.
//!
//! ```text
//! PIN (utf-8) + segment salt (16 bytes)
//!       │
//!       ▼
//! PBKDF2-HMAC-SHA256, 100_000 rounds  →  segment key (32 bytes, AES-256)
//!       │
//!       ▼
//! base64(SHA-256(segment key))        →  stored PIN verification hash
//! ```
//!
//! The salt is generated once when a segment is created and persisted with
//! it; every derivation must be handed that salt explicitly. Keys come back
//! wrapped in [`Zeroizing`] and are meant to live for a single operation.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::Hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::constants::{PBKDF2_ITERATIONS, SALT_SIZE, SYMMETRIC_KEY_SIZE};
use crate::crypto::SymmetricKey;
use crate::error::CryptoError;

/// A segment key that is wiped from memory when dropped.
pub type DerivedKey = Zeroizing<SymmetricKey>;

/// Per-segment PBKDF2 salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Draw a fresh salt from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|_| CryptoError::InvalidSalt)?;
        let arr: [u8; SALT_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidSalt)?;
        Ok(Self(arr))
    }
}

/// Everything a newly protected segment needs, from a single derivation.
pub struct PinProtection {
    pub salt: Salt,
    pub pin_hash: String,
    pub key: DerivedKey,
}

impl PinProtection {
    pub fn new(pin: &str) -> Result<Self, CryptoError> {
        let salt = Salt::generate();
        let key = derive_key(pin, &salt)?;
        let pin_hash = verification_hash(&key);
        Ok(Self {
            salt,
            pin_hash,
            key,
        })
    }
}

/// PBKDF2-HMAC-SHA256 over the UTF-8 bytes of `pin`. Deterministic for a
/// given pin and salt.
pub fn derive_key(pin: &str, salt: &Salt) -> Result<DerivedKey, CryptoError> {
    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        pin.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut *key,
    )
    .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

/// base64(SHA-256(key)). This is what gets persisted, never the key.
pub fn verification_hash(key: &SymmetricKey) -> String {
    STANDARD.encode(Sha256::digest(key))
}

pub fn compute_verification_hash(pin: &str, salt: &Salt) -> Result<String, CryptoError> {
    let key = derive_key(pin, salt)?;
    Ok(verification_hash(&key))
}

pub fn verify_pin(pin: &str, stored_hash: &str, salt: &Salt) -> Result<bool, CryptoError> {
    Ok(unlock(pin, stored_hash, salt)?.is_some())
}

/// Derive the segment key and hand it back only if it matches
/// `stored_hash`. Saves a second PBKDF2 run when the caller goes on to
/// decrypt.
pub fn unlock(
    pin: &str,
    stored_hash: &str,
    salt: &Salt,
) -> Result<Option<DerivedKey>, CryptoError> {
    let key = derive_key(pin, salt)?;
    let computed = verification_hash(&key);

    if bool::from(computed.as_bytes().ct_eq(stored_hash.as_bytes())) {
        Ok(Some(key))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let salt = Salt::from_bytes([7u8; SALT_SIZE]);

        let key1 = derive_key("1234", &salt).unwrap();
        let key2 = derive_key("1234", &salt).unwrap();

        assert_eq!(*key1, *key2);
    }

    #[test]
    fn test_different_salts_different_keys() {
        let key1 = derive_key("1234", &Salt::from_bytes([1u8; SALT_SIZE])).unwrap();
        let key2 = derive_key("1234", &Salt::from_bytes([2u8; SALT_SIZE])).unwrap();

        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_verify_pin_accepts_own_hash() {
        for pin in ["0000", "1234", "correct horse", "ünïcødé", ""] {
            let salt = Salt::generate();
            let hash = compute_verification_hash(pin, &salt).unwrap();
            assert!(verify_pin(pin, &hash, &salt).unwrap(), "pin {pin:?}");
        }
    }

    #[test]
    fn test_different_pins_different_hashes() {
        let salt = Salt::generate();
        let h1 = compute_verification_hash("1234", &salt).unwrap();
        let h2 = compute_verification_hash("0000", &salt).unwrap();

        assert_ne!(h1, h2);
        assert!(!verify_pin("0000", &h1, &salt).unwrap());
    }

    #[test]
    fn test_hash_is_not_the_key() {
        let salt = Salt::generate();
        let key = derive_key("1234", &salt).unwrap();
        let hash = compute_verification_hash("1234", &salt).unwrap();

        assert_ne!(hash, STANDARD.encode(*key));
    }

    #[test]
    fn test_unlock_returns_matching_key() {
        let protection = PinProtection::new("1234").unwrap();

        let key = unlock("1234", &protection.pin_hash, &protection.salt)
            .unwrap()
            .expect("correct pin unlocks");
        assert_eq!(*key, *protection.key);

        assert!(unlock("4321", &protection.pin_hash, &protection.salt)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unlock_rejects_garbage_hash() {
        let salt = Salt::generate();
        assert!(unlock("1234", "", &salt).unwrap().is_none());
        assert!(unlock("1234", "short", &salt).unwrap().is_none());
    }

    #[test]
    fn test_salt_base64_roundtrip() {
        let salt = Salt::generate();
        assert_eq!(Salt::from_base64(&salt.to_base64()).unwrap(), salt);
        assert_eq!(Salt::from_base64("AAAA"), Err(CryptoError::InvalidSalt));
        assert_eq!(Salt::from_base64("***"), Err(CryptoError::InvalidSalt));
    }
}
