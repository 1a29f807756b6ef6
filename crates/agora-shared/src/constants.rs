/// AES-256-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (AES-256)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Per-segment PBKDF2 salt size in bytes
pub const SALT_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 rounds for PIN-derived segment keys
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Smallest well-formed sealed blob: nonce + empty ciphertext + tag
pub const MIN_SEALED_LEN: usize = NONCE_SIZE + TAG_SIZE;
