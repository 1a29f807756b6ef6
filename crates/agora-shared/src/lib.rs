//! # agora-shared
//!
//! Storage-free building blocks for the Agora chat segment store: PIN-based
//! key derivation, AES-256-GCM sealing of segment blobs, identifier newtypes
//! and protocol constants.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod kdf;
pub mod types;

pub use error::CryptoError;
