use agora_shared::types::SegmentId;
use agora_shared::CryptoError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The request itself is malformed (e.g. a protected segment without a
    /// PIN, an empty member list). Not retryable.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The segment is protected and no PIN was supplied.
    #[error("Segment {0} is protected and needs a PIN")]
    PinRequired(SegmentId),

    /// The supplied PIN does not match the segment's verification hash.
    /// Raised before any decryption is attempted.
    #[error("Wrong PIN")]
    WrongPin,

    /// The PIN verified but the sealed blob failed its authentication tag.
    #[error("Segment {0} data is corrupted or was tampered with")]
    Corrupted(SegmentId),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// The segment blob changed between read and write.
    #[error("Concurrent update on segment {0}")]
    Conflict(SegmentId),

    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Message list (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Crypto failure other than an integrity check (those map to
    /// [`StoreError::Corrupted`]).
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl StoreError {
    /// Map a `QueryReturnedNoRows` to [`StoreError::NotFound`].
    pub(crate) fn from_query(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
