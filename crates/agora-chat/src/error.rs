use agora_store::StoreError;
use thiserror::Error;

/// Errors returned by [`crate::ChatService`].
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification a transport layer can map to user-facing replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller must fix the request (missing PIN, bad members).
    Validation,
    /// Wrong PIN.
    Authentication,
    /// Sealed data failed its authentication tag.
    Integrity,
    NotFound,
    /// Retries on a concurrently updated segment ran out.
    Concurrency,
    Storage,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Config(_) => ErrorKind::Validation,
            ChatError::Store(e) => match e {
                StoreError::Validation(_) | StoreError::PinRequired(_) => ErrorKind::Validation,
                StoreError::WrongPin => ErrorKind::Authentication,
                StoreError::Corrupted(_) => ErrorKind::Integrity,
                StoreError::NotFound => ErrorKind::NotFound,
                StoreError::Conflict(_) => ErrorKind::Concurrency,
                _ => ErrorKind::Storage,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
