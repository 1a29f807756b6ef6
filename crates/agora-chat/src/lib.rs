//! # agora-chat
//!
//! Collaborator-facing service over the Agora segment store.
//!
//! [`ChatService`] is what a delivery layer talks to: create threads and
//! segments, append messages to a thread's active segment, read segments
//! back and list the threads a user can see. Appends to one segment are
//! serialized in-process and guarded by the store's version token across
//! processes, so concurrent writers never lose each other's messages.

pub mod config;
pub mod error;
pub mod locks;
pub mod logging;
pub mod service;

pub use config::ChatConfig;
pub use error::{ChatError, ErrorKind, Result};
pub use service::ChatService;
