//! # agora-store
//!
//! Local SQLite storage for Agora chat threads and their segments.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection`. Thread metadata and membership live in plain
//! columns; each segment keeps its whole message list in one blob column,
//! stored as JSON for open segments and as an AES-256-GCM sealed blob for
//! PIN-protected ones.

pub mod database;
pub mod migrations;
pub mod models;
pub mod segments;
pub mod threads;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use segments::SegmentBlob;
