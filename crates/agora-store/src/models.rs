//! Domain model structs persisted in the local SQLite database.

use std::collections::BTreeSet;

use agora_shared::kdf::Salt;
use agora_shared::types::{SegmentId, ThreadId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// A conversation between a fixed set of members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    /// Unique thread identifier.
    pub id: ThreadId,
    /// Display name.
    pub name: String,
    /// Member set. Two threads never share the same set.
    pub members: BTreeSet<UserId>,
    /// When the thread was created.
    pub created_at: DateTime<Utc>,
    /// Segments ordered by start time, oldest first.
    pub segments: Vec<Segment>,
}

impl Thread {
    /// The segment still accepting messages, if any.
    pub fn active_segment(&self) -> Option<&Segment> {
        self.segments.iter().rev().find(|s| s.is_active())
    }

    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }

    /// Time of the most recent creation or append across all segments.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.segments.iter().map(|s| s.updated_at).max()
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// How a segment's message blob is stored.
#[derive(Clone, PartialEq, Eq)]
pub enum Protection {
    /// Plain JSON message list.
    Open,
    /// Sealed with a key derived from a PIN. Only the verification hash and
    /// the salt are kept; the key is recomputed on every access.
    Pin { pin_hash: String, salt: Salt },
}

impl std::fmt::Debug for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protection::Open => f.write_str("Open"),
            Protection::Pin { .. } => f.write_str("Pin { .. }"),
        }
    }
}

/// A time-bounded slice of a thread's conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: SegmentId,
    pub thread_id: ThreadId,
    pub start_time: DateTime<Utc>,
    /// Set when a newer segment supersedes this one.
    pub end_time: Option<DateTime<Utc>>,
    pub protection: Protection,
    /// Bumped on every blob write.
    pub version: i64,
    /// Creation time, or time of the last append.
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    pub fn is_protected(&self) -> bool {
        matches!(self.protection, Protection::Pin { .. })
    }

    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message as stored inside a segment blob. Messages are only ever
/// appended; there is no per-message update or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MessageRecord", into = "MessageRecord")]
pub struct Message {
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Per-message encryption fields from before segment-level encryption.
    /// Preserved on read/write, never produced or interpreted.
    pub legacy: Option<LegacyEncryption>,
    pub attachment: Option<Attachment>,
}

impl Message {
    /// A plain text message stamped with the current time.
    pub fn new(sender_id: impl Into<UserId>, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            legacy: None,
            attachment: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Deprecated per-message encryption metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyEncryption {
    pub encryption_iv: Option<String>,
    pub encrypted_key: Option<String>,
    pub is_encrypted: bool,
}

/// Reference to a file stored elsewhere. Older records may carry the
/// descriptive fields without an id; they are kept as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    pub id: Option<String>,
    pub content_type: Option<String>,
    pub name: Option<String>,
    pub size: Option<i64>,
}

/// Flat camelCase shape of a message inside a segment blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    sender_id: UserId,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(rename = "encryptionIV", default, skip_serializing_if = "Option::is_none")]
    encryption_iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted_key: Option<String>,
    #[serde(default)]
    is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attachment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attachment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attachment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attachment_size: Option<i64>,
}

impl From<MessageRecord> for Message {
    fn from(r: MessageRecord) -> Self {
        let legacy = (r.encryption_iv.is_some() || r.encrypted_key.is_some() || r.is_encrypted)
            .then(|| LegacyEncryption {
                encryption_iv: r.encryption_iv,
                encrypted_key: r.encrypted_key,
                is_encrypted: r.is_encrypted,
            });

        let has_attachment = r.attachment_id.is_some()
            || r.attachment_type.is_some()
            || r.attachment_name.is_some()
            || r.attachment_size.is_some();
        let attachment = has_attachment.then(|| Attachment {
            id: r.attachment_id,
            content_type: r.attachment_type,
            name: r.attachment_name,
            size: r.attachment_size,
        });

        Self {
            sender_id: r.sender_id,
            content: r.content,
            timestamp: r.timestamp,
            legacy,
            attachment,
        }
    }
}

impl From<Message> for MessageRecord {
    fn from(m: Message) -> Self {
        let legacy = m.legacy.unwrap_or_default();
        let (attachment_id, attachment_type, attachment_name, attachment_size) = match m.attachment
        {
            Some(a) => (a.id, a.content_type, a.name, a.size),
            None => (None, None, None, None),
        };

        Self {
            sender_id: m.sender_id,
            content: m.content,
            timestamp: m.timestamp,
            encryption_iv: legacy.encryption_iv,
            encrypted_key: legacy.encrypted_key,
            is_encrypted: legacy.is_encrypted,
            attachment_id,
            attachment_type,
            attachment_name,
            attachment_size,
        }
    }
}
