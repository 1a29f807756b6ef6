//! Segment records and the encrypt-on-write / decrypt-on-read contract.
//!
//! A segment's whole message list lives in one `message_blob` column:
//! a JSON array for open segments, a base64 AES-256-GCM blob for protected
//! ones. Appending is read-modify-write of that column, guarded by the
//! `version` token so a stale writer gets [`StoreError::Conflict`] instead
//! of silently dropping someone else's message.

use agora_shared::crypto;
use agora_shared::kdf::{self, DerivedKey, PinProtection, Salt};
use agora_shared::types::{SegmentId, ThreadId};
use agora_shared::CryptoError;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{conversion_error, db_now, format_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, Protection, Segment};

/// Optimistic-concurrency retries for [`Database::append_message`].
pub const DEFAULT_APPEND_RETRIES: u32 = 1;

const SEGMENT_COLUMNS: &str =
    "id, thread_id, start_time, end_time, is_protected, pin_hash, salt, version, updated_at";

// ---------------------------------------------------------------------------
// Blob + access
// ---------------------------------------------------------------------------

/// Raw contents of a segment's `message_blob` column.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SegmentBlob(Option<String>);

impl SegmentBlob {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Some(raw.into()))
    }

    /// NULL and whitespace-only blobs both read as an empty message list.
    pub fn is_empty(&self) -> bool {
        self.0.as_deref().map_or(true, |s| s.trim().is_empty())
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl std::fmt::Debug for SegmentBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(s) => write!(f, "SegmentBlob([{} bytes])", s.len()),
            None => f.write_str("SegmentBlob(NULL)"),
        }
    }
}

/// Proof that the caller may read and write one segment's blob.
///
/// For protected segments this holds the PIN-derived key, which is wiped
/// when the access is dropped. Build one per operation; do not keep it.
pub enum SegmentAccess {
    Open,
    Unlocked(DerivedKey),
}

impl SegmentAccess {
    /// Check `pin` against the segment. Protected segments fail with
    /// [`StoreError::PinRequired`] or [`StoreError::WrongPin`] before any
    /// decryption happens. A PIN given for an open segment is ignored.
    pub fn for_segment(segment: &Segment, pin: Option<&str>) -> Result<Self> {
        match &segment.protection {
            Protection::Open => Ok(SegmentAccess::Open),
            Protection::Pin { pin_hash, salt } => {
                let pin = pin
                    .filter(|p| !p.is_empty())
                    .ok_or(StoreError::PinRequired(segment.id))?;

                match kdf::unlock(pin, pin_hash, salt)? {
                    Some(key) => Ok(SegmentAccess::Unlocked(key)),
                    None => {
                        tracing::info!(segment_id = %segment.id, "wrong PIN for protected segment");
                        Err(StoreError::WrongPin)
                    }
                }
            }
        }
    }

    /// Turn a stored blob back into messages.
    pub fn decode(&self, segment_id: SegmentId, blob: &SegmentBlob) -> Result<Vec<Message>> {
        let raw = match blob.as_str() {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Ok(Vec::new()),
        };

        match self {
            SegmentAccess::Open => parse_messages(segment_id, raw.as_bytes()),
            SegmentAccess::Unlocked(key) => {
                let plaintext = crypto::open(key, raw).map_err(|e| match e {
                    CryptoError::IntegrityCheckFailed => {
                        tracing::warn!(
                            target: "security",
                            segment_id = %segment_id,
                            "segment blob failed authentication after PIN verification"
                        );
                        StoreError::Corrupted(segment_id)
                    }
                    other => StoreError::Crypto(other),
                })?;
                parse_messages(segment_id, &plaintext)
            }
        }
    }

    /// Serialize (and seal, if protected) a message list.
    pub fn encode(&self, messages: &[Message]) -> Result<SegmentBlob> {
        let json = serde_json::to_string(messages)?;
        match self {
            SegmentAccess::Open => Ok(SegmentBlob::new(json)),
            SegmentAccess::Unlocked(key) => {
                Ok(SegmentBlob::new(crypto::seal(key, json.as_bytes())?))
            }
        }
    }
}

/// Protection and initial blob of a segment that is about to be inserted.
///
/// Preparing a protected segment runs PBKDF2, so a caller sharing one
/// connection between threads should prepare before taking its lock.
pub struct NewSegment {
    protection: Protection,
    blob: SegmentBlob,
}

impl NewSegment {
    /// A protected segment needs a non-empty PIN. Its salt and verification
    /// hash are computed here and the initial empty list is sealed under the
    /// derived key, which is dropped before this returns.
    pub fn prepare(protected: bool, pin: Option<&str>) -> Result<Self> {
        if !protected {
            return Ok(Self {
                protection: Protection::Open,
                blob: SegmentAccess::Open.encode(&[])?,
            });
        }

        let pin = pin
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| StoreError::Validation("a protected segment requires a PIN".into()))?;
        let PinProtection {
            salt,
            pin_hash,
            key,
        } = PinProtection::new(pin)?;
        let blob = SegmentAccess::Unlocked(key).encode(&[])?;

        Ok(Self {
            protection: Protection::Pin { pin_hash, salt },
            blob,
        })
    }

    pub fn is_protected(&self) -> bool {
        matches!(self.protection, Protection::Pin { .. })
    }
}

// ---------------------------------------------------------------------------
// Database operations
// ---------------------------------------------------------------------------

impl Database {
    /// Open a new segment for `thread_id`, closing the currently active one.
    pub fn create_segment(
        &self,
        thread_id: ThreadId,
        protected: bool,
        pin: Option<&str>,
    ) -> Result<Segment> {
        let new = NewSegment::prepare(protected, pin)?;
        self.insert_segment(thread_id, new)
    }

    /// Insert a prepared segment as the active one of `thread_id`. No key
    /// derivation happens here.
    pub fn insert_segment(&self, thread_id: ThreadId, new: NewSegment) -> Result<Segment> {
        let NewSegment { protection, blob } = new;

        let now = db_now();
        let segment = Segment {
            id: SegmentId::new(),
            thread_id,
            start_time: now,
            end_time: None,
            protection,
            version: 0,
            updated_at: now,
        };

        let tx = self.conn().unchecked_transaction()?;

        let thread_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM threads WHERE id = ?1)",
            params![thread_id.0.to_string()],
            |row| row.get(0),
        )?;
        if !thread_exists {
            return Err(StoreError::NotFound);
        }

        let closed = tx.execute(
            "UPDATE segments SET end_time = ?1 WHERE thread_id = ?2 AND end_time IS NULL",
            params![format_ts(&now), thread_id.0.to_string()],
        )?;

        let (pin_hash, salt) = match &segment.protection {
            Protection::Open => (None, None),
            Protection::Pin { pin_hash, salt } => (Some(pin_hash.clone()), Some(salt.to_base64())),
        };

        tx.execute(
            "INSERT INTO segments
                (id, thread_id, start_time, end_time, is_protected, pin_hash, salt,
                 message_blob, version, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, 0, ?8)",
            params![
                segment.id.0.to_string(),
                thread_id.0.to_string(),
                format_ts(&segment.start_time),
                segment.is_protected() as i32,
                pin_hash,
                salt,
                blob.as_str(),
                format_ts(&segment.updated_at),
            ],
        )?;

        tx.commit()?;

        tracing::info!(
            segment_id = %segment.id,
            thread_id = %thread_id,
            protected = segment.is_protected(),
            closed_previous = closed > 0,
            "segment created"
        );

        Ok(segment)
    }

    /// Fetch segment metadata by id.
    pub fn get_segment(&self, id: SegmentId) -> Result<Segment> {
        self.conn()
            .query_row(
                &format!("SELECT {SEGMENT_COLUMNS} FROM segments WHERE id = ?1"),
                params![id.0.to_string()],
                row_to_segment,
            )
            .map_err(StoreError::from_query)
    }

    /// Fetch segment metadata together with its raw blob.
    pub fn load_segment(&self, id: SegmentId) -> Result<(Segment, SegmentBlob)> {
        self.conn()
            .query_row(
                &format!("SELECT {SEGMENT_COLUMNS}, message_blob FROM segments WHERE id = ?1"),
                params![id.0.to_string()],
                |row| {
                    let segment = row_to_segment(row)?;
                    let blob: Option<String> = row.get(9)?;
                    Ok((segment, SegmentBlob(blob)))
                },
            )
            .map_err(StoreError::from_query)
    }

    /// All segments of a thread, oldest first.
    pub fn list_segments(&self, thread_id: ThreadId) -> Result<Vec<Segment>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments
             WHERE thread_id = ?1
             ORDER BY start_time ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![thread_id.0.to_string()], row_to_segment)?;

        let mut segments = Vec::new();
        for row in rows {
            segments.push(row?);
        }
        Ok(segments)
    }

    /// End the active segment of a thread without opening a new one.
    /// Returns the segment that was closed, if there was one.
    pub fn close_active_segment(&self, thread_id: ThreadId) -> Result<Option<Segment>> {
        let Some(active) = self.active_segment_of(thread_id)? else {
            return Ok(None);
        };

        let now = db_now();
        self.conn().execute(
            "UPDATE segments SET end_time = ?1 WHERE id = ?2 AND end_time IS NULL",
            params![format_ts(&now), active.id.0.to_string()],
        )?;

        tracing::info!(segment_id = %active.id, thread_id = %thread_id, "segment closed");

        Ok(Some(Segment {
            end_time: Some(now),
            ..active
        }))
    }

    /// Write a new blob if the segment is still at `expected_version`.
    /// Returns the new version.
    pub fn replace_blob(
        &self,
        id: SegmentId,
        expected_version: i64,
        blob: &SegmentBlob,
    ) -> Result<i64> {
        let affected = self.conn().execute(
            "UPDATE segments
             SET message_blob = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4",
            params![
                blob.as_str(),
                format_ts(&db_now()),
                id.0.to_string(),
                expected_version,
            ],
        )?;

        if affected == 1 {
            return Ok(expected_version + 1);
        }

        let exists = self
            .conn()
            .query_row(
                "SELECT 1 FROM segments WHERE id = ?1",
                params![id.0.to_string()],
                |_| Ok(()),
            )
            .optional()?;

        match exists {
            Some(()) => Err(StoreError::Conflict(id)),
            None => Err(StoreError::NotFound),
        }
    }

    /// Read the full message list of a segment.
    ///
    /// Protected segments verify `pin` first; a wrong PIN never reaches the
    /// cipher. An empty or NULL blob reads as an empty list.
    pub fn read_messages(&self, id: SegmentId, pin: Option<&str>) -> Result<Vec<Message>> {
        let (segment, blob) = self.load_segment(id)?;
        let access = SegmentAccess::for_segment(&segment, pin)?;
        access.decode(segment.id, &blob)
    }

    /// Number of messages in a segment. Same PIN rules as [`Self::read_messages`].
    pub fn message_count(&self, id: SegmentId, pin: Option<&str>) -> Result<usize> {
        self.read_messages(id, pin).map(|m| m.len())
    }

    /// Append one message to a segment by id, retrying once on a concurrent
    /// update. Appending to a closed segment is allowed here.
    pub fn append_message(
        &self,
        id: SegmentId,
        message: &Message,
        pin: Option<&str>,
    ) -> Result<()> {
        self.append_message_with_retries(id, message, pin, DEFAULT_APPEND_RETRIES)
    }

    pub fn append_message_with_retries(
        &self,
        id: SegmentId,
        message: &Message,
        pin: Option<&str>,
        retries: u32,
    ) -> Result<()> {
        append_with_retries(self, id, message, pin, retries).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Append transition
// ---------------------------------------------------------------------------

/// The two storage steps of an append.
///
/// Implementors choose what is held around each step. PIN verification,
/// decoding and sealing in [`append_with_retries`] run between the calls,
/// outside whatever lock `load` and `store` take.
pub trait SegmentSource {
    fn load(&self, id: SegmentId) -> Result<(Segment, SegmentBlob)>;

    /// Write `blob` if the segment is still at `expected_version`.
    fn store(&self, id: SegmentId, expected_version: i64, blob: &SegmentBlob) -> Result<i64>;
}

impl SegmentSource for Database {
    fn load(&self, id: SegmentId) -> Result<(Segment, SegmentBlob)> {
        self.load_segment(id)
    }

    fn store(&self, id: SegmentId, expected_version: i64, blob: &SegmentBlob) -> Result<i64> {
        self.replace_blob(id, expected_version, blob)
    }
}

/// Append one message to segment `id` and return the new message count.
///
/// The PIN is checked once. When the write hits [`StoreError::Conflict`]
/// the segment is re-read and the message re-applied on top, at most
/// `retries` times; after that the conflict is returned.
pub fn append_with_retries<S: SegmentSource + ?Sized>(
    source: &S,
    id: SegmentId,
    message: &Message,
    pin: Option<&str>,
    retries: u32,
) -> Result<usize> {
    let (segment, mut blob) = source.load(id)?;
    let access = SegmentAccess::for_segment(&segment, pin)?;
    let mut version = segment.version;

    if !segment.is_active() {
        tracing::debug!(segment_id = %id, "appending to a closed segment");
    }

    let mut attempt = 0;
    loop {
        let mut messages = access.decode(id, &blob)?;
        messages.push(message.clone());
        let sealed = access.encode(&messages)?;

        match source.store(id, version, &sealed) {
            Ok(_) => {
                tracing::debug!(segment_id = %id, count = messages.len(), "message appended");
                return Ok(messages.len());
            }
            Err(StoreError::Conflict(_)) if attempt < retries => {
                attempt += 1;
                tracing::debug!(segment_id = %id, attempt, "segment changed underneath, retrying");
                let (fresh, fresh_blob) = source.load(id)?;
                version = fresh.version;
                blob = fresh_blob;
            }
            Err(StoreError::Conflict(conflicted)) => {
                tracing::warn!(
                    segment_id = %id,
                    attempts = attempt + 1,
                    "append gave up after concurrent updates"
                );
                return Err(StoreError::Conflict(conflicted));
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

// Undecodable content is reported like a failed tag. The parser error is
// not logged since it can quote plaintext.
fn parse_messages(segment_id: SegmentId, bytes: &[u8]) -> Result<Vec<Message>> {
    serde_json::from_slice(bytes).map_err(|_| {
        tracing::warn!(
            target: "security",
            segment_id = %segment_id,
            "segment blob does not hold a message list"
        );
        StoreError::Corrupted(segment_id)
    })
}

/// Map the first nine columns of a segment query to a [`Segment`].
pub(crate) fn row_to_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Segment> {
    let id_str: String = row.get(0)?;
    let thread_id_str: String = row.get(1)?;
    let start_str: String = row.get(2)?;
    let end_str: Option<String> = row.get(3)?;
    let is_protected: bool = row.get(4)?;
    let pin_hash: Option<String> = row.get(5)?;
    let salt_b64: Option<String> = row.get(6)?;
    let version: i64 = row.get(7)?;
    let updated_str: String = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;
    let thread_id = Uuid::parse_str(&thread_id_str).map_err(|e| conversion_error(1, e))?;
    let start_time = parse_ts(&start_str).map_err(|e| conversion_error(2, e))?;
    let end_time = end_str
        .map(|s| parse_ts(&s))
        .transpose()
        .map_err(|e| conversion_error(3, e))?;
    let updated_at = parse_ts(&updated_str).map_err(|e| conversion_error(8, e))?;

    let protection = match (is_protected, pin_hash, salt_b64) {
        (false, _, _) => Protection::Open,
        (true, Some(pin_hash), Some(salt_b64)) => {
            let salt = Salt::from_base64(&salt_b64).map_err(|e| conversion_error(6, e))?;
            Protection::Pin { pin_hash, salt }
        }
        (true, _, _) => {
            return Err(conversion_error(
                4,
                StoreError::Validation("protected segment without salt or PIN hash".into()),
            ))
        }
    };

    Ok(Segment {
        id: SegmentId(id),
        thread_id: ThreadId(thread_id),
        start_time,
        end_time,
        protection,
        version,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Attachment;
    use agora_shared::types::UserId;
    use chrono::{DateTime, Utc};
    use std::cell::RefCell;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn db_with_thread() -> (Database, ThreadId) {
        let db = Database::open_in_memory().unwrap();
        let thread = db
            .find_or_create_thread(&[UserId::from("u1"), UserId::from("u2")], None)
            .unwrap();
        (db, thread.id)
    }

    #[test]
    fn unprotected_append_then_read() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, false, None).unwrap();

        let msg = Message::new("u1", "hi").at(ts("2024-05-01T10:00:00Z"));
        db.append_message(segment.id, &msg, None).unwrap();

        let messages = db.read_messages(segment.id, None).unwrap();
        assert_eq!(messages, vec![msg]);
    }

    #[test]
    fn unprotected_blob_is_plain_json() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, false, None).unwrap();
        db.append_message(segment.id, &Message::new("u1", "plain"), None)
            .unwrap();

        let (_, blob) = db.load_segment(segment.id).unwrap();
        assert!(blob.as_str().unwrap().contains("\"content\":\"plain\""));
    }

    #[test]
    fn protected_segment_requires_pin_at_creation() {
        let (db, thread_id) = db_with_thread();

        for pin in [None, Some(""), Some("   ")] {
            let err = db.create_segment(thread_id, true, pin).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{err:?}");
        }
        assert!(db.list_segments(thread_id).unwrap().is_empty());
    }

    #[test]
    fn protected_round_trip_and_wrong_pin() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, true, Some("1234")).unwrap();
        assert!(segment.is_protected());

        let msg = Message::new("u1", "secret plans").at(ts("2024-05-01T10:00:00Z"));
        db.append_message(segment.id, &msg, Some("1234")).unwrap();

        let err = db.read_messages(segment.id, Some("0000")).unwrap_err();
        assert!(matches!(err, StoreError::WrongPin), "{err:?}");

        assert_eq!(db.read_messages(segment.id, Some("1234")).unwrap(), vec![msg]);
    }

    #[test]
    fn protected_blob_does_not_leak_plaintext() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, true, Some("1234")).unwrap();
        db.append_message(segment.id, &Message::new("u1", "secret plans"), Some("1234"))
            .unwrap();

        let (_, blob) = db.load_segment(segment.id).unwrap();
        let raw = blob.as_str().unwrap();
        assert!(!raw.contains("secret"));
        assert!(!raw.contains("senderId"));
    }

    #[test]
    fn protected_read_without_pin_is_rejected() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, true, Some("1234")).unwrap();

        for pin in [None, Some("")] {
            let err = db.read_messages(segment.id, pin).unwrap_err();
            assert!(matches!(err, StoreError::PinRequired(id) if id == segment.id));
        }
    }

    #[test]
    fn append_with_wrong_pin_leaves_blob_untouched() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, true, Some("1234")).unwrap();
        let (_, before) = db.load_segment(segment.id).unwrap();

        let err = db
            .append_message(segment.id, &Message::new("u1", "x"), Some("9999"))
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongPin));

        let (after_segment, after) = db.load_segment(segment.id).unwrap();
        assert_eq!(before, after);
        assert_eq!(after_segment.version, 0);
    }

    #[test]
    fn tampered_blob_is_corrupted_not_wrong_pin() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, true, Some("1234")).unwrap();
        db.append_message(segment.id, &Message::new("u1", "x"), Some("1234"))
            .unwrap();

        let (loaded, blob) = db.load_segment(segment.id).unwrap();
        let mut raw = blob.as_str().unwrap().to_string();
        // Swap one base64 character for another so the blob still decodes.
        let mid = raw.len() / 2;
        let replacement = if &raw[mid..mid + 1] == "A" { "B" } else { "A" };
        raw.replace_range(mid..mid + 1, replacement);
        db.replace_blob(segment.id, loaded.version, &SegmentBlob::new(raw))
            .unwrap();

        let err = db.read_messages(segment.id, Some("1234")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(id) if id == segment.id), "{err:?}");

        let err = db.read_messages(segment.id, Some("0000")).unwrap_err();
        assert!(matches!(err, StoreError::WrongPin));
    }

    #[test]
    fn empty_or_null_blob_reads_as_empty_list() {
        let (db, thread_id) = db_with_thread();
        let open = db.create_segment(thread_id, false, None).unwrap();
        let protected = db.create_segment(thread_id, true, Some("1234")).unwrap();

        assert!(db.read_messages(open.id, None).unwrap().is_empty());
        assert!(db.read_messages(protected.id, Some("1234")).unwrap().is_empty());

        for segment in [&open, &protected] {
            db.conn()
                .execute(
                    "UPDATE segments SET message_blob = NULL WHERE id = ?1",
                    params![segment.id.0.to_string()],
                )
                .unwrap();
        }

        assert!(db.read_messages(open.id, None).unwrap().is_empty());
        assert!(db.read_messages(protected.id, Some("1234")).unwrap().is_empty());
        // PIN still checked even with nothing to decrypt.
        assert!(matches!(
            db.read_messages(protected.id, Some("0000")),
            Err(StoreError::WrongPin)
        ));
    }

    #[test]
    fn duplicate_appends_are_not_deduplicated() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, false, None).unwrap();
        let msg = Message::new("u1", "same").at(ts("2024-05-01T10:00:00Z"));

        db.append_message(segment.id, &msg, None).unwrap();
        db.append_message(segment.id, &msg, None).unwrap();

        assert_eq!(
            db.read_messages(segment.id, None).unwrap(),
            vec![msg.clone(), msg]
        );
    }

    #[test]
    fn appends_keep_order_and_attachments() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, true, Some("4321")).unwrap();

        let first = Message::new("u1", "one");
        let second = Message::new("u2", "two").with_attachment(Attachment {
            id: Some("17".into()),
            content_type: Some("image/png".into()),
            name: Some("diagram.png".into()),
            size: Some(2048),
        });
        db.append_message(segment.id, &first, Some("4321")).unwrap();
        db.append_message(segment.id, &second, Some("4321")).unwrap();

        assert_eq!(
            db.read_messages(segment.id, Some("4321")).unwrap(),
            vec![first, second]
        );
        assert_eq!(db.message_count(segment.id, Some("4321")).unwrap(), 2);
        assert_eq!(db.get_segment(segment.id).unwrap().version, 2);
    }

    #[test]
    fn new_segment_closes_previous() {
        let (db, thread_id) = db_with_thread();
        let first = db.create_segment(thread_id, false, None).unwrap();
        let second = db.create_segment(thread_id, true, Some("1234")).unwrap();

        let first = db.get_segment(first.id).unwrap();
        assert!(first.end_time.is_some());
        assert!(second.is_active());

        let active = db.active_segment_of(thread_id).unwrap().unwrap();
        assert_eq!(active.id, second.id);

        let all = db.list_segments(thread_id).unwrap();
        assert_eq!(all.iter().filter(|s| s.is_active()).count(), 1);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn closed_segment_stays_readable_and_appendable_by_id() {
        let (db, thread_id) = db_with_thread();
        let first = db.create_segment(thread_id, true, Some("1234")).unwrap();
        db.append_message(first.id, &Message::new("u1", "before"), Some("1234"))
            .unwrap();
        db.create_segment(thread_id, false, None).unwrap();

        assert_eq!(db.message_count(first.id, Some("1234")).unwrap(), 1);
        db.append_message(first.id, &Message::new("u1", "late"), Some("1234"))
            .unwrap();
        assert_eq!(db.message_count(first.id, Some("1234")).unwrap(), 2);
    }

    #[test]
    fn stale_version_is_a_conflict() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, false, None).unwrap();
        let (stale, _) = db.load_segment(segment.id).unwrap();

        db.append_message(segment.id, &Message::new("u1", "first"), None)
            .unwrap();

        let err = db
            .replace_blob(segment.id, stale.version, &SegmentBlob::new("[]"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(id) if id == segment.id));
        assert_eq!(db.message_count(segment.id, None).unwrap(), 1);
    }

    #[test]
    fn missing_records_are_not_found() {
        let (db, _) = db_with_thread();
        let ghost = SegmentId::new();

        assert!(matches!(db.get_segment(ghost), Err(StoreError::NotFound)));
        assert!(matches!(db.read_messages(ghost, None), Err(StoreError::NotFound)));
        assert!(matches!(
            db.append_message(ghost, &Message::new("u1", "x"), None),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            db.replace_blob(ghost, 0, &SegmentBlob::default()),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            db.create_segment(ThreadId::new(), false, None),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn close_active_segment_leaves_thread_without_active() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, false, None).unwrap();

        let closed = db.close_active_segment(thread_id).unwrap().unwrap();
        assert_eq!(closed.id, segment.id);
        assert!(closed.end_time.is_some());
        assert!(db.active_segment_of(thread_id).unwrap().is_none());
        assert!(db.close_active_segment(thread_id).unwrap().is_none());
    }

    #[test]
    fn pin_is_ignored_for_open_segments() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, false, Some("1234")).unwrap();
        assert!(!segment.is_protected());

        db.append_message(segment.id, &Message::new("u1", "x"), Some("anything"))
            .unwrap();
        assert_eq!(db.message_count(segment.id, None).unwrap(), 1);
    }

    /// Lands queued messages from "someone else" right before each write,
    /// so the write always sees a bumped version.
    struct CompetingWriter<'a> {
        db: &'a Database,
        pin: Option<&'a str>,
        queued: RefCell<Vec<Message>>,
    }

    impl SegmentSource for CompetingWriter<'_> {
        fn load(&self, id: SegmentId) -> Result<(Segment, SegmentBlob)> {
            self.db.load_segment(id)
        }

        fn store(&self, id: SegmentId, expected_version: i64, blob: &SegmentBlob) -> Result<i64> {
            let next = self.queued.borrow_mut().pop();
            if let Some(other) = next {
                self.db.append_message_with_retries(id, &other, self.pin, 0)?;
            }
            self.db.replace_blob(id, expected_version, blob)
        }
    }

    #[test]
    fn conflicting_write_is_reapplied_once() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, true, Some("1234")).unwrap();
        let writer = CompetingWriter {
            db: &db,
            pin: Some("1234"),
            queued: RefCell::new(vec![Message::new("u2", "theirs")]),
        };

        let count =
            append_with_retries(&writer, segment.id, &Message::new("u1", "mine"), Some("1234"), 1)
                .unwrap();
        assert_eq!(count, 2);

        let contents: Vec<_> = db
            .read_messages(segment.id, Some("1234"))
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["theirs", "mine"]);
        assert_eq!(db.get_segment(segment.id).unwrap().version, 2);
    }

    #[test]
    fn conflict_surfaces_when_retries_run_out() {
        let (db, thread_id) = db_with_thread();
        let segment = db.create_segment(thread_id, false, None).unwrap();

        let writer = CompetingWriter {
            db: &db,
            pin: None,
            queued: RefCell::new(vec![Message::new("u2", "a")]),
        };
        let err = append_with_retries(&writer, segment.id, &Message::new("u1", "x"), None, 0)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(id) if id == segment.id));

        let writer = CompetingWriter {
            db: &db,
            pin: None,
            queued: RefCell::new(vec![Message::new("u2", "b"), Message::new("u2", "c")]),
        };
        let err = append_with_retries(&writer, segment.id, &Message::new("u1", "y"), None, 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Only the competing messages made it.
        let contents: Vec<_> = db
            .read_messages(segment.id, None)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["a", "c", "b"]);
    }

    #[test]
    fn prepared_segment_inserts_without_pin() {
        let (db, thread_id) = db_with_thread();

        let prepared = NewSegment::prepare(true, Some("2468")).unwrap();
        assert!(prepared.is_protected());
        let segment = db.insert_segment(thread_id, prepared).unwrap();

        assert!(segment.is_protected());
        assert!(db.read_messages(segment.id, Some("2468")).unwrap().is_empty());
        assert!(matches!(
            db.read_messages(segment.id, Some("1357")),
            Err(StoreError::WrongPin)
        ));

        let open = NewSegment::prepare(false, None).unwrap();
        assert!(!open.is_protected());
        assert!(matches!(
            db.insert_segment(ThreadId::new(), open),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            NewSegment::prepare(true, None),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn undecodable_message_list_is_corrupted() {
        let (db, thread_id) = db_with_thread();

        let open = db.create_segment(thread_id, false, None).unwrap();
        db.replace_blob(open.id, 0, &SegmentBlob::new("{not a list"))
            .unwrap();
        assert!(matches!(
            db.read_messages(open.id, None),
            Err(StoreError::Corrupted(id)) if id == open.id
        ));

        let protected = db.create_segment(thread_id, true, Some("1234")).unwrap();
        let access = SegmentAccess::for_segment(&protected, Some("1234")).unwrap();
        let SegmentAccess::Unlocked(key) = &access else {
            panic!("protected segment should unlock");
        };
        let sealed = crypto::seal(key, b"plain words, not json").unwrap();
        db.replace_blob(protected.id, 0, &SegmentBlob::new(sealed))
            .unwrap();

        assert!(matches!(
            db.read_messages(protected.id, Some("1234")),
            Err(StoreError::Corrupted(id)) if id == protected.id
        ));
        assert!(matches!(
            db.append_message(protected.id, &Message::new("u1", "x"), Some("1234")),
            Err(StoreError::Corrupted(_))
        ));
    }
}
