//! The service a delivery layer calls into.
//!
//! One [`ChatService`] wraps one database connection. Key derivation and
//! cipher work run outside the connection lock; only loads, inserts and
//! the versioned blob write hold it.

use agora_shared::types::{SegmentId, ThreadId, UserId};
use agora_store::segments::{self, NewSegment, SegmentAccess, SegmentSource};
use agora_store::{Database, Message, Segment, SegmentBlob, Thread};
use parking_lot::Mutex;

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::locks::KeyedLocks;
use crate::logging::Redacted;

pub struct ChatService {
    db: Mutex<Database>,
    segment_locks: KeyedLocks<SegmentId>,
    thread_locks: KeyedLocks<ThreadId>,
    append_retries: u32,
}

/// Each storage step of an append takes the connection lock on its own.
struct SharedConnection<'a>(&'a Mutex<Database>);

impl SegmentSource for SharedConnection<'_> {
    fn load(&self, id: SegmentId) -> agora_store::Result<(Segment, SegmentBlob)> {
        self.0.lock().load_segment(id)
    }

    fn store(
        &self,
        id: SegmentId,
        expected_version: i64,
        blob: &SegmentBlob,
    ) -> agora_store::Result<i64> {
        self.0.lock().replace_blob(id, expected_version, blob)
    }
}

impl ChatService {
    /// Open the configured database and build a service around it.
    pub fn open(config: &ChatConfig) -> Result<Self> {
        let db = match &config.db_path {
            Some(path) if path.is_dir() => {
                return Err(ChatError::Config(format!(
                    "database path {} is a directory",
                    path.display()
                )));
            }
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        db.set_busy_timeout(config.busy_timeout)?;

        tracing::info!(
            busy_timeout_ms = config.busy_timeout.as_millis() as u64,
            append_retries = config.append_retries,
            "chat service ready"
        );

        Ok(Self::from_database(db, config.append_retries))
    }

    pub fn from_database(db: Database, append_retries: u32) -> Self {
        Self {
            db: Mutex::new(db),
            segment_locks: KeyedLocks::new(),
            thread_locks: KeyedLocks::new(),
            append_retries,
        }
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Return the id of the thread with exactly these members, creating
    /// it if needed.
    pub fn create_thread(&self, members: &[UserId], name: Option<&str>) -> Result<ThreadId> {
        let thread = self.db.lock().find_or_create_thread(members, name)?;
        Ok(thread.id)
    }

    pub fn get_thread(&self, thread_id: ThreadId) -> Result<Thread> {
        Ok(self.db.lock().get_thread(thread_id)?)
    }

    /// Threads `user` belongs to, most recently active first.
    pub fn threads_for_user(&self, user: &UserId) -> Result<Vec<Thread>> {
        Ok(self.db.lock().threads_visible_to(user)?)
    }

    // ------------------------------------------------------------------
    // Segments
    // ------------------------------------------------------------------

    /// Open a new segment for a thread, closing the active one.
    pub fn create_segment(
        &self,
        thread_id: ThreadId,
        protected: bool,
        pin: Option<&str>,
    ) -> Result<SegmentId> {
        tracing::debug!(
            thread_id = %thread_id,
            protected,
            pin = ?pin.map(Redacted),
            "opening segment"
        );

        let new = NewSegment::prepare(protected, pin)?;

        self.thread_locks.with_lock(thread_id, || -> Result<SegmentId> {
            let segment = self.db.lock().insert_segment(thread_id, new)?;
            Ok(segment.id)
        })
    }

    pub fn active_segment(&self, thread_id: ThreadId) -> Result<Option<Segment>> {
        Ok(self.db.lock().active_segment_of(thread_id)?)
    }

    /// End the active segment of a thread. The next append to the thread
    /// opens a fresh unprotected segment.
    pub fn close_active_segment(&self, thread_id: ThreadId) -> Result<Option<Segment>> {
        self.thread_locks.with_lock(thread_id, || -> Result<Option<Segment>> {
            Ok(self.db.lock().close_active_segment(thread_id)?)
        })
    }

    /// Ordered message list of a segment. Protected segments need `pin`.
    pub fn read_messages(&self, segment_id: SegmentId, pin: Option<&str>) -> Result<Vec<Message>> {
        let (segment, blob) = self.db.lock().load_segment(segment_id)?;
        let access = SegmentAccess::for_segment(&segment, pin)?;
        Ok(access.decode(segment_id, &blob)?)
    }

    // ------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------

    /// Append `message` to the active segment of `thread_id`.
    ///
    /// A thread without an active segment gets a new unprotected one. The
    /// PIN is only passed on when the resolved segment is protected, and a
    /// protected segment without a PIN fails with
    /// [`agora_store::StoreError::PinRequired`].
    pub fn append_message(
        &self,
        thread_id: ThreadId,
        message: &Message,
        pin: Option<&str>,
    ) -> Result<()> {
        // Held across the append so the message cannot land in a segment
        // that a concurrent create_segment has just closed.
        self.thread_locks.with_lock(thread_id, || -> Result<()> {
            let segment = self.resolve_active_segment(thread_id)?;
            let pin = pin.filter(|_| segment.is_protected());
            self.append_to_segment(segment.id, message, pin)
        })
    }

    fn resolve_active_segment(&self, thread_id: ThreadId) -> Result<Segment> {
        let db = self.db.lock();
        if let Some(segment) = db.active_segment_of(thread_id)? {
            return Ok(segment);
        }

        tracing::debug!(thread_id = %thread_id, "no active segment, opening an unprotected one");
        Ok(db.insert_segment(thread_id, NewSegment::prepare(false, None)?)?)
    }

    /// Append `message` to a segment by id, whether or not it is still
    /// active.
    ///
    /// Appends to the same segment are serialized within this service. A
    /// writer on another connection is detected through the segment's
    /// version and the append is re-applied on the fresh list, up to the
    /// configured number of retries.
    pub fn append_to_segment(
        &self,
        segment_id: SegmentId,
        message: &Message,
        pin: Option<&str>,
    ) -> Result<()> {
        self.segment_locks.with_lock(segment_id, || -> Result<()> {
            let conn = SharedConnection(&self.db);
            segments::append_with_retries(&conn, segment_id, message, pin, self.append_retries)?;
            Ok(())
        })
    }
}
