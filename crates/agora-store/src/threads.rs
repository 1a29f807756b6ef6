//! Thread registry: member sets, segment grouping and visibility.

use std::collections::BTreeSet;

use agora_shared::types::{ThreadId, UserId};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{conversion_error, db_now, format_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Segment, Thread};
use crate::segments::row_to_segment;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the thread whose member set is exactly `members`, creating it
    /// if none exists. Duplicates in `members` are ignored; order does not
    /// matter. `name` defaults to the member ids joined by ", ".
    pub fn find_or_create_thread(&self, members: &[UserId], name: Option<&str>) -> Result<Thread> {
        let members = normalize_members(members)?;

        if let Some(thread) = self.find_by_member_set(&members)? {
            return Ok(thread);
        }

        let now = db_now();
        let thread = Thread {
            id: ThreadId::new(),
            name: name
                .map(str::to_string)
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| default_name(&members)),
            members,
            created_at: now,
            segments: Vec::new(),
        };

        match self.insert_thread(&thread) {
            Ok(()) => {
                tracing::info!(
                    thread_id = %thread.id,
                    members = thread.members.len(),
                    "thread created"
                );
                Ok(thread)
            }
            // Another connection created the same member set first.
            Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                self.find_by_member_set(&thread.members)?
                    .ok_or(StoreError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    fn insert_thread(&self, thread: &Thread) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO threads (id, name, member_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                thread.id.0.to_string(),
                thread.name,
                member_key(&thread.members),
                format_ts(&thread.created_at),
            ],
        )?;

        {
            let mut stmt =
                tx.prepare("INSERT INTO thread_members (thread_id, user_id) VALUES (?1, ?2)")?;
            for member in &thread.members {
                stmt.execute(params![thread.id.0.to_string(), member.as_str()])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Look up a thread by exact member set without creating one.
    pub fn find_thread_by_members(&self, members: &[UserId]) -> Result<Option<Thread>> {
        let members = normalize_members(members)?;
        self.find_by_member_set(&members)
    }

    fn find_by_member_set(&self, members: &BTreeSet<UserId>) -> Result<Option<Thread>> {
        let header = self
            .conn()
            .query_row(
                "SELECT id, name, created_at FROM threads WHERE member_key = ?1",
                params![member_key(members)],
                row_to_header,
            )
            .optional()?;

        header.map(|h| self.hydrate(h)).transpose()
    }

    /// Fetch a thread with its members and segments.
    pub fn get_thread(&self, id: ThreadId) -> Result<Thread> {
        let header = self
            .conn()
            .query_row(
                "SELECT id, name, created_at FROM threads WHERE id = ?1",
                params![id.0.to_string()],
                row_to_header,
            )
            .map_err(StoreError::from_query)?;

        self.hydrate(header)
    }

    /// The segment of `thread_id` that currently accepts messages.
    ///
    /// `Ok(None)` means the thread exists but has no open segment; the
    /// caller decides whether to open one.
    pub fn active_segment_of(&self, thread_id: ThreadId) -> Result<Option<Segment>> {
        if !self.thread_exists(thread_id)? {
            return Err(StoreError::NotFound);
        }

        let segment = self
            .conn()
            .query_row(
                "SELECT id, thread_id, start_time, end_time, is_protected, pin_hash, salt,
                        version, updated_at
                 FROM segments
                 WHERE thread_id = ?1 AND end_time IS NULL
                 ORDER BY start_time DESC, rowid DESC
                 LIMIT 1",
                params![thread_id.0.to_string()],
                row_to_segment,
            )
            .optional()?;

        Ok(segment)
    }

    /// Threads that `user` is a member of, most recently active first.
    /// Threads without any segment come last. `user` is matched the way
    /// member ids were stored, so surrounding whitespace is ignored.
    pub fn threads_visible_to(&self, user: &UserId) -> Result<Vec<Thread>> {
        let user = normalize_user(user);
        if user.as_str().is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn().prepare(
            "SELECT t.id, t.name, t.created_at, MAX(s.updated_at) AS last_activity
             FROM thread_members m
             JOIN threads t ON t.id = m.thread_id
             LEFT JOIN segments s ON s.thread_id = t.id
             WHERE m.user_id = ?1
             GROUP BY t.id
             ORDER BY last_activity IS NULL, last_activity DESC, t.created_at DESC",
        )?;

        let rows = stmt.query_map(params![user.as_str()], row_to_header)?;

        let mut headers = Vec::new();
        for row in rows {
            headers.push(row?);
        }

        headers.into_iter().map(|h| self.hydrate(h)).collect()
    }

    fn thread_exists(&self, id: ThreadId) -> Result<bool> {
        Ok(self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM threads WHERE id = ?1)",
            params![id.0.to_string()],
            |row| row.get(0),
        )?)
    }

    fn load_members(&self, id: ThreadId) -> Result<BTreeSet<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM thread_members WHERE thread_id = ?1")?;
        let rows = stmt.query_map(params![id.0.to_string()], |row| {
            row.get::<_, String>(0).map(UserId)
        })?;
        rows.collect::<std::result::Result<BTreeSet<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    fn hydrate(&self, header: ThreadHeader) -> Result<Thread> {
        Ok(Thread {
            members: self.load_members(header.id)?,
            segments: self.list_segments(header.id)?,
            id: header.id,
            name: header.name,
            created_at: header.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct ThreadHeader {
    id: ThreadId,
    name: String,
    created_at: DateTime<Utc>,
}

fn row_to_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadHeader> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let created_str: String = row.get(2)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;
    let created_at = parse_ts(&created_str).map_err(|e| conversion_error(2, e))?;

    Ok(ThreadHeader {
        id: ThreadId(id),
        name,
        created_at,
    })
}

fn normalize_members(members: &[UserId]) -> Result<BTreeSet<UserId>> {
    let set: BTreeSet<UserId> = members.iter().map(normalize_user).collect();

    if set.is_empty() {
        return Err(StoreError::Validation("a thread needs at least one member".into()));
    }
    if set.iter().any(|m| m.as_str().is_empty()) {
        return Err(StoreError::Validation("member ids must not be empty".into()));
    }
    Ok(set)
}

fn normalize_user(user: &UserId) -> UserId {
    UserId(user.as_str().trim().to_string())
}

/// Canonical, length-prefixed encoding of a member set. Equal sets give
/// equal keys regardless of input order; ids containing separators cannot
/// collide.
fn member_key(members: &BTreeSet<UserId>) -> String {
    members
        .iter()
        .map(|m| format!("{}:{}", m.as_str().len(), m.as_str()))
        .collect::<Vec<_>>()
        .join(";")
}

fn default_name(members: &BTreeSet<UserId>) -> String {
    members
        .iter()
        .map(UserId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
