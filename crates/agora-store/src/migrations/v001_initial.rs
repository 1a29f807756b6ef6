//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `threads`, `thread_members` and `segments`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Threads (conversations between a fixed member set)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS threads (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    name       TEXT NOT NULL,
    member_key TEXT NOT NULL,                 -- canonical encoding of the member set
    created_at TEXT NOT NULL                  -- RFC-3339, microseconds, UTC
);

-- ----------------------------------------------------------------
-- Thread members
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS thread_members (
    thread_id TEXT NOT NULL,                  -- FK -> threads(id)
    user_id   TEXT NOT NULL,

    PRIMARY KEY (thread_id, user_id),
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Segments
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS segments (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    thread_id    TEXT NOT NULL,               -- FK -> threads(id)
    start_time   TEXT NOT NULL,
    end_time     TEXT,                        -- NULL while active
    is_protected INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    pin_hash     TEXT,                        -- base64 SHA-256 of the derived key
    salt         TEXT,                        -- base64, 16 bytes
    message_blob TEXT,                        -- JSON list, or base64 sealed blob
    version      INTEGER NOT NULL DEFAULT 0,  -- optimistic concurrency token
    updated_at   TEXT NOT NULL,

    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE,
    CHECK (
        (is_protected = 0 AND pin_hash IS NULL AND salt IS NULL)
        OR (is_protected = 1 AND pin_hash IS NOT NULL AND salt IS NOT NULL)
    )
);

CREATE INDEX IF NOT EXISTS idx_segments_thread_start
    ON segments(thread_id, start_time);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
