//! v002 -- Indexed membership lookups and the single-active-segment rule.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Threads visible to a user
CREATE INDEX IF NOT EXISTS idx_thread_members_user
    ON thread_members(user_id);

-- Exactly one thread per member set
CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_member_key
    ON threads(member_key);

-- At most one active (open-ended) segment per thread
CREATE UNIQUE INDEX IF NOT EXISTS idx_segments_one_active
    ON segments(thread_id) WHERE end_time IS NULL;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
