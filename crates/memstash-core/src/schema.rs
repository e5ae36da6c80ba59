use rusqlite::Connection;

use crate::MemoryError;

/// Create the `memories` table and its indexes if they are missing. Safe to
/// run against an image that already has them.
pub fn ensure_schema(conn: &Connection) -> Result<(), MemoryError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memories (
            id          TEXT PRIMARY KEY,
            text        TEXT NOT NULL,
            text_lower  TEXT NOT NULL,
            category    TEXT NOT NULL DEFAULT 'other',
            importance  REAL NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            session_key TEXT,
            metadata    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
        CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);
        CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);
        CREATE INDEX IF NOT EXISTS idx_memories_text_lower ON memories(text_lower);",
    )
    .map_err(MemoryError::Schema)
}
