use tracing::info;

use crate::store::MemoryStore;
use crate::MemoryError;

/// Result of an eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EvictionResult {
    pub evicted: usize,
}

/// Trim the store back down to `max_memories`.
///
/// The surplus is chosen across the whole table by lowest importance first,
/// then oldest `created_at`, then insertion order, and removed in a single
/// statement. Runs after every store, never after a forget.
pub fn run_eviction(store: &mut MemoryStore) -> Result<EvictionResult, MemoryError> {
    let max = store.config().max_memories;
    let total = usize::try_from(store.count()?).unwrap_or(0);
    let surplus = total.saturating_sub(max);
    if surplus == 0 {
        return Ok(EvictionResult { evicted: 0 });
    }

    let evicted = store.conn().execute(
        "DELETE FROM memories WHERE rowid IN (
             SELECT rowid FROM memories
             ORDER BY importance ASC, created_at ASC, rowid ASC
             LIMIT ?1
         )",
        rusqlite::params![i64::try_from(surplus).unwrap_or(i64::MAX)],
    )?;

    if evicted > 0 {
        info!(evicted, max, "evicted least important memories");
        store.mark_dirty()?;
    }
    Ok(EvictionResult { evicted })
}
