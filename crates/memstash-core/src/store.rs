use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::evict;
use crate::memory::{
    Category, ForgetRequest, ForgetResult, MemoryRecord, MemoryStats, NewMemory, RecallQuery,
};
use crate::noise::NoiseFilter;
use crate::recall;
use crate::{persist, schema, MemoryError};

/// Upper bound on how many matches a forget-by-query may delete in one call.
pub const FORGET_QUERY_CAP: usize = 100;

pub(crate) const MEMORY_COLUMNS: &str =
    "id, text, category, importance, created_at, updated_at, session_key, metadata";

/// The storage engine: one in-memory SQLite image plus the bookkeeping that
/// decides when it is written back to disk.
pub struct MemoryStore {
    conn: Connection,
    path: Option<PathBuf>,
    config: StoreConfig,
    noise: NoiseFilter,
    dirty: bool,
}

impl MemoryStore {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn open(config: StoreConfig) -> Result<Self, MemoryError> {
        config.validate()?;
        let noise = NoiseFilter::new(&config.noise_patterns)?;
        let conn = persist::load(config.db_path.as_deref())?;
        schema::ensure_schema(&conn)?;
        debug!(
            path = ?config.db_path,
            max_memories = config.max_memories,
            auto_save_ms = config.auto_save_interval_ms,
            "memory store ready"
        );
        Ok(Self {
            conn,
            path: config.db_path.clone(),
            config,
            noise,
            dirty: false,
        })
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn noise(&self) -> &NoiseFilter {
        &self.noise
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // ── Store ────────────────────────────────────────────────

    /// Insert a new memory, evict any surplus beyond `max_memories`, then
    /// persist per the save policy. A write that triggers eviction is flushed
    /// once, after the surplus is gone.
    pub fn store(&mut self, input: NewMemory) -> Result<MemoryRecord, MemoryError> {
        let record = self.insert(input)?;
        self.dirty = true;
        if evict::run_eviction(self)?.evicted == 0 {
            self.mark_dirty()?;
        }
        Ok(record)
    }

    fn insert(&self, input: NewMemory) -> Result<MemoryRecord, MemoryError> {
        let now = now_timestamp();
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            category: input.category.unwrap_or_default(),
            importance: input.importance.unwrap_or(self.config.default_importance),
            created_at: now.clone(),
            updated_at: now,
            session_key: input.session_key,
            metadata: input.metadata,
            text: input.text,
        };
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO memories (id, text, text_lower, category, importance, created_at, updated_at, session_key, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.text,
                record.text.to_lowercase(),
                record.category.as_str(),
                record.importance,
                record.created_at,
                record.updated_at,
                record.session_key,
                metadata,
            ],
        )?;
        Ok(record)
    }

    // ── Forget ───────────────────────────────────────────────

    /// Delete by id when one is given, otherwise by what an unfiltered recall
    /// for `query` finds. Eviction is not run afterwards.
    pub fn forget(&mut self, request: &ForgetRequest) -> Result<ForgetResult, MemoryError> {
        let deleted = if let Some(id) = request.id.as_deref() {
            self.forget_by_id(id)?
        } else if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
            self.forget_by_query(query)?
        } else {
            0
        };
        Ok(ForgetResult { deleted })
    }

    pub fn forget_by_id(&mut self, id: &str) -> Result<usize, MemoryError> {
        let deleted = self
            .conn
            .execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        if deleted > 0 {
            self.mark_dirty()?;
        }
        Ok(deleted)
    }

    pub fn forget_by_query(&mut self, query: &str) -> Result<usize, MemoryError> {
        let matches = recall::recall(
            self,
            &RecallQuery::new(query)
                .limit(FORGET_QUERY_CAP)
                .filter_noise(false),
        )?;
        let ids: Vec<String> = matches.into_iter().map(|m| m.id).collect();
        let deleted = self.delete_ids(&ids)?;
        if deleted > 0 {
            self.mark_dirty()?;
        }
        Ok(deleted)
    }

    fn delete_ids(&self, ids: &[String]) -> SqlResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        self.conn.execute(
            &format!("DELETE FROM memories WHERE id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )
    }

    // ── Lookup ───────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        let mem = self
            .conn
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id],
                row_to_memory,
            )
            .optional()?;
        Ok(mem)
    }

    pub fn count(&self) -> Result<i64, MemoryError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?)
    }

    // ── Persistence ──────────────────────────────────────────

    /// Record an unsaved write. In write-through mode the image is flushed
    /// right away; otherwise the auto-save worker or shutdown picks it up.
    pub(crate) fn mark_dirty(&mut self) -> Result<(), MemoryError> {
        self.dirty = true;
        if self.config.auto_save_interval().is_none() {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the whole image to disk and clear the dirty flag. A store with
    /// no path only clears the flag.
    pub fn flush(&mut self) -> Result<(), MemoryError> {
        if let Some(path) = &self.path {
            persist::flush(&self.conn, path)?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn flush_if_dirty(&mut self) -> Result<bool, MemoryError> {
        if !self.dirty {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    // ── Stats ────────────────────────────────────────────────

    pub fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let (total, avg_importance, oldest, newest): (i64, f64, Option<String>, Option<String>) =
            self.conn.query_row(
                "SELECT COUNT(*), COALESCE(AVG(importance), 0.0), MIN(created_at), MAX(created_at)
                 FROM memories",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?;

        let mut stmt = self
            .conn
            .prepare("SELECT category, COUNT(*) FROM memories GROUP BY category")?;
        let by_category = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<SqlResult<BTreeMap<_, _>>>()?;

        Ok(MemoryStats {
            total,
            by_category,
            avg_importance,
            oldest,
            newest,
            dirty: self.dirty,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────

/// Millisecond-precision UTC timestamp. Fixed width, so string order is time
/// order.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a boundary category string. Unknown names are stored as `other`.
pub fn coerce_category(raw: &str) -> Category {
    raw.parse().unwrap_or_else(|e| {
        warn!(%e, "storing memory under 'other'");
        Category::Other
    })
}

pub(crate) fn row_to_memory(row: &rusqlite::Row) -> SqlResult<MemoryRecord> {
    let category: String = row.get(2)?;
    let category = category
        .parse::<Category>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let metadata = row
        .get::<_, Option<String>>(7)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        text: row.get(1)?,
        category,
        importance: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        session_key: row.get(6)?,
        metadata,
    })
}
