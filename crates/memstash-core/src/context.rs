//! Request/response surface for the host agent.
//!
//! The host calls [`MemoryContext::init`] once and then passes the returned
//! context into every handler call. All calls are serialized through one
//! lock around the [`MemoryDb`]; when write-back is configured the context
//! also owns the [`AutoSaver`] that flushes on a timer.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::autosave::AutoSaver;
use crate::config::StoreConfig;
use crate::memory::{
    Category, ForgetRequest, ForgetResult, MemoryRecord, MemoryStats, NewMemory, RecallQuery,
    DEFAULT_RECALL_LIMIT,
};
use crate::store::coerce_category;
use crate::{MemoryDb, MemoryError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreParams {
    pub text: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallParams {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
    #[serde(default)]
    pub filter_noise: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgetParams {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
}

impl From<StoreParams> for NewMemory {
    fn from(p: StoreParams) -> Self {
        NewMemory {
            text: p.text,
            category: p.category.as_deref().map(coerce_category),
            importance: p.importance,
            session_key: p.session_key,
            metadata: p.metadata,
        }
    }
}

impl From<ForgetParams> for ForgetRequest {
    fn from(p: ForgetParams) -> Self {
        ForgetRequest {
            id: p.id,
            query: p.query,
        }
    }
}

/// Shared handle to an initialized store. Cloning is cheap and every clone
/// talks to the same store.
#[derive(Clone)]
pub struct MemoryContext {
    db: Arc<Mutex<MemoryDb>>,
    autosave: Arc<Mutex<Option<AutoSaver>>>,
}

impl MemoryContext {
    pub fn init(config: StoreConfig) -> Result<Self, MemoryError> {
        let interval = config.auto_save_interval();
        let db = Arc::new(Mutex::new(MemoryDb::open(config)?));
        let autosave = match interval {
            Some(every) => Some(AutoSaver::spawn(Arc::clone(&db), every)?),
            None => None,
        };
        Ok(Self {
            db,
            autosave: Arc::new(Mutex::new(autosave)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryDb>, MemoryError> {
        self.db.lock().map_err(|_| MemoryError::Poisoned)
    }

    pub fn memory_store(&self, params: StoreParams) -> Result<MemoryRecord, MemoryError> {
        self.lock()?.store(params.into())
    }

    pub fn memory_recall(&self, params: RecallParams) -> Result<Vec<MemoryRecord>, MemoryError> {
        let db = self.lock()?;
        let category = match params.category.as_deref() {
            None => None,
            Some(raw) => match raw.parse::<Category>() {
                Ok(category) => Some(category),
                // No stored record can carry an unknown category.
                Err(_) => {
                    return if db.is_ready() {
                        Ok(vec![])
                    } else {
                        Err(MemoryError::NotInitialized)
                    }
                }
            },
        };
        let query = RecallQuery {
            query: params.query,
            limit: params.limit.unwrap_or(DEFAULT_RECALL_LIMIT),
            category,
            date_from: params.date_from,
            date_to: params.date_to,
            filter_noise: params.filter_noise.unwrap_or(true),
        };
        db.recall(&query)
    }

    pub fn memory_forget(&self, params: ForgetParams) -> Result<ForgetResult, MemoryError> {
        self.lock()?.forget(&params.into())
    }

    pub fn memory_stats(&self) -> Result<MemoryStats, MemoryError> {
        self.lock()?.stats()
    }

    pub fn is_ready(&self) -> bool {
        self.lock().map(|db| db.is_ready()).unwrap_or(false)
    }

    /// Flush once more, close the store and stop the auto-save worker.
    /// Later calls on any clone fail with `NotInitialized`; calling this again
    /// is a no-op.
    ///
    /// If the final flush fails the store stays open and the worker keeps
    /// running, so pending writes are still retried on its timer.
    pub fn shutdown(&self) -> Result<(), MemoryError> {
        // The db lock must be released before joining the worker, which takes
        // the same lock on every tick.
        self.lock()?.shutdown()?;
        let worker = self
            .autosave
            .lock()
            .map_err(|_| MemoryError::Poisoned)?
            .take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    fn ctx() -> MemoryContext {
        MemoryContext::init(StoreConfig::in_memory()).unwrap()
    }

    fn store(ctx: &MemoryContext, text: &str, category: &str, importance: f64) -> MemoryRecord {
        ctx.memory_store(StoreParams {
            text: text.into(),
            category: Some(category.into()),
            importance: Some(importance),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let p: RecallParams = serde_json::from_value(json!({ "query": "rust" })).unwrap();
        assert_eq!(p.query, "rust");
        assert!(p.limit.is_none());
        assert!(p.filter_noise.is_none());

        let p: StoreParams = serde_json::from_value(json!({
            "text": "likes tea",
            "session_key": "s1",
            "metadata": { "k": 1 }
        }))
        .unwrap();
        assert_eq!(p.session_key.as_deref(), Some("s1"));
        assert_eq!(p.metadata, Some(json!({ "k": 1 })));
    }

    #[test]
    fn store_then_recall_through_context() {
        let ctx = ctx();
        let mem = store(&ctx, "Prefers concise answers", "preference", 0.8);

        let results = ctx
            .memory_recall(RecallParams {
                query: "concise".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, mem.id);
        assert_eq!(results[0].category, Category::Preference);
    }

    #[test]
    fn unknown_store_category_becomes_other() {
        let ctx = ctx();
        let mem = store(&ctx, "plays chess", "hobby", 0.5);
        assert_eq!(mem.category, Category::Other);
    }

    #[test]
    fn unknown_recall_category_matches_nothing() {
        let ctx = ctx();
        store(&ctx, "plays chess", "other", 0.5);

        let results = ctx
            .memory_recall(RecallParams {
                category: Some("hobby".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn recall_limit_defaults_to_five() {
        let ctx = ctx();
        for i in 0..8 {
            store(&ctx, &format!("fact number {i}"), "fact", 0.5);
        }
        let results = ctx.memory_recall(RecallParams::default()).unwrap();
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn forget_reports_deleted_count() {
        let ctx = ctx();
        let mem = store(&ctx, "temporary", "other", 0.5);
        let result = ctx
            .memory_forget(ForgetParams {
                id: Some(mem.id),
                query: None,
            })
            .unwrap();
        assert_eq!(result, ForgetResult { deleted: 1 });
        assert_eq!(ctx.memory_stats().unwrap().total, 0);
    }

    #[test]
    fn clones_share_one_store_and_one_lifecycle() {
        let ctx = ctx();
        let other = ctx.clone();
        store(&ctx, "shared", "other", 0.5);
        assert_eq!(other.memory_stats().unwrap().total, 1);

        other.shutdown().unwrap();
        assert!(!ctx.is_ready());
        let err = ctx.memory_stats().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        let err = ctx
            .memory_recall(RecallParams {
                category: Some("hobby".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        ctx.shutdown().unwrap();
    }

    #[test]
    fn huge_recall_limit_is_served_and_keeps_the_store_usable() {
        let ctx = ctx();
        store(&ctx, "hello world", "fact", 0.5);

        let results = ctx
            .memory_recall(RecallParams {
                query: "hello".into(),
                limit: Some(usize::MAX),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(ctx.memory_stats().unwrap().total, 1);
    }

    #[test]
    fn failed_shutdown_keeps_the_auto_save_timer_running() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("mem.db");
        let ctx = MemoryContext::init(StoreConfig {
            auto_save_interval_ms: 20,
            ..StoreConfig::with_path(&path)
        })
        .unwrap();

        store(&ctx, "first", "fact", 0.5);
        let err = ctx.shutdown().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageIo);
        assert!(ctx.is_ready());

        std::fs::remove_file(&blocker).unwrap();
        store(&ctx, "second", "fact", 0.5);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !path.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(path.exists(), "timer should flush once the path is writable");

        ctx.shutdown().unwrap();
        assert!(!ctx.is_ready());
    }

    #[test]
    fn write_back_context_flushes_at_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.db");
        let config = StoreConfig {
            auto_save_interval_ms: 3_600_000,
            ..StoreConfig::with_path(&path)
        };

        let ctx = MemoryContext::init(config.clone()).unwrap();
        store(&ctx, "survives restart", "fact", 0.9);
        assert!(!path.exists());
        ctx.shutdown().unwrap();
        assert!(path.exists());

        let reopened = MemoryContext::init(config).unwrap();
        let results = reopened
            .memory_recall(RecallParams {
                query: "restart".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        reopened.shutdown().unwrap();
    }
}
