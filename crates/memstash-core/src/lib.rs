pub mod autosave;
pub mod config;
pub mod context;
pub mod evict;
pub mod memory;
pub mod noise;
pub mod persist;
pub mod recall;
pub mod schema;
pub mod store;

// Re-export key types for convenience.
pub use autosave::AutoSaver;
pub use config::StoreConfig;
pub use context::{ForgetParams, MemoryContext, RecallParams, StoreParams};
pub use evict::{run_eviction, EvictionResult};
pub use memory::{
    Category, ForgetRequest, ForgetResult, MemoryRecord, MemoryStats, NewMemory, RecallQuery,
};
pub use noise::NoiseFilter;
pub use recall::recall;
pub use store::MemoryStore;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory store is not initialized")]
    NotInitialized,
    #[error("storage I/O failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage image failure at {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("schema error: {0}")]
    Schema(#[source] rusqlite::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid noise pattern: {0}")]
    NoisePattern(#[from] regex::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("internal error: memory store lock poisoned")]
    Poisoned,
    #[error("internal error: cannot start auto-save worker: {0}")]
    Worker(#[source] std::io::Error),
}

/// Coarse classification of [`MemoryError`] for callers that only need to
/// know which kind of failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotInitialized,
    StorageIo,
    Schema,
    Database,
    Config,
    Metadata,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::StorageIo => "storage_io",
            ErrorKind::Schema => "schema",
            ErrorKind::Database => "database",
            ErrorKind::Config => "config",
            ErrorKind::Metadata => "metadata",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::NotInitialized => ErrorKind::NotInitialized,
            MemoryError::Io { .. } | MemoryError::Image { .. } => ErrorKind::StorageIo,
            MemoryError::Schema(_) => ErrorKind::Schema,
            MemoryError::Database(_) => ErrorKind::Database,
            MemoryError::Config(_) | MemoryError::NoisePattern(_) => ErrorKind::Config,
            MemoryError::Metadata(_) => ErrorKind::Metadata,
            MemoryError::Poisoned | MemoryError::Worker(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        MemoryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn image(path: &Path, source: rusqlite::Error) -> Self {
        MemoryError::Image {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Lifecycle wrapper around [`MemoryStore`].
///
/// A `MemoryDb` is ready from the moment `open` returns until `shutdown`
/// succeeds. Every call after that fails with [`MemoryError::NotInitialized`].
pub struct MemoryDb {
    store: Option<MemoryStore>,
}

impl MemoryDb {
    /// Load the image, make sure the schema exists and start accepting calls.
    pub fn open(config: StoreConfig) -> Result<Self, MemoryError> {
        let store = MemoryStore::open(config)?;
        Ok(Self { store: Some(store) })
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::open(StoreConfig::in_memory())
    }

    /// A handle that never opened. Useful for hosts that construct the
    /// context before the store is configured.
    pub fn uninitialized() -> Self {
        Self { store: None }
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_some()
    }

    fn ready(&self) -> Result<&MemoryStore, MemoryError> {
        self.store.as_ref().ok_or(MemoryError::NotInitialized)
    }

    fn ready_mut(&mut self) -> Result<&mut MemoryStore, MemoryError> {
        self.store.as_mut().ok_or(MemoryError::NotInitialized)
    }

    pub fn store(&mut self, input: NewMemory) -> Result<MemoryRecord, MemoryError> {
        self.ready_mut()?.store(input)
    }

    pub fn recall(&self, query: &RecallQuery) -> Result<Vec<MemoryRecord>, MemoryError> {
        recall::recall(self.ready()?, query)
    }

    pub fn forget(&mut self, request: &ForgetRequest) -> Result<ForgetResult, MemoryError> {
        self.ready_mut()?.forget(request)
    }

    pub fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        self.ready()?.get(id)
    }

    pub fn stats(&self) -> Result<MemoryStats, MemoryError> {
        self.ready()?.stats()
    }

    /// Flush when there are unsaved writes. Returns whether a flush happened.
    pub fn flush_if_dirty(&mut self) -> Result<bool, MemoryError> {
        self.ready_mut()?.flush_if_dirty()
    }

    /// Final flush, then release the image. Calling it again is a no-op.
    ///
    /// If the flush fails the handle stays open so the caller can retry.
    pub fn shutdown(&mut self) -> Result<(), MemoryError> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        store.flush_if_dirty()?;
        self.store = None;
        info!("memory store closed");
        Ok(())
    }
}

impl Drop for MemoryDb {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "failed to flush memory store on drop");
        }
    }
}
