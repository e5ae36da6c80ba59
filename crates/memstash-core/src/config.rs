use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::MemoryError;

pub const DEFAULT_MAX_MEMORIES: usize = 10_000;
pub const DEFAULT_IMPORTANCE: f64 = 0.7;

/// Filler replies that carry no information worth recalling. Each entry is
/// matched case-insensitively against the whole text.
pub const DEFAULT_NOISE_PATTERNS: &[&str] = &[
    r"(ok|okay|k|kk|yes|yeah|yep|no|nope|sure|fine|alright|cool|nice|great)[.!?]*",
    r"(thanks|thank you|thx|ty|got it|sounds good|will do|noted)[.!?]*",
    r"(hi|hello|hey|bye|goodbye)[.!?]*",
    r"\s*",
];

/// Store configuration. Missing fields fall back to their defaults when
/// deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. `None` keeps the image purely in memory.
    pub db_path: Option<PathBuf>,
    pub max_memories: usize,
    pub default_importance: f64,
    pub noise_patterns: Vec<String>,
    /// 0 flushes on every write; anything else flushes on a timer and at
    /// shutdown.
    pub auto_save_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: Some(default_db_path()),
            max_memories: DEFAULT_MAX_MEMORIES,
            default_importance: DEFAULT_IMPORTANCE,
            noise_patterns: DEFAULT_NOISE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            auto_save_interval_ms: 0,
        }
    }
}

impl StoreConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            ..Default::default()
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, MemoryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MemoryError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, MemoryError> {
        toml::from_str(raw).map_err(|e| MemoryError::Config(format!("invalid config: {e}")))
    }

    /// `None` means write-through.
    pub fn auto_save_interval(&self) -> Option<Duration> {
        match self.auto_save_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.max_memories == 0 {
            return Err(MemoryError::Config(
                "max_memories must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memstash")
        .join("memories.db")
}
