use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of categories a stored memory can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Preference,
    Fact,
    Decision,
    Entity,
    Conversation,
    #[default]
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Preference,
        Category::Fact,
        Category::Decision,
        Category::Entity,
        Category::Conversation,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Preference => "preference",
            Category::Fact => "fact",
            Category::Decision => "decision",
            Category::Entity => "entity",
            Category::Conversation => "conversation",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preference" => Ok(Category::Preference),
            "fact" => Ok(Category::Fact),
            "decision" => Ok(Category::Decision),
            "entity" => Ok(Category::Entity),
            "conversation" => Ok(Category::Conversation),
            "other" => Ok(Category::Other),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// A stored memory as seen by callers. The lowercased match column never
/// leaves the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    pub category: Category,
    pub importance: f64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Input to the write path. Anything left unset is defaulted by the store.
#[derive(Debug, Clone, Default)]
pub struct NewMemory {
    pub text: String,
    pub category: Option<Category>,
    pub importance: Option<f64>,
    pub session_key: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewMemory {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub const DEFAULT_RECALL_LIMIT: usize = 5;

/// A recall request. `date_from` / `date_to` are inclusive bounds compared
/// against the stored ISO-8601 `created_at` strings.
#[derive(Debug, Clone)]
pub struct RecallQuery {
    pub query: String,
    pub limit: usize,
    pub category: Option<Category>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub filter_noise: bool,
}

impl Default for RecallQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: DEFAULT_RECALL_LIMIT,
            category: None,
            date_from: None,
            date_to: None,
            filter_noise: true,
        }
    }
}

impl RecallQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn between(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn filter_noise(mut self, filter: bool) -> Self {
        self.filter_noise = filter;
        self
    }
}

/// What to delete. `id` wins over `query` when both are set.
#[derive(Debug, Clone, Default)]
pub struct ForgetRequest {
    pub id: Option<String>,
    pub query: Option<String>,
}

impl ForgetRequest {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            query: None,
        }
    }

    pub fn by_query(query: impl Into<String>) -> Self {
        Self {
            id: None,
            query: Some(query.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgetResult {
    pub deleted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: i64,
    pub by_category: BTreeMap<String, i64>,
    pub avg_importance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest: Option<String>,
    pub dirty: bool,
}
