use rusqlite::params_from_iter;
use rusqlite::types::Value;
use tracing::trace;

use crate::memory::{MemoryRecord, RecallQuery};
use crate::store::{row_to_memory, MemoryStore, MEMORY_COLUMNS};
use crate::MemoryError;

/// Rows fetched per requested result, so noise filtering has something to
/// fall back on.
const OVERFETCH_FACTOR: usize = 2;

/// Tokens this short match nearly everything and are dropped.
const MIN_TOKEN_CHARS: usize = 2;

/// Keyword recall.
///
/// 1. Split the query into lowercase tokens longer than one character
/// 2. Keep memories whose text contains any token, plus category/date filters
/// 3. Rank by importance, then recency
/// 4. Fetch `2 × limit`, drop noise, truncate to `limit`
///
/// Over-fetching is a heuristic: when more than `limit` of the fetched rows are
/// noise, fewer than `limit` results come back even if valid matches exist
/// further down.
pub fn recall(store: &MemoryStore, query: &RecallQuery) -> Result<Vec<MemoryRecord>, MemoryError> {
    if query.limit == 0 {
        return Ok(vec![]);
    }

    let compiled = compile(query);
    let mut stmt = store.conn().prepare(&compiled.sql)?;
    let rows = stmt.query_map(params_from_iter(compiled.params.iter()), row_to_memory)?;

    let mut results = Vec::new();
    let mut suppressed = 0usize;
    for row in rows {
        let mem = row?;
        if query.filter_noise && store.noise().is_noise(&mem.text) {
            suppressed += 1;
            continue;
        }
        results.push(mem);
    }
    results.truncate(query.limit);

    trace!(
        returned = results.len(),
        suppressed,
        limit = query.limit,
        "recall finished"
    );
    Ok(results)
}

/// Lowercased whitespace-separated tokens with single characters removed.
pub fn tokenize(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug)]
struct CompiledQuery {
    sql: String,
    params: Vec<Value>,
}

fn compile(query: &RecallQuery) -> CompiledQuery {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    let tokens = tokenize(&query.query);
    if !tokens.is_empty() {
        let any_token = vec!["instr(text_lower, ?) > 0"; tokens.len()].join(" OR ");
        clauses.push(format!("({any_token})"));
        params.extend(tokens.into_iter().map(Value::Text));
    }
    if let Some(category) = query.category {
        clauses.push("category = ?".to_string());
        params.push(Value::Text(category.as_str().to_string()));
    }
    if let Some(from) = &query.date_from {
        clauses.push("created_at >= ?".to_string());
        params.push(Value::Text(from.clone()));
    }
    if let Some(to) = &query.date_to {
        clauses.push("created_at <= ?".to_string());
        params.push(Value::Text(to.clone()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let fetch = query.limit.saturating_mul(OVERFETCH_FACTOR);
    params.push(Value::Integer(i64::try_from(fetch).unwrap_or(i64::MAX)));

    CompiledQuery {
        sql: format!(
            "SELECT {MEMORY_COLUMNS} FROM memories{where_clause}
             ORDER BY importance DESC, created_at DESC, rowid DESC
             LIMIT ?"
        ),
        params,
    }
}
