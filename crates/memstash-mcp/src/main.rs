use clap::Parser;
use memstash_core::{
    config::default_db_path, ForgetParams, MemoryContext, MemoryError, RecallParams,
    StoreConfig, StoreParams,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize, JsonSchema)]
struct StoreToolParams {
    /// Text to remember
    text: String,
    /// preference, fact, decision, entity, conversation or other
    category: Option<String>,
    /// 0.0 to 1.0; higher survives eviction longer and ranks first
    importance: Option<f64>,
    session_key: Option<String>,
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RecallToolParams {
    #[serde(default)]
    query: String,
    limit: Option<usize>,
    category: Option<String>,
    /// Inclusive lower bound on created_at (ISO-8601)
    date_from: Option<String>,
    /// Inclusive upper bound on created_at (ISO-8601)
    date_to: Option<String>,
    filter_noise: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ForgetToolParams {
    id: Option<String>,
    query: Option<String>,
}

impl From<StoreToolParams> for StoreParams {
    fn from(p: StoreToolParams) -> Self {
        StoreParams {
            text: p.text,
            category: p.category,
            importance: p.importance,
            session_key: p.session_key,
            metadata: p.metadata,
        }
    }
}

impl From<RecallToolParams> for RecallParams {
    fn from(p: RecallToolParams) -> Self {
        RecallParams {
            query: p.query,
            limit: p.limit,
            category: p.category,
            date_from: p.date_from,
            date_to: p.date_to,
            filter_noise: p.filter_noise,
        }
    }
}

fn tool_error(e: &MemoryError) -> CallToolResult {
    let payload = serde_json::json!({ "error": e.kind().as_str(), "message": e.to_string() });
    CallToolResult::error(vec![Content::text(payload.to_string())])
}

fn internal_error(message: &str) -> CallToolResult {
    let payload = serde_json::json!({ "error": "internal", "message": message });
    CallToolResult::error(vec![Content::text(payload.to_string())])
}

fn success_json(value: Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(value.to_string())])
}

fn success_json_pretty<T: Serialize>(value: &T) -> CallToolResult {
    match serde_json::to_string_pretty(value) {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(e) => internal_error(&format!("cannot serialize response: {e}")),
    }
}

#[derive(Clone)]
struct MemstashServer {
    context: MemoryContext,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MemstashServer {
    fn new(context: MemoryContext) -> Self {
        Self {
            context,
            tool_router: Self::tool_router(),
        }
    }

    /// Run a store call on the blocking pool; the context serializes access
    /// with its own lock.
    async fn with_context_blocking<R, F>(
        &self,
        f: F,
    ) -> Result<Result<R, CallToolResult>, McpError>
    where
        R: Send + 'static,
        F: FnOnce(&MemoryContext) -> Result<R, MemoryError> + Send + 'static,
    {
        let context = self.context.clone();
        match tokio::task::spawn_blocking(move || f(&context).map_err(|e| tool_error(&e))).await {
            Ok(result) => Ok(result),
            Err(_) => Ok(Err(internal_error("blocking task failed"))),
        }
    }

    #[tool(
        name = "memory_store",
        description = "Remember a piece of text with an optional category, importance, session key and JSON metadata."
    )]
    async fn memory_store(
        &self,
        params: Parameters<StoreToolParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = StoreParams::from(params.0);
        match self
            .with_context_blocking(move |ctx| ctx.memory_store(params))
            .await?
        {
            Ok(mem) => Ok(success_json_pretty(&mem)),
            Err(error) => Ok(error),
        }
    }

    #[tool(
        name = "memory_recall",
        description = "Keyword search over stored memories, ranked by importance then recency. Acknowledgements like 'ok' are filtered unless filter_noise is false."
    )]
    async fn memory_recall(
        &self,
        params: Parameters<RecallToolParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = RecallParams::from(params.0);
        match self
            .with_context_blocking(move |ctx| ctx.memory_recall(params))
            .await?
        {
            Ok(results) => Ok(success_json_pretty(&results)),
            Err(error) => Ok(error),
        }
    }

    #[tool(
        name = "memory_forget",
        description = "Delete a memory by id, or every memory a keyword query matches."
    )]
    async fn memory_forget(
        &self,
        params: Parameters<ForgetToolParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if p.id.is_none() && p.query.is_none() {
            return Ok(CallToolResult::error(vec![Content::text(
                "Provide 'id' or 'query'".to_string(),
            )]));
        }
        let params = ForgetParams {
            id: p.id,
            query: p.query,
        };
        match self
            .with_context_blocking(move |ctx| ctx.memory_forget(params))
            .await?
        {
            Ok(result) => Ok(success_json(serde_json::json!({ "deleted": result.deleted }))),
            Err(error) => Ok(error),
        }
    }

    #[tool(name = "memory_stats", description = "Get memory statistics.")]
    async fn memory_stats(&self) -> Result<CallToolResult, McpError> {
        match self
            .with_context_blocking(|ctx| ctx.memory_stats())
            .await?
        {
            Ok(stats) => Ok(success_json_pretty(&stats)),
            Err(error) => Ok(error),
        }
    }
}

#[tool_handler]
impl ServerHandler for MemstashServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Persistent memory for AI agents. Store short notes with a category and \
                 importance, recall them by keyword, forget them by id or query."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "memstash-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Parser)]
#[command(name = "memstash-mcp", about = "MCP stdio server for memstash")]
struct Args {
    #[arg(long, env = "MEMSTASH_DB")]
    db: Option<PathBuf>,
    #[arg(long, env = "MEMSTASH_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "MEMSTASH_MAX_MEMORIES")]
    max_memories: Option<usize>,
    /// 0 writes through on every change
    #[arg(long, env = "MEMSTASH_AUTO_SAVE_MS")]
    auto_save_ms: Option<u64>,
}

fn load_config(args: &Args) -> Result<StoreConfig, MemoryError> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::from_toml_file(path)?,
        None => StoreConfig::default(),
    };
    if let Some(db) = &args.db {
        config.db_path = Some(db.clone());
    }
    if config.db_path.is_none() {
        config.db_path = Some(default_db_path());
    }
    if let Some(max) = args.max_memories {
        config.max_memories = max;
    }
    if let Some(ms) = args.auto_save_ms {
        config.auto_save_interval_ms = ms;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memstash_core::ErrorKind;

    fn server() -> MemstashServer {
        MemstashServer::new(MemoryContext::init(StoreConfig::in_memory()).expect("context"))
    }

    fn tool_result_json_text(result: &CallToolResult) -> serde_json::Value {
        let outer = serde_json::to_value(result).expect("serialize tool result");
        let text = outer["content"][0]["text"]
            .as_str()
            .expect("text content payload");
        serde_json::from_str(text).expect("inner json payload")
    }

    fn is_error(result: &CallToolResult) -> bool {
        let outer = serde_json::to_value(result).expect("serialize tool result");
        outer["isError"] == serde_json::Value::Bool(true)
    }

    fn store_params(text: &str, category: &str, importance: f64) -> StoreToolParams {
        StoreToolParams {
            text: text.to_string(),
            category: Some(category.to_string()),
            importance: Some(importance),
            session_key: None,
            metadata: None,
        }
    }

    fn recall_params(query: &str) -> RecallToolParams {
        RecallToolParams {
            query: query.to_string(),
            limit: None,
            category: None,
            date_from: None,
            date_to: None,
            filter_noise: None,
        }
    }

    #[test]
    fn tool_error_names_the_kind() {
        let result = tool_error(&MemoryError::NotInitialized);
        assert!(is_error(&result));
        let value = tool_result_json_text(&result);
        assert_eq!(value["error"], ErrorKind::NotInitialized.as_str());
    }

    #[test]
    fn env_style_args_override_config_defaults() {
        let args = Args::try_parse_from([
            "memstash-mcp",
            "--db",
            "/tmp/mcp.db",
            "--max-memories",
            "50",
            "--auto-save-ms",
            "1500",
        ])
        .expect("args");
        let config = load_config(&args).expect("config");
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/mcp.db")));
        assert_eq!(config.max_memories, 50);
        assert_eq!(config.auto_save_interval_ms, 1500);
    }

    #[tokio::test]
    async fn store_then_recall_returns_record() {
        let server = server();
        let stored = server
            .memory_store(Parameters(StoreToolParams {
                session_key: Some("s-42".to_string()),
                metadata: Some(serde_json::json!({ "source": "chat" })),
                ..store_params("Deploys happen on Thursdays", "fact", 0.8)
            }))
            .await
            .expect("tool call should succeed");
        let stored = tool_result_json_text(&stored);
        assert_eq!(stored["category"], "fact");
        assert!(stored["id"].is_string());

        let recalled = server
            .memory_recall(Parameters(recall_params("thursdays")))
            .await
            .expect("tool call should succeed");
        let recalled = tool_result_json_text(&recalled);
        assert_eq!(recalled.as_array().map(Vec::len), Some(1));
        assert_eq!(recalled[0]["id"], stored["id"]);
        assert_eq!(recalled[0]["session_key"], "s-42");
        assert_eq!(recalled[0]["metadata"]["source"], "chat");
    }

    #[tokio::test]
    async fn recall_with_unknown_category_is_empty() {
        let server = server();
        server
            .memory_store(Parameters(store_params("likes green tea", "preference", 0.7)))
            .await
            .expect("store");

        let result = server
            .memory_recall(Parameters(RecallToolParams {
                category: Some("hobby".to_string()),
                ..recall_params("")
            }))
            .await
            .expect("tool call should succeed");
        assert!(!is_error(&result));
        assert_eq!(tool_result_json_text(&result), serde_json::json!([]));
    }

    #[tokio::test]
    async fn forget_requires_id_or_query() {
        let server = server();
        let result = server
            .memory_forget(Parameters(ForgetToolParams {
                id: None,
                query: None,
            }))
            .await
            .expect("tool call should succeed");
        assert!(is_error(&result));
    }

    #[tokio::test]
    async fn forget_by_query_reports_count_and_updates_stats() {
        let server = server();
        for text in ["release train notes", "release checklist", "lunch order"] {
            server
                .memory_store(Parameters(store_params(text, "fact", 0.5)))
                .await
                .expect("store");
        }

        let result = server
            .memory_forget(Parameters(ForgetToolParams {
                id: None,
                query: Some("release".to_string()),
            }))
            .await
            .expect("tool call should succeed");
        assert_eq!(tool_result_json_text(&result)["deleted"], 2);

        let stats = server.memory_stats().await.expect("stats");
        assert_eq!(tool_result_json_text(&stats)["total"], 1);
    }

    #[tokio::test]
    async fn tools_after_shutdown_report_not_initialized() {
        let server = server();
        server.context.shutdown().expect("shutdown");

        let result = server.memory_stats().await.expect("tool call should succeed");
        assert!(is_error(&result));
        assert_eq!(tool_result_json_text(&result)["error"], "not_initialized");
    }

    #[tokio::test]
    async fn concurrent_store_and_recall_succeed_without_internal_errors() {
        let server = server();
        let seed = server
            .memory_store(Parameters(store_params("seed note", "conversation", 0.5)))
            .await
            .expect("seed write should succeed");
        assert!(!is_error(&seed));

        // Sync store work must stay off the async runtime threads.
        let store_server = server.clone();
        let store_a = tokio::spawn(async move {
            store_server
                .memory_store(Parameters(store_params("parallel note a", "conversation", 0.5)))
                .await
        });

        let recall_server = server.clone();
        let recall_a = tokio::spawn(async move {
            recall_server
                .memory_recall(Parameters(recall_params("note")))
                .await
        });

        let store_b = server.memory_store(Parameters(store_params(
            "parallel note b",
            "conversation",
            0.5,
        )));
        let recall_b = server.memory_recall(Parameters(recall_params("parallel")));

        let (store_b_res, recall_b_res, store_a_join, recall_a_join) =
            tokio::join!(store_b, recall_b, store_a, recall_a);

        let store_b_res = store_b_res.expect("inline store should complete");
        let recall_b_res = recall_b_res.expect("inline recall should complete");
        let store_a_res = store_a_join
            .expect("spawned store task should join")
            .expect("spawned store should complete");
        let recall_a_res = recall_a_join
            .expect("spawned recall task should join")
            .expect("spawned recall should complete");

        for result in [&store_b_res, &recall_b_res, &store_a_res, &recall_a_res] {
            assert!(!is_error(result), "tool call should not return an error payload");
            let outer = serde_json::to_value(result).expect("serialize tool result");
            let text = outer["content"][0]["text"]
                .as_str()
                .expect("tool payload should include text");
            assert!(!text.contains("internal"));
        }

        let stats = server.memory_stats().await.expect("stats");
        assert_eq!(tool_result_json_text(&stats)["total"], 3);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MEMSTASH_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    if let Some(path) = &config.db_path {
        info!(db = %path.display(), max_memories = config.max_memories, "opening memory store");
    }
    let context = MemoryContext::init(config)?;
    info!("memstash-mcp ready");

    let server = MemstashServer::new(context.clone());
    let service = server.serve(stdio()).await?;
    let waited = service.waiting().await;
    info!("client disconnected, shutting down");
    context.shutdown()?;
    waited?;
    Ok(())
}
