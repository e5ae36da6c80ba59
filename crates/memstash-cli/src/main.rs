use clap::{Parser, Subcommand};
use memstash_core::{
    config::default_db_path, store::coerce_category, Category, ForgetRequest, MemoryDb,
    MemoryRecord, NewMemory, RecallQuery, StoreConfig,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memstash", about = "Persistent keyword memory for AI agents")]
struct Cli {
    /// Database file (defaults to ~/.memstash/memories.db)
    #[arg(long, global = true, env = "MEMSTASH_DB")]
    db: Option<PathBuf>,
    /// TOML file with store settings; flags override it
    #[arg(long, global = true, env = "MEMSTASH_CONFIG")]
    config: Option<PathBuf>,
    /// Record ceiling before the least important memories are evicted
    #[arg(long, global = true, env = "MEMSTASH_MAX_MEMORIES")]
    max_memories: Option<usize>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a memory
    Store {
        text: String,
        /// preference, fact, decision, entity, conversation or other
        #[arg(long)]
        category: Option<String>,
        /// Defaults to the configured default importance
        #[arg(long)]
        importance: Option<f64>,
        #[arg(long)]
        session_key: Option<String>,
        /// Arbitrary JSON payload kept alongside the memory
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Keyword search, ranked by importance then recency
    Recall {
        #[arg(default_value = "")]
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long)]
        category: Option<String>,
        /// Inclusive lower bound on created_at (ISO-8601)
        #[arg(long)]
        from: Option<String>,
        /// Inclusive upper bound on created_at (ISO-8601)
        #[arg(long)]
        to: Option<String>,
        /// Include acknowledgements and other filler
        #[arg(long)]
        include_noise: bool,
    },
    /// Delete memories
    Forget {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        query: Option<String>,
    },
    /// Show database statistics
    Stats,
}

fn load_config(cli: &Cli) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_toml_file(path)?,
        None => StoreConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db_path = Some(db.clone());
    }
    if config.db_path.is_none() {
        config.db_path = Some(default_db_path());
    }
    if let Some(max) = cli.max_memories {
        config.max_memories = max;
    }
    // One-shot process: nothing would be left to run a timer.
    config.auto_save_interval_ms = 0;
    Ok(config)
}

fn parse_recall_category(raw: Option<&str>) -> Result<Option<Category>, String> {
    raw.map(|c| c.parse::<Category>().map_err(|e| e.to_string()))
        .transpose()
}

fn print_memory(mem: &MemoryRecord) {
    let session = mem
        .session_key
        .as_deref()
        .map(|s| format!(" session={s}"))
        .unwrap_or_default();
    println!(
        "[{}] {} (imp: {:.2}, {}{session}) {}",
        mem.category, mem.text, mem.importance, mem.created_at, mem.id
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MEMSTASH_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    debug!(
        db = ?config.db_path,
        max_memories = config.max_memories,
        "resolved store config"
    );
    let mut db = match MemoryDb::open(config) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let outcome = run(&cli, &mut db);
    let closed = db.shutdown();
    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    if let Err(e) = closed {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli, db: &mut MemoryDb) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Command::Store {
            text,
            category,
            importance,
            session_key,
            metadata,
        } => {
            let metadata = metadata
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .map_err(|e| format!("--metadata is not valid JSON: {e}"))?;
            let mem = db.store(NewMemory {
                text: text.clone(),
                category: category.as_deref().map(coerce_category),
                importance: *importance,
                session_key: session_key.clone(),
                metadata,
            })?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&mem)?);
            } else if !cli.quiet {
                println!("Stored [{}] {} (id: {})", mem.category, mem.text, mem.id);
            }
        }
        Command::Recall {
            query,
            limit,
            category,
            from,
            to,
            include_noise,
        } => {
            let query = RecallQuery {
                query: query.clone(),
                limit: *limit,
                category: parse_recall_category(category.as_deref())?,
                date_from: from.clone(),
                date_to: to.clone(),
                filter_noise: !include_noise,
            };
            let results = db.recall(&query)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if !cli.quiet {
                if results.is_empty() {
                    println!("No memories found.");
                }
                for mem in &results {
                    print_memory(mem);
                }
            }
        }
        Command::Forget { id, query } => {
            if id.is_none() && query.is_none() {
                return Err("specify --id or --query".into());
            }
            let result = db.forget(&ForgetRequest {
                id: id.clone(),
                query: query.clone(),
            })?;
            if cli.json {
                println!("{}", serde_json::to_string(&result)?);
            } else if !cli.quiet {
                println!("Deleted {} memories.", result.deleted);
            }
        }
        Command::Stats => {
            let stats = db.stats()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if !cli.quiet {
                println!("Memories: {}", stats.total);
                for (category, count) in &stats.by_category {
                    println!("  {category}: {count}");
                }
                println!("Avg importance: {:.2}", stats.avg_importance);
                if let (Some(oldest), Some(newest)) = (&stats.oldest, &stats.newest) {
                    println!("Span: {oldest} .. {newest}");
                }
            }
        }
    }
    Ok(())
}
