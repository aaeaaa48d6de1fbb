// ============================================================================
// aicook - command-line front end for the AICOOK assistant
// ============================================================================
// Usage:
//   aicook chat                             Talk to the assistant (with memory)
//   aicook remember "User prefers tea"      Store a canonical fact
//   aicook observe "I like Python"          Run extraction on an utterance
//   aicook recall "which language?" --k 3   Show the facts a turn would see
//   aicook forget "User likes tea" --yes    Delete similar facts
//   aicook list | stats | export | clear    Inspect and manage the store
// ============================================================================

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use aicook_core::memory::{FactQuery, ForgetReport, RememberOutcome};
use aicook_core::{ChatClient, MemoryConfig, MemoryManager, Session};
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// How long `chat` waits for background extractions before exiting
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// AICOOK assistant with long-term preference memory
#[derive(Parser)]
#[command(name = "aicook", version, about = "Personal AI assistant that remembers your preferences")]
struct Cli {
    /// Path to the memory database (default: ~/.aicook/memory.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Memory scope to read and write (default: AICOOK_USER or "default")
    #[arg(long, global = true)]
    user: Option<String>,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation
    Chat,

    #[command(flatten)]
    Memory(MemoryCommands),
}

/// Commands that need an open memory store
#[derive(Subcommand)]
enum MemoryCommands {
    /// Store a fact given in canonical form ("User prefers ...")
    Remember {
        fact: String,
    },

    /// Run fact extraction over an utterance and store the result
    Observe {
        utterance: String,
    },

    /// Show the facts recalled for a query, with scores
    Recall {
        query: String,

        /// Number of facts to return (default: MEMORY_TOP_K)
        #[arg(long)]
        k: Option<usize>,
    },

    /// Find facts similar to TEXT and delete them
    Forget {
        text: String,

        /// Minimum similarity for a fact to match
        #[arg(long)]
        threshold: Option<f32>,

        /// Maximum number of facts to remove
        #[arg(long)]
        top_n: Option<usize>,

        /// Delete the matches instead of previewing them
        #[arg(long)]
        yes: bool,
    },

    /// List every fact in the scope, oldest first
    List,

    /// Show store statistics
    Stats,

    /// Export the scope's facts
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Delete every fact in the scope
    Clear {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "aicook=debug,aicook_core=debug"
    } else {
        "aicook=info,aicook_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn format_timestamp(ts_millis: i64) -> String {
    Utc.timestamp_millis_opt(ts_millis)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts_millis))
}

fn load_config(cli: &Cli) -> Result<MemoryConfig> {
    let mut config = MemoryConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = &cli.db_path {
        config.store_path = Some(path.into());
    }
    if let Some(user) = &cli.user {
        config.scope = user.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let generator = Arc::new(ChatClient::from_config(&config));
    let scope = config.scope.as_str();
    debug!("Using scope {} with model {}", scope, config.model);

    let opened = MemoryManager::from_config(&config, generator.clone()).await;
    match cli.command {
        Commands::Chat => {
            // Chat keeps going without memory
            let memory = match opened {
                Ok(manager) => Some(Arc::new(manager)),
                Err(e) => {
                    warn!("Memory disabled for this session: {}", e);
                    None
                }
            };
            cmd_chat(&config, generator, memory).await
        }
        Commands::Memory(command) => {
            let memory = opened.context("Failed to open memory store")?;
            run_command(&memory, scope, command).await
        }
    }
}

async fn run_command(memory: &MemoryManager, scope: &str, command: MemoryCommands) -> Result<()> {
    match command {
        MemoryCommands::Remember { fact } => {
            let outcome = memory.remember_fact(scope, &fact).await?;
            print_outcome(&outcome);
            Ok(())
        }
        MemoryCommands::Observe { utterance } => {
            print_outcome(&memory.observe(scope, &utterance).await);
            Ok(())
        }
        MemoryCommands::Recall { query, k } => {
            let k = k.unwrap_or_else(|| memory.default_k());
            cmd_recall(memory, scope, &query, k).await
        }
        MemoryCommands::Forget {
            text,
            threshold,
            top_n,
            yes,
        } => {
            let report = memory.forget(scope, &text, threshold, top_n, yes).await?;
            print_forget(&report);
            Ok(())
        }
        MemoryCommands::List => cmd_list(memory, scope).await,
        MemoryCommands::Stats => cmd_stats(memory, scope).await,
        MemoryCommands::Export { format } => cmd_export(memory, scope, &format).await,
        MemoryCommands::Clear { yes } => {
            if !yes {
                anyhow::bail!("Refusing to clear scope '{}' without --yes", scope);
            }
            let removed = memory.clear(scope).await?;
            println!("Removed {} facts from scope '{}'", removed, scope);
            Ok(())
        }
    }
}

async fn cmd_chat(
    config: &MemoryConfig,
    generator: Arc<ChatClient>,
    memory: Option<Arc<MemoryManager>>,
) -> Result<()> {
    if let Some(memory) = &memory {
        if !memory.health_check().await {
            warn!("Memory store is not responding; recall will be empty until it recovers");
        }
    }
    let mut session = Session::from_config(config, generator, memory);
    info!("Chat session started for scope {}", session.scope());

    if let Some(greeting) = session.history().last() {
        println!("AICOOK: {}", greeting.content);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nYou: ");
        std::io::stdout().flush()?;

        // Ctrl-D closes stdin
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_lowercase().as_str(), "quit" | "exit" | "bye") {
            println!("AICOOK: Goodbye!");
            break;
        }

        match session.turn(input).await {
            Ok(reply) => {
                for fact in &reply.recalled {
                    debug!("Recalled: {}", fact);
                }
                println!("AICOOK: {}", reply.text);
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    let pending = session.pending();
    if pending > 0 {
        let finished = session.drain(DRAIN_TIMEOUT).await;
        debug!("Drained {}/{} pending extractions", finished, pending);
    }
    Ok(())
}

fn print_outcome(outcome: &RememberOutcome) {
    match outcome {
        RememberOutcome::Stored(id) => println!("Stored fact {}", id),
        RememberOutcome::Duplicate(id) => println!("Already known as {}", id),
        RememberOutcome::NoFact => println!("No fact found"),
        RememberOutcome::Degraded(e) => println!("Memory unavailable: {}", e),
    }
}

async fn cmd_recall(memory: &MemoryManager, scope: &str, query: &str, k: usize) -> Result<()> {
    let results = memory.recall_scored(scope, &FactQuery::new(query, k)).await?;

    if results.is_empty() {
        println!("No relevant memories.");
        return Ok(());
    }
    for r in &results {
        println!("{:.3}  [{}] {}", r.score, r.fact.created_date(), r.fact.text);
    }
    Ok(())
}

fn print_forget(report: &ForgetReport) {
    if report.matches.is_empty() {
        println!("No matching facts.");
        return;
    }

    for r in &report.matches {
        println!("{:.3}  {}  {}", r.score, r.fact.id, r.fact.text);
    }
    if report.confirmed {
        println!("Deleted {} facts.", report.deleted);
    } else {
        println!(
            "{} facts would be deleted. Re-run with --yes to delete them.",
            report.matches.len()
        );
    }
}

async fn cmd_list(memory: &MemoryManager, scope: &str) -> Result<()> {
    let facts = memory.list(scope).await?;

    if facts.is_empty() {
        println!("No facts stored for scope '{}'.", scope);
        return Ok(());
    }

    println!("{:<36}  {:<23}  TEXT", "ID", "CREATED");
    println!("{}", "-".repeat(100));
    for fact in &facts {
        println!(
            "{:<36}  {:<23}  {}",
            fact.id,
            format_timestamp(fact.created_at),
            fact.text
        );
    }
    println!("\n{} facts", facts.len());
    Ok(())
}

async fn cmd_stats(memory: &MemoryManager, scope: &str) -> Result<()> {
    let stats = memory.stats().await?;
    let in_scope = memory.count(scope).await?;

    println!("=== AICOOK Memory Stats ===");
    println!("Backend:   {}", stats.backend);
    println!("Location:  {}", stats.location);
    match &stats.embedding_space {
        Some(space) => println!("Embedding: {}", space),
        None => println!("Embedding: (not pinned yet, {})", memory.embedding_model()),
    }
    println!();
    println!("Facts:     {} total", stats.total_facts);
    println!("  {:12} {}", scope, in_scope);
    Ok(())
}

async fn cmd_export(memory: &MemoryManager, scope: &str, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let mut facts = memory.list(scope).await?;
    for fact in &mut facts {
        fact.embedding.clear();
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "scope": scope,
        "embedding_model": memory.embedding_model(),
        "facts": facts,
    });
    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
