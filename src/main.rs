use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skein_agent::{Engine, Graph, TurnOutcome};
use skein_core::config::{AppConfig, EngineConfig, ModelConfig, StoreConfig, ToolsConfig};
use skein_core::event::EventBus;
use skein_core::traits::{Agent, PersistenceStore};
use skein_core::types::{EngineEvent, Message, Role};
use skein_llm::ChatAgent;
use skein_memory::{MemoryStore, SqliteStore};
use skein_tools::{ToolDispatcher, ToolRegistry, ToolRequestTable};

const DEFAULT_AGENT: &str = "chat";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer concisely.";

#[derive(Parser)]
#[command(name = "skein", version, about = "Workflow engine for multi-agent conversations")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "skein.toml")]
    config: PathBuf,

    /// Conversation ID to resume (auto-generated if not provided)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive REPL mode
    Repl,
    /// Run a single prompt and exit
    Run {
        /// The prompt to send
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Show current configuration
    Config,
    /// List stored conversations
    Conversations {
        /// Delete the conversation with this id instead of listing
        #[arg(long)]
        delete: Option<String>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skein=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "skein", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Some(Commands::Conversations { ref delete }) => {
            return list_conversations(&config, delete.as_deref());
        }
        _ => {}
    }

    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace).ok();

    let store: Arc<dyn PersistenceStore> = if config.store.in_memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::open(&config.store_path())?)
    };
    let event_bus = Arc::new(EventBus::default());

    let mut registry = ToolRegistry::with_builtins();
    registry.retain(&config.tools.enabled);
    let tool_names: Vec<String> = registry.list().into_iter().map(String::from).collect();
    let dispatcher = Arc::new(
        ToolDispatcher::new(Arc::new(ToolRequestTable::new()), Arc::new(registry))
            .with_event_bus(event_bus.clone()),
    );

    let agents = build_agents(&config, &tool_names);
    let graph = match config.graph {
        Some(ref graph) => Graph::from_config(graph, &agents)?,
        None => {
            let id = config
                .engine
                .default_agent
                .clone()
                .filter(|id| agents.contains_key(id))
                .or_else(|| agents.keys().min().cloned())
                .unwrap_or_else(|| DEFAULT_AGENT.to_string());
            let agent = agents
                .get(&id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("agent '{}' is not configured", id))?;
            Graph::chat(&id, agent)
        }
    };

    let mut builder = Engine::builder(graph, store)
        .config(&config.engine)
        .tools(dispatcher)
        .event_bus(event_bus.clone());
    if let Some(ref id) = cli.session {
        builder = builder.conversation(id);
    }
    let engine = Arc::new(builder.build().await?);
    info!(conversation_id = %engine.conversation_id(), "Conversation ready");

    let cancel = CancellationToken::new();
    let poller = engine.tool_poller().map(|p| p.with_config(&config.tools));
    let poller_handle = poller.map(|p| tokio::spawn(p.run(cancel.clone())));

    let result = match cli.command {
        Some(Commands::Run { prompt }) => {
            let text = if prompt.is_empty() {
                // Read from stdin
                io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                prompt.join(" ")
            };
            run_once(&engine, &text).await
        }
        _ => run_repl(&engine, &tool_names).await,
    };

    cancel.cancel();
    if let Some(handle) = poller_handle {
        handle.await.ok();
    }
    result
}

/// Load the config file, falling back to `~/.skein/config.toml`, then to
/// environment variables.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".skein").join("config.toml"));
    if let Some(ref path) = home_config {
        if path.exists() {
            info!(path = %path.display(), "Loading config from home directory");
            return Ok(AppConfig::load(path)?);
        }
    }

    eprintln!("Warning: No config file found. Set OPENAI_API_KEY or create skein.toml");
    create_env_config()
}

/// Create a minimal config from environment variables.
fn create_env_config() -> anyhow::Result<AppConfig> {
    Ok(AppConfig {
        engine: EngineConfig::default(),
        model: ModelConfig {
            provider: std::env::var("SKEIN_PROVIDER").unwrap_or_else(|_| "openai".to_string()),
            model_id: std::env::var("SKEIN_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: std::env::var("SKEIN_BASE_URL").ok(),
            max_tokens: 4096,
            temperature: 0.0,
            retry: None,
        },
        agents: HashMap::new(),
        tools: ToolsConfig::default(),
        store: StoreConfig::default(),
        graph: None,
    })
}

fn build_agents(config: &AppConfig, tool_names: &[String]) -> HashMap<String, Arc<dyn Agent>> {
    let mut ids: Vec<&String> = config.agents.keys().collect();
    let default_id = DEFAULT_AGENT.to_string();
    if ids.is_empty() {
        ids.push(&default_id);
    }

    ids.into_iter()
        .map(|id| {
            let prompt = config
                .agents
                .get(id)
                .and_then(|a| a.system_prompt.clone())
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
            let agent = ChatAgent::new(id.as_str(), config.model_for(id).clone())
                .with_system_prompt(prompt)
                .with_tools(tool_names);
            (id.clone(), Arc::new(agent) as Arc<dyn Agent>)
        })
        .collect()
}

fn list_conversations(config: &AppConfig, delete: Option<&str>) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.store_path())?;
    if let Some(id) = delete {
        if store.delete(id)? {
            println!("Deleted {}", id);
        } else {
            println!("No conversation {}", id);
        }
        return Ok(());
    }

    let conversations = store.list_conversations()?;
    if conversations.is_empty() {
        println!("No conversations yet.");
    }
    for c in conversations {
        println!(
            "{}  {}  {}",
            c.conversation_id,
            c.updated_at.format("%Y-%m-%d %H:%M"),
            c.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

async fn run_once(engine: &Arc<Engine>, text: &str) -> anyhow::Result<()> {
    let mut events = engine.event_bus().subscribe();
    let outcome = engine.process_message(text).await?;
    print_outcome(&outcome);

    // Wait for background tools started by this turn.
    let mut waiting: HashSet<String> = outcome
        .replies
        .iter()
        .filter(|m| m.metadata.extra.contains_key("pending"))
        .filter_map(|m| m.metadata.request_id.clone())
        .collect();
    let wait = async {
        while !waiting.is_empty() {
            match events.recv().await {
                Ok(EngineEvent::ToolReconciled { request_id, .. }) => {
                    if waiting.remove(&request_id) {
                        print_follow_ups(&engine.state().messages(), &request_id);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .is_err()
    {
        warn!("Timed out waiting for background tools");
    }
    Ok(())
}

async fn run_repl(engine: &Arc<Engine>, tool_names: &[String]) -> anyhow::Result<()> {
    println!("Skein v{}", env!("CARGO_PKG_VERSION"));
    println!("Conversation: {}", engine.conversation_id());
    if let Some(title) = engine.state().title() {
        println!("Title: {}", title);
    }
    println!("Commands: /rename <title>, /tools, /debug, /exit\n");

    let debug = Arc::new(AtomicBool::new(false));
    let printer = spawn_event_printer(engine.clone(), debug.clone());

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break; // EOF
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
        match command {
            "/exit" | "/quit" | "exit" | "quit" => {
                println!("Goodbye!");
                break;
            }
            "/rename" => {
                match engine.rename(rest).await {
                    Ok(()) => println!("Renamed to: {}", rest.trim()),
                    Err(e) => println!("Error: {}", e),
                }
                continue;
            }
            "/tools" => {
                for name in tool_names {
                    println!("  - {}", name);
                }
                if let Some(tools) = engine.tools() {
                    for rec in tools.table().pending() {
                        println!("  [running] {} ({})", rec.tool_name, rec.request_id);
                    }
                }
                // Forced pass; claims keep this safe alongside the background poller.
                if let Some(poller) = engine.tool_poller() {
                    match poller.poll_once().await {
                        Ok(done) if !done.is_empty() => {
                            println!("  reconciled {} finished request(s)", done.len())
                        }
                        Ok(_) => {}
                        Err(e) => println!("Error: {}", e),
                    }
                }
                continue;
            }
            "/debug" => {
                let on = !debug.fetch_xor(true, Ordering::SeqCst);
                println!("Event output {}", if on { "on" } else { "off" });
                continue;
            }
            _ => {}
        }

        match engine.process_message(input).await {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => println!("Error: {}", e),
        }
    }

    printer.abort();
    Ok(())
}

/// Print tool follow-ups as they land, plus every event in debug mode.
fn spawn_event_printer(
    engine: Arc<Engine>,
    debug: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    let mut events = engine.event_bus().subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event printer lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if debug.load(Ordering::SeqCst) {
                println!("\n[event] {:?}", event);
            }
            if let EngineEvent::ToolReconciled { ref request_id, .. } = event {
                println!();
                print_follow_ups(&engine.state().messages(), request_id);
                print!("> ");
                io::stdout().flush().ok();
            }
        }
    })
}

fn print_outcome(outcome: &TurnOutcome) {
    for msg in &outcome.replies {
        print_message(msg);
    }
    for failure in &outcome.failures {
        eprintln!("  ! {} failed: {}", failure.node_id, failure.error);
    }
}

fn print_follow_ups(messages: &[Message], request_id: &str) {
    messages
        .iter()
        .filter(|m| m.metadata.request_id.as_deref() == Some(request_id))
        .filter(|m| m.role == Role::Tool || m.metadata.extra.contains_key("follow_up"))
        .for_each(print_message);
}

fn print_message(msg: &Message) {
    match (msg.role, msg.agent_id()) {
        (Role::Tool, _) => println!("  [tool] {}", msg.content),
        (_, Some(agent)) => println!("[{}] {}", agent, msg.content),
        _ => println!("{}", msg.content),
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
