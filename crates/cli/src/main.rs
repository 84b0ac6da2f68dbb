//! CLI entrypoint and subcommand orchestration.

mod config;
mod logs;
mod repl;
#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand};

#[cfg(not(test))]
use std::sync::Arc;

#[cfg(not(test))]
use agent::{JsonFileStore, LlmGateway, OpenAiGateway, SessionManager, SessionSettings};
#[cfg(not(test))]
use config::{Config, LlmConfig, LlmProvider};
#[cfg(not(test))]
use logs::LogBuffer;
#[cfg(not(test))]
use mcp::StdioConnector;
#[cfg(not(test))]
use proto::AgentId;
#[cfg(not(test))]
use tracing::{info, warn};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments for toolgate.
#[derive(Parser)]
#[command(name = "toolgate")]
#[command(about = "Tool-using chat agent with per-function approval", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Agent whose configuration and history are used
    #[arg(short, long, default_value = "default")]
    agent: String,

    /// Enable debug logging to ~/.toolgate/logs/debug.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands available in the application.
#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Interactive chat with tool-call confirmation (default)
    Chat,

    /// Run a single turn without confirmation prompts and exit
    Run {
        /// Message to send to the agent
        #[arg(short, long)]
        message: String,
    },

    /// List agents with a stored configuration
    Agents,

    /// Delete an agent's stored configuration
    Delete {
        /// Agent to delete
        agent: String,
    },

    /// Show configured tool servers and their function policies
    Servers,

    /// Show the conversation history
    History,

    /// Reset the conversation history to the system prompt
    Clear,

    /// Set `allowed` or `confirmed` on a server or one of its functions
    SetFlag {
        /// Server name
        server: String,
        /// Function name; omit to target the server itself
        #[arg(short, long)]
        function: Option<String>,
        /// Flag name (allowed, confirmed)
        flag: String,
        /// New value, as JSON or a bare string
        value: String,
    },
}

impl Commands {
    fn label(&self) -> &'static str {
        match self {
            Commands::Chat => "chat",
            Commands::Run { .. } => "run",
            Commands::Agents => "agents",
            Commands::Delete { .. } => "delete",
            Commands::Servers => "servers",
            Commands::History => "history",
            Commands::Clear => "clear",
            Commands::SetFlag { .. } => "set-flag",
        }
    }
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Chat);

    // RUST_LOG wins; otherwise warn, or debug with --debug.
    let default_level = if cli.debug { "debug" } else { "warn" };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    let file_layer = if cli.debug {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let log_dir = std::path::PathBuf::from(home).join(".toolgate").join("logs");
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .with_filter(EnvFilter::new("debug,hyper_util=info,rustls=info,reqwest=info")),
        )
    } else {
        _file_guard = None;
        None
    };

    let log_buffer = LogBuffer::default();
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);
    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(log_buffer.clone().with_filter(EnvFilter::new("info")))
        .init();

    if cli.debug {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = command.label(),
            agent = %cli.agent,
            "========== toolgate session start =========="
        );
    }

    // Load config
    let config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Failed to load config ({e}), using defaults");
        Config::default()
    });
    config.validate()?;

    let manager = Arc::new(build_manager(&config)?);
    let agent = AgentId::from(cli.agent.as_str());

    match command {
        Commands::Chat => repl::run(manager, agent, log_buffer).await,
        Commands::Run { message } => cmd_run(&manager, &agent, &message).await,
        Commands::Agents => cmd_agents(&manager),
        Commands::Delete { agent } => cmd_delete(&manager, &AgentId::from(agent.as_str())).await,
        Commands::Servers => {
            let session = manager.lock_session(&agent).await?;
            print!("{}", repl::format_servers(session.servers()));
            Ok(())
        }
        Commands::History => {
            let session = manager.lock_session(&agent).await?;
            print!("{}", repl::format_history(&session.history()));
            Ok(())
        }
        Commands::Clear => {
            manager.lock_session(&agent).await?.clear_history();
            println!("History cleared for agent '{agent}'.");
            Ok(())
        }
        Commands::SetFlag {
            server,
            function,
            flag,
            value,
        } => {
            let value = repl::parse_flag_value(&value);
            manager
                .lock_session(&agent)
                .await?
                .update_policy_flag(&server, function.as_deref(), &flag, &value)?;
            println!("Updated.");
            Ok(())
        }
    }
}

#[cfg(not(test))]
/// Builds the chat-completions gateway for the configured provider.
fn build_gateway(llm: &LlmConfig) -> Arc<dyn LlmGateway> {
    if llm.api_key.is_empty() {
        warn!(provider = llm.provider.name(), "No API key configured");
    }
    let gateway = match (llm.provider, llm.effective_base_url()) {
        (LlmProvider::Azure, Some(endpoint)) => OpenAiGateway::azure(
            llm.api_key.clone(),
            endpoint,
            llm.model.clone(),
            llm.api_version.clone(),
        ),
        (_, Some(base_url)) => OpenAiGateway::with_base_url(llm.api_key.clone(), base_url),
        (_, None) => OpenAiGateway::new(llm.api_key.clone()),
    };
    Arc::new(gateway)
}

#[cfg(not(test))]
/// Wires the gateway, the JSON store and the stdio tool-server connector.
fn build_manager(config: &Config) -> anyhow::Result<SessionManager> {
    let data_dir = config.agent.data_path();
    let store = JsonFileStore::open(&data_dir)?;
    info!(data_dir = %data_dir.display(), "Agent store opened");

    let settings = SessionSettings {
        model: config.llm.model.clone(),
        max_tool_rounds: config.agent.max_tool_rounds,
    };
    Ok(SessionManager::new(
        build_gateway(&config.llm),
        Arc::new(store),
        Arc::new(StdioConnector),
        settings,
    ))
}

#[cfg(not(test))]
/// Runs one headless turn: calls that need approval are rejected.
async fn cmd_run(manager: &SessionManager, agent: &AgentId, message: &str) -> anyhow::Result<()> {
    let result = manager.chat(agent, message, None).await;
    manager.shutdown().await;

    match result {
        Ok(reply) => {
            print!("{}", repl::format_reply(&reply));
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
    Ok(())
}

#[cfg(not(test))]
fn cmd_agents(manager: &SessionManager) -> anyhow::Result<()> {
    let agents = manager.list_agents()?;
    if agents.is_empty() {
        println!("No agents stored.");
    }
    for agent in agents {
        println!("{agent}");
    }
    Ok(())
}

#[cfg(not(test))]
async fn cmd_delete(manager: &SessionManager, agent: &AgentId) -> anyhow::Result<()> {
    manager.delete(agent).await?;
    println!("Deleted agent '{agent}'.");
    Ok(())
}
