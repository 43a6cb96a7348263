use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use opsgraph_agent::{ConversationStore, GraphEngine, MemoryCheckpoints, SqliteCheckpoints};
use opsgraph_core::config::AppConfig;
use opsgraph_core::event::StreamEvent;
use opsgraph_core::traits::CheckpointBackend;
use opsgraph_core::types::{ChatRequest, ResumeAction, ResumeRequest};
use opsgraph_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "opsgraph", version, about = "Supervisor-routed troubleshooting engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "opsgraph.toml")]
    config: PathBuf,

    /// Keep sessions in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Human-readable output instead of NDJSON
    #[arg(long)]
    pretty: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve,
    /// Send one message and stream the session's events
    Run {
        /// The message (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
        /// Continue an existing thread
        #[arg(long)]
        thread: Option<String>,
    },
    /// Approve or deny a session parked for approval
    Resume {
        #[arg(long)]
        thread: String,
        /// approve | deny
        #[arg(long)]
        action: ResumeAction,
    },
    /// List stored sessions
    Sessions,
    /// Show effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "opsgraph=info,warn",
        1 => "opsgraph=debug,info",
        _ => "opsgraph=trace,debug",
    };
    // Logs go to stderr so stdout carries only the event stream
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        config.nodes = config.roster_definitions();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let backend: Arc<dyn CheckpointBackend> = if cli.ephemeral {
        Arc::new(MemoryCheckpoints::new())
    } else {
        let path = config.checkpoint_path();
        info!(path = %path.display(), "Opening checkpoint store");
        Arc::new(SqliteCheckpoints::open(&path)?)
    };
    let store = Arc::new(ConversationStore::new(backend));

    if let Commands::Sessions = cli.command {
        for id in store.list()? {
            let session = store.load(&id)?;
            println!(
                "{}\t{}\trev {}\t{} messages\t{}",
                id,
                session.cursor,
                session.revision,
                session.messages.len(),
                session.updated_at.to_rfc3339()
            );
        }
        return Ok(());
    }

    let tools = Arc::new(ToolRegistry::with_builtins(&config.tools));
    let llm = opsgraph_llm::build_from_config(&config);
    let engine = Arc::new(GraphEngine::new(&config, llm, tools, store)?);

    match cli.command {
        Commands::Serve => {
            info!(bind = %config.gateway.bind, "Starting HTTP gateway");
            let server = opsgraph_gateway::GatewayServer::new(config.gateway.clone(), engine);
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Run { prompt, thread } => {
            let mut text = prompt.join(" ");
            if text.trim().is_empty() {
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            let mut req = ChatRequest::new(text);
            req.thread_id = thread;
            let (thread_id, rx) = engine.spawn_chat(req);
            if cli.pretty {
                eprintln!("thread: {}", thread_id);
            }
            print_stream(rx, cli.pretty).await?;
        }
        Commands::Resume { thread, action } => {
            let rx = engine.spawn_resume(ResumeRequest {
                thread_id: thread,
                action,
            });
            print_stream(rx, cli.pretty).await?;
        }
        Commands::Sessions | Commands::Config => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".opsgraph").join("config.toml"));
    match home_config {
        Some(p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(AppConfig::load(&p)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

async fn print_stream(mut rx: mpsc::Receiver<StreamEvent>, pretty: bool) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    while let Some(event) = rx.recv().await {
        if pretty {
            if let Some(line) = render_pretty(&event) {
                writeln!(stdout, "{}", line)?;
            }
        } else {
            write!(stdout, "{}", event.to_line())?;
        }
        stdout.flush()?;
    }
    Ok(())
}

fn render_pretty(event: &StreamEvent) -> Option<String> {
    let line = match event {
        StreamEvent::Activity { agent } => format!("== {} ==", agent),
        StreamEvent::ToolCall { tool, args, .. } => format!("  [tool: {}] {}", tool, args),
        StreamEvent::ToolOutput {
            tool,
            content,
            is_error,
            ..
        } => {
            let status = if *is_error { "ERROR" } else { "ok" };
            format!("  [{}: {}] {}", tool, status, truncate(content, 200))
        }
        StreamEvent::Message { agent, content } => format!("{}: {}", agent, content),
        StreamEvent::ApprovalRequired { thread_id } => format!(
            "\n[APPROVAL] waiting for a decision. Run:\n  opsgraph resume --thread {} --action approve|deny",
            thread_id
        ),
        StreamEvent::Error { agent, content } => format!("[error from {}] {}", agent, content),
        StreamEvent::Final => return None,
    };
    Some(line)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((cut, _)) => &s[..cut],
        None => s,
    }
}
