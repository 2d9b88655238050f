//! `openclaw` — command line client for the OpenClaw gateway.
//!
//! Connects over WebSocket and either sends a one-shot agent request
//! (`run`), opens an interactive chat loop (`chat`), or queries gateway
//! diagnostics (`health`, `status`).
//!
//! Usage:
//!   OPENCLAW_TOKEN=secret openclaw run "summarize my inbox"
//!   OPENCLAW_TOKEN=secret openclaw chat --session work

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures_util::{pin_mut, StreamExt};
use tracing_subscriber::EnvFilter;

use oc_client::{FileKeyStore, GatewayClient, GatewayClientBuilder};

#[derive(Debug, Parser)]
#[command(name = "openclaw", version, about = "OpenClaw gateway client")]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ConnectArgs {
    /// Gateway host.
    #[arg(long, default_value = "127.0.0.1", global = true)]
    host: String,
    /// Gateway port.
    #[arg(long, default_value_t = 18789, global = true)]
    port: u16,
    /// Use TLS for the WebSocket connection.
    #[arg(long, global = true)]
    tls: bool,
    /// Auth token (falls back to $OPENCLAW_TOKEN).
    #[arg(long, global = true)]
    token: Option<String>,
    /// Path to the device key file (default: ~/.openclaw/device_key).
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,
    /// Overall timeout for one agent run, in seconds.
    #[arg(long, default_value_t = 120, global = true)]
    timeout: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a single message to the agent and print the response.
    Run {
        /// The message to send.
        message: String,
        /// Session key (defaults to "cli:run").
        #[arg(long, default_value = "cli:run")]
        session: String,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
        /// Print the full response as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Interactive chat loop against one session.
    Chat {
        /// Session key (defaults to "cli:chat").
        #[arg(long, default_value = "cli:chat")]
        session: String,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
    },
    /// Query gateway health and print the result as JSON.
    Health,
    /// Query gateway status and print the result as JSON.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            message,
            session,
            model,
            json,
        } => {
            let client = build_client(&cli.connect, &session, model)?;
            client.connect().await?;
            let result = run_once(&client, &message, json).await;
            client.disconnect().await;
            result
        }
        Command::Chat { session, model } => {
            let client = build_client(&cli.connect, &session, model)?;
            client.connect().await?;
            let result = chat_loop(&client, &session).await;
            client.disconnect().await;
            result
        }
        Command::Health => {
            let client = build_client(&cli.connect, "cli:query", None)?;
            client.connect().await?;
            let health = client.health().await;
            client.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&health?)?);
            Ok(())
        }
        Command::Status => {
            let client = build_client(&cli.connect, "cli:query", None)?;
            client.connect().await?;
            let status = client.status().await;
            client.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&status?)?);
            Ok(())
        }
    }
}

fn build_client(
    args: &ConnectArgs,
    session: &str,
    model: Option<String>,
) -> anyhow::Result<GatewayClient> {
    let key_path = match &args.key_file {
        Some(path) => path.clone(),
        None => dirs::home_dir()
            .unwrap_or_default()
            .join(".openclaw")
            .join("device_key"),
    };

    let mut builder = GatewayClientBuilder::new()
        .host(&args.host)
        .port(args.port)
        .use_tls(args.tls)
        .session_key(session)
        .timeout(Duration::from_secs(args.timeout))
        .key_store(Arc::new(FileKeyStore::new(key_path)));
    let token = args
        .token
        .clone()
        .or_else(|| std::env::var("OPENCLAW_TOKEN").ok());
    if let Some(token) = token {
        builder = builder.token(token);
    }
    if let Some(model) = model {
        builder = builder.model(model);
    }
    Ok(builder.build()?)
}

/// Stream one agent response to stdout (or collect it as JSON).
async fn run_once(client: &GatewayClient, message: &str, json: bool) -> anyhow::Result<()> {
    if json {
        let response = client.send_agent_request(message).await?;
        println!("{}", serde_json::json!({ "response": response }));
        return Ok(());
    }

    let stream = client.stream_agent_request(message);
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        print!("{}", chunk?);
        std::io::stdout().flush().ok();
    }
    println!();
    Ok(())
}

/// Readline loop: each line becomes one agent request, responses stream
/// to stdout. Ctrl+D or /exit quits.
async fn chat_loop(client: &GatewayClient, session: &str) -> anyhow::Result<()> {
    let history_path = dirs::home_dir()
        .unwrap_or_default()
        .join(".openclaw")
        .join("chat_history.txt");
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut rl = rustyline::DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    // Keep stdout clean for agent output.
    eprintln!("OpenClaw gateway chat");
    eprintln!("Session: {session}  |  Ctrl+D or /exit to quit");
    eprintln!();

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(&line).ok();
                if trimmed == "/exit" || trimmed == "/quit" {
                    break;
                }

                if let Err(err) = run_once(client, trimmed, false).await {
                    eprintln!("\x1B[31merror: {err}\x1B[0m");
                    if let Some(fatal) = client.fatal_error() {
                        eprintln!("\x1B[31mconnection stopped: {fatal}\x1B[0m");
                        break;
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                eprintln!("(Use Ctrl+D or /exit to quit)");
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("\x1B[31mreadline error: {err}\x1B[0m");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}
