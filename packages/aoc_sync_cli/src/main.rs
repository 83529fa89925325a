use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::prelude::*;

use aoc_sync::SyncConfig;

mod cli;
mod inputs;

#[derive(Parser)]
#[command(name = "aoc-sync")]
#[command(about = "Watch and drive automation server workspaces over MQTT")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (AOC_* env vars override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON file with the broker tokens, one per workspace
    #[arg(long, global = true, default_value = "tokens.json")]
    tokens: PathBuf,

    /// JSON file with automation server and workspace names
    #[arg(long, global = true)]
    servers: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every workspace and print the aggregate as it changes
    Watch(WatchArgs),

    /// Connect and list every connection with its state
    Connections(ListArgs),

    /// Read or write a process document
    #[command(subcommand)]
    Content(ContentCommand),

    /// Fetch, upload or delete process attachments
    #[command(subcommand)]
    Attachment(AttachmentCommand),

    /// Create or delete processes
    #[command(subcommand)]
    Process(ProcessCommand),
}

#[derive(Args)]
struct WatchArgs {
    /// Print each state as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// The workspace a command is addressed to.
#[derive(Args, Clone)]
pub(crate) struct Target {
    /// Automation server id
    #[arg(long)]
    server: String,

    /// Workspace id
    #[arg(long)]
    workspace: String,
}

impl Target {
    pub(crate) fn key(&self) -> aoc_sync::ConnectionKey {
        aoc_sync::ConnectionKey::new(&self.server, &self.workspace)
    }
}

#[derive(Subcommand)]
enum ContentCommand {
    /// Print a process document
    Get {
        #[command(flatten)]
        target: Target,
        process: String,
    },
    /// Replace a process document with the contents of a file
    Set {
        #[command(flatten)]
        target: Target,
        process: String,
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum AttachmentCommand {
    /// Download an attachment
    Get {
        #[command(flatten)]
        target: Target,
        process: String,
        name: String,
        /// Write here instead of ./<name>
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Upload a file as an attachment named after it
    Put {
        #[command(flatten)]
        target: Target,
        process: String,
        file: PathBuf,
    },
    /// Delete an attachment
    Delete {
        #[command(flatten)]
        target: Target,
        process: String,
        name: String,
    },
}

#[derive(Subcommand)]
enum ProcessCommand {
    /// Create a process and print its id
    Create {
        #[command(flatten)]
        target: Target,
        name: String,
    },
    /// Delete a process
    Delete {
        #[command(flatten)]
        target: Target,
        process: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "aoc_sync=debug,aoc_sync_cli=debug,info"
    } else {
        "aoc_sync=info,aoc_sync_cli=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = SyncConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    let tokens = inputs::load_tokens(&cli.tokens)?;
    let servers = match &cli.servers {
        Some(path) => inputs::load_servers(path)?,
        None => Vec::new(),
    };
    let session = cli::Session::open(config, &tokens, servers).await;

    let result = match cli.command {
        Commands::Watch(args) => cli::watch_command(&session, args.json).await,
        Commands::Connections(args) => cli::connections_command(&session, args.json).await,
        Commands::Content(ContentCommand::Get { target, process }) => {
            cli::content_get_command(&session, &target, &process).await
        }
        Commands::Content(ContentCommand::Set {
            target,
            process,
            file,
        }) => cli::content_set_command(&session, &target, &process, &file).await,
        Commands::Attachment(AttachmentCommand::Get {
            target,
            process,
            name,
            out,
        }) => cli::attachment_get_command(&session, &target, &process, &name, out).await,
        Commands::Attachment(AttachmentCommand::Put {
            target,
            process,
            file,
        }) => cli::attachment_put_command(&session, &target, &process, &file).await,
        Commands::Attachment(AttachmentCommand::Delete {
            target,
            process,
            name,
        }) => cli::attachment_delete_command(&session, &target, &process, &name).await,
        Commands::Process(ProcessCommand::Create { target, name }) => {
            cli::process_create_command(&session, &target, &name).await
        }
        Commands::Process(ProcessCommand::Delete { target, process }) => {
            cli::process_delete_command(&session, &target, &process).await
        }
    };

    session.close().await;
    result
}
