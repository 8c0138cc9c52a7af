use anyhow::{Context, Result};
use clap::Parser;
use convoy::client::default_socket_path;
use convoy_crypto::credential::{TokenDigest, generate_token};
use convoy_fleet::state_dir::{default_state_dir, ensure_state_dir};
use convoy_node::config::{self, NodeConfig};
use convoy_node::handler::{NodeState, Stores};
use convoy_node::{socket, sweeper};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "convoy fleet coordination daemon")]
struct Args {
    /// Path to the Unix socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// State directory for tasks, trust records and messages.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/convoy/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep all state in memory; nothing is written to disk.
    #[arg(long)]
    ephemeral: bool,

    /// Print a fresh account token and its sha256 digest, then exit.
    #[arg(long)]
    generate_token: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy_node=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.generate_token {
        let token = generate_token();
        println!("token:        {}", token.as_str());
        println!("token_sha256: {}", TokenDigest::of_token(&token).to_hex());
        return Ok(());
    }

    let config_path = args.config.unwrap_or_else(NodeConfig::default_path);
    let config = NodeConfig::load(&config_path)?;
    if config.accounts.is_empty() {
        tracing::warn!(path = %config_path.display(), "no accounts configured, every auth will fail");
    }

    let stores = if args.ephemeral {
        tracing::info!("running with in-memory state");
        Stores::in_memory(&config)
    } else {
        let state_dir = match args.state_dir {
            Some(dir) => dir,
            None => default_state_dir().context("failed to determine state directory")?,
        };
        ensure_state_dir(&state_dir)?;
        tracing::info!(state_dir = %state_dir.display(), "loading state");
        Stores::load(&state_dir, &config)?
    };

    let socket_path = args.socket.unwrap_or_else(default_socket_path);
    let state = NodeState::new(&config, stores)?;

    let background = sweeper::spawn(state.clone(), state.shutdown.child_token());
    tokio::spawn(config::watch(
        state.clone(),
        config_path,
        state.shutdown.child_token(),
    ));

    // Run Unix socket server (blocks until shutdown signal)
    tokio::select! {
        result = socket::serve(state.clone(), &socket_path) => {
            result.context("socket server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }

    state.shutdown.cancel();
    for handle in background {
        handle.await.ok();
    }

    // Cleanup socket file
    std::fs::remove_file(&socket_path).ok();
    tracing::info!("convoy-node shut down");
    Ok(())
}
