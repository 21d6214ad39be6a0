use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use teamflow_node::config::NodeConfig;
use teamflow_node::identity::token_digest;
use teamflow_node::server;

#[derive(Parser, Debug)]
#[command(author, version, about = "teamflow collaborative session server")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, env = "TEAMFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file).
    #[arg(long)]
    listen: Option<String>,

    /// Data directory for the database and proof files (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Print the SHA-256 digest of a token for the `[[users]]` table and exit.
    #[arg(long, value_name = "TOKEN")]
    hash_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(token) = args.hash_token {
        println!("{}", token_digest(&token));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "teamflow_node=info,teamflow_store=info".into()),
        )
        .init();

    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    let state = server::build_state(&config)?;
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    tracing::info!(
        data_dir = %config.data_dir.display(),
        users = config.users.len(),
        "teamflow node starting"
    );

    tokio::select! {
        result = server::serve(state, listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    Ok(())
}
