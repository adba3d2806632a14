//! netio
//!
//! Run a command on a remote host: `netio -s` serves, `netio cmd ...` runs.

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use netio::client::{Client, ClientOptions};
use netio::config::Config;
use netio::logging;
use netio::server::Server;
use protocol::SENTINEL_EXIT_CODE;

/// netio - run a command on a remote host and relay its terminal.
#[derive(Parser, Debug)]
#[command(name = "netio")]
#[command(version, about, long_about = None)]
#[command(override_usage = "netio [OPTIONS] <COMMAND> [ARGS]...\n       netio -s [OPTIONS]")]
pub struct Cli {
    /// Run as server
    #[arg(short = 's', long = "server", conflicts_with = "command")]
    pub server: bool,

    /// Allocate a terminal on the server
    #[arg(short = 't', long = "tty")]
    pub tty: bool,

    /// Request stream compression
    #[arg(short = 'c', long = "compress")]
    pub compress: bool,

    /// Working directory of the remote command
    #[arg(short = 'w', long = "workdir", value_name = "DIR")]
    pub workdir: Option<String>,

    /// Environment entry for the remote command (repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Listen address (server) or server address (client)
    #[arg(long, value_name = "ADDR")]
    pub addr: Option<String>,

    /// Path to configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to run remotely, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if !cli.server && cli.command.is_empty() {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "a command to run is required unless --server is given",
            )
            .exit();
    }

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.apply_cli_addr(cli.addr.as_deref());
    config.validate()?;

    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    logging::init(level);
    logging::install_panic_hook();

    if cli.server {
        tracing::info!("netio server starting");
        return Server::bind(&config.addr).await?.run().await;
    }

    let client = Client::new(ClientOptions {
        addr: config.addr,
        tty: cli.tty,
        compress: cli.compress,
        working_directory: cli.workdir.unwrap_or_default(),
        environment: cli.env,
        command: cli.command,
    });

    let code = match client.run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            SENTINEL_EXIT_CODE
        }
    };
    std::process::exit(code);
}
