//! grainidx CLI - secondary indexes over virtual actors

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use grainidx_core::Config;

mod commands;
mod logging;

use commands::{cmd_config_init, cmd_config_show, cmd_demo};
use logging::init_logging;

#[derive(Parser)]
#[command(name = "grainidx")]
#[command(about = "Secondary indexes over virtual actors")]
#[command(after_help = "\
QUICK START:
  grainidx config init            # Write .grainidx/config.toml
  grainidx demo                   # Run the indexing walkthrough
  grainidx demo --kill-node       # Include a node failure")]
struct Cli {
  /// Config file to use instead of the project/user lookup
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `grainidx config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show effective configuration
  Show,
  /// Write a default configuration file
  Init {
    /// Write the user-level file instead of the project one
    #[arg(long)]
    user: bool,
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
}

#[derive(Subcommand)]
enum Commands {
  /// Configuration management
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
  /// Run a scripted indexing scenario on an in-process cluster
  Demo {
    /// Number of nodes
    #[arg(short, long, default_value = "3")]
    nodes: usize,
    /// Kill the node hosting the workflow queue midway
    #[arg(long)]
    kill_node: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let cwd = std::env::current_dir()?;

  let config = match &cli.config {
    Some(path) => Config::load_from(path)?,
    None => Config::load_for_project(&cwd),
  };
  let _guard = init_logging(&config.logging, cli.verbose);

  match cli.command {
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show(&cwd, cli.config.as_deref()),
      ConfigCommand::Init { user, force } => cmd_config_init(&cwd, user, force),
    },
    Commands::Demo { nodes, kill_node } => cmd_demo(config, nodes, kill_node).await,
  }
}
