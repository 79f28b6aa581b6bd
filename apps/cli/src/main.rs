//! chanvault command-line entry point.

mod channels;
mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Store files in an append-only channel as verified chunks.
#[derive(Debug, Parser)]
#[command(name = "chanvault", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "CHANVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Settings key to use instead of the configured user id
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Split a file into chunks and post it to a new channel
    SplitFile {
        /// File to upload
        path: PathBuf,

        /// Compress chunks (defaults to the stored setting)
        #[arg(long)]
        compress: Option<bool>,

        /// Chunk size such as 4MiB or 2097152 (defaults to the stored setting)
        #[arg(long, value_parser = commands::parse_size)]
        chunk_size: Option<usize>,

        /// Encrypt chunks with a key from the key store
        #[arg(long)]
        encrypt: bool,

        /// Key id to encrypt with; a new key is generated when omitted
        #[arg(long)]
        key: Option<String>,
    },

    /// Locate the newest manifest in a channel and rebuild its file
    CombineFile {
        /// Channel directory, absolute or relative to the channel root
        channel: String,

        /// Directory to write the file into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Show or change stored transfer defaults
    #[command(subcommand)]
    Settings(SettingsCommand),

    /// Generate a new encryption key
    Keygen,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    /// Print the current defaults
    Show,

    /// Change one or more defaults
    Set {
        #[arg(long)]
        encrypt: Option<bool>,

        #[arg(long)]
        compress: Option<bool>,

        #[arg(long, value_parser = commands::parse_size)]
        chunk_size: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = config::Config::load(&config_path)?;
    if let Some(user) = cli.user {
        config.user_id = user;
    }
    tracing::debug!(path = %config_path.display(), user = %config.user_id, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(commands::run(cli.command, &config))?;
    println!("{summary}");
    Ok(())
}
