use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "hopssh",
    version,
    about = "Transparent SSH-to-SSH proxy with pinned upstream host keys"
)]
pub struct Cli {
    /// Path to configuration file (also settable via HOPSSH_CONFIG env var)
    #[arg(short, long, default_value = "config.toml", env = "HOPSSH_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate configuration file
    CheckConfig,
}
