use anyhow::Result;
use clap::Parser;

use hopssh::cli::{Cli, Command};
use hopssh::config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::CheckConfig) => {
            let cfg = config::load_config(&cli.config)?;
            println!("Configuration is valid.");
            println!("  Listen: {}", cfg.server.listen);
            println!("  Upstream: {}:{}", cfg.upstream.server, cfg.upstream.port);
            println!(
                "  Pinned fingerprints: {}",
                cfg.upstream.allowed_host_key_fingerprints.len()
            );
            return Ok(());
        }
        None => {}
    }

    let cfg = config::load_config(&cli.config)?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| cfg.logging.level.to_string());
    hopssh::logging::setup_logging(&level, cfg.logging.format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(hopssh::server::run(cfg))
}
