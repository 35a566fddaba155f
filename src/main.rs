//! multipackager - build distribution packages in cached chroot sandboxes
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use multipackager::cli::{commands, Cli, Commands};
use multipackager::config::{Config, ConfigManager};
use multipackager::error::{MultipackError, MultipackResult};
use multipackager::ui;
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> MultipackResult<()> {
    let cli = Cli::parse();

    // Completions need neither config nor logging
    if let Commands::Completions(args) = cli.command {
        commands::completions(args);
        return Ok(());
    }

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let loaded = manager.load().await;

    init_logging(cli.verbose, loaded.as_ref().ok());
    let config = loaded?;
    ui::init_theme();

    match cli.command {
        Commands::Completions(_) => Ok(()),
        Commands::Config(args) => commands::config(args, &config, &manager).await,
        // The shell owns the terminal; Ctrl-C belongs to it
        Commands::Shell(args) => commands::shell(args, &config).await,
        Commands::Build(args) => interruptible(commands::build(args, &config)).await,
        Commands::Update(args) => interruptible(commands::update(args, &config)).await,
        Commands::ClearCache(args) => interruptible(commands::clear_cache(args, &config)).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set
fn init_logging(verbose: u8, config: Option<&Config>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("multipackager=warn"),
        1 => EnvFilter::new("multipackager=info"),
        _ => EnvFilter::new("multipackager=debug"),
    });

    let json = config.is_some_and(|c| c.general.log_format == "json");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_target(false).without_time().init();
    }
}

/// Abort the command on Ctrl-C; dropping its future unmounts overlays,
/// restores backups and kills child processes
async fn interruptible<F>(command: F) -> MultipackResult<()>
where
    F: std::future::Future<Output = MultipackResult<()>>,
{
    tokio::select! {
        result = command => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cleaning up");
            Err(MultipackError::Interrupted)
        }
    }
}
