mod cli;
mod handlers;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use ferry::ConfigManager;
use std::process;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Validate CLI arguments first
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    // Initialize logging based on verbosity
    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let mut config_manager = match &args.config {
        Some(path) => ConfigManager::with_file(path)?,
        None => ConfigManager::new()?,
    };

    // Config commands must work even when the file is broken
    if !handlers::should_skip_config_validation(&args.command) {
        if let Err(e) = config_manager.validate() {
            eprintln!("Configuration validation failed: {}", e);
            eprintln!("Run 'ferry config show' to inspect the file");
            eprintln!("Or run 'ferry config reset' to restore the defaults");
            process::exit(1);
        }
    }

    match args.command {
        Commands::Add {
            urls,
            output,
            name,
            detach,
        } => {
            handlers::handle_add(&config_manager, urls, output, name, detach).await?;
        }
        Commands::List { status, long } => {
            handlers::handle_list(&config_manager, status, long || args.verbose).await?;
        }
        Commands::Pause { ids, all } => {
            handlers::handle_pause(&config_manager, ids, all).await?;
        }
        Commands::Resume { ids, all } => {
            handlers::handle_resume(&config_manager, ids, all).await?;
        }
        Commands::Remove {
            ids,
            all,
            force,
            yes,
        } => {
            handlers::handle_remove(&config_manager, ids, all, force, yes).await?;
        }
        Commands::Config { action } => {
            handlers::handle_config(&mut config_manager, action).await?;
        }
    }

    Ok(())
}
