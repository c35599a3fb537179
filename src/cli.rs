use clap::{Parser, Subcommand};
use ferry::Status;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "A resumable multi-protocol download manager")]
#[command(long_about = "
ferry queues downloads, runs a bounded number of them at a time, and keeps
their progress on disk so an interrupted transfer continues where it stopped.

Examples:
  ferry add https://example.com/file.iso          # Download into the default folder
  ferry add https://example.com/a.tar -o ~/dl -n b.tar
  ferry list --status running                     # Show active transfers
  ferry pause --all                               # Pause everything
  ferry resume 3f2a...                            # Continue a paused task
  ferry remove --all --force --yes                # Drop tasks and their files
")]
#[command(version)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue one or more downloads and follow them
    #[command(visible_alias = "a")]
    Add {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Destination directory
        #[arg(short, long, value_name = "DIR")]
        #[arg(help = "Destination directory (defaults to the configured download_dir)")]
        output: Option<String>,

        /// File name override
        #[arg(short, long, value_name = "NAME")]
        #[arg(help = "Save under this name (single URL only)")]
        name: Option<String>,

        /// Queue and exit immediately
        #[arg(short, long)]
        #[arg(help = "Queue the downloads and exit; they stay paused until resumed")]
        detach: bool,
    },

    /// List known tasks
    #[command(visible_alias = "ls")]
    List {
        /// Only show tasks in this state
        #[arg(short, long, value_name = "STATUS")]
        #[arg(help = "Filter by status (ready, running, pause, wait, error, done)")]
        status: Option<Status>,

        /// Show detailed information
        #[arg(short = 'l', long)]
        #[arg(help = "Show paths and timestamps")]
        long: bool,
    },

    /// Pause tasks
    Pause {
        /// Task ids
        ids: Vec<String>,

        #[arg(short, long)]
        #[arg(help = "Pause every task")]
        all: bool,
    },

    /// Continue paused or failed tasks and follow them
    #[command(visible_alias = "r")]
    Resume {
        /// Task ids
        ids: Vec<String>,

        #[arg(short, long)]
        #[arg(help = "Resume every task")]
        all: bool,
    },

    /// Remove tasks
    #[command(visible_alias = "rm")]
    Remove {
        /// Task ids
        ids: Vec<String>,

        #[arg(short, long)]
        #[arg(help = "Remove every task")]
        all: bool,

        /// Also delete downloaded files
        #[arg(short, long)]
        #[arg(help = "Also delete downloaded files")]
        force: bool,

        /// Skip confirmation prompt
        #[arg(short, long)]
        #[arg(help = "Skip confirmation prompt")]
        yes: bool,
    },

    /// Configuration management
    #[command(visible_alias = "cfg")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the current configuration
    Show,

    /// Print the config file location
    Path,

    /// Restore the default configuration
    Reset {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

impl Cli {
    /// Validate CLI arguments and show helpful error messages
    pub fn validate(&self) -> Result<(), String> {
        match &self.command {
            Commands::Add { urls, name, .. } => {
                if urls.iter().any(|url| url.trim().is_empty()) {
                    return Err("URL cannot be empty".to_string());
                }
                if name.is_some() && urls.len() > 1 {
                    return Err("--name can only be used with a single URL".to_string());
                }
            }
            Commands::Pause { ids, all }
            | Commands::Resume { ids, all }
            | Commands::Remove { ids, all, .. } => {
                if ids.is_empty() && !*all {
                    return Err("Specify task ids or --all".to_string());
                }
                if !ids.is_empty() && *all {
                    return Err("Cannot specify both task ids and --all".to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Check if command stays attached to running transfers
    pub fn follows_progress(&self) -> bool {
        matches!(
            self.command,
            Commands::Add { detach: false, .. } | Commands::Resume { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["ferry", "list"]).unwrap();
        assert!(matches!(cli.command, Commands::List { .. }));

        let cli = Cli::try_parse_from(["ferry", "add", "https://example.com/a.iso"]).unwrap();
        assert!(matches!(cli.command, Commands::Add { .. }));
        assert!(cli.follows_progress());
    }

    #[test]
    fn test_add_command_options() {
        let cli = Cli::try_parse_from([
            "ferry",
            "add",
            "https://example.com/a.iso",
            "--output",
            "/tmp/dl",
            "--name",
            "b.iso",
            "--detach",
        ])
        .unwrap();

        if let Commands::Add {
            urls,
            output,
            name,
            detach,
        } = cli.command
        {
            assert_eq!(urls, vec!["https://example.com/a.iso".to_string()]);
            assert_eq!(output, Some("/tmp/dl".to_string()));
            assert_eq!(name, Some("b.iso".to_string()));
            assert!(detach);
        } else {
            panic!("Expected Add command");
        }
    }

    #[test]
    fn test_status_filter_parses() {
        let cli = Cli::try_parse_from(["ferry", "ls", "--status", "done"]).unwrap();
        if let Commands::List { status, .. } = cli.command {
            assert_eq!(status, Some(Status::Done));
        } else {
            panic!("Expected List command");
        }

        assert!(Cli::try_parse_from(["ferry", "ls", "--status", "sleeping"]).is_err());
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["ferry", "config", "reset", "--yes"]).unwrap();
        if let Commands::Config { action } = cli.command {
            assert!(matches!(action, ConfigAction::Reset { yes: true }));
        } else {
            panic!("Expected Config command");
        }
    }

    #[test]
    fn test_validation() {
        let cli = Cli::try_parse_from(["ferry", "pause", "--all"]).unwrap();
        assert!(cli.validate().is_ok());

        let cli = Cli::try_parse_from(["ferry", "pause"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["ferry", "rm", "abc", "--all"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["ferry", "add", "http://a/x", "http://a/y", "-n", "z"])
            .unwrap();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["ferry", "add", "http://a/x", "-d", "-v", "-c", "x.toml"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
        assert!(!cli.follows_progress());

        let cli = Cli::try_parse_from(["ferry", "resume", "--all"]).unwrap();
        assert!(cli.follows_progress());
    }
}
