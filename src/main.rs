use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "recast")]
#[command(version, about = "Track elements through process steps, synced in realtime")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in with email and password, or through the OAuth provider
    Login {
        /// Sign in through the browser instead of with a password
        #[arg(long)]
        oauth: bool,
        /// Email address for password sign-in
        email: Option<String>,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show the signed-in user's profile
    Profile,
    /// List processes with their steps
    Processes,
    /// List elements and where they are
    Elements {
        /// Only elements of this process (id or name)
        #[arg(short, long)]
        process: Option<String>,
    },
    /// Inspect or change a single element
    Element {
        #[command(subcommand)]
        command: ElementCommands,
    },
    /// List bundles
    Bundles,
    /// Manage process bundles
    Bundle {
        #[command(subcommand)]
        command: BundleCommands,
    },
    /// Stream changes to elements as they happen
    Watch {
        /// Only elements of this process (id or name)
        #[arg(short, long)]
        process: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ElementCommands {
    /// Show an element with its step and property values
    Show { id: i64 },
    /// Create an element at the first step of a process
    Create {
        /// Process id or name
        process: String,
        name: String,
    },
    /// Move an element to its next step
    Advance { id: i64 },
    /// Set a property value on an element
    Set {
        id: i64,
        /// Step property id
        property: i64,
        value: String,
    },
    /// Delete an element
    Delete {
        id: i64,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum BundleCommands {
    /// Import processes, steps and step properties from a YAML or JSON file
    Import { path: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default recast.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Login { oauth, email } => {
            cmd::cmd_login(&project_dir, cli.verbose, *oauth, email.as_deref()).await?
        }
        Commands::Logout => cmd::cmd_logout(&project_dir, cli.verbose).await?,
        Commands::Profile => cmd::cmd_profile(&project_dir, cli.verbose).await?,
        Commands::Processes => cmd::cmd_processes(&project_dir, cli.verbose).await?,
        Commands::Elements { process } => {
            cmd::cmd_elements(&project_dir, cli.verbose, process.as_deref()).await?
        }
        Commands::Element { command } => {
            cmd::cmd_element(&project_dir, cli.verbose, command.clone()).await?
        }
        Commands::Bundles => cmd::cmd_bundles(&project_dir, cli.verbose).await?,
        Commands::Bundle { command } => {
            cmd::cmd_bundle(&project_dir, cli.verbose, command.clone()).await?
        }
        Commands::Watch { process } => {
            cmd::cmd_watch(&project_dir, cli.verbose, process.as_deref()).await?
        }
    }

    Ok(())
}
