use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Reproducible environment provisioning with layered caching", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an environment from a pipeline definition
    Build(BuildArgs),

    /// Parse and statically validate a pipeline definition
    Validate {
        /// Pipeline definition file (TOML)
        pipeline: PathBuf,
    },

    /// Inspect or clear the layer cache
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct BuildArgs {
    /// Pipeline definition file (TOML)
    pub pipeline: PathBuf,

    /// Directory the environment is materialized into
    #[arg(long, default_value = "./strata-root")]
    pub state_root: PathBuf,

    /// Layer cache directory (defaults to the user cache dir)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Override the `base_uid` variable of the definition
    #[arg(long)]
    pub base_uid: Option<u32>,

    /// Override the `base_user` variable of the definition
    #[arg(long)]
    pub base_user: Option<String>,

    /// Ignore cached layers and re-execute every step
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Show cache statistics
    Stats {
        /// Layer cache directory (defaults to the user cache dir)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Delete all cached layers
    Clear {
        /// Layer cache directory (defaults to the user cache dir)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}
