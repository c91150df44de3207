mod cli;
mod commands;
mod loader;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{CacheCommand, Cli, Commands};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Build(args) => {
            let code = commands::build::run(&ctx, args)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Validate { pipeline } => commands::validate::run(&ctx, &pipeline),
        Commands::Cache(cmd) => match cmd {
            CacheCommand::Stats { cache_dir } => commands::cache::stats(&ctx, cache_dir.as_deref()),
            CacheCommand::Clear { cache_dir, yes } => {
                commands::cache::clear(&ctx, cache_dir.as_deref(), yes)
            }
        },
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "strata", &mut io::stdout());
            Ok(())
        }
    }
}
