mod completion;
mod config;
mod flows;
mod prompt;
mod render;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use crate::completion::write_completions_script;
use crate::config::UpdaterConfig;
use crate::flows::{run_cache, run_install, run_releases, InstallArgs};

#[derive(Parser, Debug)]
#[command(name = "rainup")]
#[command(about = "Installs and updates Rained from release archives", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/rainup.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log debug output to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a release, replacing the files of the installed one.
    Install {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        catalog: PathBuf,
        /// Version to install.
        #[arg(long)]
        to: String,
        /// Version currently installed; omit for a fresh install.
        #[arg(long)]
        from: Option<String>,
    },
    /// List releases in a catalog.
    Releases {
        #[arg(long)]
        catalog: PathBuf,
        /// Include beta builds.
        #[arg(long)]
        all: bool,
        /// Print the listing as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show cached release archives for an install directory.
    Cache {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Print a shell completion script to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = UpdaterConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Install {
            dir,
            catalog,
            to,
            from,
        } => run_install(
            &config,
            InstallArgs {
                dir,
                catalog,
                to,
                from,
            },
        ),
        Commands::Releases { catalog, all, json } => run_releases(&catalog, all, json),
        Commands::Cache { dir } => run_cache(&config, &dir),
        Commands::Completions { shell } => {
            write_completions_script(shell, &mut std::io::stdout().lock())
        }
    }
}
