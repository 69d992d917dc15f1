use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "rtx",
    about = "RTX transactional resource store -- operator tools",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Inspect a transaction journal
    Journal(JournalArgs),
    /// Validate or generate configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct JournalArgs {
    #[command(subcommand)]
    pub action: JournalAction,
}

#[derive(Subcommand)]
pub enum JournalAction {
    /// Print every record in the journal
    Inspect {
        /// Path to the journal log
        path: PathBuf,
    },
    /// List transactions that recovery would still have to resolve
    Pending {
        /// Path to the journal log
        path: PathBuf,
    },
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigKind {
    /// Transaction engine settings
    Transact,
    /// Resource service and scheduler settings
    Service,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Parse and validate a TOML config file
    Check {
        file: PathBuf,
        #[arg(long, default_value = "transact")]
        kind: ConfigKind,
    },
    /// Print the default configuration as TOML
    Default {
        #[arg(long, default_value = "transact")]
        kind: ConfigKind,
    },
}
