//! CLI interface for leverage-worker
//!
//! Provides subcommands for:
//! - `run`: Start the trading engine
//! - `status`: Show the persisted session
//! - `halt`: Raise the emergency stop through the stop file
//! - `resume`: Clear a persisted emergency stop
//! - `config`: Show the effective configuration

mod operator;
mod run;

pub use operator::{HaltArgs, ResumeArgs, StatusArgs};
pub use run::RunArgs;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "leverage-worker")]
#[command(about = "Order execution and recovery engine for leveraged ETF trading")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the trading engine
    Run(RunArgs),
    /// Show the persisted session and recent crashes
    Status(StatusArgs),
    /// Halt new entries via the stop file
    Halt(HaltArgs),
    /// Clear a persisted emergency stop before the next start
    Resume(ResumeArgs),
    /// Show the effective configuration
    Config,
}
