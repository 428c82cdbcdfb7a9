use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agora", about = "AI discussion generator for community sites")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Run one generation batch now and persist the results
    Run,

    /// Run a small batch and print the generated posts without saving them
    Test,

    /// Send a connection test request to the LLM provider
    Check,

    /// Show provider health and stored run statistics
    Health,
}
