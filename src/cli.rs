use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agent-access-core")]
#[command(about = "Control-plane core: SSH pool, reverse tunnels, terminal and log streaming for a fleet of sandboxed agent containers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the web server
    Server {
        /// Configuration file path
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },
}

impl Commands {
    // Commands are handled directly in main.rs
}
