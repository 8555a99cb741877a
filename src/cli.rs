//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the swarm trainer.

use clap::{Parser, Subcommand};

/// Swarm Trainer - decentralized collaborative training peer
///
/// Joins a swarm of peers through a distributed directory, accumulates
/// gradients locally and averages them with whichever peers are alive,
/// without any central coordinator.
#[derive(Parser, Debug)]
#[command(name = "swarm-trainer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a training peer
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "SWARM_CONFIG")]
        config: Option<String>,

        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Bootstrap peer ("<peer_id_hex>@host:port" or "host:port"), repeatable
        #[arg(short = 'i', long = "initial-peer")]
        initial_peers: Vec<String>,
    },

    /// Watch a run without training
    Monitor {
        /// Path to configuration file
        #[arg(short, long, env = "SWARM_CONFIG")]
        config: Option<String>,

        /// Bootstrap peer ("<peer_id_hex>@host:port" or "host:port"), repeatable
        #[arg(short = 'i', long = "initial-peer")]
        initial_peers: Vec<String>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
