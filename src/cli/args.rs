//! Command-line interface definitions.

use clap::{ColorChoice, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// Preview runtime host: process pool, file sync and live-update relay
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Config file path (default: previewd.toml)
    #[arg(short = 'C', long, global = true, default_value = "previewd.toml", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// Enable verbose output for debugging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the host: registry, relay and admin endpoint
    #[command(visible_alias = "s")]
    Serve {
        /// Network interface for the relay and admin endpoints (e.g., 127.0.0.1, 0.0.0.0)
        #[arg(short, long)]
        interface: Option<IpAddr>,

        /// Port viewers connect to for live updates
        #[arg(long)]
        relay_port: Option<u16>,

        /// Port of the admin HTTP endpoint
        #[arg(long)]
        admin_port: Option<u16>,

        /// Register configured projects without starting them
        #[arg(long)]
        no_autostart: bool,
    },

    /// Validate the config file and list configured projects
    #[command(visible_alias = "c")]
    Check,
}
