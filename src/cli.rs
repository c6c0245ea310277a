//! CLI / entry point (SPEC_FULL §4.9): `proxy <config-path>`.
//!
//! Ground: `httproxy::cmd::Args` (positional bind address, log-level and
//! colored flags). The teacher's argument parser (`sarge`) is a `path`
//! dependency pointing outside this workspace and cannot be fetched; this
//! crate uses `clap`'s derive API instead, the registry crate the sibling
//! `agentgateway`/`mini-gateway-rs` repos in this example pack use for the
//! same purpose (see DESIGN.md).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "filterproxy", about = "Forwarding HTTP/1.1 proxy with rule-based access control")]
pub struct Args {
    /// Path to the JSON configuration file (spec §6).
    pub config_path: PathBuf,

    /// Diagnostic log verbosity: off, error, warn, info, debug, trace.
    #[arg(short = 'v', long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Colorize diagnostic log level output.
    #[arg(long)]
    pub colored: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }
}
