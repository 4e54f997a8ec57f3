use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// A unified AI-inference gateway.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
pub(crate) struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "relay.toml")]
    pub config: PathBuf,

    /// Listen address, overriding the configuration.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Log filter, e.g. `info` or `gateway=debug,server=debug`.
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_filter: String,
}
