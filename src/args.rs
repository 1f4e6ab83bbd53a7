//! velad CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the velad
//! daemon.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// velad CLI arguments.
#[derive(Parser, Debug, Clone, Eq, PartialEq, Hash)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Backend configuration file (JSON)
    #[clap(long)]
    pub config: PathBuf,

    /// Listen address for the control interface
    #[clap(long, default_value = "0.0.0.0:7140")]
    pub listen: SocketAddr,

    /// Run against a simulated digitizer instead of real hardware
    #[clap(long)]
    pub simulate: bool,
}
