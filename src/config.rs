use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::engine::Settings;

fn parse_duration(s: &str) -> Result<Duration, String> {
    duration_str::parse(s).map_err(|e| e.to_string())
}

/// Command-line surface. Positional `listen_address`/`remote_address`
/// plus the flags carried over one-for-one from the original
/// `cenkalti/tcpproxy`.
#[derive(Parser, Debug)]
#[command(name = "tcpproxy", disable_version_flag = true, about = "Transparent TCP forwarder with live-reconfigurable upstream")]
pub struct Cli {
    /// Print version and exit.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: (),

    /// Address to accept client connections on, e.g. `0.0.0.0:8000`.
    pub listen_address: String,

    /// Initial upstream address, e.g. `127.0.0.1:9000`. May be overridden
    /// by a persisted state file (see `--state-path`).
    pub remote_address: String,

    /// Listen address for the management interface; omit to disable it.
    #[arg(short = 'm', long = "mgmt")]
    pub mgmt_listen_addr: Option<String>,

    /// Grace period before killing connections still on the old upstream.
    #[arg(short = 'g', long = "grace", default_value = "10s", value_parser = parse_duration)]
    pub grace_period: Duration,

    /// Timeout for a single dial attempt to the upstream.
    #[arg(short = 'c', long = "connect-timeout", default_value = "10s", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// TCP keepalive period applied to both sides of a connection.
    #[arg(short = 'k', long = "keepalive", default_value = "60s", value_parser = parse_duration)]
    pub keepalive: Duration,

    /// How long a resolved upstream address is cached before re-resolving.
    #[arg(short = 'r', long = "resolve-period", default_value = "10s", value_parser = parse_duration)]
    pub resolve_period: Duration,

    /// File to save/load the remote address to survive restarts; omit to
    /// disable persistence.
    #[arg(short = 's', long = "state-path")]
    pub state_path: Option<PathBuf>,

    /// Enable verbose debug logging.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

impl Cli {
    pub fn settings(&self) -> Settings {
        Settings {
            grace_period: self.grace_period,
            connect_timeout: self.connect_timeout,
            keepalive_period: self.keepalive,
            resolve_period: self.resolve_period,
            state_path: self.state_path.clone(),
        }
    }
}
