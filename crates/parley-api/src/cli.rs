//! CLI definitions for the `parley` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Realtime chat transport for the consulting intake service.
#[derive(Parser)]
#[command(name = "parley", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to $PARLEY_CONFIG, then ~/.parley/config.toml).
    #[arg(long, global = true, env = "PARLEY_CONFIG")]
    pub config: Option<PathBuf>,

    /// More log output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the WebSocket and diagnostics server.
    Serve {
        /// Address to bind (overrides server.host).
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides server.port).
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

impl Cli {
    /// Log filter for the requested verbosity, falling back to `configured`.
    pub fn log_level<'a>(&self, configured: &'a str) -> &'a str {
        match self.verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from(["parley", "serve", "--host", "0.0.0.0", "-p", "9000"]).unwrap();
        match cli.command {
            Commands::Serve { host, port } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9000));
            }
            Commands::Config => panic!("expected serve"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["parley", "config", "-vv", "--json-logs"]).unwrap();
        assert!(cli.json_logs);
        assert_eq!(cli.log_level("info"), "trace");
        assert!(matches!(cli.command, Commands::Config));
    }

    #[test]
    fn test_configured_level_without_verbose() {
        let cli = Cli::try_parse_from(["parley", "serve"]).unwrap();
        assert_eq!(cli.log_level("warn"), "warn");
    }
}
