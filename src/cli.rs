//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Failover Relay - rate-limited, circuit-broken provider dispatch
#[derive(Parser, Debug)]
#[command(name = "failover-relay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FAILOVER_RELAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "FAILOVER_RELAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FAILOVER_RELAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load the configuration and print a summary
    Validate,

    /// Dispatch a batch of requests read from a JSON lines file
    Dispatch {
        /// Requests, one JSON object per line (`-` for stdin)
        #[arg(short, long, required = true)]
        input: PathBuf,

        /// Maximum requests in flight (overrides `dispatch.concurrency`)
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,

        /// Report format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

/// Report output format
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable summary
    Text,
    /// JSON report
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dispatch() {
        let cli = Cli::try_parse_from([
            "failover-relay",
            "--config",
            "relay.yaml",
            "dispatch",
            "--input",
            "batch.jsonl",
            "-n",
            "4",
            "--format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("relay.yaml")));
        match cli.command {
            Command::Dispatch {
                input,
                concurrency,
                format,
            } => {
                assert_eq!(input, PathBuf::from("batch.jsonl"));
                assert_eq!(concurrency, Some(4));
                assert_eq!(format, OutputFormat::Json);
            }
            Command::Validate => panic!("expected dispatch"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["failover-relay", "validate", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Command::Validate));
    }

    #[test]
    fn test_dispatch_requires_input() {
        assert!(Cli::try_parse_from(["failover-relay", "dispatch"]).is_err());
    }
}
