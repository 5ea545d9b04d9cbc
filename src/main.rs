//! Failover Relay - rate-limited, circuit-broken provider dispatch

use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use failover_relay::{
    cli::{Cli, Command, OutputFormat},
    config::Config,
    dispatch::DispatchRequest,
    relay::Relay,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Validate => run_validate(&config),
        Command::Dispatch {
            input,
            concurrency,
            format,
        } => run_dispatch(config, &input, concurrency, format).await,
    }
}

/// Print a configuration summary
fn run_validate(config: &Config) -> ExitCode {
    println!("Configuration OK");
    println!("\nProviders ({}):", config.providers.len());
    for (id, provider) in &config.providers {
        let state = if provider.enabled { "enabled" } else { "disabled" };
        println!("  {id} [{state}] {}", provider.endpoint);
        let limits = &provider.rate_limit;
        if limits.is_limited() {
            println!(
                "    rate limit: {}/min, {}/hour, {} tokens/min",
                limits.requests_per_minute, limits.requests_per_hour, limits.tokens_per_minute
            );
        }
        let breaker = provider.circuit_breaker.unwrap_or(config.circuit_breaker);
        if breaker.enabled {
            println!(
                "    circuit breaker: opens after {} failures, for {}s",
                breaker.failure_threshold,
                breaker.timeout_duration.as_secs()
            );
        } else {
            println!("    circuit breaker: disabled");
        }
    }

    let chain: Vec<String> = config
        .failover_chain()
        .iter()
        .map(ToString::to_string)
        .collect();
    println!(
        "\nFailover chain: {} (deadline {}s)",
        if chain.is_empty() {
            "<empty>".to_string()
        } else {
            chain.join(" -> ")
        },
        config.failover.timeout.as_secs()
    );
    println!("Dispatch concurrency: {}", config.dispatch.concurrency);

    ExitCode::SUCCESS
}

/// Run a batch from a JSON lines file
async fn run_dispatch(
    mut config: Config,
    input: &Path,
    concurrency: Option<usize>,
    format: OutputFormat,
) -> ExitCode {
    let contents = match read_input(input).await {
        Ok(contents) => contents,
        Err(e) => {
            error!("Failed to read {}: {e}", input.display());
            return ExitCode::FAILURE;
        }
    };

    let requests = match DispatchRequest::parse_lines(&contents) {
        Ok(requests) => requests,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(n) = concurrency {
        config.dispatch.concurrency = n;
    }

    let relay = match Relay::from_config(config) {
        Ok(relay) => relay,
        Err(e) => {
            error!("Failed to build relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(requests = requests.len(), "Loaded batch");
    let report = relay.run_batch(requests).await;

    match format {
        OutputFormat::Text => {
            println!("{report}");
            for outcome in &report.outcomes {
                if let Err(e) = &outcome.result {
                    println!("  {} failed: {e}", outcome.request_id);
                }
            }
        }
        OutputFormat::Json => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!("Failed to serialize report: {e}");
                return ExitCode::FAILURE;
            }
        },
    }

    if report.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

async fn read_input(input: &Path) -> std::io::Result<String> {
    if input == Path::new("-") {
        tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).map(|_| buf)
        })
        .await
        .map_err(std::io::Error::other)?
    } else {
        tokio::fs::read_to_string(input).await
    }
}
