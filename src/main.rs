//! failsafe - drive the failover selector and rate limiter from the shell

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use failsafe_core::{
    cli::{Cli, Command, SelectEvent},
    config::Config,
    failsafe::{MultiEndpoint, MultiEndpointOptions, RateLimiter},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Command::Limit {
            keys,
            count,
            tokens,
            pause,
        } => run_limit(config, &keys, count, tokens, pause).await,
        Command::Select { endpoints, events } => run_select(config, endpoints, &events).await,
    }
}

/// Run `count` rounds of takes over `keys`
async fn run_limit(
    config: Config,
    keys: &[String],
    count: u32,
    tokens: Option<u32>,
    pause: Option<Duration>,
) -> anyhow::Result<()> {
    let mut limit_config = config.rate_limit;
    if let Some(tokens) = tokens {
        limit_config.tokens = tokens;
    }
    let limiter = RateLimiter::new(&limit_config).context("failed to build rate limiter")?;

    let mut granted = 0u64;
    for round in 0..count {
        if round > 0 {
            if let Some(pause) = pause {
                tokio::time::sleep(pause).await;
            }
        }
        for key in keys {
            let outcome = limiter.take(key);
            granted += u64::from(outcome.ok);
            println!(
                "{}",
                json!({
                    "key": key,
                    "limit": outcome.limit,
                    "remaining": outcome.remaining,
                    "reset": outcome.reset,
                    "ok": outcome.ok,
                })
            );
        }
    }

    info!(
        granted,
        requested = u64::from(count) * keys.len() as u64,
        "Rate limit run finished"
    );
    limiter.close();
    Ok(())
}

/// Apply `events` to a selector and print its view after each one
async fn run_select(
    config: Config,
    endpoints: Vec<String>,
    events: &[SelectEvent],
) -> anyhow::Result<()> {
    let mut options = MultiEndpointOptions::from(&config.endpoints);
    if !endpoints.is_empty() {
        options.endpoints = endpoints;
    }
    let selector = MultiEndpoint::new(options).context("failed to build endpoint selector")?;

    print_selection(&selector, "start")?;
    for event in events {
        let label = match event {
            SelectEvent::Availability { id, available } => {
                selector.set_availability(id, *available);
                format!("{id}={}", if *available { "up" } else { "down" })
            }
            SelectEvent::Wait(duration) => {
                tokio::time::sleep(*duration).await;
                format!("wait:{}ms", duration.as_millis())
            }
        };
        print_selection(&selector, &label)?;
    }
    Ok(())
}

fn print_selection(selector: &MultiEndpoint, event: &str) -> anyhow::Result<()> {
    let line = json!({
        "event": event,
        "current": selector.current(),
        "endpoints": selector.snapshot(),
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}
