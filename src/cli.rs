//! Command-line interface

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde;

/// Exercise the failsafe primitives from the command line
#[derive(Parser, Debug)]
#[command(name = "failsafe")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FAILSAFE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "FAILSAFE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FAILSAFE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective configuration as YAML
    Config,

    /// Take tokens from a fresh rate limiter and print each outcome as JSON
    Limit {
        /// Keys to take from, in round-robin order
        #[arg(short, long = "key", default_value = "default")]
        keys: Vec<String>,

        /// Number of takes per key
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Override the configured bucket size
        #[arg(long)]
        tokens: Option<u32>,

        /// Pause between rounds (e.g. "250ms")
        #[arg(long, value_parser = parse_duration)]
        pause: Option<Duration>,
    },

    /// Drive an endpoint selector with availability events
    Select {
        /// Override the configured endpoints (comma-separated, best first)
        #[arg(long, value_delimiter = ',')]
        endpoints: Vec<String>,

        /// Events applied in order: `ID=up`, `ID=down` or `wait:DURATION`
        #[arg(short, long = "event")]
        events: Vec<SelectEvent>,
    },
}

/// One step of the `select` subcommand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectEvent {
    /// Report an endpoint's availability
    Availability {
        /// Endpoint id
        id: String,
        /// Reported state
        available: bool,
    },
    /// Let time pass so timers can fire
    Wait(Duration),
}

impl FromStr for SelectEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(duration) = s.strip_prefix("wait:") {
            return parse_duration(duration).map(Self::Wait);
        }

        let (id, state) = s
            .split_once('=')
            .ok_or_else(|| format!("expected ID=up, ID=down or wait:DURATION, got '{s}'"))?;
        if id.is_empty() {
            return Err(format!("missing endpoint id in '{s}'"));
        }
        let available = match state {
            "up" => true,
            "down" => false,
            other => return Err(format!("unknown state '{other}', expected up or down")),
        };
        Ok(Self::Availability {
            id: id.to_string(),
            available,
        })
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::parse(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}
