//! Failsafe primitives
//!
//! Two small concurrent building blocks for clients and servers that talk to
//! more than one place:
//!
//! - **Endpoint failover** ([`failsafe::MultiEndpoint`]): priority-ordered
//!   endpoints with a recovery window for the current one and a switching
//!   delay that keeps a fleet from stampeding onto a recovered endpoint.
//! - **Keyed rate limiting** ([`failsafe::RateLimiter`]): one token bucket
//!   per caller, lazily refilled, with a background sweeper for idle keys.
//!
//! The two are independent; [`failsafe::Failsafe`] merely builds both from a
//! single [`config::Config`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// Logs go to stderr so that command output on stdout stays machine-readable.
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
