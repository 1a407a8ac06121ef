//! Failsafe mechanisms: endpoint failover and keyed rate limiting

mod multi_endpoint;
mod rate_limiter;

pub use multi_endpoint::{EndpointSnapshot, EndpointStatus, MultiEndpoint, MultiEndpointOptions};
pub use rate_limiter::{RateLimiter, TakeOutcome};

use crate::Result;
use crate::config::Config;

/// Selector and limiter built from one configuration
///
/// The two share nothing at runtime; this only saves callers from wiring
/// both up by hand.
#[derive(Debug)]
pub struct Failsafe {
    /// Endpoint selector
    pub endpoints: MultiEndpoint,
    /// Keyed rate limiter
    pub rate_limiter: RateLimiter,
}

impl Failsafe {
    /// Create both primitives from configuration
    ///
    /// # Errors
    ///
    /// Fails if either primitive rejects its section of the configuration.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            endpoints: MultiEndpoint::from_config(&config.endpoints)?,
            rate_limiter: RateLimiter::new(&config.rate_limit)?,
        })
    }

    /// Endpoint the caller should talk to right now
    #[must_use]
    pub fn current_endpoint(&self) -> String {
        self.endpoints.current()
    }

    /// Admit a request from `caller` against its rate limit
    #[must_use]
    pub fn admit(&self, caller: &str) -> TakeOutcome {
        self.rate_limiter.take(caller)
    }
}
