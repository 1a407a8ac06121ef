//! Priority-ordered endpoint selection with recovery and switching delays
//!
//! A [`MultiEndpoint`] tracks a set of endpoints whose priority is their
//! position in the configured list (lower is better) and exposes exactly one
//! of them as the current endpoint.
//!
//! # Rules
//!
//! - An endpoint reported down while `Available` enters `Recovering` for
//!   `recovery_timeout`. While the current endpoint is recovering and nothing
//!   strictly better is available, it stays current.
//! - The best available endpoint otherwise becomes current. When the current
//!   endpoint is still usable, the switch waits `switching_delay` so that a
//!   fleet of clients does not stampede onto a freshly recovered endpoint.
//! - With nothing available and the current endpoint removed, the endpoint
//!   with the best priority becomes current immediately.
//!
//! Every timer captures the generation of the transition it was scheduled
//! for and does nothing if the selector has moved on since.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::clock::{self, TimerHandle};
use crate::config::MultiEndpointConfig;
use crate::{Error, Result};

/// Health state of a single endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Not usable
    Unavailable,
    /// Usable
    Available,
    /// Went down recently; kept as current while it gets a chance to recover
    Recovering,
}

/// Options for building a [`MultiEndpoint`]
#[derive(Debug, Clone, Default)]
pub struct MultiEndpointOptions {
    /// Endpoint ids in priority order
    pub endpoints: Vec<String>,
    /// Zero disables the recovering state
    pub recovery_timeout: Duration,
    /// Zero disables delayed switching
    pub switching_delay: Duration,
}

impl From<&MultiEndpointConfig> for MultiEndpointOptions {
    fn from(config: &MultiEndpointConfig) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            recovery_timeout: config.recovery_timeout,
            switching_delay: config.switching_delay,
        }
    }
}

/// Point-in-time view of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSnapshot {
    /// Endpoint id
    pub id: String,
    /// Position in the configured list
    pub priority: usize,
    /// Health state
    pub status: EndpointStatus,
    /// Whether this endpoint is the current one
    pub current: bool,
}

struct Endpoint {
    id: String,
    priority: usize,
    status: EndpointStatus,
    last_change: Instant,
    generation: u64,
    recovery_timer: Option<TimerHandle>,
}

impl Endpoint {
    fn cancel_recovery(&mut self) {
        if let Some(timer) = self.recovery_timer.take() {
            timer.cancel();
        }
    }
}

struct PendingSwitch {
    target: String,
    generation: u64,
    timer: Option<TimerHandle>,
}

struct SelectorState {
    endpoints: HashMap<String, Endpoint>,
    current: String,
    pending: Option<PendingSwitch>,
}

impl SelectorState {
    fn clear_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            if let Some(timer) = pending.timer {
                timer.cancel();
            }
            trace!(target_endpoint = %pending.target, "Pending switch discarded");
        }
    }

    /// Id and priority of the available endpoint with the best priority
    fn top_available(&self) -> Option<(String, usize)> {
        self.endpoints
            .values()
            .filter(|e| e.status == EndpointStatus::Available)
            .min_by_key(|e| e.priority)
            .map(|e| (e.id.clone(), e.priority))
    }

    fn top(&self) -> Option<String> {
        self.endpoints
            .values()
            .min_by_key(|e| e.priority)
            .map(|e| e.id.clone())
    }
}

struct Shared {
    recovery_timeout: Duration,
    switching_delay: Duration,
    runtime: Option<Handle>,
    this: Weak<Shared>,
    generations: AtomicU64,
    state: RwLock<SelectorState>,
}

impl Shared {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn initial_status(&self) -> EndpointStatus {
        if self.recovery_timeout.is_zero() {
            EndpointStatus::Unavailable
        } else {
            EndpointStatus::Recovering
        }
    }

    /// Schedule `f` to run under the state lock after `delay`
    ///
    /// The callback holds only a weak reference, so it never keeps a dropped
    /// selector alive.
    fn schedule<F>(&self, delay: Duration, f: F) -> Option<TimerHandle>
    where
        F: FnOnce(&Shared, &mut SelectorState) + Send + 'static,
    {
        let runtime = self.runtime.as_ref()?;
        let this = self.this.clone();
        Some(clock::schedule(runtime, delay, move || {
            let Some(shared) = this.upgrade() else {
                return;
            };
            let mut state = shared.state.write();
            f(&shared, &mut state);
        }))
    }

    fn transition(&self, endpoint: &mut Endpoint, status: EndpointStatus) {
        endpoint.cancel_recovery();
        let previous = endpoint.status;
        endpoint.status = status;
        endpoint.last_change = Instant::now();
        endpoint.generation = self.next_generation();

        if status == EndpointStatus::Recovering {
            let id = endpoint.id.clone();
            let generation = endpoint.generation;
            endpoint.recovery_timer = self.schedule(self.recovery_timeout, move |shared, state| {
                shared.expire_recovery(state, &id, generation);
            });
        }

        debug!(endpoint = %endpoint.id, from = ?previous, to = ?status, "Endpoint status changed");
    }

    fn new_endpoint(&self, id: &str, priority: usize) -> Endpoint {
        let mut endpoint = Endpoint {
            id: id.to_string(),
            priority,
            status: EndpointStatus::Unavailable,
            last_change: Instant::now(),
            generation: self.next_generation(),
            recovery_timer: None,
        };
        let initial = self.initial_status();
        if initial != endpoint.status {
            self.transition(&mut endpoint, initial);
        }
        endpoint
    }

    fn expire_recovery(&self, state: &mut SelectorState, id: &str, generation: u64) {
        let Some(endpoint) = state.endpoints.get_mut(id) else {
            trace!(endpoint = id, "Recovery timer fired for removed endpoint");
            return;
        };
        if endpoint.generation != generation || endpoint.status != EndpointStatus::Recovering {
            trace!(endpoint = id, "Stale recovery timer ignored");
            return;
        }

        // The timer is the one firing right now; nothing left to cancel.
        endpoint.recovery_timer = None;
        warn!(
            endpoint = id,
            recovering_for_ms = endpoint.last_change.elapsed().as_millis(),
            "Endpoint did not recover in time, marking unavailable"
        );
        self.transition(endpoint, EndpointStatus::Unavailable);
        self.maybe_update_current(state);
    }

    fn complete_switch(&self, state: &mut SelectorState, generation: u64) {
        let Some(pending) = state.pending.take_if(|p| p.generation == generation) else {
            trace!("Stale switch timer ignored");
            return;
        };

        match state.endpoints.get(&pending.target) {
            Some(e) if e.status == EndpointStatus::Available => {
                Self::set_current(state, pending.target);
            }
            _ => {
                debug!(target_endpoint = %pending.target, "Delayed switch target no longer available");
            }
        }
    }

    fn set_current(state: &mut SelectorState, id: String) {
        if state.current != id {
            info!(from = %state.current, to = %id, "Switching current endpoint");
            state.current = id;
        }
    }

    fn maybe_update_current(&self, state: &mut SelectorState) {
        let top_available = state.top_available();
        let current = state
            .endpoints
            .get(&state.current)
            .map(|c| (c.status, c.priority));

        if let Some((EndpointStatus::Recovering, priority)) = current {
            if top_available.as_ref().is_none_or(|(_, p)| *p > priority) {
                // Let the current endpoint recover while nothing better is up.
                // A switch target that went down must earn a fresh delay.
                if state.pending.as_ref().is_some_and(|p| {
                    state
                        .endpoints
                        .get(&p.target)
                        .is_none_or(|e| e.status != EndpointStatus::Available)
                }) {
                    state.clear_pending();
                }
                return;
            }
        }

        if let Some((target, _)) = top_available {
            self.switch_to(state, current.map(|(status, _)| status), target);
            return;
        }

        if current.is_none() {
            state.clear_pending();
            if let Some(top) = state.top() {
                Self::set_current(state, top);
            }
        }
    }

    fn switch_to(&self, state: &mut SelectorState, from: Option<EndpointStatus>, target: String) {
        if state.current == target {
            state.clear_pending();
            return;
        }

        if self.switching_delay.is_zero() || matches!(from, None | Some(EndpointStatus::Unavailable)) {
            state.clear_pending();
            Self::set_current(state, target);
            return;
        }

        if state.pending.as_ref().is_some_and(|p| p.target == target) {
            return;
        }

        state.clear_pending();
        let generation = self.next_generation();
        debug!(
            from = %state.current,
            to = %target,
            delay_ms = self.switching_delay.as_millis(),
            "Scheduling delayed endpoint switch"
        );
        let timer = self.schedule(self.switching_delay, move |shared, state| {
            shared.complete_switch(state, generation);
        });
        state.pending = Some(PendingSwitch {
            target,
            generation,
            timer,
        });
    }

    /// Bring the endpoint set in line with `ids` (already de-duplicated)
    fn reconcile(&self, state: &mut SelectorState, ids: &[String]) {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();

        state.endpoints.retain(|id, endpoint| {
            let keep = wanted.contains(id.as_str());
            if !keep {
                endpoint.cancel_recovery();
                debug!(endpoint = %id, "Endpoint removed");
            }
            keep
        });

        if state
            .pending
            .as_ref()
            .is_some_and(|p| !wanted.contains(p.target.as_str()))
        {
            state.clear_pending();
        }

        for (priority, id) in ids.iter().enumerate() {
            if let Some(endpoint) = state.endpoints.get_mut(id) {
                endpoint.priority = priority;
            } else {
                let endpoint = self.new_endpoint(id, priority);
                debug!(endpoint = %id, priority, status = ?endpoint.status, "Endpoint added");
                state.endpoints.insert(id.clone(), endpoint);
            }
        }

        self.maybe_update_current(state);
    }
}

/// Drop duplicate ids, keeping the first occurrence
fn dedup_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .map(AsRef::as_ref)
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// Selector exposing one current endpoint out of a priority-ordered set
///
/// Dropping the selector cancels all of its outstanding timers.
pub struct MultiEndpoint {
    shared: Arc<Shared>,
}

impl MultiEndpoint {
    /// Create a selector; the first endpoint starts as current
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyEndpointList`] for an empty list and
    /// [`Error::NoRuntime`] when a delay is configured but there is no tokio
    /// runtime to run timers on.
    pub fn new(options: MultiEndpointOptions) -> Result<Self> {
        let ids = dedup_ids(&options.endpoints);
        let Some(first) = ids.first().cloned() else {
            return Err(Error::EmptyEndpointList);
        };

        let needs_timers = !options.recovery_timeout.is_zero() || !options.switching_delay.is_zero();
        let runtime = clock::current_runtime();
        if needs_timers && runtime.is_none() {
            return Err(Error::NoRuntime);
        }

        let shared = Arc::new_cyclic(|this| Shared {
            recovery_timeout: options.recovery_timeout,
            switching_delay: options.switching_delay,
            runtime,
            this: this.clone(),
            generations: AtomicU64::new(0),
            state: RwLock::new(SelectorState {
                endpoints: HashMap::with_capacity(ids.len()),
                current: first,
                pending: None,
            }),
        });

        {
            let mut state = shared.state.write();
            shared.reconcile(&mut state, &ids);
        }

        info!(
            endpoints = ids.len(),
            recovery_timeout_ms = options.recovery_timeout.as_millis(),
            switching_delay_ms = options.switching_delay.as_millis(),
            "Endpoint selector created"
        );
        Ok(Self { shared })
    }

    /// Build a selector from configuration
    ///
    /// # Errors
    ///
    /// See [`MultiEndpoint::new`].
    pub fn from_config(config: &MultiEndpointConfig) -> Result<Self> {
        Self::new(config.into())
    }

    /// Id of the endpoint currently exposed
    #[must_use]
    pub fn current(&self) -> String {
        self.shared.state.read().current.clone()
    }

    /// Report whether an endpoint is reachable
    ///
    /// Unknown ids are ignored.
    #[tracing::instrument(skip(self))]
    pub fn set_availability(&self, id: &str, available: bool) {
        let shared = &self.shared;
        let mut state = shared.state.write();
        let Some(endpoint) = state.endpoints.get_mut(id) else {
            debug!("Ignoring availability for unknown endpoint");
            return;
        };

        if available {
            if endpoint.status != EndpointStatus::Available {
                shared.transition(endpoint, EndpointStatus::Available);
            }
        } else if endpoint.status == EndpointStatus::Available {
            let next = if shared.recovery_timeout.is_zero() {
                EndpointStatus::Unavailable
            } else {
                EndpointStatus::Recovering
            };
            shared.transition(endpoint, next);
        }

        shared.maybe_update_current(&mut state);
    }

    /// Replace the endpoint set, keeping the state of retained endpoints
    ///
    /// Priorities follow the new list order; duplicates keep their first
    /// position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyEndpointList`] for an empty list; the selector is
    /// left untouched in that case.
    #[tracing::instrument(skip_all, fields(endpoints = endpoints.len()))]
    pub fn set_endpoints<S: AsRef<str>>(&self, endpoints: &[S]) -> Result<()> {
        let ids = dedup_ids(endpoints);
        if ids.is_empty() {
            return Err(Error::EmptyEndpointList);
        }

        let mut state = self.shared.state.write();
        self.shared.reconcile(&mut state, &ids);
        Ok(())
    }

    /// Health state of an endpoint, if known
    #[must_use]
    pub fn status(&self, id: &str) -> Option<EndpointStatus> {
        self.shared.state.read().endpoints.get(id).map(|e| e.status)
    }

    /// All endpoints ordered by priority
    #[must_use]
    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let state = self.shared.state.read();
        let mut endpoints: Vec<EndpointSnapshot> = state
            .endpoints
            .values()
            .map(|e| EndpointSnapshot {
                id: e.id.clone(),
                priority: e.priority,
                status: e.status,
                current: e.id == state.current,
            })
            .collect();
        endpoints.sort_by_key(|e| e.priority);
        endpoints
    }
}

impl Drop for MultiEndpoint {
    fn drop(&mut self) {
        let mut state = self.shared.state.write();
        for endpoint in state.endpoints.values_mut() {
            endpoint.cancel_recovery();
        }
        state.clear_pending();
    }
}

impl std::fmt::Debug for MultiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEndpoint")
            .field("current", &self.current())
            .field("recovery_timeout", &self.shared.recovery_timeout)
            .field("switching_delay", &self.shared.switching_delay)
            .finish_non_exhaustive()
    }
}
