//! Per-endpoint circuit breaker.
//!
//! Closed (normal operation), Open (failing fast), Half-Open (one probe
//! allowed through to test recovery).

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Breaker guarding one backend endpoint
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Current state; an open breaker past its cooldown reports half-open
    pub fn state(&self) -> CircuitState {
        match &*self.inner.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { opened_at } if opened_at.elapsed() >= self.cooldown => {
                CircuitState::HalfOpen
            }
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Ask whether a call may go through. In half-open state only one probe
    /// is admitted until its outcome is recorded on the returned permit.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.inner.lock();
        let probe = match &mut *inner {
            Inner::Closed { .. } => false,
            Inner::Open { opened_at } => {
                if opened_at.elapsed() < self.cooldown {
                    return None;
                }
                info!(endpoint = %self.endpoint, "Circuit half-open, admitting probe");
                *inner = Inner::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
            Inner::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    return None;
                }
                *probe_in_flight = true;
                true
            }
        };
        Some(Permit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// A probe ended without an outcome (its caller went away)
    fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if let Inner::HalfOpen {
            probe_in_flight: true,
        } = *inner
        {
            warn!(endpoint = %self.endpoint, "Probe abandoned, circuit re-opened");
            *inner = Inner::Open {
                opened_at: Instant::now(),
            };
        }
    }

    /// The endpoint answered (any response, including rejections)
    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if matches!(*inner, Inner::HalfOpen { .. } | Inner::Open { .. }) {
            info!(endpoint = %self.endpoint, "Circuit closed");
        }
        *inner = Inner::Closed {
            consecutive_failures: 0,
        };
    }

    /// The endpoint timed out or was unreachable
    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    warn!(
                        endpoint = %self.endpoint,
                        failures = *consecutive_failures,
                        "Circuit opened"
                    );
                    *inner = Inner::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!(endpoint = %self.endpoint, "Probe failed, circuit re-opened");
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }
}

/// Admission to call an endpoint; report the outcome with
/// [`Permit::succeeded`] or [`Permit::failed`]. A half-open probe dropped
/// without an outcome re-opens the breaker.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The endpoint answered (any response, including rejections)
    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// The endpoint timed out or was unreachable
    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.abandon_probe();
        }
    }
}
