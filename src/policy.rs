//! Per-node failure and reconnect policy state machines.
//!
//! Pure state: all transitions take an explicit `Instant` so they are
//! drivable from tests without sleeping. The node feeds failures in; the
//! cluster consults the health state before routing.

use crate::config::{FailureMode, ReconnectMode};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Decides when accumulated I/O failures kill a node.
#[derive(Debug)]
pub enum FailurePolicy {
    /// Dead on the first failure.
    FailFast,
    /// Dead once `threshold` failures land inside `window`.
    Tolerant {
        threshold: u32,
        window: Duration,
        failures: VecDeque<Instant>,
    },
}

impl FailurePolicy {
    pub fn from_mode(mode: FailureMode) -> Self {
        match mode {
            FailureMode::FailFast => FailurePolicy::FailFast,
            FailureMode::Tolerant { threshold, window } => FailurePolicy::Tolerant {
                threshold,
                window,
                failures: VecDeque::new(),
            },
        }
    }

    /// Record a failure at `now`. Returns whether the node is now dead.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        match self {
            FailurePolicy::FailFast => true,
            FailurePolicy::Tolerant {
                threshold,
                window,
                failures,
            } => {
                failures.push_back(now);
                while let Some(&oldest) = failures.front() {
                    if now.duration_since(oldest) > *window {
                        failures.pop_front();
                    } else {
                        break;
                    }
                }
                failures.len() as u32 >= *threshold
            }
        }
    }

    /// Forget accumulated failures (called after a successful reconnect).
    pub fn reset(&mut self) {
        if let FailurePolicy::Tolerant { failures, .. } = self {
            failures.clear();
        }
    }
}

/// Decides when a dead node may be offered a reconnect attempt.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectPolicy {
    Periodic { interval: Duration },
    Backoff { base: Duration, max: Duration },
}

impl ReconnectPolicy {
    pub fn from_mode(mode: ReconnectMode) -> Self {
        match mode {
            ReconnectMode::Periodic { interval } => ReconnectPolicy::Periodic { interval },
            ReconnectMode::Backoff { base, max } => ReconnectPolicy::Backoff { base, max },
        }
    }

    /// When the next attempt is allowed, given how many attempts have
    /// already failed since the node died.
    pub fn next_attempt(&self, now: Instant, attempts: u32) -> Instant {
        match *self {
            ReconnectPolicy::Periodic { interval } => now + interval,
            ReconnectPolicy::Backoff { base, max } => {
                let factor = 1u32 << attempts.min(16);
                now + base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Health state machine for one node.
///
/// `Healthy -> Dead` on a policy-confirmed failure; `Dead -> Healthy`
/// only after a successful reconnect, never merely because the retry
/// timer elapsed.
#[derive(Debug)]
pub enum NodeHealth {
    Healthy,
    Dead {
        since: Instant,
        next_retry: Instant,
        attempts: u32,
    },
}

impl NodeHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, NodeHealth::Healthy)
    }

    /// Whether a reconnect attempt is allowed at `now`.
    pub fn retry_due(&self, now: Instant) -> bool {
        match self {
            NodeHealth::Healthy => false,
            NodeHealth::Dead { next_retry, .. } => now >= *next_retry,
        }
    }

    /// Transition to dead, scheduling the first retry.
    pub fn mark_dead(&mut self, now: Instant, reconnect: &ReconnectPolicy) {
        if let NodeHealth::Healthy = self {
            *self = NodeHealth::Dead {
                since: now,
                next_retry: reconnect.next_attempt(now, 0),
                attempts: 0,
            };
        }
    }

    /// A reconnect attempt failed; push the next retry out.
    pub fn record_retry_failure(&mut self, now: Instant, reconnect: &ReconnectPolicy) {
        if let NodeHealth::Dead {
            next_retry,
            attempts,
            ..
        } = self
        {
            *attempts += 1;
            *next_retry = reconnect.next_attempt(now, *attempts);
        }
    }

    /// A reconnect succeeded.
    pub fn mark_healthy(&mut self) {
        *self = NodeHealth::Healthy;
    }
}
