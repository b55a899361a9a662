//! Configuration types for the cache client.
//!
//! The client takes fully resolved values: endpoint lists, timeouts, and
//! pool sizing. Parsing configuration files is a caller concern.

use crate::buffer::BufferPoolConfig;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Which node-selection strategy the cluster builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorStrategy {
    /// Hash modulo member count. Simple, but remaps most keys when the
    /// member set changes.
    Modulo,
    /// Consistent hashing with virtual nodes; membership changes remap
    /// only the affected ring segments.
    Ketama,
}

/// When a node is declared dead after I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Dead after the first failure.
    FailFast,
    /// Dead after `threshold` failures inside `window`.
    Tolerant { threshold: u32, window: Duration },
}

/// How often a dead node is offered a reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Fixed interval between attempts.
    Periodic { interval: Duration },
    /// Exponential backoff from `base` capped at `max`.
    Backoff { base: Duration, max: Duration },
}

/// Main configuration for a [`Cluster`](crate::Cluster).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster member endpoints, in a stable order.
    pub members: Vec<SocketAddr>,

    /// Connection establishment deadline.
    pub connect_timeout: Duration,

    /// Idle deadline per receive call while responses are owed.
    pub receive_timeout: Duration,

    /// Largest response body accepted before the stream is considered
    /// corrupt.
    pub max_frame_body: u32,

    /// Buffer pool sizing.
    pub buffers: BufferPoolConfig,

    /// Node-selection strategy.
    pub locator: LocatorStrategy,

    /// Ring positions per node for the ketama locator.
    pub vnodes_per_node: usize,

    /// Failure-declaration policy applied to every node.
    pub failure: FailureMode,

    /// Retry cadence for dead nodes.
    pub reconnect: ReconnectMode,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(10),
            max_frame_body: 16 * 1024 * 1024,
            buffers: BufferPoolConfig::default(),
            locator: LocatorStrategy::Ketama,
            vnodes_per_node: 160,
            failure: FailureMode::Tolerant {
                threshold: 3,
                window: Duration::from_secs(10),
            },
            reconnect: ReconnectMode::Periodic {
                interval: Duration::from_secs(10),
            },
        }
    }
}

impl ClusterConfig {
    /// Create a configuration for the given member endpoints.
    pub fn new(members: Vec<SocketAddr>) -> Self {
        Self {
            members,
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_max_frame_body(mut self, bytes: u32) -> Self {
        self.max_frame_body = bytes;
        self
    }

    pub fn with_buffers(mut self, buffers: BufferPoolConfig) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_locator(mut self, locator: LocatorStrategy) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_vnodes_per_node(mut self, vnodes: usize) -> Self {
        self.vnodes_per_node = vnodes;
        self
    }

    pub fn with_failure_mode(mut self, failure: FailureMode) -> Self {
        self.failure = failure;
        self
    }

    pub fn with_reconnect_mode(mut self, reconnect: ReconnectMode) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validate before the cluster starts; all violations are
    /// `InvalidArgument`.
    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(Error::InvalidArgument(
                "cluster needs at least one member".into(),
            ));
        }
        if self.connect_timeout.is_zero() || self.receive_timeout.is_zero() {
            return Err(Error::InvalidArgument("timeouts must be non-zero".into()));
        }
        if self.buffers.max_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "max_buffer_size must be non-zero".into(),
            ));
        }
        if self.vnodes_per_node == 0 && self.locator == LocatorStrategy::Ketama {
            return Err(Error::InvalidArgument(
                "ketama locator needs at least one vnode per node".into(),
            ));
        }
        if let FailureMode::Tolerant { threshold, .. } = self.failure {
            if threshold == 0 {
                return Err(Error::InvalidArgument(
                    "failure threshold must be non-zero".into(),
                ));
            }
        }
        Ok(())
    }
}
