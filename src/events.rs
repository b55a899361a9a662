//! Observability boundary.
//!
//! The client reports lifecycle events through an injected sink so
//! callers can wire their own telemetry. Tracing spans/events are
//! emitted independently; the client works fine with the default
//! [`NoopSink`].

use crate::types::NodeId;
use std::net::SocketAddr;

/// Lifecycle events emitted by the client core.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectStart { node: NodeId, addr: SocketAddr },
    ConnectOk { node: NodeId, addr: SocketAddr },
    ConnectFailed { node: NodeId, addr: SocketAddr },
    ConnectionClosed { node: NodeId },
    OpEnqueued { node: NodeId, opaque: u32 },
    /// One socket write was accepted; a frame usually takes several.
    SendChunk { node: NodeId, bytes: usize },
    /// The whole request frame is on the wire.
    OpSent { node: NodeId, opaque: u32, bytes: usize },
    /// One socket read produced bytes; frames reassemble across reads.
    ReceiveChunk { node: NodeId, bytes: usize },
    ResponseReceived { node: NodeId, opaque: u32 },
    OpCompleted { node: NodeId, opaque: u32 },
    NodeDead { node: NodeId },
    NodeRevived { node: NodeId },
}

/// Sink for [`ClientEvent`]s. Implementations must be cheap; events are
/// emitted from the node I/O loops.
pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, event: &ClientEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_event(&self, _event: &ClientEvent) {}
}
