//! Async client for memcached's binary protocol.
//!
//! This crate drives a cluster of cache servers over the binary wire
//! protocol, with:
//! - **Pipelined connections** — one TCP connection per node, requests
//!   streamed back-to-back and correlated by opaque id
//! - **Quiet operations** — the protocol's silent-on-success variants,
//!   resolved through pipeline ordering and NoOp barriers
//! - **Consistent hashing** — ketama-style key placement so membership
//!   changes remap only a bounded slice of the keyspace
//! - **Failure policies** — per-node death thresholds and reconnect
//!   schedules, with no silent failover to other nodes
//!
//! # Example
//!
//! ```rust,no_run
//! use cachewire::{Cluster, ClusterConfig, Operation, OperationKind, StoreMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::new(vec![
//!         "127.0.0.1:11211".parse()?,
//!         "127.0.0.1:11212".parse()?,
//!     ]);
//!     let cluster = Cluster::connect(config).await?;
//!
//!     let set = Operation::new(
//!         cluster.opaque_generator(),
//!         b"user:123".to_vec(),
//!         0,
//!         OperationKind::Store {
//!             mode: StoreMode::Set,
//!             flags: 0,
//!             value: b"Alice".to_vec(),
//!             expiration: 0,
//!             quiet: false,
//!         },
//!     )?;
//!     cluster.execute(set).await?;
//!
//!     let get = Operation::new(
//!         cluster.opaque_generator(),
//!         b"user:123".to_vec(),
//!         0,
//!         OperationKind::Get { quiet: false },
//!     )?;
//!     let result = cluster.execute(get).await?;
//!     println!("got: {:?}", result);
//!
//!     cluster.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Cluster                     │
//! │  execute(op) ── locator ──> owning node     │
//! │  health gate / reconnect per member         │
//! └─────────────────────────────────────────────┘
//!                      │
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │      Node       │ ... │      Node       │
//! │ queue → write   │     │ queue → write   │
//! │ in-flight table │     │ in-flight table │
//! │ read → resolve  │     │ read → resolve  │
//! └─────────────────┘     └─────────────────┘
//!          │                       │
//!          ▼                       ▼
//!   binary protocol codec (24-byte header frames)
//! ```
//!
//! # Correctness model
//!
//! - Responses on one connection arrive in request order; a reply for a
//!   later operation resolves every earlier quiet one
//! - Every reply is matched by opaque id; a mismatch means the stream is
//!   corrupt and the connection is torn down
//! - A key routes to exactly one node; reads are never served from a
//!   non-owner, so a recovering node never exposes stale placement

pub mod buffer;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod locator;
pub mod node;
pub mod ops;
pub mod policy;
pub mod protocol;
pub mod types;

// Re-export the main types for convenience
pub use cluster::Cluster;
pub use config::{ClusterConfig, FailureMode, LocatorStrategy, ReconnectMode};
pub use error::{Error, ProtocolError, Result};
pub use types::{Expiration, NodeId, OpaqueGenerator};

// Re-export the operation layer
pub use ops::{
    Completion, ConcatDirection, MutateDirection, OpResult, Operation, OperationKind, StoreMode,
};

// Re-export protocol types useful for tooling and tests
pub use protocol::{Opcode, Status};

// Re-export the observability boundary
pub use events::{ClientEvent, EventSink, NoopSink};

// Re-export buffer pool types
pub use buffer::{BufferPool, BufferPoolConfig, PooledBuf};
