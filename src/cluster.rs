//! Cluster client: key routing, node health, and reconnects.
//!
//! Operations on keys route through the locator to exactly one node.
//! There is no failover to a different node: the key's owner is fixed
//! by the ring, and serving it elsewhere would show stale or divergent
//! cache state once the owner returns. A dead node fails fast until its
//! retry timer allows one reconnect attempt.

use crate::buffer::BufferPool;
use crate::config::{ClusterConfig, LocatorStrategy};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventSink, NoopSink};
use crate::locator::{KetamaLocator, ModuloLocator, NodeLocator};
use crate::node::Node;
use crate::ops::{OpResult, Operation, OperationKind};
use crate::policy::{FailurePolicy, NodeHealth, ReconnectPolicy};
use crate::types::{NodeId, OpaqueGenerator};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct MemberState {
    node: Option<Arc<Node>>,
    health: NodeHealth,
    failures: FailurePolicy,
}

struct Member {
    id: NodeId,
    addr: SocketAddr,
    /// Async mutex: held across reconnect attempts so only one caller
    /// dials a member at a time.
    state: Mutex<MemberState>,
}

/// A connected cache cluster.
pub struct Cluster {
    config: ClusterConfig,
    pool: BufferPool,
    ids: Arc<OpaqueGenerator>,
    sink: Arc<dyn EventSink>,
    locator: Box<dyn NodeLocator>,
    members: Vec<Member>,
    reconnect: ReconnectPolicy,
    closed: AtomicBool,
}

impl Cluster {
    /// Connect to every configured member.
    ///
    /// Construction succeeds as long as the configuration validates;
    /// members that cannot be reached start out dead with a scheduled
    /// retry, and operations routed to them fail until they recover.
    pub async fn connect(config: ClusterConfig) -> Result<Self> {
        Self::connect_with_sink(config, Arc::new(NoopSink)).await
    }

    /// Like [`Self::connect`], with a caller-provided event sink.
    pub async fn connect_with_sink(
        config: ClusterConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = BufferPool::new(config.buffers.clone());
        let ids = Arc::new(OpaqueGenerator::new());
        let reconnect = ReconnectPolicy::from_mode(config.reconnect);

        let endpoints: Vec<(NodeId, SocketAddr)> = config
            .members
            .iter()
            .enumerate()
            .map(|(i, &addr)| (i as NodeId, addr))
            .collect();

        let locator: Box<dyn NodeLocator> = match config.locator {
            LocatorStrategy::Modulo => Box::new(ModuloLocator::new(&endpoints)),
            LocatorStrategy::Ketama => {
                Box::new(KetamaLocator::new(&endpoints, config.vnodes_per_node))
            }
        };

        let mut members = Vec::with_capacity(endpoints.len());
        for &(id, addr) in &endpoints {
            let mut state = MemberState {
                node: None,
                health: NodeHealth::Healthy,
                failures: FailurePolicy::from_mode(config.failure),
            };
            match Node::connect(id, addr, &config, pool.clone(), ids.clone(), sink.clone()).await
            {
                Ok(node) => state.node = Some(Arc::new(node)),
                Err(e) => {
                    warn!(node_id = id, %addr, error = %e, "initial connect failed");
                    let now = Instant::now();
                    state.failures.record_failure(now);
                    state.health.mark_dead(now, &reconnect);
                    sink.on_event(&ClientEvent::NodeDead { node: id });
                }
            }
            members.push(Member {
                id,
                addr,
                state: Mutex::new(state),
            });
        }
        info!(members = members.len(), "cluster connected");

        Ok(Self {
            config,
            pool,
            ids,
            sink,
            locator,
            members,
            reconnect,
            closed: AtomicBool::new(false),
        })
    }

    /// Generator for operation correlation ids. Operations submitted to
    /// this cluster must be built with it.
    pub fn opaque_generator(&self) -> &OpaqueGenerator {
        &self.ids
    }

    /// All member node ids, in configuration order.
    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// The node a key routes to.
    pub fn locate(&self, key: &[u8]) -> Option<NodeId> {
        self.locator.locate(key)
    }

    /// Execute a keyed operation on the node that owns its key.
    pub async fn execute(&self, op: Operation) -> Result<OpResult> {
        if matches!(
            op.kind(),
            OperationKind::Stats
                | OperationKind::Flush { .. }
                | OperationKind::Version
                | OperationKind::NoOp
        ) {
            return Err(Error::InvalidArgument(
                "keyless operations target a node explicitly; use execute_on".into(),
            ));
        }
        let node_id = self
            .locator
            .locate(op.key())
            .ok_or(Error::InvalidArgument("cluster has no members".into()))?;
        self.execute_on(node_id, op).await
    }

    /// Execute an operation on a specific node. This is the path for
    /// keyless operations (Stats, Flush, Version, NoOp).
    pub async fn execute_on(&self, node_id: NodeId, op: Operation) -> Result<OpResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let member = self
            .members
            .get(node_id as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown node {}", node_id)))?;

        let node = self.checkout(member).await?;
        let result = node.execute(op).await;

        if let Err(e) = &result {
            if e.is_fatal_to_connection() {
                debug!(node_id = member.id, error = %e, "operation failed fatally");
                self.report_down(member).await;
            }
        }
        result
    }

    /// Stop every node; queued and in-flight operations fail.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for member in &self.members {
            let mut state = member.state.lock().await;
            if let Some(node) = state.node.take() {
                node.shutdown().await;
            }
        }
        info!("cluster shut down");
    }

    /// Get a live connection for a member, reconnecting if the health
    /// state allows it.
    async fn checkout(&self, member: &Member) -> Result<Arc<Node>> {
        let mut state = member.state.lock().await;

        if let Some(node) = &state.node {
            if node.is_alive() {
                return Ok(node.clone());
            }
        }

        // The connection broke since we last looked; account for it.
        if let Some(dead) = state.node.take() {
            dead.shutdown().await;
            self.account_down(member, &mut state, Instant::now());
        }

        let now = Instant::now();
        match &state.health {
            // Tolerant mode: below the death threshold the member keeps
            // getting immediate reconnect attempts.
            NodeHealth::Healthy => self.reconnect_member(member, &mut state).await,
            NodeHealth::Dead { .. } if state.health.retry_due(now) => {
                debug!(node_id = member.id, "retry due, attempting reconnect");
                self.reconnect_member(member, &mut state).await
            }
            NodeHealth::Dead { .. } => Err(Error::NoHealthyNode { node: member.id }),
        }
    }

    async fn reconnect_member(
        &self,
        member: &Member,
        state: &mut MemberState,
    ) -> Result<Arc<Node>> {
        match Node::connect(
            member.id,
            member.addr,
            &self.config,
            self.pool.clone(),
            self.ids.clone(),
            self.sink.clone(),
        )
        .await
        {
            Ok(node) => {
                let node = Arc::new(node);
                state.node = Some(node.clone());
                let was_dead = !state.health.is_healthy();
                state.health.mark_healthy();
                state.failures.reset();
                if was_dead {
                    info!(node_id = member.id, "node revived");
                    self.sink.on_event(&ClientEvent::NodeRevived { node: member.id });
                }
                Ok(node)
            }
            Err(e) => {
                let now = Instant::now();
                if state.health.is_healthy() {
                    self.account_down(member, state, now);
                } else {
                    state.health.record_retry_failure(now, &self.reconnect);
                }
                Err(e)
            }
        }
    }

    /// A fatal operation error was observed on this member.
    ///
    /// One broken connection counts as one failure no matter how many
    /// pipelined operations it took down: only the caller that actually
    /// removes the node feeds the failure policy. Later reporters find
    /// either a fresh connection or nothing, and do neither harm.
    async fn report_down(&self, member: &Member) {
        let mut state = member.state.lock().await;
        if state.node.as_ref().is_some_and(|n| n.is_alive()) {
            // Someone already swapped in a fresh connection.
            return;
        }
        if let Some(dead) = state.node.take() {
            dead.shutdown().await;
            self.account_down(member, &mut state, Instant::now());
        }
    }

    /// Feed one failure into the member's policy, transitioning to dead
    /// if the threshold is crossed.
    fn account_down(&self, member: &Member, state: &mut MemberState, now: Instant) {
        if state.health.is_healthy() && state.failures.record_failure(now) {
            warn!(node_id = member.id, addr = %member.addr, "node marked dead");
            state.health.mark_dead(now, &self.reconnect);
            self.sink.on_event(&ClientEvent::NodeDead { node: member.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailureMode, ReconnectMode};
    use crate::ops::StoreMode;
    use crate::protocol::{Opcode, Status, HEADER_LEN, RESPONSE_MAGIC};
    use bytes::BufMut;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct Request {
        opcode: u8,
        opaque: u32,
        extras: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    }

    async fn read_request(socket: &mut TcpStream) -> Option<Request> {
        let mut header = [0u8; HEADER_LEN];
        socket.read_exact(&mut header).await.ok()?;
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extra_len = header[4] as usize;
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        let mut body = vec![0u8; body_len];
        socket.read_exact(&mut body).await.ok()?;
        Some(Request {
            opcode: header[1],
            opaque,
            extras: body[..extra_len].to_vec(),
            key: body[extra_len..extra_len + key_len].to_vec(),
            value: body[extra_len + key_len..].to_vec(),
        })
    }

    async fn write_response(
        socket: &mut TcpStream,
        opcode: u8,
        status: Status,
        opaque: u32,
        extras: &[u8],
        value: &[u8],
    ) {
        let mut out = Vec::new();
        out.put_u8(RESPONSE_MAGIC);
        out.put_u8(opcode);
        out.put_u16(0);
        out.put_u8(extras.len() as u8);
        out.put_u8(0);
        out.put_u16(status.code());
        out.put_u32((extras.len() + value.len()) as u32);
        out.put_u32(opaque);
        out.put_u64(1);
        out.put_slice(extras);
        out.put_slice(value);
        socket.write_all(&out).await.unwrap();
    }

    async fn serve_cache(listener: TcpListener) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut store: HashMap<Vec<u8>, (u32, Vec<u8>)> = HashMap::new();
                while let Some(req) = read_request(&mut socket).await {
                    match req.opcode {
                        o if o == Opcode::Get as u8 => match store.get(&req.key) {
                            Some((flags, value)) => {
                                write_response(
                                    &mut socket,
                                    o,
                                    Status::Success,
                                    req.opaque,
                                    &flags.to_be_bytes(),
                                    value,
                                )
                                .await
                            }
                            None => {
                                write_response(
                                    &mut socket,
                                    o,
                                    Status::KeyNotFound,
                                    req.opaque,
                                    &[],
                                    &[],
                                )
                                .await
                            }
                        },
                        o if o == Opcode::Set as u8 => {
                            let flags = u32::from_be_bytes(req.extras[..4].try_into().unwrap());
                            store.insert(req.key, (flags, req.value));
                            write_response(&mut socket, o, Status::Success, req.opaque, &[], &[])
                                .await;
                        }
                        o if o == Opcode::Version as u8 => {
                            write_response(
                                &mut socket,
                                o,
                                Status::Success,
                                req.opaque,
                                &[],
                                b"1.6.21",
                            )
                            .await;
                        }
                        o if o == Opcode::NoOp as u8 => {
                            write_response(&mut socket, o, Status::Success, req.opaque, &[], &[])
                                .await;
                        }
                        other => panic!("unexpected opcode {:#x}", other),
                    }
                }
            });
        }
    }

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn spawn_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_cache(listener));
        addr
    }

    struct CountingSink {
        dead: SyncMutex<Vec<NodeId>>,
        revived: SyncMutex<Vec<NodeId>>,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dead: SyncMutex::new(Vec::new()),
                revived: SyncMutex::new(Vec::new()),
            })
        }
    }

    impl EventSink for CountingSink {
        fn on_event(&self, event: &ClientEvent) {
            match event {
                ClientEvent::NodeDead { node } => self.dead.lock().push(*node),
                ClientEvent::NodeRevived { node } => self.revived.lock().push(*node),
                _ => {}
            }
        }
    }

    fn set_op(cluster: &Cluster, key: &str, value: &str) -> Operation {
        Operation::new(
            cluster.opaque_generator(),
            key.as_bytes().to_vec(),
            0,
            OperationKind::Store {
                mode: StoreMode::Set,
                flags: 0,
                value: value.as_bytes().to_vec(),
                expiration: 0,
                quiet: false,
            },
        )
        .unwrap()
    }

    fn get_op(cluster: &Cluster, key: &str) -> Operation {
        Operation::new(
            cluster.opaque_generator(),
            key.as_bytes().to_vec(),
            0,
            OperationKind::Get { quiet: false },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_routes_and_round_trips_across_members() {
        init_tracing();
        let a = spawn_server().await;
        let b = spawn_server().await;
        let cluster = Cluster::connect(ClusterConfig::new(vec![a, b])).await.unwrap();

        for i in 0..20 {
            let key = format!("key_{}", i);
            cluster.execute(set_op(&cluster, &key, "v")).await.unwrap();
        }
        for i in 0..20 {
            let key = format!("key_{}", i);
            let result = cluster.execute(get_op(&cluster, &key)).await.unwrap();
            assert!(matches!(result, OpResult::Found { .. }), "{} missing", key);
        }

        // Routing is stable: the same key always lands on the same node.
        let owner = cluster.locate(b"key_0").unwrap();
        assert_eq!(cluster.locate(b"key_0"), Some(owner));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_keyless_operation_requires_explicit_target() {
        let a = spawn_server().await;
        let cluster = Cluster::connect(ClusterConfig::new(vec![a])).await.unwrap();

        let version = Operation::keyless(cluster.opaque_generator(), OperationKind::Version)
            .unwrap();
        let err = cluster.execute(version).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        for id in cluster.member_ids() {
            let version =
                Operation::keyless(cluster.opaque_generator(), OperationKind::Version).unwrap();
            let result = cluster.execute_on(id, version).await.unwrap();
            assert!(matches!(result, OpResult::Version(v) if v == "1.6.21"));
        }

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_member_starts_dead_then_revives() {
        // Reserve a port, then free it so the initial connect is refused.
        let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = parked.local_addr().unwrap();
        drop(parked);

        let sink = CountingSink::new();
        let config = ClusterConfig::new(vec![addr])
            .with_failure_mode(FailureMode::FailFast)
            .with_reconnect_mode(ReconnectMode::Periodic {
                interval: Duration::from_millis(200),
            });
        let cluster = Cluster::connect_with_sink(config, sink.clone()).await.unwrap();
        assert_eq!(sink.dead.lock().as_slice(), &[0]);

        // Not due for retry yet: fail fast without touching the network.
        let err = cluster.execute(get_op(&cluster, "k")).await.unwrap_err();
        assert!(matches!(err, Error::NoHealthyNode { node: 0 }));

        // Bring the server up on the reserved address and wait out the
        // retry interval.
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(serve_cache(listener));
        tokio::time::sleep(Duration::from_millis(250)).await;

        let result = cluster.execute(get_op(&cluster, "k")).await.unwrap();
        assert!(matches!(result, OpResult::NotFound));
        assert_eq!(sink.revived.lock().as_slice(), &[0]);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_error_marks_node_dead() {
        // Server that answers the handshake but hangs up on the first
        // real request.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
        });

        let sink = CountingSink::new();
        let config = ClusterConfig::new(vec![addr]).with_failure_mode(FailureMode::FailFast);
        let cluster = Cluster::connect_with_sink(config, sink.clone()).await.unwrap();

        let err = cluster.execute(get_op(&cluster, "k")).await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)), "got {:?}", err);
        assert_eq!(sink.dead.lock().as_slice(), &[0]);

        // Default periodic retry is far away; the node stays dead.
        let err = cluster.execute(get_op(&cluster, "k")).await.unwrap_err();
        assert!(matches!(err, Error::NoHealthyNode { node: 0 }));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_tolerant_mode_reconnects_below_threshold() {
        // First connection dies after one request; the listener keeps
        // serving, so the transparent reconnect succeeds.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection: hang up after one request.
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            drop(socket);
            // Then behave.
            serve_cache(listener).await;
        });

        let sink = CountingSink::new();
        let config = ClusterConfig::new(vec![addr]).with_failure_mode(FailureMode::Tolerant {
            threshold: 3,
            window: Duration::from_secs(10),
        });
        let cluster = Cluster::connect_with_sink(config, sink.clone()).await.unwrap();

        let err = cluster.execute(get_op(&cluster, "k")).await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));

        // One failure is below the threshold: next call reconnects.
        let result = cluster.execute(get_op(&cluster, "k")).await.unwrap();
        assert!(matches!(result, OpResult::NotFound));
        assert!(sink.dead.lock().is_empty());

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_pipelined_failures_count_as_one() {
        // Three operations share the connection when it dies. That is
        // one failure, not three: under Tolerant { threshold: 3 } the
        // member must stay up and reconnect on the next call.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            drop(socket);
            serve_cache(listener).await;
        });

        let sink = CountingSink::new();
        let config = ClusterConfig::new(vec![addr]).with_failure_mode(FailureMode::Tolerant {
            threshold: 3,
            window: Duration::from_secs(10),
        });
        let cluster = Cluster::connect_with_sink(config, sink.clone()).await.unwrap();

        let (r1, r2, r3) = tokio::join!(
            cluster.execute(set_op(&cluster, "a", "1")),
            cluster.execute(set_op(&cluster, "b", "2")),
            cluster.execute(set_op(&cluster, "c", "3")),
        );
        assert!(r1.is_err() && r2.is_err() && r3.is_err());

        assert!(sink.dead.lock().is_empty(), "dead: {:?}", sink.dead.lock());
        let result = cluster.execute(get_op(&cluster, "a")).await.unwrap();
        assert!(matches!(result, OpResult::NotFound));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_is_rejected() {
        let a = spawn_server().await;
        let cluster = Cluster::connect(ClusterConfig::new(vec![a])).await.unwrap();
        cluster.shutdown().await;

        let err = cluster.execute(get_op(&cluster, "k")).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn test_unknown_node_id_rejected() {
        let a = spawn_server().await;
        let cluster = Cluster::connect(ClusterConfig::new(vec![a])).await.unwrap();

        let noop = Operation::keyless(cluster.opaque_generator(), OperationKind::NoOp).unwrap();
        let err = cluster.execute_on(42, noop).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        cluster.shutdown().await;
    }
}
