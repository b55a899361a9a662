//! One node: a bounded submission queue, a TCP connection, and a pair
//! of I/O loops.
//!
//! The write loop dequeues operations, registers them in the in-flight
//! table, then streams the request frame. The read loop reassembles
//! response frames and resolves them against the table. Responses on a
//! connection arrive in request order, which is what makes quiet
//! operations resolvable: a reply for a later operation proves every
//! earlier quiet one was silently answered.
//!
//! A `Node` is one live connection. When anything fatal happens the node
//! breaks permanently and fails everything it owes; reconnection means
//! building a fresh `Node`.

use crate::buffer::BufferPool;
use crate::config::ClusterConfig;
use crate::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::error::{Error, ProtocolError, Result};
use crate::events::{ClientEvent, EventSink};
use crate::ops::{Completion, OpResult, Operation};
use crate::protocol::FrameReader;
use crate::types::{NodeId, OpaqueGenerator};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Submission queue depth per node.
const QUEUE_DEPTH: usize = 1024;

/// Read buffer size for the response loop.
const READ_BUF_LEN: usize = 16 * 1024;

struct Submission {
    op: Operation,
    reply: oneshot::Sender<Result<OpResult>>,
}

/// An operation that has been (or is being) written to the socket.
/// `reply` is `None` for internal pipeline barriers.
struct InFlight {
    op: Operation,
    reply: Option<oneshot::Sender<Result<OpResult>>>,
}

struct NodeShared {
    id: NodeId,
    /// Insertion-ordered: matches the order requests hit the wire, which
    /// is the order the server answers in.
    in_flight: Mutex<VecDeque<InFlight>>,
    /// Pinged whenever an operation is registered, so the read loop can
    /// re-arm its idle deadline instead of sitting in an untimed read.
    wake: Notify,
    broken: AtomicBool,
    /// Why the connection broke. Set once, by whoever wins the
    /// `broken` swap; read when failing late stragglers (queued
    /// submissions, multi-packet re-inserts).
    fail_cause: Mutex<Option<FailCause>>,
    sink: Arc<dyn EventSink>,
}

/// The error every outstanding operation gets when the connection
/// breaks. `Error` is not `Clone`, so the cause is kept in a form that
/// can mint one per waiter.
#[derive(Debug, Clone)]
enum FailCause {
    Timeout,
    Shutdown,
    Connectivity(String),
}

impl FailCause {
    fn of(e: &Error) -> Self {
        match e {
            Error::Timeout => FailCause::Timeout,
            Error::Shutdown => FailCause::Shutdown,
            other => FailCause::Connectivity(other.to_string()),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            FailCause::Timeout => Error::Timeout,
            FailCause::Shutdown => Error::Shutdown,
            FailCause::Connectivity(msg) => Error::Connectivity(msg.clone()),
        }
    }
}

/// A connected node.
pub struct Node {
    id: NodeId,
    addr: SocketAddr,
    tx: mpsc::Sender<Submission>,
    cancel: CancellationToken,
    shared: Arc<NodeShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Dial `addr` and spin up the I/O loops.
    pub(crate) async fn connect(
        id: NodeId,
        addr: SocketAddr,
        config: &ClusterConfig,
        pool: BufferPool,
        ids: Arc<OpaqueGenerator>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        sink.on_event(&ClientEvent::ConnectStart { node: id, addr });

        let cancel = CancellationToken::new();
        let connection = match Connection::connect(addr, config.connect_timeout, &cancel).await {
            Ok(c) => c,
            Err(e) => {
                sink.on_event(&ClientEvent::ConnectFailed { node: id, addr });
                return Err(e);
            }
        };
        sink.on_event(&ClientEvent::ConnectOk { node: id, addr });

        let (reader, writer) = connection.split();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

        let shared = Arc::new(NodeShared {
            id,
            in_flight: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            broken: AtomicBool::new(false),
            fail_cause: Mutex::new(None),
            sink,
        });

        let frames = FrameReader::new(pool.clone(), config.max_frame_body);
        let write_task = tokio::spawn(write_loop(
            shared.clone(),
            rx,
            writer,
            pool,
            ids,
            cancel.clone(),
        ));
        let read_task = tokio::spawn(read_loop(
            shared.clone(),
            reader,
            frames,
            config.receive_timeout,
            cancel.clone(),
        ));

        Ok(Self {
            id,
            addr,
            tx,
            cancel,
            shared,
            tasks: Mutex::new(vec![write_task, read_task]),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the connection is still usable. Once false it stays false.
    pub fn is_alive(&self) -> bool {
        !self.shared.broken.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Enqueue an operation, waiting for queue space if needed. The
    /// returned receiver yields the operation's final result.
    pub async fn submit(&self, op: Operation) -> Result<oneshot::Receiver<Result<OpResult>>> {
        if !self.is_alive() {
            return Err(Error::Connectivity("connection is down".into()));
        }
        let opaque = op.opaque();
        let (reply, receiver) = oneshot::channel();
        self.tx
            .send(Submission { op, reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        self.shared.sink.on_event(&ClientEvent::OpEnqueued {
            node: self.id,
            opaque,
        });
        Ok(receiver)
    }

    /// Enqueue and wait for the result.
    pub async fn execute(&self, op: Operation) -> Result<OpResult> {
        let receiver = self.submit(op).await?;
        receiver.await.map_err(|_| Error::Shutdown)?
    }

    /// Stop the I/O loops and fail everything still owed.
    pub async fn shutdown(&self) {
        tear_down(&self.shared, &self.cancel, FailCause::Shutdown);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        debug!(node_id = self.id, "node shut down");
    }
}

/// Break the connection: record the cause, cancel the loops, and fail
/// every in-flight operation. Idempotent; only the first caller does
/// the work. Operations still sitting in the submission queue are
/// failed by the write loop on its way out (it owns the receiver).
fn tear_down(shared: &NodeShared, cancel: &CancellationToken, cause: FailCause) {
    if shared.broken.swap(true, Ordering::SeqCst) {
        return;
    }
    // Cause before cancel: the write loop reads it after observing the
    // cancellation.
    *shared.fail_cause.lock() = Some(cause.clone());
    cancel.cancel();

    let drained: Vec<InFlight> = shared.in_flight.lock().drain(..).collect();
    if !drained.is_empty() {
        warn!(
            node_id = shared.id,
            count = drained.len(),
            "failing in-flight operations"
        );
    }
    for entry in drained {
        if let Some(reply) = entry.reply {
            let _ = reply.send(Err(cause.to_error()));
        }
    }
    shared.sink.on_event(&ClientEvent::ConnectionClosed { node: shared.id });
}

/// The teardown error for late stragglers, `Shutdown` when the loops
/// exited without breaking (plain channel close).
fn teardown_error(shared: &NodeShared) -> Error {
    shared
        .fail_cause
        .lock()
        .as_ref()
        .map_or(Error::Shutdown, FailCause::to_error)
}

async fn write_loop(
    shared: Arc<NodeShared>,
    mut rx: mpsc::Receiver<Submission>,
    mut writer: ConnectionWriter,
    pool: BufferPool,
    ids: Arc<OpaqueGenerator>,
    cancel: CancellationToken,
) {
    let mut pending: Option<Submission> = None;
    loop {
        let submission = match pending.take() {
            Some(s) => s,
            None => tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(s) => s,
                    None => break,
                },
            },
        };

        let quiet = submission.op.is_quiet();
        if let Err(e) = send_submission(&shared, &mut writer, &pool, submission, &cancel).await {
            debug!(node_id = shared.id, error = %e, "write failed");
            tear_down(&shared, &cancel, FailCause::of(&e));
            break;
        }

        if quiet {
            // Quiet requests get no reply on success, so without further
            // traffic they would hang forever. If nothing else is queued,
            // follow up with a NoOp barrier; the server always answers
            // it, and its reply resolves every quiet request before it.
            match rx.try_recv() {
                Ok(next) => pending = Some(next),
                Err(_) => {
                    let barrier = Operation::noop(&ids);
                    if let Err(e) =
                        send_barrier(&shared, &mut writer, &pool, barrier, &cancel).await
                    {
                        debug!(node_id = shared.id, error = %e, "barrier write failed");
                        tear_down(&shared, &cancel, FailCause::of(&e));
                        break;
                    }
                }
            }
        }
    }

    // Never exit with callers still parked on the queue: everything not
    // yet written gets the same error the in-flight set got. No-op when
    // a teardown already ran.
    tear_down(&shared, &cancel, FailCause::Shutdown);
    rx.close();
    let mut queued: Vec<Submission> = pending.take().into_iter().collect();
    while let Ok(sub) = rx.try_recv() {
        queued.push(sub);
    }
    if !queued.is_empty() {
        warn!(
            node_id = shared.id,
            count = queued.len(),
            "failing queued operations"
        );
        for sub in queued {
            let _ = sub.reply.send(Err(teardown_error(&shared)));
        }
    }
}

async fn send_submission(
    shared: &Arc<NodeShared>,
    writer: &mut ConnectionWriter,
    pool: &BufferPool,
    submission: Submission,
    cancel: &CancellationToken,
) -> Result<()> {
    let frame = match submission.op.build_request(pool) {
        Ok(f) => f,
        Err(e) => {
            // Not a connection problem; fail just this operation.
            let _ = submission.reply.send(Err(e));
            return Ok(());
        }
    };
    let entry = InFlight {
        op: submission.op,
        reply: Some(submission.reply),
    };
    stream_frame(shared, writer, frame, entry, cancel).await
}

async fn send_barrier(
    shared: &Arc<NodeShared>,
    writer: &mut ConnectionWriter,
    pool: &BufferPool,
    barrier: Operation,
    cancel: &CancellationToken,
) -> Result<()> {
    let frame = barrier.build_request(pool)?;
    let entry = InFlight {
        op: barrier,
        reply: None,
    };
    stream_frame(shared, writer, frame, entry, cancel).await
}

async fn stream_frame(
    shared: &Arc<NodeShared>,
    writer: &mut ConnectionWriter,
    mut frame: crate::protocol::FrameWriter,
    entry: InFlight,
    cancel: &CancellationToken,
) -> Result<()> {
    let opaque = entry.op.opaque();

    // Register before the first byte hits the wire, so the read loop can
    // never see a response for an unknown operation.
    shared.in_flight.lock().push_back(entry);
    shared.wake.notify_one();

    // Every socket wait races the cancel token: when the read loop
    // breaks the connection while the peer has stopped draining us, the
    // write must abort rather than sit in a full socket buffer forever.
    let mut sent = 0usize;
    while !frame.is_done() {
        let chunk = frame.next_slice();
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Shutdown),
            wrote = writer.send(chunk) => wrote?,
        };
        sent += n;
        frame.consume(n);
        shared.sink.on_event(&ClientEvent::SendChunk {
            node: shared.id,
            bytes: n,
        });
    }
    tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Shutdown),
        flushed = writer.flush() => flushed?,
    }

    shared.sink.on_event(&ClientEvent::OpSent {
        node: shared.id,
        opaque,
        bytes: sent,
    });
    Ok(())
}

async fn read_loop(
    shared: Arc<NodeShared>,
    mut reader: ConnectionReader,
    mut frames: FrameReader,
    receive_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUF_LEN];
    loop {
        // The idle deadline only applies while responses are owed; a
        // connection with nothing outstanding may sit quiet forever.
        let owed = !shared.in_flight.lock().is_empty();
        let received = if owed {
            tokio::select! {
                _ = cancel.cancelled() => return,
                r = reader.receive_timeout(&mut buf, receive_timeout) => r,
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                // An operation just went in-flight; re-arm with a deadline.
                _ = shared.wake.notified() => continue,
                r = reader.receive(&mut buf) => r,
            }
        };

        let n = match received {
            Ok(n) => n,
            Err(e) => {
                debug!(node_id = shared.id, error = %e, "read failed");
                tear_down(&shared, &cancel, FailCause::of(&e));
                return;
            }
        };
        shared.sink.on_event(&ClientEvent::ReceiveChunk {
            node: shared.id,
            bytes: n,
        });

        let mut rest = &buf[..n];
        while !rest.is_empty() {
            match frames.feed(rest) {
                Ok((consumed, frame)) => {
                    rest = &rest[consumed..];
                    if let Some(frame) = frame {
                        if let Err(e) = resolve(&shared, frame) {
                            warn!(node_id = shared.id, error = %e, "response resolution failed");
                            tear_down(&shared, &cancel, FailCause::of(&e));
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(node_id = shared.id, error = %e, "malformed response stream");
                    tear_down(&shared, &cancel, FailCause::of(&e));
                    return;
                }
            }
        }
    }
}

/// Match a response against the in-flight table.
///
/// Everything older than the matching entry must have been quiet and
/// silently successful, so those are resolved with "no reply". The lock
/// is held only while entries are taken out of the table; decoding and
/// completion (which calls into the event sink) run unlocked, so a slow
/// sink cannot stall the write loop's registrations.
fn resolve(shared: &Arc<NodeShared>, frame: crate::protocol::ResponseFrame) -> Result<()> {
    let (older, entry) = {
        let mut table = shared.in_flight.lock();

        let Some(idx) = table.iter().position(|e| e.op.matches(&frame)) else {
            return Err(Error::Protocol(ProtocolError::UnmatchedOpaque(
                frame.opaque(),
            )));
        };

        let mut older = Vec::with_capacity(idx);
        for _ in 0..idx {
            if let Some(skipped) = table.pop_front() {
                older.push(skipped);
            }
        }
        (older, table.pop_front())
    };

    for mut skipped in older {
        if let Completion::Done(result) = skipped.op.consume_response(None) {
            complete(shared, skipped.op.opaque(), skipped.reply, result);
        }
    }

    let Some(mut entry) = entry else {
        return Ok(());
    };
    shared.sink.on_event(&ClientEvent::ResponseReceived {
        node: shared.id,
        opaque: frame.opaque(),
    });
    match entry.op.consume_response(Some(&frame)) {
        Completion::Done(result) => complete(shared, frame.opaque(), entry.reply, result),
        Completion::More => {
            // Multi-packet operation, keep it at the head of the table.
            // If teardown ran while the table was unlocked the entry
            // must not be re-inserted: nothing would drain it again.
            let mut table = shared.in_flight.lock();
            if shared.broken.load(Ordering::SeqCst) {
                drop(table);
                let err = teardown_error(shared);
                complete(shared, frame.opaque(), entry.reply, Err(err));
            } else {
                table.push_front(entry);
            }
        }
    }
    Ok(())
}

fn complete(
    shared: &NodeShared,
    opaque: u32,
    reply: Option<oneshot::Sender<Result<OpResult>>>,
    result: Result<OpResult>,
) {
    shared.sink.on_event(&ClientEvent::OpCompleted {
        node: shared.id,
        opaque,
    });
    if let Some(reply) = reply {
        // The caller may have given up waiting; that is their business.
        let _ = reply.send(result);
    }
}
