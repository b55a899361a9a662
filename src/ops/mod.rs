//! Operation layer: one request/response contract per command.
//!
//! An [`Operation`] is one-shot: constructed with a correlation id,
//! builds exactly one request frame, consumes zero or more response
//! frames, and yields one typed result. Commands are a tagged union
//! dispatched by pattern matching rather than a trait hierarchy.

mod result;

pub use result::OpResult;

use crate::buffer::BufferPool;
use crate::error::{Error, Result};
use crate::protocol::{FrameWriter, Opcode, ResponseFrame, Status};
use crate::types::{Expiration, OpaqueGenerator, MAX_KEY_LEN};
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::time::SystemTime;

/// Which store opcode family to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store regardless of existing state.
    Set,
    /// Store only if the key does not exist.
    Add,
    /// Store only if the key already exists.
    Replace,
}

/// Counter direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateDirection {
    Increment,
    Decrement,
}

/// Which end of the existing value to splice onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatDirection {
    Append,
    Prepend,
}

/// Command-specific payload of an operation.
#[derive(Debug, Clone)]
pub enum OperationKind {
    Get {
        quiet: bool,
    },
    GetAndTouch {
        expiration: u32,
    },
    Touch {
        expiration: u32,
    },
    Store {
        mode: StoreMode,
        flags: u32,
        value: Vec<u8>,
        expiration: u32,
        quiet: bool,
    },
    Delete {
        quiet: bool,
    },
    Mutate {
        direction: MutateDirection,
        delta: u64,
        initial: u64,
        expiration: u32,
        quiet: bool,
    },
    Concat {
        direction: ConcatDirection,
        value: Vec<u8>,
        quiet: bool,
    },
    Stats,
    Flush {
        delay: Option<u32>,
        quiet: bool,
    },
    Version,
    /// Pipeline barrier; the server always replies. Used internally to
    /// flush quiet requests and usable as an application-level ping.
    NoOp,
}

/// What an operation reported after consuming a response.
#[derive(Debug)]
pub enum Completion {
    /// The operation finished with this result.
    Done(Result<OpResult>),
    /// More response packets are expected (multi-packet operations).
    More,
}

/// A single in-flight command: correlation id, key, CAS, and the
/// command-specific payload. Not reusable after completion.
#[derive(Debug)]
pub struct Operation {
    opaque: u32,
    key: Vec<u8>,
    cas: u64,
    kind: OperationKind,
    /// Accumulator for multi-packet Stats responses.
    stats: Option<HashMap<String, String>>,
}

impl Operation {
    /// Construct an operation for a keyed command.
    ///
    /// Key length is validated here, before any I/O; expirations have
    /// already been resolved to wire form by [`Self::resolve_expiration`].
    pub fn new(
        ids: &OpaqueGenerator,
        key: impl Into<Vec<u8>>,
        cas: u64,
        kind: OperationKind,
    ) -> Result<Self> {
        let key = key.into();
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds protocol maximum of {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        if key.is_empty() && kind.requires_key() {
            return Err(Error::InvalidArgument("empty key".into()));
        }
        // Stats accepts an optional sub-stats key; the other keyless
        // commands never carry one.
        if !key.is_empty() && !kind.requires_key() && !matches!(kind, OperationKind::Stats) {
            return Err(Error::InvalidArgument(format!(
                "{:?} does not take a key",
                kind.opcode()
            )));
        }

        let stats = matches!(kind, OperationKind::Stats).then(HashMap::new);

        Ok(Self {
            opaque: ids.next(),
            key,
            cas,
            kind,
            stats,
        })
    }

    /// Construct a keyless operation (Stats, Flush, Version, NoOp).
    pub fn keyless(ids: &OpaqueGenerator, kind: OperationKind) -> Result<Self> {
        Self::new(ids, Vec::new(), 0, kind)
    }

    /// A NoOp pipeline barrier. Cannot fail validation, so the write
    /// loop can synthesize one without an error path.
    pub(crate) fn noop(ids: &OpaqueGenerator) -> Self {
        Self {
            opaque: ids.next(),
            key: Vec::new(),
            cas: 0,
            kind: OperationKind::NoOp,
            stats: None,
        }
    }

    /// Resolve an [`Expiration`] against the current wall clock.
    pub fn resolve_expiration(expiration: Expiration) -> u32 {
        expiration.encode(SystemTime::now())
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// Whether the server stays silent on success.
    pub fn is_quiet(&self) -> bool {
        self.kind.opcode().is_quiet()
    }

    /// Whether this operation can consume multiple response packets.
    pub fn is_multi_packet(&self) -> bool {
        matches!(self.kind, OperationKind::Stats)
    }

    /// Build the request frame for this operation.
    pub fn build_request(&self, pool: &BufferPool) -> Result<FrameWriter> {
        let opcode = self.kind.opcode();
        let mut extras = [0u8; 20];
        let extras = self.kind.encode_extras(&mut extras);
        let value = self.kind.value();

        FrameWriter::build(pool, opcode, &self.key, extras, value, self.opaque, self.cas)
    }

    /// Correlation check: does this response belong to this operation?
    pub fn matches(&self, frame: &ResponseFrame) -> bool {
        frame.opaque() == self.opaque
    }

    /// Consume a response packet, or `None` meaning "no further packets"
    /// (the quiet-mode contract: the server only replies on error).
    pub fn consume_response(&mut self, frame: Option<&ResponseFrame>) -> Completion {
        let frame = match frame {
            Some(f) => f,
            None => return Completion::Done(self.quiet_success()),
        };

        let status = frame.status();
        if !status.is_success() {
            return Completion::Done(self.failed_status(status));
        }

        match &self.kind {
            OperationKind::Get { .. } | OperationKind::GetAndTouch { .. } => {
                Completion::Done(Self::decode_found(frame))
            }
            OperationKind::Touch { .. } => Completion::Done(Ok(OpResult::Touched)),
            OperationKind::Store { .. } => {
                Completion::Done(Ok(OpResult::Stored { cas: frame.cas() }))
            }
            OperationKind::Delete { .. } => Completion::Done(Ok(OpResult::Deleted)),
            OperationKind::Mutate { .. } => Completion::Done(Self::decode_counter(frame)),
            OperationKind::Concat { .. } => Completion::Done(Ok(OpResult::Concatenated)),
            OperationKind::Flush { .. } => Completion::Done(Ok(OpResult::Flushed)),
            OperationKind::Version => Completion::Done(Ok(OpResult::Version(
                String::from_utf8_lossy(frame.value()).into_owned(),
            ))),
            OperationKind::NoOp => Completion::Done(Ok(OpResult::NoOp)),
            OperationKind::Stats => self.consume_stats(frame),
        }
    }

    /// Result for a quiet operation the server never answered.
    ///
    /// Per-opcode semantics are deliberate: a silent quiet Get is a miss,
    /// while silent writes are successes.
    fn quiet_success(&self) -> Result<OpResult> {
        match &self.kind {
            OperationKind::Get { .. } | OperationKind::GetAndTouch { .. } => Ok(OpResult::NotFound),
            OperationKind::Store { .. } => Ok(OpResult::Stored { cas: 0 }),
            OperationKind::Delete { .. } => Ok(OpResult::Deleted),
            OperationKind::Mutate { .. } => Ok(OpResult::Counter(0)),
            OperationKind::Concat { .. } => Ok(OpResult::Concatenated),
            OperationKind::Flush { .. } => Ok(OpResult::Flushed),
            // Non-quiet operations always get a reply; reaching here means
            // the connection died, which the node reports separately.
            _ => Err(Error::Connectivity(
                "response stream ended before reply".into(),
            )),
        }
    }

    /// Map a non-success status to the operation's typed outcome.
    fn failed_status(&self, status: Status) -> Result<OpResult> {
        match (&self.kind, status) {
            // A missing key is an ordinary miss for reads and touches.
            (
                OperationKind::Get { .. }
                | OperationKind::GetAndTouch { .. }
                | OperationKind::Touch { .. },
                Status::KeyNotFound,
            ) => Ok(OpResult::NotFound),
            _ => Err(Error::ServerStatus(status)),
        }
    }

    fn decode_found(frame: &ResponseFrame) -> Result<OpResult> {
        let extras = frame.extras();
        if extras.len() != 4 {
            return Err(Error::MalformedResult(format!(
                "get response extras must be 4 flag bytes, got {}",
                extras.len()
            )));
        }
        let flags = (&extras[..]).get_u32();

        Ok(OpResult::Found {
            flags,
            value: frame.value().to_vec(),
            cas: frame.cas(),
        })
    }

    fn decode_counter(frame: &ResponseFrame) -> Result<OpResult> {
        let value = frame.value();
        if value.len() != 8 {
            return Err(Error::MalformedResult(format!(
                "counter response must be 8 bytes, got {}",
                value.len()
            )));
        }
        Ok(OpResult::Counter((&value[..]).get_u64()))
    }

    fn consume_stats(&mut self, frame: &ResponseFrame) -> Completion {
        // The stats sequence terminates on an empty-key packet.
        if frame.key().is_empty() {
            let map = self.stats.take().unwrap_or_default();
            return Completion::Done(Ok(OpResult::Stats(map)));
        }

        let key = String::from_utf8_lossy(frame.key()).into_owned();
        let value = String::from_utf8_lossy(frame.value()).into_owned();
        self.stats
            .get_or_insert_with(HashMap::new)
            .insert(key, value);
        Completion::More
    }
}

impl OperationKind {
    /// Wire opcode, selecting the quiet variant where requested.
    pub fn opcode(&self) -> Opcode {
        match self {
            OperationKind::Get { quiet: false } => Opcode::Get,
            OperationKind::Get { quiet: true } => Opcode::GetQ,
            OperationKind::GetAndTouch { .. } => Opcode::GetAndTouch,
            OperationKind::Touch { .. } => Opcode::Touch,
            OperationKind::Store { mode, quiet, .. } => match (mode, quiet) {
                (StoreMode::Set, false) => Opcode::Set,
                (StoreMode::Set, true) => Opcode::SetQ,
                (StoreMode::Add, false) => Opcode::Add,
                (StoreMode::Add, true) => Opcode::AddQ,
                (StoreMode::Replace, false) => Opcode::Replace,
                (StoreMode::Replace, true) => Opcode::ReplaceQ,
            },
            OperationKind::Delete { quiet: false } => Opcode::Delete,
            OperationKind::Delete { quiet: true } => Opcode::DeleteQ,
            OperationKind::Mutate {
                direction, quiet, ..
            } => match (direction, quiet) {
                (MutateDirection::Increment, false) => Opcode::Increment,
                (MutateDirection::Increment, true) => Opcode::IncrementQ,
                (MutateDirection::Decrement, false) => Opcode::Decrement,
                (MutateDirection::Decrement, true) => Opcode::DecrementQ,
            },
            OperationKind::Concat {
                direction, quiet, ..
            } => match (direction, quiet) {
                (ConcatDirection::Append, false) => Opcode::Append,
                (ConcatDirection::Append, true) => Opcode::AppendQ,
                (ConcatDirection::Prepend, false) => Opcode::Prepend,
                (ConcatDirection::Prepend, true) => Opcode::PrependQ,
            },
            OperationKind::Stats => Opcode::Stat,
            OperationKind::Flush { quiet: false, .. } => Opcode::Flush,
            OperationKind::Flush { quiet: true, .. } => Opcode::FlushQ,
            OperationKind::Version => Opcode::Version,
            OperationKind::NoOp => Opcode::NoOp,
        }
    }

    fn requires_key(&self) -> bool {
        !matches!(
            self,
            OperationKind::Stats
                | OperationKind::Flush { .. }
                | OperationKind::Version
                | OperationKind::NoOp
        )
    }

    /// Encode this command's extras section into `scratch`, returning the
    /// used prefix.
    fn encode_extras<'a>(&self, scratch: &'a mut [u8; 20]) -> &'a [u8] {
        let mut dst = &mut scratch[..];
        let len = match self {
            OperationKind::Store {
                flags, expiration, ..
            } => {
                dst.put_u32(*flags);
                dst.put_u32(*expiration);
                8
            }
            OperationKind::Mutate {
                delta,
                initial,
                expiration,
                ..
            } => {
                dst.put_u64(*delta);
                dst.put_u64(*initial);
                dst.put_u32(*expiration);
                20
            }
            OperationKind::Touch { expiration } | OperationKind::GetAndTouch { expiration } => {
                dst.put_u32(*expiration);
                4
            }
            OperationKind::Flush {
                delay: Some(delay), ..
            } => {
                dst.put_u32(*delay);
                4
            }
            _ => 0,
        };
        &scratch[..len]
    }

    fn value(&self) -> &[u8] {
        match self {
            OperationKind::Store { value, .. } | OperationKind::Concat { value, .. } => value,
            _ => &[],
        }
    }
}
