//! Typed results produced by completed operations.

use std::collections::HashMap;

/// The outcome of a successfully completed operation.
///
/// Server-reported failures surface as
/// [`Error::ServerStatus`](crate::Error::ServerStatus) instead, with one
/// exception: a missing key on a read is the ordinary [`OpResult::NotFound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// The item was stored; `cas` is the server's new version stamp
    /// (zero when the store was quiet and the server stayed silent).
    Stored { cas: u64 },

    /// A read found the item.
    Found {
        flags: u32,
        value: Vec<u8>,
        cas: u64,
    },

    /// A read or touch found nothing under the key.
    NotFound,

    /// The item was deleted.
    Deleted,

    /// New counter value after an increment/decrement (zero when the
    /// mutate was quiet and the server stayed silent).
    Counter(u64),

    /// The item's expiration was updated.
    Touched,

    /// The append/prepend was applied.
    Concatenated,

    /// The node's cache was flushed.
    Flushed,

    /// Accumulated statistics from one node.
    Stats(HashMap<String, String>),

    /// Server version string.
    Version(String),

    /// NoOp round trip completed.
    NoOp,
}

impl OpResult {
    /// Convenience accessor for read results.
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            OpResult::Found { value, .. } => Some(value),
            _ => None,
        }
    }
}
