//! Core types used throughout the client.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Maximum key length the binary protocol can carry (2-byte field).
pub const MAX_KEY_LEN: usize = 65_535;

/// Maximum extras length the binary protocol can carry (1-byte field).
pub const MAX_EXTRA_LEN: usize = 255;

/// Relative expirations at or above this many seconds are interpreted by
/// the server as absolute Unix timestamps, so the client must encode them
/// as such.
pub const RELATIVE_EXPIRATION_LIMIT_SECS: u64 = 30 * 24 * 60 * 60;

/// Generator for request correlation ids.
///
/// One generator is shared per cluster and passed to operation
/// constructors, so correlation state is explicit rather than a hidden
/// process-wide counter. Wraparound at 2^32 is fine: in-flight windows
/// are far smaller.
#[derive(Debug, Default)]
pub struct OpaqueGenerator {
    next: AtomicU32,
}

impl OpaqueGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next correlation id.
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Item expiration, resolved to its wire encoding once at operation
/// construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// The item never expires.
    Never,
    /// Expire this long after the server stores the item.
    Relative(Duration),
    /// Expire at an absolute point in time.
    At(SystemTime),
}

impl Expiration {
    /// Encode against a wall-clock "now" into the protocol's 4-byte form.
    ///
    /// Relative durations under 30 days are sent as seconds-from-now;
    /// anything longer, and all absolute expirations, are sent as
    /// Unix-epoch seconds.
    pub fn encode(self, now: SystemTime) -> u32 {
        match self {
            Expiration::Never => 0,
            Expiration::Relative(d) => {
                let secs = d.as_secs();
                if secs < RELATIVE_EXPIRATION_LIMIT_SECS {
                    secs as u32
                } else {
                    Self::epoch_secs(now + d)
                }
            }
            Expiration::At(t) => Self::epoch_secs(t),
        }
    }

    fn epoch_secs(t: SystemTime) -> u32 {
        t.duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}
