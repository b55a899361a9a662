//! Wire-level codec for the memcached binary protocol.
//!
//! Pure encode/decode logic: the 24-byte fixed header plus variable
//! extra/key/value sections, with incremental writer and reader state
//! machines that tolerate a frame arriving or departing in arbitrarily
//! small chunks.

pub mod header;
pub mod reader;
pub mod writer;

pub use header::{RequestHeader, ResponseHeader, HEADER_LEN};
pub use reader::{FrameReader, ResponseFrame};
pub use writer::FrameWriter;

/// Magic byte opening every request frame.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte opening every response frame.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Binary protocol command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Flush = 0x08,
    GetQ = 0x09,
    NoOp = 0x0a,
    Version = 0x0b,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    GetAndTouchQ = 0x1e,
}

impl Opcode {
    /// Whether the server stays silent on success for this opcode.
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            Opcode::GetQ
                | Opcode::GetKQ
                | Opcode::SetQ
                | Opcode::AddQ
                | Opcode::ReplaceQ
                | Opcode::DeleteQ
                | Opcode::IncrementQ
                | Opcode::DecrementQ
                | Opcode::FlushQ
                | Opcode::AppendQ
                | Opcode::PrependQ
                | Opcode::GetAndTouchQ
        )
    }
}

/// Protocol-defined response status codes, mapped 1:1 so consumers can
/// branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    DeltaBadValue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    /// A code this client does not know. Carried verbatim.
    Other(u16),
}

impl Status {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::DeltaBadValue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            other => Status::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::DeltaBadValue => 0x0006,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::NotSupported => 0x0083,
            Status::InternalError => 0x0084,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists (CAS mismatch)"),
            Status::ValueTooLarge => write!(f, "value too large"),
            Status::InvalidArguments => write!(f, "invalid arguments"),
            Status::ItemNotStored => write!(f, "item not stored"),
            Status::DeltaBadValue => write!(f, "incr/decr on non-numeric value"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "server out of memory"),
            Status::NotSupported => write!(f, "not supported"),
            Status::InternalError => write!(f, "server internal error"),
            Status::Busy => write!(f, "server busy"),
            Status::TemporaryFailure => write!(f, "temporary failure"),
            Status::Other(code) => write!(f, "status {:#06x}", code),
        }
    }
}
