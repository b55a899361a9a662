//! The 24-byte fixed frame header.
//!
//! Layout (big-endian):
//!
//! ```text
//! offset 0    : magic        (0x80 request / 0x81 response)
//! offset 1    : opcode
//! offset 2-3  : key length
//! offset 4    : extra length
//! offset 5    : data type (0 = raw)
//! offset 6-7  : status (response) / reserved (request)
//! offset 8-11 : total body length (extra + key + value)
//! offset 12-15: correlation id (opaque, echoed by the server)
//! offset 16-23: CAS
//! ```

use crate::error::{ProtocolError, Result};
use crate::protocol::{Status, REQUEST_MAGIC, RESPONSE_MAGIC};
use bytes::{Buf, BufMut};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 24;

/// Header of an outgoing request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extra_len: u8,
    pub data_type: u8,
    pub vbucket: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    pub fn new(opcode: u8, key_len: u16, extra_len: u8, value_len: u32, opaque: u32, cas: u64) -> Self {
        Self {
            opcode,
            key_len,
            extra_len,
            data_type: 0,
            vbucket: 0,
            body_len: extra_len as u32 + key_len as u32 + value_len,
            opaque,
            cas,
        }
    }

    /// Write the header into `dst`, which must have at least
    /// [`HEADER_LEN`] bytes remaining.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(REQUEST_MAGIC);
        dst.put_u8(self.opcode);
        dst.put_u16(self.key_len);
        dst.put_u8(self.extra_len);
        dst.put_u8(self.data_type);
        dst.put_u16(self.vbucket);
        dst.put_u32(self.body_len);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
    }
}

/// Header of a received response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extra_len: u8,
    pub data_type: u8,
    pub status: Status,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    /// Decode from exactly [`HEADER_LEN`] bytes.
    ///
    /// A magic byte other than 0x81 means the stream is corrupt; the
    /// owning connection must be torn down. The body-length arithmetic is
    /// validated here so downstream code can subtract without underflow.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        debug_assert_eq!(src.len(), HEADER_LEN);

        let magic = src.get_u8();
        if magic != RESPONSE_MAGIC {
            return Err(ProtocolError::BadMagic(magic).into());
        }

        let opcode = src.get_u8();
        let key_len = src.get_u16();
        let extra_len = src.get_u8();
        let data_type = src.get_u8();
        let status = Status::from_code(src.get_u16());
        let body_len = src.get_u32();
        let opaque = src.get_u32();
        let cas = src.get_u64();

        if (body_len as u64) < extra_len as u64 + key_len as u64 {
            return Err(ProtocolError::BodyLengthMismatch {
                body_len,
                extra_len,
                key_len,
            }
            .into());
        }

        Ok(Self {
            opcode,
            key_len,
            extra_len,
            data_type,
            status,
            body_len,
            opaque,
            cas,
        })
    }

    /// Length of the value section.
    pub fn value_len(&self) -> u32 {
        self.body_len - self.extra_len as u32 - self.key_len as u32
    }
}
