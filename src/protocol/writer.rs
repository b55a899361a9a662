//! Incremental request-frame writer.
//!
//! A [`FrameWriter`] carries a fully built frame plus a cursor, so one
//! frame can be pushed through any number of short socket writes without
//! re-deriving offsets. The caller loop is:
//!
//! ```ignore
//! while !writer.is_done() {
//!     let n = connection.send(writer.next_slice()).await?;
//!     writer.consume(n);
//! }
//! ```

use crate::buffer::{BufferPool, PooledBuf};
use crate::error::{Error, Result};
use crate::protocol::header::{RequestHeader, HEADER_LEN};
use crate::protocol::Opcode;
use crate::types::{MAX_EXTRA_LEN, MAX_KEY_LEN};
use bytes::BufMut;

/// Which section of the frame the cursor is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    /// Header plus extras (contiguous in one pooled buffer).
    Header,
    /// Key bytes.
    Key,
    /// Value bytes.
    Body,
    Done,
}

/// Resumable writer for a single request frame.
pub struct FrameWriter {
    /// Header and extras, laid out contiguously.
    head: PooledBuf,
    /// Key followed by value.
    body: PooledBuf,
    key_len: usize,
    state: WriteState,
    /// Byte offset within the current section.
    offset: usize,
    opaque: u32,
}

impl FrameWriter {
    /// Build a complete frame from its parts.
    ///
    /// Key and extras lengths beyond what the header fields can carry are
    /// rejected here, before any I/O.
    pub fn build(
        pool: &BufferPool,
        opcode: Opcode,
        key: &[u8],
        extras: &[u8],
        value: &[u8],
        opaque: u32,
        cas: u64,
    ) -> Result<Self> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds protocol maximum of {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        if extras.len() > MAX_EXTRA_LEN {
            return Err(Error::InvalidArgument(format!(
                "extras of {} bytes exceed protocol maximum of {}",
                extras.len(),
                MAX_EXTRA_LEN
            )));
        }

        let header = RequestHeader::new(
            opcode as u8,
            key.len() as u16,
            extras.len() as u8,
            value.len() as u32,
            opaque,
            cas,
        );

        let mut head = pool.acquire(HEADER_LEN + extras.len())?;
        head.truncate(HEADER_LEN + extras.len());
        {
            let mut dst = head.as_mut_slice();
            header.encode(&mut dst);
            dst.put_slice(extras);
        }

        let mut body = pool.acquire(key.len() + value.len())?;
        body.truncate(key.len() + value.len());
        body.as_mut_slice()[..key.len()].copy_from_slice(key);
        body.as_mut_slice()[key.len()..].copy_from_slice(value);

        Ok(Self {
            head,
            body,
            key_len: key.len(),
            state: WriteState::Header,
            offset: 0,
            opaque,
        })
    }

    /// Correlation id carried by this frame.
    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn is_done(&self) -> bool {
        self.state == WriteState::Done
    }

    /// Bytes of the frame not yet consumed.
    pub fn remaining(&self) -> usize {
        match self.state {
            WriteState::Header => self.head.len() - self.offset + self.body.len(),
            WriteState::Key => self.body.len() - self.offset,
            WriteState::Body => self.body.len() - self.offset,
            WriteState::Done => 0,
        }
    }

    /// The next contiguous chunk to hand to the socket. Empty only once
    /// the frame is done.
    pub fn next_slice(&self) -> &[u8] {
        match self.state {
            WriteState::Header => &self.head[self.offset..],
            WriteState::Key => &self.body[self.offset..self.key_len],
            WriteState::Body => &self.body[self.offset..],
            WriteState::Done => &[],
        }
    }

    /// Record that the sink accepted `n` bytes of the current slice.
    /// Returns whether further writes are pending.
    pub fn consume(&mut self, n: usize) -> bool {
        debug_assert!(n <= self.next_slice().len());
        self.offset += n;
        self.advance_state();
        !self.is_done()
    }

    fn advance_state(&mut self) {
        loop {
            match self.state {
                WriteState::Header if self.offset >= self.head.len() => {
                    self.state = WriteState::Key;
                    self.offset = 0;
                }
                WriteState::Key if self.offset >= self.key_len => {
                    self.state = WriteState::Body;
                    // Value bytes follow the key in the same buffer.
                    self.offset = self.key_len.max(self.offset);
                }
                WriteState::Body if self.offset >= self.body.len() => {
                    self.state = WriteState::Done;
                    self.offset = 0;
                }
                _ => break,
            }
        }
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("opaque", &self.opaque)
            .field("state", &self.state)
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolConfig;

    fn pool() -> BufferPool {
        BufferPool::new(BufferPoolConfig::default())
    }

    /// Drain a writer by feeding it a sink that accepts `step` bytes at a
    /// time.
    fn drain(writer: &mut FrameWriter, step: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while !writer.is_done() {
            let chunk = writer.next_slice();
            let n = chunk.len().min(step);
            out.extend_from_slice(&chunk[..n]);
            writer.consume(n);
        }
        out
    }

    #[test]
    fn test_get_request_bytes() {
        // Get("k") with a known opaque, byte for byte.
        let pool = pool();
        let mut w =
            FrameWriter::build(&pool, Opcode::Get, b"k", &[], &[], 0x00000007, 0).unwrap();
        let bytes = drain(&mut w, usize::MAX);

        let mut expected = vec![
            0x80, 0x00, // magic, opcode
            0x00, 0x01, // key length
            0x00, 0x00, // extra length, data type
            0x00, 0x00, // vbucket
            0x00, 0x00, 0x00, 0x01, // body length
            0x00, 0x00, 0x00, 0x07, // opaque
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // cas
        ];
        expected.push(0x6b); // 'k'
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_one_byte_at_a_time_equals_whole_frame() {
        let pool = pool();
        let extras = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x3C];
        let build = || {
            FrameWriter::build(
                &pool,
                Opcode::Set,
                b"some-key",
                &extras,
                b"the value payload",
                99,
                0x1122334455667788,
            )
            .unwrap()
        };

        let whole = drain(&mut build(), usize::MAX);
        let byte_wise = drain(&mut build(), 1);
        let trickle = drain(&mut build(), 3);

        assert_eq!(whole, byte_wise);
        assert_eq!(whole, trickle);
        assert_eq!(whole.len(), HEADER_LEN + 8 + 8 + 17);
    }

    #[test]
    fn test_empty_key_and_value_sections_skipped() {
        let pool = pool();
        let mut w = FrameWriter::build(&pool, Opcode::NoOp, &[], &[], &[], 5, 0).unwrap();
        let bytes = drain(&mut w, usize::MAX);
        assert_eq!(bytes.len(), HEADER_LEN);
        assert!(w.is_done());
        assert_eq!(w.remaining(), 0);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let pool = BufferPool::new(BufferPoolConfig {
            max_buffer_size: 1024 * 1024,
            max_free_per_class: 4,
        });
        let key = vec![0u8; MAX_KEY_LEN + 1];
        let err = FrameWriter::build(&pool, Opcode::Get, &key, &[], &[], 0, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_oversized_extras_rejected() {
        let pool = pool();
        let extras = vec![0u8; MAX_EXTRA_LEN + 1];
        let err = FrameWriter::build(&pool, Opcode::Set, b"k", &extras, &[], 0, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_buffers_return_to_pool() {
        let pool = pool();
        {
            let mut w = FrameWriter::build(&pool, Opcode::Get, b"k", &[], &[], 0, 0).unwrap();
            drain(&mut w, 2);
            assert!(pool.outstanding() > 0);
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
