//! Incremental response-frame reader.
//!
//! The reader is fed whatever the socket produced and buffers partial
//! sections internally: exactly 24 header bytes are accumulated first,
//! then the extras and key+value sections are streamed into pooled
//! buffers sized from the decoded header. One `feed` call consumes at
//! most one frame's worth of input; the caller re-feeds any leftover.

use crate::buffer::{BufferPool, PooledBuf};
use crate::error::{ProtocolError, Result};
use crate::protocol::header::{ResponseHeader, HEADER_LEN};
use crate::protocol::Status;

/// A fully reassembled response frame.
pub struct ResponseFrame {
    pub header: ResponseHeader,
    extras: PooledBuf,
    /// Key followed by value.
    body: PooledBuf,
}

impl ResponseFrame {
    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    pub fn status(&self) -> Status {
        self.header.status
    }

    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    pub fn extras(&self) -> &[u8] {
        &self.extras
    }

    pub fn key(&self) -> &[u8] {
        &self.body[..self.header.key_len as usize]
    }

    pub fn value(&self) -> &[u8] {
        &self.body[self.header.key_len as usize..]
    }
}

impl std::fmt::Debug for ResponseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFrame")
            .field("opaque", &self.header.opaque)
            .field("status", &self.header.status)
            .field("key_len", &self.header.key_len)
            .field("value_len", &self.header.value_len())
            .finish()
    }
}

enum ReadState {
    /// Accumulating the fixed header.
    Header { buf: [u8; HEADER_LEN], have: usize },
    /// Streaming the extras section.
    Extra {
        header: ResponseHeader,
        extras: PooledBuf,
        have: usize,
    },
    /// Streaming key + value.
    Body {
        header: ResponseHeader,
        extras: PooledBuf,
        body: PooledBuf,
        have: usize,
    },
}

impl ReadState {
    fn start() -> Self {
        ReadState::Header {
            buf: [0u8; HEADER_LEN],
            have: 0,
        }
    }
}

/// Resumable reader reassembling response frames from a byte stream.
pub struct FrameReader {
    pool: BufferPool,
    /// Largest body this reader will allocate for; anything bigger is
    /// treated as stream corruption.
    max_body_len: u32,
    state: ReadState,
}

impl FrameReader {
    pub fn new(pool: BufferPool, max_body_len: u32) -> Self {
        Self {
            pool,
            max_body_len,
            state: ReadState::start(),
        }
    }

    /// Feed stream bytes. Returns how many bytes were consumed and, if a
    /// frame completed, the frame. Consumption stops at a frame boundary
    /// so dispatch can happen before the next frame's bytes are touched.
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<ResponseFrame>)> {
        let mut consumed = 0;

        loop {
            match &mut self.state {
                ReadState::Header { buf, have } => {
                    let want = HEADER_LEN - *have;
                    let take = want.min(data.len() - consumed);
                    buf[*have..*have + take].copy_from_slice(&data[consumed..consumed + take]);
                    *have += take;
                    consumed += take;

                    if *have < HEADER_LEN {
                        return Ok((consumed, None));
                    }

                    let header = ResponseHeader::decode(&buf[..])?;
                    if header.body_len > self.max_body_len {
                        return Err(ProtocolError::BodyTooLarge(header.body_len).into());
                    }

                    if header.body_len == 0 {
                        let frame = ResponseFrame {
                            header,
                            extras: self.pool.acquire(0)?,
                            body: self.pool.acquire(0)?,
                        };
                        self.state = ReadState::start();
                        return Ok((consumed, Some(frame)));
                    }

                    let mut extras = self.pool.acquire(header.extra_len as usize)?;
                    extras.truncate(header.extra_len as usize);
                    self.state = ReadState::Extra {
                        header,
                        extras,
                        have: 0,
                    };
                }

                ReadState::Extra {
                    header,
                    extras,
                    have,
                } => {
                    let want = extras.len() - *have;
                    let take = want.min(data.len() - consumed);
                    extras.as_mut_slice()[*have..*have + take]
                        .copy_from_slice(&data[consumed..consumed + take]);
                    *have += take;
                    consumed += take;

                    if *have < extras.len() {
                        return Ok((consumed, None));
                    }

                    let header = *header;
                    let body_len = header.body_len as usize - header.extra_len as usize;
                    let mut body = self.pool.acquire(body_len)?;
                    body.truncate(body_len);

                    let extras = match std::mem::replace(&mut self.state, ReadState::start()) {
                        ReadState::Extra { extras, .. } => extras,
                        _ => unreachable!(),
                    };
                    self.state = ReadState::Body {
                        header,
                        extras,
                        body,
                        have: 0,
                    };
                }

                ReadState::Body {
                    header: _,
                    extras: _,
                    body,
                    have,
                } => {
                    let want = body.len() - *have;
                    let take = want.min(data.len() - consumed);
                    body.as_mut_slice()[*have..*have + take]
                        .copy_from_slice(&data[consumed..consumed + take]);
                    *have += take;
                    consumed += take;

                    if *have < body.len() {
                        return Ok((consumed, None));
                    }

                    let (header, extras, body) =
                        match std::mem::replace(&mut self.state, ReadState::start()) {
                            ReadState::Body {
                                header,
                                extras,
                                body,
                                ..
                            } => (header, extras, body),
                            _ => unreachable!(),
                        };
                    return Ok((consumed, Some(ResponseFrame { header, extras, body })));
                }
            }
        }
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            ReadState::Header { have, .. } => format!("header({}/{})", have, HEADER_LEN),
            ReadState::Extra { have, .. } => format!("extra({})", have),
            ReadState::Body { have, .. } => format!("body({})", have),
        };
        f.debug_struct("FrameReader")
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolConfig;
    use crate::error::Error;
    use crate::protocol::RESPONSE_MAGIC;
    use bytes::BufMut;

    fn pool() -> BufferPool {
        BufferPool::new(BufferPoolConfig::default())
    }

    fn response_bytes(
        opcode: u8,
        status: u16,
        opaque: u32,
        cas: u64,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(RESPONSE_MAGIC);
        out.put_u8(opcode);
        out.put_u16(key.len() as u16);
        out.put_u8(extras.len() as u8);
        out.put_u8(0);
        out.put_u16(status);
        out.put_u32((extras.len() + key.len() + value.len()) as u32);
        out.put_u32(opaque);
        out.put_u64(cas);
        out.put_slice(extras);
        out.put_slice(key);
        out.put_slice(value);
        out
    }

    fn feed_all(reader: &mut FrameReader, mut data: &[u8], step: usize) -> Vec<ResponseFrame> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            let chunk = &data[..step.min(data.len())];
            let mut offset = 0;
            while offset < chunk.len() {
                let (n, frame) = reader.feed(&chunk[offset..]).unwrap();
                offset += n;
                if let Some(f) = frame {
                    frames.push(f);
                }
            }
            data = &data[chunk.len()..];
        }
        frames
    }

    #[test]
    fn test_whole_frame_decode() {
        let raw = response_bytes(0x00, 0, 7, 42, &[0, 0, 0, 0], b"", b"v");
        let mut reader = FrameReader::new(pool(), 1 << 20);

        let frames = feed_all(&mut reader, &raw, usize::MAX);
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!(f.opaque(), 7);
        assert_eq!(f.cas(), 42);
        assert_eq!(f.status(), Status::Success);
        assert_eq!(f.extras(), &[0, 0, 0, 0]);
        assert_eq!(f.key(), b"");
        assert_eq!(f.value(), b"v");
    }

    #[test]
    fn test_one_byte_at_a_time_matches_whole() {
        let raw = response_bytes(0x01, 0, 9, 5, &[1, 2, 3, 4], b"the-key", b"the-value");

        let mut whole = FrameReader::new(pool(), 1 << 20);
        let mut trickle = FrameReader::new(pool(), 1 << 20);

        let a = feed_all(&mut whole, &raw, usize::MAX);
        let b = feed_all(&mut trickle, &raw, 1);

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].header, b[0].header);
        assert_eq!(a[0].extras(), b[0].extras());
        assert_eq!(a[0].key(), b[0].key());
        assert_eq!(a[0].value(), b[0].value());
    }

    #[test]
    fn test_zero_body_completes_after_header() {
        let raw = response_bytes(0x01, 0, 3, 0, &[], b"", b"");
        let mut reader = FrameReader::new(pool(), 1 << 20);
        let (n, frame) = reader.feed(&raw).unwrap();
        assert_eq!(n, HEADER_LEN);
        let frame = frame.unwrap();
        assert_eq!(frame.value(), b"");
        assert_eq!(frame.extras(), b"");
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut raw = response_bytes(0x00, 0, 1, 0, &[0, 0, 0, 0], b"", b"a");
        raw.extend(response_bytes(0x00, 0, 2, 0, &[0, 0, 0, 0], b"", b"b"));

        let mut reader = FrameReader::new(pool(), 1 << 20);
        let frames = feed_all(&mut reader, &raw, usize::MAX);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opaque(), 1);
        assert_eq!(frames[1].opaque(), 2);
        assert_eq!(frames[0].value(), b"a");
        assert_eq!(frames[1].value(), b"b");
    }

    #[test]
    fn test_bad_magic_fails_even_with_partial_feed() {
        let mut raw = response_bytes(0x00, 0, 1, 0, &[], b"", b"");
        raw[0] = 0x79;

        let mut reader = FrameReader::new(pool(), 1 << 20);
        // Header is only validated once all 24 bytes arrived.
        let (n, frame) = reader.feed(&raw[..10]).unwrap();
        assert_eq!(n, 10);
        assert!(frame.is_none());

        let err = reader.feed(&raw[10..]).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::BadMagic(0x79))
        ));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let raw = response_bytes(0x00, 0, 1, 0, &[], b"", &vec![0u8; 2048]);
        let mut reader = FrameReader::new(pool(), 1024);
        let err = reader.feed(&raw).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::BodyTooLarge(2048))
        ));
    }

    #[test]
    fn test_pooled_buffers_released_with_frame() {
        let pool = pool();
        let raw = response_bytes(0x00, 0, 1, 0, &[0, 0, 0, 0], b"k", b"value");
        let mut reader = FrameReader::new(pool.clone(), 1 << 20);

        let frames = feed_all(&mut reader, &raw, usize::MAX);
        assert!(pool.outstanding() > 0);
        drop(frames);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_error_status_frame_still_parses() {
        let raw = response_bytes(0x01, 0x0002, 4, 0, &[], b"", b"");
        let mut reader = FrameReader::new(pool(), 1 << 20);
        let (_, frame) = reader.feed(&raw).unwrap();
        assert_eq!(frame.unwrap().status(), Status::KeyExists);
    }
}
