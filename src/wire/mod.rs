/// Wire-message framing and header handling
///
/// Every message starts with a 16-byte header: a little-endian i32 total
/// length (including the length field itself), the request id, the id of the
/// request this message answers (0 for fresh requests), and an opcode. The
/// framer only needs the first four bytes to find frame boundaries; the rest
/// of the header is interpreted by response dispatch.
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{DriverError, DriverResult};

/// Size of the fixed wire header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Reply opcode.
pub const OP_REPLY: i32 = 1;
/// Query/command opcode.
pub const OP_QUERY: i32 = 2004;

/// Upper bound for a declared message length before the stream is treated
/// as corrupt. Matches the wire-level maximum message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Fixed message header, bit-exact with the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    /// Parse a header from the front of a frame.
    pub fn parse(buf: &[u8]) -> DriverResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(DriverError::protocol(format!(
                "frame of {} bytes is shorter than the {} byte header",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let read_i32 = |offset: usize| {
            i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
        };
        Ok(Self {
            message_length: read_i32(0),
            request_id: read_i32(4),
            response_to: read_i32(8),
            op_code: read_i32(12),
        })
    }

    pub fn write_into(&self, out: &mut BytesMut) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.to_le_bytes());
    }
}

/// A fully reassembled inbound frame, split into header and opcode-specific
/// payload. The payload is a zero-copy slice of the frame buffer.
#[derive(Debug, Clone)]
pub struct RawReply {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl RawReply {
    pub fn parse(frame: Bytes) -> DriverResult<Self> {
        let header = MessageHeader::parse(&frame)?;
        if header.message_length as usize != frame.len() {
            return Err(DriverError::protocol(format!(
                "frame length {} disagrees with declared length {}",
                frame.len(),
                header.message_length
            )));
        }
        let payload = frame.slice(HEADER_SIZE..);
        Ok(Self { header, payload })
    }
}

/// Wrap an encoded payload in a wire header.
pub fn wrap_message(payload: &[u8], request_id: i32, response_to: i32, op_code: i32) -> Bytes {
    let total = HEADER_SIZE + payload.len();
    let mut out = BytesMut::with_capacity(total);
    MessageHeader {
        message_length: total as i32,
        request_id,
        response_to,
        op_code,
    }
    .write_into(&mut out);
    out.extend_from_slice(payload);
    out.freeze()
}

/// Monotonic request-id source; one per session so ids never collide across
/// the servers that share a callback registry.
#[derive(Debug)]
pub struct RequestIdSource {
    counter: AtomicI32,
}

impl RequestIdSource {
    pub fn new() -> Self {
        Self {
            counter: AtomicI32::new(1),
        }
    }

    pub fn next(&self) -> i32 {
        // Wrap back to 1 at the positive limit; an id is only required to be
        // unique among in-flight requests, never across the whole session.
        self.counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == i32::MAX { 1 } else { id + 1 })
            })
            .unwrap_or(1)
    }
}

impl Default for RequestIdSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental frame reassembly over an arbitrarily chunked byte stream.
///
/// A chunk boundary can fall anywhere, including inside the four length
/// bytes; partial length bytes are held in a small stub buffer until the full
/// length is known. Multiple complete messages inside one chunk are emitted
/// separately in arrival order. A declared length below the header size or
/// above `max_message_size` is a corrupt stream: the framer returns an error
/// and the connection must be closed.
#[derive(Debug)]
pub struct MessageFramer {
    max_message_size: usize,
    stub: Vec<u8>,
    buffer: BytesMut,
    expected: usize,
}

impl MessageFramer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            stub: Vec::with_capacity(4),
            buffer: BytesMut::new(),
            expected: 0,
        }
    }

    /// Feed one chunk of inbound bytes; returns the frames it completed.
    pub fn feed(&mut self, mut chunk: &[u8]) -> DriverResult<Vec<Bytes>> {
        let mut frames = Vec::new();
        while !chunk.is_empty() {
            if self.expected > 0 {
                // Mid-message: keep filling the current frame buffer.
                let need = self.expected - self.buffer.len();
                let take = need.min(chunk.len());
                self.buffer.extend_from_slice(&chunk[..take]);
                chunk = &chunk[take..];
                if self.buffer.len() == self.expected {
                    frames.push(self.buffer.split().freeze());
                    self.expected = 0;
                }
            } else if !self.stub.is_empty() || chunk.len() < 4 {
                // Not enough bytes seen to know the frame length yet.
                let need = 4 - self.stub.len();
                let take = need.min(chunk.len());
                self.stub.extend_from_slice(&chunk[..take]);
                chunk = &chunk[take..];
                if self.stub.len() == 4 {
                    let declared =
                        i32::from_le_bytes([self.stub[0], self.stub[1], self.stub[2], self.stub[3]]);
                    self.begin_frame(declared)?;
                    let stub = std::mem::take(&mut self.stub);
                    self.buffer.extend_from_slice(&stub);
                }
            } else {
                let declared = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                self.begin_frame(declared)?;
                self.buffer.extend_from_slice(&chunk[..4]);
                chunk = &chunk[4..];
            }
        }
        Ok(frames)
    }

    fn begin_frame(&mut self, declared: i32) -> DriverResult<()> {
        if declared < HEADER_SIZE as i32 || declared as usize > self.max_message_size {
            return Err(DriverError::protocol(format!(
                "corrupt stream: declared message length {declared}"
            )));
        }
        self.expected = declared as usize;
        self.buffer.reserve(self.expected);
        Ok(())
    }
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}
