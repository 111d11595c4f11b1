//! Relay channel between a worker and the dispatcher.
//!
//! Each worker owns the write end of a bounded in-memory byte pipe and the
//! dispatcher owns the read end. Traffic is a sequence of frames:
//!
//! ```text
//! +----------------+----------------+---------------------+
//! | sender_slot    | payload_len    | payload             |
//! | i32, BE        | i32, BE        | payload_len bytes   |
//! +----------------+----------------+---------------------+
//! ```
//!
//! The pipe is byte-oriented, so the reader never assumes a read lines up with
//! a frame boundary. [`FrameBuffer`] accumulates partial reads and yields a
//! frame only once its header and payload are complete.

use std::{
    borrow::Cow,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};

/// Index of a connection in the dispatcher's table.
pub type SlotId = usize;

/// Size of the fixed frame header: sender slot plus payload length.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 1023;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload length {len} outside 1..={max}", max = MAX_PAYLOAD)]
    PayloadLength { len: i64 },
    #[error("sender slot {slot} cannot be encoded")]
    SenderSlot { slot: i64 },
}

/// One line relayed by a worker on behalf of its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    sender_slot: SlotId,
    payload: Bytes,
}

impl Frame {
    pub fn new(sender_slot: SlotId, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.is_empty() || payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadLength {
                len: payload.len() as i64,
            });
        }
        if i32::try_from(sender_slot).is_err() {
            return Err(FrameError::SenderSlot {
                slot: sender_slot as i64,
            });
        }
        Ok(Self {
            sender_slot,
            payload,
        })
    }

    pub fn sender_slot(&self) -> SlotId {
        self.sender_slot
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text; invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Appends header and payload to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        // Both values were range-checked in `Frame::new`.
        dst.reserve(HEADER_SIZE + self.payload.len());
        dst.put_i32(self.sender_slot as i32);
        dst.put_i32(self.payload.len() as i32);
        dst.extend_from_slice(&self.payload);
    }
}

/// Raw header as read off the pipe, before validation.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    sender_slot: i32,
    payload_len: i32,
}

impl FrameHeader {
    fn take_from(buf: &mut BytesMut) -> Self {
        let sender_slot = buf.get_i32();
        let payload_len = buf.get_i32();
        Self {
            sender_slot,
            payload_len,
        }
    }

    fn validate(&self) -> Result<(SlotId, usize), FrameError> {
        let len = usize::try_from(self.payload_len)
            .ok()
            .filter(|len| (1..=MAX_PAYLOAD).contains(len))
            .ok_or(FrameError::PayloadLength {
                len: i64::from(self.payload_len),
            })?;
        let slot = usize::try_from(self.sender_slot).map_err(|_| FrameError::SenderSlot {
            slot: i64::from(self.sender_slot),
        })?;
        Ok((slot, len))
    }
}

/// Outcome of decoding one frame from the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    Malformed(FrameError),
}

#[derive(Debug, Clone, Copy)]
enum State {
    Header,
    Payload { sender_slot: SlotId, len: usize },
    /// Discarding the body of a rejected frame so the stream stays aligned.
    Skip { remaining: usize },
}

/// Accumulates bytes from the relay pipe and extracts complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(HEADER_SIZE + MAX_PAYLOAD),
            state: State::Header,
        }
    }

    /// Appends `data` and returns every frame it completes, oldest first.
    pub fn push(&mut self, data: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(data);

        let mut decoded = Vec::new();
        while let Some(item) = self.try_extract_one() {
            decoded.push(item);
        }
        decoded
    }

    /// True when no partial frame is pending.
    pub fn is_at_boundary(&self) -> bool {
        matches!(self.state, State::Header) && self.buffer.is_empty()
    }

    /// Bytes buffered towards an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn try_extract_one(&mut self) -> Option<Decoded> {
        loop {
            match self.state {
                State::Header => {
                    if self.buffer.len() < HEADER_SIZE {
                        return None;
                    }
                    let header = FrameHeader::take_from(&mut self.buffer);
                    match header.validate() {
                        Ok((sender_slot, len)) => {
                            self.state = State::Payload { sender_slot, len };
                        }
                        Err(err) => {
                            if header.payload_len > 0 {
                                self.state = State::Skip {
                                    remaining: header.payload_len as usize,
                                };
                            }
                            return Some(Decoded::Malformed(err));
                        }
                    }
                }
                State::Payload { sender_slot, len } => {
                    if self.buffer.len() < len {
                        return None;
                    }
                    let payload = self.buffer.split_to(len).freeze();
                    self.state = State::Header;
                    return Some(Decoded::Frame(Frame {
                        sender_slot,
                        payload,
                    }));
                }
                State::Skip { remaining } => {
                    let skipped = remaining.min(self.buffer.len());
                    self.buffer.advance(skipped);
                    if skipped < remaining {
                        self.state = State::Skip {
                            remaining: remaining - skipped,
                        };
                        return None;
                    }
                    self.state = State::Header;
                }
            }
        }
    }
}

/// Creates a relay pipe for `slot` holding at most `capacity` unread bytes.
pub fn channel(slot: SlotId, capacity: usize) -> (RelayWriter, RelayReader) {
    let (write_end, read_end) = tokio::io::duplex(capacity);
    (
        RelayWriter::new(slot, write_end),
        RelayReader::from_stream(read_end),
    )
}

/// Worker side of the relay. Dropping it signals end-of-stream.
pub struct RelayWriter {
    slot: SlotId,
    inner: DuplexStream,
    scratch: BytesMut,
}

impl RelayWriter {
    fn new(slot: SlotId, inner: DuplexStream) -> Self {
        Self {
            slot,
            inner,
            scratch: BytesMut::with_capacity(HEADER_SIZE + MAX_PAYLOAD),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Sends `payload` as one frame attributed to this writer's slot.
    pub async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        let frame = Frame::new(self.slot, Bytes::copy_from_slice(payload))
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.scratch.clear();
        frame.encode(&mut self.scratch);
        self.inner.write_all(&self.scratch).await
    }
}

/// Result of one readiness poll on a relay pipe.
#[derive(Debug)]
pub enum RelayRead {
    /// At least one frame (valid or not) was completed.
    Frames(Vec<Decoded>),
    /// The worker dropped its end. `truncated` counts bytes of an incomplete
    /// trailing frame that can never be finished.
    Closed { truncated: usize },
    /// The pipe itself failed.
    Failed(io::Error),
}

/// Dispatcher side of the relay.
pub struct RelayReader {
    inner: DuplexStream,
    frames: FrameBuffer,
}

impl RelayReader {
    pub(crate) fn from_stream(inner: DuplexStream) -> Self {
        Self {
            inner,
            frames: FrameBuffer::new(),
        }
    }

    /// Reads whatever the pipe holds and returns once a frame completes, the
    /// pipe closes, or it fails. Short reads keep polling.
    pub fn poll_read_frames(&mut self, cx: &mut Context<'_>) -> Poll<RelayRead> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let mut buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut self.inner).poll_read(cx, &mut buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Poll::Ready(Err(err)) => return Poll::Ready(RelayRead::Failed(err)),
                Poll::Ready(Ok(())) => {
                    let filled = buf.filled();
                    if filled.is_empty() {
                        let truncated = if self.frames.is_at_boundary() {
                            0
                        } else {
                            self.frames.pending().max(1)
                        };
                        return Poll::Ready(RelayRead::Closed { truncated });
                    }
                    let decoded = self.frames.push(filled);
                    if !decoded.is_empty() {
                        return Poll::Ready(RelayRead::Frames(decoded));
                    }
                }
            }
        }
    }
}
