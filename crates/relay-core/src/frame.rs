//! Newline-delimited relay frames.
//!
//! One frame is four lines: the event name, the sender, the JSON payload and
//! a terminator line that is written empty and ignored on read.

use crate::event::{ControlEvent, Event};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

const FRAME_LINES: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid {field} field: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("stream ended inside a frame after {received} bytes")]
    Truncated { received: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded frame together with the exact bytes it arrived as.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub control: ControlEvent,
    pub event: Event,
    pub raw: Vec<u8>,
}

pub fn encode_frame(event: &Event) -> Result<Vec<u8>, FrameError> {
    encode_frame_limited(event, DEFAULT_MAX_FRAME_BYTES)
}

pub fn encode_frame_limited(event: &Event, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    check_line_field("name", event.name())?;
    check_line_field("sender", event.sender())?;
    if event.name().is_empty() {
        return Err(FrameError::InvalidField {
            field: "name",
            reason: "must not be empty",
        });
    }

    let payload =
        serde_json::to_vec(event.payload()).map_err(|err| FrameError::Encode(err.to_string()))?;
    let mut encoded =
        Vec::with_capacity(event.name().len() + event.sender().len() + payload.len() + 4);
    encoded.extend_from_slice(event.name().as_bytes());
    encoded.push(b'\n');
    encoded.extend_from_slice(event.sender().as_bytes());
    encoded.push(b'\n');
    encoded.extend_from_slice(&payload);
    encoded.extend_from_slice(b"\n\n");

    if encoded.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

fn check_line_field(field: &'static str, value: &str) -> Result<(), FrameError> {
    if value.contains(&['\n', '\r'][..]) {
        return Err(FrameError::InvalidField {
            field,
            reason: "must not contain line breaks",
        });
    }
    Ok(())
}

/// Decodes one complete frame buffer.
pub fn decode_frame(raw: Vec<u8>) -> Result<Frame, FrameError> {
    let mut lines = Vec::with_capacity(FRAME_LINES);
    let mut rest = raw.as_slice();
    while let Some(idx) = rest.iter().position(|byte| *byte == b'\n') {
        lines.push(strip_line(&rest[..idx]));
        rest = &rest[idx + 1..];
    }
    if !rest.is_empty() || lines.len() != FRAME_LINES {
        return Err(FrameError::Malformed(format!(
            "expected {FRAME_LINES} terminated lines, found {}",
            lines.len()
        )));
    }

    let name = std::str::from_utf8(lines[0])
        .map_err(|err| FrameError::Malformed(format!("name is not utf-8: {err}")))?;
    if name.is_empty() {
        return Err(FrameError::Malformed("empty event name".to_string()));
    }
    let sender = std::str::from_utf8(lines[1])
        .map_err(|err| FrameError::Malformed(format!("sender is not utf-8: {err}")))?;
    let payload: Value = serde_json::from_slice(lines[2])
        .map_err(|err| FrameError::Malformed(format!("payload is not json: {err}")))?;
    // Line four closes the frame; its content is discarded.

    let event = Event::new(name, sender, payload);
    Ok(Frame {
        control: event.control(),
        event,
        raw,
    })
}

fn strip_line(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Buffered frame reader and writer over a byte stream.
///
/// Bytes of a frame that has not fully arrived stay in `partial`, so
/// `read_frame` can be raced against a timeout and simply called again.
pub struct FrameStream<S> {
    inner: BufReader<S>,
    partial: Vec<u8>,
    max_frame_bytes: usize,
}

impl<S: AsyncRead> FrameStream<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_bytes(stream, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(stream: S, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(stream),
            partial: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// True when unread bytes sit in the read buffer, so the next
    /// `read_frame` can make progress without the socket becoming readable.
    /// Bytes already moved into an incomplete frame do not count.
    pub fn has_buffered(&self) -> bool {
        !self.inner.buffer().is_empty()
    }

    /// Bytes of the frame currently being assembled.
    pub fn pending_bytes(&self) -> usize {
        self.partial.len()
    }
}

impl<S: AsyncRead + Unpin> FrameStream<S> {
    /// Reads the next frame. `Ok(None)` means the peer closed the stream
    /// on a frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            let lines = self.partial.iter().filter(|byte| **byte == b'\n').count();
            if lines == FRAME_LINES {
                let raw = std::mem::take(&mut self.partial);
                return decode_frame(raw).map(Some);
            }

            let limit = (self.max_frame_bytes + 1).saturating_sub(self.partial.len()) as u64;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.partial)
                .await?;
            if read == 0 {
                if self.partial.is_empty() {
                    return Ok(None);
                }
                let received = self.partial.len();
                self.partial.clear();
                return Err(FrameError::Truncated { received });
            }
            if self.partial.len() > self.max_frame_bytes {
                let size = self.partial.len();
                self.partial.clear();
                return Err(FrameError::Oversized {
                    size,
                    max: self.max_frame_bytes,
                });
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameStream<S> {
    pub async fn write_frame(&mut self, raw: &[u8]) -> std::io::Result<()> {
        let writer = self.inner.get_mut();
        writer.write_all(raw).await?;
        writer.flush().await
    }

    pub async fn write_event(&mut self, event: &Event) -> Result<(), FrameError> {
        let raw = encode_frame_limited(event, self.max_frame_bytes)?;
        self.write_frame(&raw).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.get_mut().shutdown().await
    }
}
