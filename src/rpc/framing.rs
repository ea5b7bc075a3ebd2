//! JSON value framing for JSON-RPC over a Unix stream socket.
//!
//! The SNAP daemon does not length-prefix its messages. A message ends
//! where its JSON value ends, so incoming bytes are accumulated and a value
//! is decoded from the front of the buffer whenever one is complete.
//!
//! # Wire Format
//!
//! ```text
//! {"jsonrpc":"2.0","method":"emulation_list","id":1}{"jsonrpc":"2.0",...
//! ```
//!
//! Whitespace between values is ignored. Bytes after a decoded value stay
//! buffered for the next read.
//!
//! New bytes are scanned once for the closing bracket or quote of the first
//! value; the buffer is only handed to serde_json once that value can be
//! complete. Malformed bytes inside a value that never closes therefore
//! surface as a timeout or as `FrameError::Oversized`.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum buffered size (100MB) of a single undecoded message.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Failure to extract a value from the buffered bytes.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The buffer starts with something that can never become valid JSON.
    #[error("malformed JSON in response stream: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The peer sent more than the size limit without finishing a value.
    #[error("message size {size} exceeds maximum {max} bytes")]
    Oversized { size: usize, max: usize },
}

/// Incremental decoder that splits a byte stream into JSON values.
#[derive(Debug)]
pub struct JsonStreamDecoder {
    buf: Vec<u8>,
    max_size: usize,
    scan: Scan,
}

/// Progress through the first value in the buffer.
#[derive(Debug, Default)]
struct Scan {
    /// Bytes of the buffer already examined.
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// A bare scalar at the top level; only the parser can find its end.
    scalar: bool,
}

impl Scan {
    /// Examine the bytes not seen yet. Returns `true` once the first value
    /// may be complete.
    fn advance(&mut self, bytes: &[u8]) -> bool {
        if self.scalar {
            self.pos = bytes.len();
            return true;
        }

        while let Some(&b) = bytes.get(self.pos) {
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return true;
                    }
                }
                continue;
            }

            match b {
                b' ' | b'\t' | b'\n' | b'\r' => {}
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return true;
                    }
                }
                _ if self.depth == 0 => {
                    self.scalar = true;
                    self.pos = bytes.len();
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    /// Nothing but whitespace has been seen.
    fn is_idle(&self) -> bool {
        self.depth == 0 && !self.in_string && !self.scalar
    }
}

impl Default for JsonStreamDecoder {
    fn default() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that gives up once an unfinished value grows past `max_size` bytes.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_size,
            scan: Scan::default(),
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete value from the front of the buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a value (or
    /// nothing but whitespace); more bytes are needed. On success the
    /// consumed bytes are dropped and anything after them is kept.
    ///
    /// # Errors
    ///
    /// - `FrameError::Malformed` if the buffered bytes are not a JSON prefix
    /// - `FrameError::Oversized` if an incomplete value exceeds the size limit
    pub fn next_value(&mut self) -> Result<Option<Value>, FrameError> {
        if !self.scan.advance(&self.buf) {
            if self.scan.is_idle() {
                self.reset();
                return Ok(None);
            }
            return self.check_size().map(|()| None);
        }

        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                self.scan = Scan::default();
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => self.check_size().map(|()| None),
            Some(Err(e)) => Err(FrameError::Malformed(e)),
            None => {
                // Only whitespace left.
                self.reset();
                Ok(None)
            }
        }
    }

    fn check_size(&self) -> Result<(), FrameError> {
        if self.buf.len() > self.max_size {
            return Err(FrameError::Oversized {
                size: self.buf.len(),
                max: self.max_size,
            });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.scan = Scan::default();
    }
}

/// Write one serialized message to the stream and flush it.
///
/// `write_all` keeps writing until every byte is accepted, so a short write
/// from the socket never truncates a request.
pub async fn write_message<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(body).await?;
    writer.flush().await
}
