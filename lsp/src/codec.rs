//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! This module provides [`FrameReader`] and [`FrameWriter`] for async
//! reading and writing of framed JSON-RPC messages.
//!
//! Decoding distinguishes recoverable faults ([`FrameError::Malformed`]: the
//! reader is left at the next frame boundary) from stream faults
//! ([`FrameError::Io`]: the stream is unusable).

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (64 MiB). Larger bodies are skipped, not buffered.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const CONTENT_LENGTH: &str = "content-length:";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame was unusable but the stream is still aligned on a frame
    /// boundary; the next read may succeed.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The stream ended mid-frame or the read failed.
    #[error("stream fault: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    fn eof(what: &str) -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("unexpected EOF while reading {what}"),
        ))
    }
}

/// Reads JSON-RPC frames from an async reader.
///
/// Parses `Content-Length` headers and reads exactly that many bytes,
/// then deserializes the body as JSON.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if content_length > MAX_FRAME_BYTES {
            self.skip_body(content_length).await?;
            return Err(FrameError::Malformed(format!(
                "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FrameError::eof("frame body")
            } else {
                FrameError::Io(e)
            }
        })?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| FrameError::Malformed(format!("invalid JSON body: {e}")))
    }

    async fn skip_body(&mut self, len: usize) -> Result<(), FrameError> {
        let mut limited = (&mut self.reader).take(len as u64);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if skipped < len as u64 {
            return Err(FrameError::eof("oversized frame body"));
        }
        Ok(())
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF before any header
    /// byte. Header lines that carry junk in front of `Content-Length:` (left
    /// over from a previous malformed frame) are resynchronized on the header.
    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<Result<usize, String>> = None;
        let mut raw = Vec::new();
        let mut saw_any_header_bytes = false;

        loop {
            raw.clear();
            let bytes_read = self.reader.read_until(b'\n', &mut raw).await?;

            if bytes_read == 0 {
                // `content_length == None` doesn't imply "no headers read"
                // (e.g. EOF after reading only Content-Type is still an error).
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(FrameError::eof("headers"));
            }

            // Bytes that are not UTF-8 can only be junk; they never hide a
            // valid Content-Length.
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                if saw_any_header_bytes {
                    break;
                }
                // Stray blank line between frames.
                continue;
            }
            saw_any_header_bytes = true;

            // Parse case-insensitively; the header may be preceded by garbage.
            let lower = trimmed.to_ascii_lowercase();
            if let Some(pos) = lower.find(CONTENT_LENGTH) {
                let value = trimmed[pos + CONTENT_LENGTH.len()..].trim();
                content_length = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| format!("invalid Content-Length value {value:?}")),
                );
            }
            // Other headers (e.g. Content-Type) are ignored.
        }

        match content_length {
            Some(Ok(len)) => Ok(Some(len)),
            Some(Err(reason)) => Err(FrameError::Malformed(reason)),
            None => Err(FrameError::Malformed(
                "missing Content-Length header".to_string(),
            )),
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
///
/// Serializes JSON and prepends the `Content-Length` header.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> io::Result<()> {
        let body = serde_json::to_vec(msg).map_err(io::Error::other)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await
    }

    /// Flush and close the underlying writer (closes the child's stdin).
    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
