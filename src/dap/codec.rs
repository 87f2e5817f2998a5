//! DAP wire protocol codec
//!
//! The DAP protocol uses HTTP-style headers followed by JSON body:
//! ```text
//! Content-Length: <byte-length>\r\n
//! \r\n
//! <JSON body>
//! ```

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::Error;

/// Upper bound for a single frame body (100 MB)
const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Read a DAP message from the stream
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
/// A frame whose headers or body are unusable but fully consumed yields
/// [`Error::AdapterProtocol`]; the stream stays aligned and the caller may keep
/// reading. Truncated frames and I/O failures yield [`Error::Io`].
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>, Error> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            if saw_header {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside frame headers",
                )));
            }
            return Ok(None);
        }

        // Empty line (just \r\n) signals end of headers
        if line == "\r\n" || line == "\n" {
            if saw_header {
                break;
            }
            // Stray blank line between frames
            continue;
        }
        saw_header = true;

        let line = line.trim();
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = Some(value.trim().parse().map_err(|_| {
                // The body length is unknown, so it cannot be skipped
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid Content-Length: {}", value.trim()),
                ))
            })?);
        }
        // Ignore other headers (like Content-Type)
    }

    let len = content_length
        .ok_or_else(|| Error::AdapterProtocol("Missing Content-Length header".to_string()))?;

    if len > MAX_FRAME_LEN {
        // The body cannot be skipped safely, so the stream is unusable
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Content-Length too large: {} bytes", len),
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    String::from_utf8(body)
        .map(Some)
        .map_err(|e| Error::AdapterProtocol(format!("Invalid UTF-8: {}", e)))
}

/// Write a DAP message to the stream
///
/// Adds the Content-Length header and writes the JSON body
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<(), Error> {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}
