//! Wire framing for chunk requests and responses

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Literal response sent when the requested chunk is not held.
pub const ERROR_NOT_FOUND: &[u8] = b"ERROR: Chunk not found";

/// Upper bound on the digits of a decimal length header.
const MAX_HEADER_DIGITS: usize = 20;

/// Upper bound on an encoded request body.
const MAX_REQUEST_BYTES: u64 = 4096;

/// Errors that can occur while framing or parsing protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The length line itself is unusable; the connection cannot resync.
    #[error("Malformed frame header: {reason}")]
    MalformedHeader { reason: String },

    /// The frame was read whole but its body is not a valid request.
    #[error("Malformed request body: {reason}")]
    MalformedRequest { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// A request for one chunk by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub chunk: String,
}

/// First bytes of a chunk response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseHeader {
    /// Declared body size in bytes; exactly this many raw bytes follow
    Size(u64),
    /// The peer does not hold the chunk
    NotFound,
}

/// Writes a framed chunk request.
///
/// # Errors
/// - `ProtocolError::Io` - Write failed
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    chunk_name: &str,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(&ChunkRequest {
        chunk: chunk_name.to_string(),
    })
    .expect("chunk request serializes to JSON");

    writer
        .write_all(format!("{}\n", body.len()).as_bytes())
        .await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed chunk request.
///
/// Returns `Ok(None)` when the client closed the connection cleanly before
/// a new frame began.
///
/// # Errors
/// - `ProtocolError::MalformedHeader` - Length line unusable; caller should
///   drop the connection
/// - `ProtocolError::MalformedRequest` - Frame consumed but the body is not
///   a valid request; caller may await the next frame
/// - `ProtocolError::Io` - Read failed or the stream ended mid-frame
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<ChunkRequest>, ProtocolError> {
    let length = match read_length_line(reader).await? {
        Some(length) => length,
        None => return Ok(None),
    };
    if length > MAX_REQUEST_BYTES {
        return Err(ProtocolError::MalformedHeader {
            reason: format!("request frame of {length} bytes exceeds limit"),
        });
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| ProtocolError::MalformedRequest {
            reason: e.to_string(),
        })
}

/// Writes the not-found response token.
///
/// # Errors
/// - `ProtocolError::Io` - Write failed
pub async fn write_not_found<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProtocolError> {
    writer.write_all(ERROR_NOT_FOUND).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes the size header that precedes a chunk body.
///
/// # Errors
/// - `ProtocolError::Io` - Write failed
pub async fn write_size_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    size: u64,
) -> Result<(), ProtocolError> {
    writer.write_all(format!("{size}\n").as_bytes()).await?;
    Ok(())
}

/// Reads a response header: either a size line or the not-found token.
///
/// # Errors
/// - `ProtocolError::MalformedHeader` - Neither a size line nor the token
/// - `ProtocolError::Io` - Read failed or the stream ended early
pub async fn read_response_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ResponseHeader, ProtocolError> {
    let first = read_byte(reader)
        .await?
        .ok_or_else(|| ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()))?;

    // The error token is the only response that does not start with a digit.
    if first == ERROR_NOT_FOUND[0] {
        let mut rest = vec![0u8; ERROR_NOT_FOUND.len() - 1];
        reader.read_exact(&mut rest).await?;
        if rest == &ERROR_NOT_FOUND[1..] {
            return Ok(ResponseHeader::NotFound);
        }
        return Err(ProtocolError::MalformedHeader {
            reason: "unrecognized error token".to_string(),
        });
    }

    let mut digits = vec![first];
    loop {
        let byte = read_byte(reader)
            .await?
            .ok_or_else(|| ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
        if byte == b'\n' {
            break;
        }
        digits.push(byte);
        if digits.len() > MAX_HEADER_DIGITS {
            return Err(ProtocolError::MalformedHeader {
                reason: "size header too long".to_string(),
            });
        }
    }

    let size = std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ProtocolError::MalformedHeader {
            reason: format!("unparsable size header: {:?}", digits),
        })?;
    Ok(ResponseHeader::Size(size))
}

/// Reads a decimal length line; `None` on clean EOF before the first byte.
async fn read_length_line<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<u64>, ProtocolError> {
    let mut digits = Vec::new();
    loop {
        let byte = match read_byte(reader).await? {
            Some(byte) => byte,
            None if digits.is_empty() => return Ok(None),
            None => return Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into())),
        };
        if byte == b'\n' {
            break;
        }
        digits.push(byte);
        if digits.len() > MAX_HEADER_DIGITS {
            return Err(ProtocolError::MalformedHeader {
                reason: "length line too long".to_string(),
            });
        }
    }

    std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| ProtocolError::MalformedHeader {
            reason: format!("unparsable length line: {:?}", digits),
        })
}

/// Reads one byte; `None` on EOF.
async fn read_byte<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u8>, std::io::Error> {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte).await? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_round_trip() {
        let mut wire = Vec::new();
        write_request(&mut wire, "movie_3.mp4").await.unwrap();

        let request = read_request(&mut wire.as_slice()).await.unwrap().unwrap();
        assert_eq!(request.chunk, "movie_3.mp4");
    }

    #[tokio::test]
    async fn test_two_requests_frame_cleanly() {
        // The length prefix is what lets back-to-back frames in one buffer
        // be separated, which accumulate-until-parses framing could not do.
        let mut wire = Vec::new();
        write_request(&mut wire, "f_1").await.unwrap();
        write_request(&mut wire, "f_2").await.unwrap();

        let mut reader = wire.as_slice();
        assert_eq!(read_request(&mut reader).await.unwrap().unwrap().chunk, "f_1");
        assert_eq!(read_request(&mut reader).await.unwrap().unwrap().chunk, "f_2");
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let request = read_request(&mut (&[] as &[u8])).await.unwrap();
        assert!(request.is_none());
    }

    #[tokio::test]
    async fn test_bad_body_is_recoverable_malformed_request() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"14\n{\"wrong\": \"x\"}");
        write_request(&mut wire, "f_1").await.unwrap();

        let mut reader = wire.as_slice();
        assert!(matches!(
            read_request(&mut reader).await,
            Err(ProtocolError::MalformedRequest { .. })
        ));
        // The frame was consumed whole, so the next request still parses.
        assert_eq!(read_request(&mut reader).await.unwrap().unwrap().chunk, "f_1");
    }

    #[tokio::test]
    async fn test_garbage_length_line_is_fatal() {
        let mut reader: &[u8] = b"not-a-number\n{}";
        assert!(matches!(
            read_request(&mut reader).await,
            Err(ProtocolError::MalformedHeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_response_header_size() {
        let mut reader: &[u8] = b"102400\n";
        assert_eq!(
            read_response_header(&mut reader).await.unwrap(),
            ResponseHeader::Size(102_400)
        );
    }

    #[tokio::test]
    async fn test_response_header_not_found_token() {
        let mut reader: &[u8] = ERROR_NOT_FOUND;
        assert_eq!(
            read_response_header(&mut reader).await.unwrap(),
            ResponseHeader::NotFound
        );
    }

    #[tokio::test]
    async fn test_truncated_response_is_an_error() {
        let mut reader: &[u8] = b"123";
        assert!(read_response_header(&mut reader).await.is_err());
    }
}
