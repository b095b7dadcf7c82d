//! Downloading side of one chunk exchange

use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::protocol::{self, ProtocolError, ResponseHeader};

/// Receive block size while streaming a chunk body.
const RECV_BLOCK_SIZE: usize = 4096;

/// Outcome of one per-peer fetch attempt.
///
/// The retry loop branches on this instead of catching exceptions: transport
/// and protocol failures poison the connection, integrity and not-found
/// failures only disqualify this peer for this chunk.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Peer does not hold the chunk")]
    NotFound,

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Integrity failure: {reason}")]
    Integrity { reason: String },

    #[error("Failed to write received bytes")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether the connection state is suspect and should be evicted.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            FetchError::Transport { .. } | FetchError::Protocol { .. }
        )
    }
}

/// Fetches one chunk over an already-acquired connection.
///
/// Sends the framed request, then streams the declared number of body bytes
/// into `temp_path` while hashing them. Succeeds only when the byte count
/// matches the declared size and the hash matches `expected_checksum`; the
/// caller renames the temp file into the store on success and discards it
/// on any error.
///
/// # Errors
/// - `FetchError::Transport` - Send/receive failed, timed out, or the
///   stream ended before the declared size
/// - `FetchError::NotFound` - Peer answered with the not-found token
/// - `FetchError::Protocol` - Response header unparsable
/// - `FetchError::Integrity` - Checksum mismatch
/// - `FetchError::Io` - Local temp file write failed
pub async fn fetch_chunk(
    stream: &mut TcpStream,
    chunk_name: &str,
    expected_checksum: &str,
    temp_path: &Path,
    exchange_timeout: Duration,
) -> Result<(), FetchError> {
    bounded(exchange_timeout, protocol::write_request(stream, chunk_name)).await?;

    let declared = match bounded(exchange_timeout, protocol::read_response_header(stream)).await? {
        ResponseHeader::NotFound => return Err(FetchError::NotFound),
        ResponseHeader::Size(size) => size,
    };
    debug!("Expected chunk size: {declared} bytes");

    let mut file = tokio::fs::File::create(temp_path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; RECV_BLOCK_SIZE];
    let mut received = 0u64;

    while received < declared {
        let want = ((declared - received) as usize).min(RECV_BLOCK_SIZE);
        let read = match tokio::time::timeout(exchange_timeout, stream.read(&mut buffer[..want]))
            .await
        {
            Err(_) => {
                return Err(FetchError::Transport {
                    reason: "receive timed out".to_string(),
                });
            }
            Ok(Err(e)) => {
                return Err(FetchError::Transport {
                    reason: e.to_string(),
                });
            }
            Ok(Ok(0)) => {
                return Err(FetchError::Transport {
                    reason: format!("connection closed after {received} of {declared} bytes"),
                });
            }
            Ok(Ok(read)) => read,
        };

        file.write_all(&buffer[..read]).await?;
        hasher.update(&buffer[..read]);
        received += read as u64;
    }
    file.flush().await?;

    let computed = hex::encode(hasher.finalize());
    if computed != expected_checksum {
        return Err(FetchError::Integrity {
            reason: format!("checksum mismatch: expected {expected_checksum}, got {computed}"),
        });
    }

    Ok(())
}

/// Runs a protocol step under the exchange timeout, mapping failures to
/// fetch outcomes.
async fn bounded<T>(
    timeout: Duration,
    step: impl Future<Output = Result<T, ProtocolError>>,
) -> Result<T, FetchError> {
    match tokio::time::timeout(timeout, step).await {
        Err(_) => Err(FetchError::Transport {
            reason: "exchange timed out".to_string(),
        }),
        Ok(Err(ProtocolError::Io(e))) => Err(FetchError::Transport {
            reason: e.to_string(),
        }),
        Ok(Err(e)) => Err(FetchError::Protocol {
            reason: e.to_string(),
        }),
        Ok(Ok(value)) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    fn checksum_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Serves one scripted response to the first connection, ignoring the
    /// request bytes.
    async fn scripted_peer(response: Vec<u8>) -> std::net::SocketAddr {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 256];
            let _ = stream.read(&mut sink).await;
            stream.write_all(&response).await.unwrap();
        });
        addr
    }

    async fn attempt(
        response: Vec<u8>,
        expected_checksum: &str,
        temp_path: &Path,
    ) -> Result<(), FetchError> {
        let addr = scripted_peer(response).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        fetch_chunk(
            &mut stream,
            "f_1",
            expected_checksum,
            temp_path,
            Duration::from_secs(2),
        )
        .await
    }

    #[tokio::test]
    async fn test_fetch_accepts_matching_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_f_1");
        let body = b"hello chunk".to_vec();
        let response = [format!("{}\n", body.len()).into_bytes(), body.clone()].concat();

        attempt(response, &checksum_of(&body), &temp).await.unwrap();

        assert_eq!(std::fs::read(&temp).unwrap(), body);
    }

    #[tokio::test]
    async fn test_fetch_rejects_single_bit_flip() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_f_1");
        let good = b"hello chunk".to_vec();
        let mut flipped = good.clone();
        flipped[4] ^= 0x01;
        let response = [format!("{}\n", flipped.len()).into_bytes(), flipped].concat();

        let result = attempt(response, &checksum_of(&good), &temp).await;

        assert!(matches!(result, Err(FetchError::Integrity { .. })));
        assert!(!result.unwrap_err().poisons_connection());
    }

    #[tokio::test]
    async fn test_fetch_rejects_truncated_body() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_f_1");
        // Declares 100 bytes but sends 5, then closes.
        let response = b"100\nhello".to_vec();

        let result = attempt(response, &checksum_of(b"hello"), &temp).await;

        assert!(matches!(result, Err(FetchError::Transport { .. })));
        assert!(result.unwrap_err().poisons_connection());
    }

    #[tokio::test]
    async fn test_fetch_maps_not_found_token() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_f_1");

        let result = attempt(b"ERROR: Chunk not found".to_vec(), "irrelevant", &temp).await;

        assert!(matches!(result, Err(FetchError::NotFound)));
    }

    #[tokio::test]
    async fn test_fetch_flags_garbage_header_as_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp_f_1");

        let result = attempt(b"!!!garbage!!!\n".to_vec(), "irrelevant", &temp).await;

        assert!(matches!(result, Err(FetchError::Protocol { .. })));
    }
}
