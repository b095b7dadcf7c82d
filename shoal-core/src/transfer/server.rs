//! Chunk server: serves locally held chunks over persistent connections

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::protocol::{self, ProtocolError};
use super::TransferError;
use crate::storage::ChunkStore;
use crate::task::{BackgroundTask, shutdown_channel};

/// Block size for streaming chunk bytes to a client.
const SEND_BLOCK_SIZE: usize = 4096;

/// Serves chunk files to downloading peers.
///
/// Each accepted connection gets its own handler task, so accepting never
/// blocks on serving. A handler loops reading framed requests and streaming
/// responses until the client closes or stays idle past the timeout.
pub struct ChunkServer {
    store: ChunkStore,
    bind_addr: IpAddr,
    peer_port: u16,
    idle_timeout: Duration,
}

/// A started chunk server: its bound address plus the accept-loop handle.
pub struct RunningServer {
    task: BackgroundTask,
    local_addr: SocketAddr,
}

impl RunningServer {
    /// Returns the address the server actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the accept loop. In-flight handlers finish on their own.
    pub async fn stop(self) {
        self.task.stop().await;
    }
}

impl ChunkServer {
    pub fn new(
        store: ChunkStore,
        bind_addr: IpAddr,
        peer_port: u16,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bind_addr,
            peer_port,
            idle_timeout,
        }
    }

    /// Binds the peer port and spawns the accept loop.
    ///
    /// # Errors
    /// - `TransferError::Bind` - The TCP port is unavailable
    pub async fn start(self) -> Result<RunningServer, TransferError> {
        let listener = TcpListener::bind((self.bind_addr, self.peer_port))
            .await
            .map_err(|source| TransferError::Bind {
                port: self.peer_port,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("Chunk server listening on {local_addr}");

        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                info!("New connection from {addr}");
                                let store = self.store.clone();
                                let idle_timeout = self.idle_timeout;
                                tokio::spawn(async move {
                                    handle_client(stream, addr, store, idle_timeout).await;
                                });
                            }
                            Err(e) => error!("Error accepting connection: {e}"),
                        }
                    }
                }
            }
        });

        Ok(RunningServer {
            task: BackgroundTask::new(shutdown_tx, handle),
            local_addr,
        })
    }
}

/// Serves one client connection until close or idle timeout.
async fn handle_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    store: ChunkStore,
    idle_timeout: Duration,
) {
    loop {
        let request = match tokio::time::timeout(idle_timeout, protocol::read_request(&mut stream))
            .await
        {
            Err(_) => {
                info!("Closing idle connection from {addr}");
                break;
            }
            Ok(Ok(None)) => {
                debug!("Client {addr} closed connection");
                break;
            }
            Ok(Ok(Some(request))) => request,
            Ok(Err(ProtocolError::MalformedRequest { reason })) => {
                // The frame was consumed whole; keep awaiting the next one.
                warn!("Malformed request from {addr}: {reason}");
                continue;
            }
            Ok(Err(e)) => {
                warn!("Dropping connection from {addr}: {e}");
                break;
            }
        };

        if let Err(e) = serve_chunk(&mut stream, &store, &request.chunk).await {
            warn!("Error sending chunk {} to {addr}: {e}", request.chunk);
            break;
        }
    }
}

/// Streams one chunk, or the not-found token, to the client.
async fn serve_chunk(
    stream: &mut TcpStream,
    store: &ChunkStore,
    chunk_name: &str,
) -> Result<(), TransferError> {
    info!("Received request for chunk: {chunk_name}");

    // Chunk names are bare file names; anything path-like is refused.
    let traversal = chunk_name.contains('/') || chunk_name.contains('\\');
    if traversal || !store.has_chunk(chunk_name).await {
        warn!("Chunk not found: {chunk_name}");
        protocol::write_not_found(stream).await?;
        return Ok(());
    }

    let path = store.chunk_path(chunk_name);
    let mut file = tokio::fs::File::open(&path).await?;
    let size = file.metadata().await?.len();

    protocol::write_size_header(stream, size).await?;
    let mut buffer = [0u8; SEND_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        stream.write_all(&buffer[..read]).await?;
    }
    stream.flush().await?;

    info!("Finished sending chunk {chunk_name} ({size} bytes)");
    Ok(())
}
