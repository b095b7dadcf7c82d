//! Chunk transfer between a chunk server and a downloading peer
//!
//! Requests and responses share one framing scheme: an ASCII decimal byte
//! count terminated by a newline, followed by exactly that many bytes. A
//! request body is a small JSON document naming the chunk; a response body
//! is the raw chunk bytes, or the literal `ERROR: Chunk not found` token in
//! place of the whole response.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{FetchError, fetch_chunk};
pub use protocol::{ChunkRequest, ProtocolError, ResponseHeader};
pub use server::ChunkServer;

/// Errors that can occur while running the chunk server.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Failed to bind chunk server on port {port}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("Protocol error")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
