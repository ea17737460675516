//! Error types for the relay.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening socket could not be bound. Fatal for the server.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A single `accept()` failed. The accept loop logs it and keeps going.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The broadcaster's dispatch loop has stopped and no longer takes messages.
    #[error("broadcast dispatcher is no longer running")]
    DispatcherClosed,
}
