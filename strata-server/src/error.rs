//! Server-side error taxonomy.
//!
//! Two classes matter at the dispatch boundary: errors that earn the
//! client an error reply (it asked for something impossible), and
//! protocol violations that drop the connection (it sent something no
//! correct client sends).

use strata_channel::ChannelError;
use strata_registry::RegistryError;
use strata_shm::ShmError;
use strata_wire::{ERR_INVARG, ERR_IO};

/// Everything that can go wrong while serving a client.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Transport failure on the client's connection.
    #[error("transport: {0}")]
    Channel(#[from] ChannelError),
    /// Shared-memory failure while building a region or surface.
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
    /// Registry operation failure.
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    /// The client broke the protocol; the connection is dropped.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// A well-formed request the server refuses.
    #[error("{0}")]
    Refused(&'static str),
}

impl ServerError {
    /// Wire code carried in an error reply.
    pub fn wire_code(&self) -> i32 {
        match self {
            ServerError::Channel(err) => err.wire_code(),
            ServerError::Shm(_) => ERR_IO,
            ServerError::Registry(err) => err.wire_code(),
            ServerError::Protocol(_) | ServerError::Refused(_) => ERR_INVARG,
        }
    }

    /// Whether the client that caused this must be disconnected rather
    /// than sent an error reply.
    pub fn drops_client(&self) -> bool {
        matches!(self, ServerError::Channel(_) | ServerError::Protocol(_))
    }
}
