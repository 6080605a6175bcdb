use std::net::SocketAddr;
use thiserror::Error;

use crate::wire::Opcode;

/// The error taxonomy a servent can produce.
///
/// Every variant maps to one of the buckets described in the error
/// handling design: transport, protocol, local-channel, file-lookup or
/// saturation. Only [`ServentError::LocalHandshake`] and a handful of
/// startup failures are ever allowed to end the process; the rest are
/// handled at the socket that produced them.
#[derive(Debug, Error)]
pub enum ServentError {
    #[error("unreachable: could not connect to {addr} after {attempts} attempts")]
    Unreachable { addr: SocketAddr, attempts: u32 },

    #[error("could not bind listening socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("truncated read from {addr}: expected {expected} bytes, got {got}")]
    Truncated {
        addr: SocketAddr,
        expected: usize,
        got: usize,
    },

    #[error("io error on {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected opcode {opcode:?} from {addr}")]
    UnexpectedOpcode { addr: SocketAddr, opcode: Opcode },

    #[error("length field {len} exceeds remaining capacity {remaining}")]
    LengthOverflow { len: usize, remaining: usize },

    #[error("local handshake failed: {0}")]
    LocalHandshake(String),

    #[error("file lookup failed: {0}")]
    FileLookup(#[from] std::io::Error),

    #[error("overlay saturated: only {have} of {want} neighbours after join attempts")]
    Saturation { have: usize, want: usize },
}

pub type Result<T> = std::result::Result<T, ServentError>;
