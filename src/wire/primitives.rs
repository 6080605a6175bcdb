//! Field-level read/write helpers shared by every packet's codec.
//!
//! Two conventions cover the whole wire format: a length-prefixed
//! string (one length byte, then that many bytes, no terminator) and a
//! handful of fixed-width integers, always written big-endian.

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, ServentError};

async fn read_exact_or_truncated(
    stream: &mut TcpStream,
    addr: SocketAddr,
    buf: &mut [u8],
) -> Result<()> {
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|source| match source.kind() {
            std::io::ErrorKind::UnexpectedEof => ServentError::Truncated {
                addr,
                expected: buf.len(),
                got: 0,
            },
            _ => ServentError::Io { addr, source },
        })
}

pub async fn read_u8(stream: &mut TcpStream, addr: SocketAddr) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact_or_truncated(stream, addr, &mut buf).await?;
    Ok(buf[0])
}

pub async fn read_u32_be(stream: &mut TcpStream, addr: SocketAddr) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_or_truncated(stream, addr, &mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Reads a length-prefixed string: one length byte followed by that
/// many bytes of (not necessarily valid UTF-8, but in practice always
/// ASCII) payload.
pub async fn read_string(stream: &mut TcpStream, addr: SocketAddr) -> Result<String> {
    let len = read_u8(stream, addr).await? as usize;
    let mut buf = vec![0u8; len];
    read_exact_or_truncated(stream, addr, &mut buf).await?;
    String::from_utf8(buf).map_err(|_| ServentError::Truncated {
        addr,
        expected: len,
        got: 0,
    })
}

pub async fn read_bytes(stream: &mut TcpStream, addr: SocketAddr, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact_or_truncated(stream, addr, &mut buf).await?;
    Ok(buf)
}

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn write_u32_be(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Writes a length-prefixed string. Callers are responsible for
/// ensuring `s.len() <= 255`; this is enforced by [`crate::wire::LenString`].
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u8::MAX as usize);
    write_u8(buf, s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
}

pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
}

pub async fn send(stream: &mut TcpStream, addr: SocketAddr, bytes: &[u8]) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|source| ServentError::Io { addr, source })
}

/// A string field whose length must fit in a single length-prefix byte.
///
/// Most of the wire format's strings are IPs, ports and filenames,
/// none of which plausibly exceed 255 bytes; this wrapper makes the
/// constraint a type-level fact instead of a debug assertion sprinkled
/// at every call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LenString(String);

impl LenString {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.len() > u8::MAX as usize {
            return Err(ServentError::LengthOverflow {
                len: s.len(),
                remaining: u8::MAX as usize,
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for LenString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_string_rejects_oversize() {
        let big = "x".repeat(256);
        assert!(LenString::new(big).is_err());
    }

    #[test]
    fn len_string_accepts_max() {
        let max = "x".repeat(255);
        assert!(LenString::new(max).is_ok());
    }
}
