//! The local control channel: the framed duplex connection to the
//! (out of scope) interactive front-end, including its startup
//! handshake.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::error::{Result, ServentError};
use crate::router::Request;
use crate::wire::{DownloadCode, Holder, Message};

/// Whether an inbound connection's source address should be treated
/// as the local front-end rather than an overlay peer.
pub fn is_local_source(addr: SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// Result of completing the local handshake's second half on a
/// connection that has already sent `LOCAL_HANDSHAKE_CLIENT`.
pub enum HandshakeOutcome {
    /// Handshake completed; this stream is now the local channel.
    Completed(TcpStream),
    /// Not a loopback connection. The control channel is restricted to
    /// the local machine regardless of what it sends.
    RejectedNonLocal,
    /// A handshake flag was already set; the new connection is
    /// rejected but the existing channel is left untouched.
    RejectedDuplicate,
    /// Replying to the handshake failed outright. This is fatal per
    /// the error handling design.
    Fatal(String),
}

/// Completes the handshake's second half on `stream`, which has already
/// sent `LOCAL_HANDSHAKE_CLIENT` as classified by the caller from the
/// opening message's opcode — both a local attach attempt and overlay
/// traffic land on the same listening socket, so only the opcode, not
/// the source address, decides which path a connection takes. Source
/// address is checked here only to enforce that the local channel
/// itself stays loopback-only.
pub async fn complete_handshake(
    mut stream: TcpStream,
    addr: SocketAddr,
    already_handshaked: bool,
) -> HandshakeOutcome {
    if !is_local_source(addr) {
        return HandshakeOutcome::RejectedNonLocal;
    }
    if already_handshaked {
        return HandshakeOutcome::RejectedDuplicate;
    }
    if Message::LocalHandshakeServer
        .write_to(&mut stream, addr)
        .await
        .is_err()
    {
        return HandshakeOutcome::Fatal("failed to reply to local handshake".into());
    }
    HandshakeOutcome::Completed(stream)
}

/// Outcome of polling the local channel for one opcode (servent loop
/// step 6): either nothing arrived, the front-end asked to exit, or a
/// search/download request was queued.
pub enum LocalPoll {
    Idle,
    Exit,
    Queued(Request),
}

/// Reads and classifies one opcode from the local channel, assuming
/// the caller has already confirmed readiness via
/// [`transport::poll_readable`].
pub async fn read_local_request(stream: &mut TcpStream, addr: SocketAddr) -> Result<LocalPoll> {
    match Message::read_from(stream, addr).await? {
        Message::LocalExit => Ok(LocalPoll::Exit),
        Message::LocalSearch { filename } => Ok(LocalPoll::Queued(Request::SearchLocal {
            name: filename,
        })),
        Message::LocalDownload { ip, port, filename } => {
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| ServentError::UnexpectedOpcode {
                    addr,
                    opcode: crate::wire::Opcode::LocalDownload,
                })?;
            let port: u16 = port
                .parse()
                .map_err(|_| ServentError::UnexpectedOpcode {
                    addr,
                    opcode: crate::wire::Opcode::LocalDownload,
                })?;
            Ok(LocalPoll::Queued(Request::DownloadLocal {
                ip,
                port,
                filename,
            }))
        }
        other => Err(ServentError::UnexpectedOpcode {
            addr,
            opcode: other.opcode(),
        }),
    }
}

pub async fn reply_search_result(
    stream: &mut TcpStream,
    addr: SocketAddr,
    filename: String,
    holders: Vec<Holder>,
) -> Result<()> {
    Message::LocalSearchResult { filename, holders }
        .write_to(stream, addr)
        .await
}

pub async fn reply_download_result(
    stream: &mut TcpStream,
    addr: SocketAddr,
    ip: IpAddr,
    port: u16,
    filename: String,
    code: DownloadCode,
) -> Result<()> {
    Message::LocalDownloadResult {
        ip: ip.to_string(),
        port: port.to_string(),
        filename,
        code,
    }
    .write_to(stream, addr)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_source_is_local() {
        assert!(is_local_source("127.0.0.1:9".parse().unwrap()));
        assert!(!is_local_source("10.0.0.1:9".parse().unwrap()));
    }
}
