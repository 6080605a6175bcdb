//! The download engine: point-to-point file transfer, bypassing the
//! flood mesh entirely once a holder's address is known.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::Result;
use crate::transport;
use crate::wire::{DownloadCode, Message};

const DOWNLOAD_CONNECT_ATTEMPTS: u32 = 1;
const DOWNLOAD_CONNECT_DELAY: Duration = Duration::from_millis(200);

/// An outbound download socket awaiting its `DOWNLOAD_REPLY`.
pub struct PendingDownload {
    pub stream: TcpStream,
    pub ip: IpAddr,
    pub port: u16,
    pub filename: String,
}

/// Result of attempting to start a user-initiated download (4.6).
pub enum DownloadStart {
    /// The file was already present locally; no overlay traffic sent.
    Local,
    /// The holder could not be reached at all.
    RemoteOffline,
    /// A `DOWNLOAD_REQUEST` was sent and the socket is now pending.
    Pending(PendingDownload),
}

/// Handles `LOCAL_DOWNLOAD{ip, port, filename}`. `held_locally` must
/// already reflect whether `filename` exists in our own share
/// directory (the lookup itself is async and runs before this call).
pub async fn start_download(
    ip: IpAddr,
    port: u16,
    filename: String,
    held_locally: bool,
) -> DownloadStart {
    if held_locally {
        return DownloadStart::Local;
    }

    let target: SocketAddr = (ip, port).into();
    let mut stream =
        match transport::connect_with_retry(target, DOWNLOAD_CONNECT_ATTEMPTS, DOWNLOAD_CONNECT_DELAY).await {
            Ok(stream) => stream,
            Err(_) => return DownloadStart::RemoteOffline,
        };

    let addr = match transport::peer_endpoint(&stream) {
        Ok(addr) => addr,
        Err(_) => return DownloadStart::RemoteOffline,
    };

    let request = Message::DownloadRequest {
        filename: filename.clone(),
    };
    if request.write_to(&mut stream, addr).await.is_err() {
        return DownloadStart::RemoteOffline;
    }

    DownloadStart::Pending(PendingDownload {
        stream,
        ip,
        port,
        filename,
    })
}

/// Handles an inbound `DOWNLOAD_REQUEST{filename}` arriving on a
/// neighbour or awaiting socket (source-side service). `held_locally`
/// and, if true, the file's contents must already be resolved by the
/// caller.
pub async fn serve_download(
    mut socket: TcpStream,
    filename: String,
    self_ip: IpAddr,
    self_contact_port: u16,
    data: Option<Vec<u8>>,
) -> Result<()> {
    let addr = transport::peer_endpoint(&socket)?;
    let reply = match data {
        Some(bytes) => Message::DownloadReply {
            code: DownloadCode::RemoteFound,
            ip: String::new(),
            port: String::new(),
            filename,
            data: Some(bytes),
        },
        None => Message::DownloadReply {
            code: DownloadCode::RemoteNotFound,
            ip: self_ip.to_string(),
            port: self_contact_port.to_string(),
            filename,
            data: None,
        },
    };
    reply.write_to(&mut socket, addr).await
}

/// Outcome of polling a pending download for completion (4.6 receiver
/// completion step).
pub enum ReceiveOutcome {
    NotYet,
    Found { filename: String, data: Vec<u8> },
    NotFound { filename: String },
    ProtocolError,
}

/// Reads one `DOWNLOAD_REPLY` from a pending download, assuming the
/// caller has already established (via [`transport::poll_readable`])
/// that the socket is ready.
pub async fn complete_pending(pending: &mut PendingDownload) -> ReceiveOutcome {
    let addr = match transport::peer_endpoint(&pending.stream) {
        Ok(addr) => addr,
        Err(_) => return ReceiveOutcome::ProtocolError,
    };
    match Message::read_from(&mut pending.stream, addr).await {
        Ok(Message::DownloadReply {
            code: DownloadCode::RemoteFound,
            filename,
            data: Some(data),
            ..
        }) => ReceiveOutcome::Found { filename, data },
        Ok(Message::DownloadReply {
            code: DownloadCode::RemoteNotFound,
            filename,
            ..
        }) => ReceiveOutcome::NotFound { filename },
        _ => ReceiveOutcome::ProtocolError,
    }
}

/// Writes downloaded bytes to `share_dir/filename`, rejecting any path
/// component other than a bare file name (closes the path-traversal
/// hole the source's direct concatenation left open).
pub async fn save_download(share_dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf> {
    let name = Path::new(filename)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(filename));
    let dest = share_dir.join(name);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(&dest, data).await?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_download_sanitizes_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let dest = save_download(dir.path(), "../../etc/passwd", b"x")
            .await
            .unwrap();
        assert_eq!(dest, dir.path().join("passwd"));
    }

    #[tokio::test]
    async fn save_download_writes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = save_download(dir.path(), "f", &[0xDE, 0xAD, 0xBE, 0xEF])
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(dest).await.unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
