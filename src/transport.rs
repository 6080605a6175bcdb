//! Opening, accepting and polling the raw stream endpoints the rest of
//! the servent builds framed messages on top of.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;

use crate::error::{Result, ServentError};

/// Outcome of a bounded wait on a socket's readability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
    Hangup,
}

/// Resolves `target` and dials it, retrying up to `attempts` times with
/// `delay` between failures. Address-family agnostic: every candidate
/// `lookup_host` returns is tried before sleeping and moving to the
/// next attempt.
pub async fn connect_with_retry(
    target: impl ToSocketAddrs + Clone,
    attempts: u32,
    delay: Duration,
) -> Result<TcpStream> {
    let mut last_addr: Option<SocketAddr> = None;
    for attempt in 0..attempts {
        let candidates = match tokio::net::lookup_host(target.clone()).await {
            Ok(c) => c,
            Err(_) => {
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        for addr in candidates {
            last_addr = Some(addr);
            if let Ok(stream) = TcpStream::connect(addr).await {
                return Ok(stream);
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(ServentError::Unreachable {
        addr: last_addr.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap()),
        attempts,
    })
}

/// Binds a passive listening endpoint on `port`.
pub async fn create_listening(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServentError::Bind { port, source })
}

/// Waits up to `timeout_dur` for an incoming connection, then accepts
/// exactly one. Returns `None` on timeout.
pub async fn accept_deadline(
    listener: &TcpListener,
    timeout_dur: Duration,
) -> Result<Option<(TcpStream, SocketAddr)>> {
    match timeout(timeout_dur, listener.accept()).await {
        Ok(Ok(pair)) => Ok(Some(pair)),
        Ok(Err(source)) => Err(ServentError::Io {
            addr: "0.0.0.0:0".parse().unwrap(),
            source,
        }),
        Err(_) => Ok(None),
    }
}

/// Waits up to `timeout_dur` for `stream` to become readable, then
/// peeks a single byte to distinguish genuine readiness from a peer
/// that has already closed its write half.
pub async fn poll_readable(stream: &TcpStream, timeout_dur: Duration) -> Readiness {
    match timeout(timeout_dur, stream.readable()).await {
        Err(_) => Readiness::Timeout,
        Ok(Err(_)) => Readiness::Hangup,
        Ok(Ok(())) => {
            let mut probe = [0u8; 1];
            match stream.peek(&mut probe).await {
                Ok(0) => Readiness::Hangup,
                Ok(_) => Readiness::Ready,
                Err(_) => Readiness::Hangup,
            }
        }
    }
}

pub fn peer_endpoint(stream: &TcpStream) -> Result<SocketAddr> {
    stream.peer_addr().map_err(|source| ServentError::Io {
        addr: "0.0.0.0:0".parse().unwrap(),
        source,
    })
}

pub fn local_endpoint(stream: &TcpStream) -> Result<SocketAddr> {
    stream.local_addr().map_err(|source| ServentError::Io {
        addr: "0.0.0.0:0".parse().unwrap(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_deadline_times_out_with_no_connection() {
        let listener = create_listening(0).await.unwrap();
        let result = accept_deadline(&listener, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn connect_with_retry_reaches_a_real_listener() {
        let listener = create_listening(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = connect_with_retry(addr, 3, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(peer_endpoint(&stream).is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_with_retry_fails_against_closed_port() {
        let listener = create_listening(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = connect_with_retry(addr, 2, Duration::from_millis(5)).await;
        assert!(result.is_err());
    }
}
