//! The `Message` sum type: one variant per opcode, with the encode/decode
//! logic for each payload shape described in the wire protocol tables.

use std::net::SocketAddr;
use tokio::net::TcpStream;

use super::opcode::Opcode;
use super::primitives::*;
use crate::error::{Result, ServentError};

/// A `(ip, contact_port)` pair as it travels on the wire — both fields
/// are length-prefixed ASCII strings, never binary integers, matching
/// every occurrence of a peer address in the protocol tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Holder {
    pub ip: String,
    pub port: String,
}

impl Holder {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
        }
    }

    async fn read(stream: &mut TcpStream, addr: SocketAddr) -> Result<Self> {
        let ip = read_string(stream, addr).await?;
        let port = read_string(stream, addr).await?;
        Ok(Self { ip, port })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_string(buf, LenString::new(self.ip.clone())?.as_str());
        write_string(buf, LenString::new(self.port.clone())?.as_str());
        Ok(())
    }
}

async fn read_holders(stream: &mut TcpStream, addr: SocketAddr) -> Result<Vec<Holder>> {
    let count = read_u8(stream, addr).await? as usize;
    let mut holders = Vec::with_capacity(count);
    for _ in 0..count {
        holders.push(Holder::read(stream, addr).await?);
    }
    Ok(holders)
}

fn write_holders(buf: &mut Vec<u8>, holders: &[Holder]) -> Result<()> {
    if holders.len() > u8::MAX as usize {
        return Err(ServentError::LengthOverflow {
            len: holders.len(),
            remaining: u8::MAX as usize,
        });
    }
    write_u8(buf, holders.len() as u8);
    for h in holders {
        h.write(buf)?;
    }
    Ok(())
}

/// Answer codes carried by `LOCAL_DOWNLOAD_RESULT`/`DOWNLOAD_REPLY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadCode {
    Local = 0,
    RemoteOffline = 1,
    RemoteNotFound = 2,
    RemoteFound = 3,
}

impl DownloadCode {
    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Local,
            1 => Self::RemoteOffline,
            2 => Self::RemoteNotFound,
            3 => Self::RemoteFound,
            _ => {
                return Err(ServentError::LengthOverflow {
                    len: b as usize,
                    remaining: 3,
                });
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    NeighboursRequest,
    NeighboursReply {
        holders: Vec<Holder>,
    },
    Join {
        rescue: bool,
        contact_port: String,
    },
    JoinReply {
        contact_port: Option<String>,
    },
    SearchRequest {
        origin_ip: String,
        origin_port: String,
        filename: String,
        ttl: u8,
        holders: Vec<Holder>,
    },
    SearchReply {
        filename: String,
        holders: Vec<Holder>,
    },
    DownloadRequest {
        filename: String,
    },
    DownloadReply {
        code: DownloadCode,
        ip: String,
        port: String,
        filename: String,
        data: Option<Vec<u8>>,
    },
    Leave,
    LocalHandshakeClient,
    LocalHandshakeServer,
    LocalSearch {
        filename: String,
    },
    LocalDownload {
        ip: String,
        port: String,
        filename: String,
    },
    LocalExit,
    LocalSearchResult {
        filename: String,
        holders: Vec<Holder>,
    },
    LocalDownloadResult {
        ip: String,
        port: String,
        filename: String,
        code: DownloadCode,
    },
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::NeighboursRequest => Opcode::NeighboursRequest,
            Message::NeighboursReply { .. } => Opcode::NeighboursReply,
            Message::Join { .. } => Opcode::Join,
            Message::JoinReply { .. } => Opcode::JoinReply,
            Message::SearchRequest { .. } => Opcode::SearchRequest,
            Message::SearchReply { .. } => Opcode::SearchReply,
            Message::DownloadRequest { .. } => Opcode::DownloadRequest,
            Message::DownloadReply { .. } => Opcode::DownloadReply,
            Message::Leave => Opcode::Leave,
            Message::LocalHandshakeClient => Opcode::LocalHandshakeClient,
            Message::LocalHandshakeServer => Opcode::LocalHandshakeServer,
            Message::LocalSearch { .. } => Opcode::LocalSearch,
            Message::LocalDownload { .. } => Opcode::LocalDownload,
            Message::LocalExit => Opcode::LocalExit,
            Message::LocalSearchResult { .. } => Opcode::LocalSearchResult,
            Message::LocalDownloadResult { .. } => Opcode::LocalDownloadResult,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.opcode().to_byte()];
        match self {
            Message::NeighboursRequest
            | Message::Leave
            | Message::LocalHandshakeClient
            | Message::LocalHandshakeServer
            | Message::LocalExit => {}

            Message::NeighboursReply { holders } => write_holders(&mut buf, holders)?,

            Message::Join {
                rescue,
                contact_port,
            } => {
                write_u8(&mut buf, if *rescue { 1 } else { 0 });
                write_string(&mut buf, LenString::new(contact_port.clone())?.as_str());
            }

            Message::JoinReply { contact_port } => match contact_port {
                Some(port) => {
                    write_u8(&mut buf, 1);
                    write_string(&mut buf, LenString::new(port.clone())?.as_str());
                }
                None => write_u8(&mut buf, 0),
            },

            Message::SearchRequest {
                origin_ip,
                origin_port,
                filename,
                ttl,
                holders,
            } => {
                write_string(&mut buf, LenString::new(origin_ip.clone())?.as_str());
                write_string(&mut buf, LenString::new(origin_port.clone())?.as_str());
                write_string(&mut buf, LenString::new(filename.clone())?.as_str());
                write_u8(&mut buf, *ttl);
                write_holders(&mut buf, holders)?;
            }

            Message::SearchReply { filename, holders } => {
                write_string(&mut buf, LenString::new(filename.clone())?.as_str());
                write_holders(&mut buf, holders)?;
            }

            Message::DownloadRequest { filename } => {
                write_string(&mut buf, LenString::new(filename.clone())?.as_str());
            }

            Message::DownloadReply {
                code,
                ip,
                port,
                filename,
                data,
            } => {
                write_u8(&mut buf, *code as u8);
                match code {
                    DownloadCode::RemoteFound => {
                        write_string(&mut buf, LenString::new(filename.clone())?.as_str());
                        let data = data.as_deref().unwrap_or_default();
                        write_u32_be(&mut buf, data.len() as u32);
                        write_bytes(&mut buf, data);
                    }
                    _ => {
                        write_string(&mut buf, LenString::new(ip.clone())?.as_str());
                        write_string(&mut buf, LenString::new(port.clone())?.as_str());
                        write_string(&mut buf, LenString::new(filename.clone())?.as_str());
                    }
                }
            }

            Message::LocalSearch { filename } => {
                write_string(&mut buf, LenString::new(filename.clone())?.as_str());
            }

            Message::LocalDownload { ip, port, filename } => {
                write_string(&mut buf, LenString::new(ip.clone())?.as_str());
                write_string(&mut buf, LenString::new(port.clone())?.as_str());
                write_string(&mut buf, LenString::new(filename.clone())?.as_str());
            }

            Message::LocalSearchResult { filename, holders } => {
                write_string(&mut buf, LenString::new(filename.clone())?.as_str());
                write_holders(&mut buf, holders)?;
            }

            Message::LocalDownloadResult {
                ip,
                port,
                filename,
                code,
            } => {
                write_string(&mut buf, LenString::new(ip.clone())?.as_str());
                write_string(&mut buf, LenString::new(port.clone())?.as_str());
                write_string(&mut buf, LenString::new(filename.clone())?.as_str());
                write_u8(&mut buf, *code as u8);
            }
        }
        Ok(buf)
    }

    pub async fn write_to(&self, stream: &mut TcpStream, addr: SocketAddr) -> Result<()> {
        let bytes = self.encode()?;
        send(stream, addr, &bytes).await
    }

    /// Reads one full message, having already consumed the opcode byte.
    pub async fn decode(
        opcode: Opcode,
        stream: &mut TcpStream,
        addr: SocketAddr,
    ) -> Result<Self> {
        Ok(match opcode {
            Opcode::NeighboursRequest => Message::NeighboursRequest,
            Opcode::NeighboursReply => Message::NeighboursReply {
                holders: read_holders(stream, addr).await?,
            },
            Opcode::Join => {
                let rescue = read_u8(stream, addr).await? != 0;
                let contact_port = read_string(stream, addr).await?;
                Message::Join {
                    rescue,
                    contact_port,
                }
            }
            Opcode::JoinReply => {
                let answer = read_u8(stream, addr).await?;
                let contact_port = if answer != 0 {
                    Some(read_string(stream, addr).await?)
                } else {
                    None
                };
                Message::JoinReply { contact_port }
            }
            Opcode::SearchRequest => {
                let origin_ip = read_string(stream, addr).await?;
                let origin_port = read_string(stream, addr).await?;
                let filename = read_string(stream, addr).await?;
                let ttl = read_u8(stream, addr).await?;
                let holders = read_holders(stream, addr).await?;
                Message::SearchRequest {
                    origin_ip,
                    origin_port,
                    filename,
                    ttl,
                    holders,
                }
            }
            Opcode::SearchReply => {
                let filename = read_string(stream, addr).await?;
                let holders = read_holders(stream, addr).await?;
                Message::SearchReply { filename, holders }
            }
            Opcode::DownloadRequest => Message::DownloadRequest {
                filename: read_string(stream, addr).await?,
            },
            Opcode::DownloadReply => {
                let code = DownloadCode::from_byte(read_u8(stream, addr).await?)?;
                match code {
                    DownloadCode::RemoteFound => {
                        let filename = read_string(stream, addr).await?;
                        let len = read_u32_be(stream, addr).await? as usize;
                        let data = read_bytes(stream, addr, len).await?;
                        Message::DownloadReply {
                            code,
                            ip: String::new(),
                            port: String::new(),
                            filename,
                            data: Some(data),
                        }
                    }
                    _ => {
                        let ip = read_string(stream, addr).await?;
                        let port = read_string(stream, addr).await?;
                        let filename = read_string(stream, addr).await?;
                        Message::DownloadReply {
                            code,
                            ip,
                            port,
                            filename,
                            data: None,
                        }
                    }
                }
            }
            Opcode::Leave => Message::Leave,
            Opcode::LocalHandshakeClient => Message::LocalHandshakeClient,
            Opcode::LocalHandshakeServer => Message::LocalHandshakeServer,
            Opcode::LocalSearch => Message::LocalSearch {
                filename: read_string(stream, addr).await?,
            },
            Opcode::LocalDownload => {
                let ip = read_string(stream, addr).await?;
                let port = read_string(stream, addr).await?;
                let filename = read_string(stream, addr).await?;
                Message::LocalDownload { ip, port, filename }
            }
            Opcode::LocalExit => Message::LocalExit,
            Opcode::LocalSearchResult => {
                let filename = read_string(stream, addr).await?;
                let holders = read_holders(stream, addr).await?;
                Message::LocalSearchResult { filename, holders }
            }
            Opcode::LocalDownloadResult => {
                let ip = read_string(stream, addr).await?;
                let port = read_string(stream, addr).await?;
                let filename = read_string(stream, addr).await?;
                let code = DownloadCode::from_byte(read_u8(stream, addr).await?)?;
                Message::LocalDownloadResult {
                    ip,
                    port,
                    filename,
                    code,
                }
            }
        })
    }

    /// Reads the opcode byte and dispatches to [`Message::decode`].
    pub async fn read_from(stream: &mut TcpStream, addr: SocketAddr) -> Result<Self> {
        let byte = read_u8(stream, addr).await?;
        let opcode = Opcode::from_byte(byte).ok_or(ServentError::LengthOverflow {
            len: byte as usize,
            remaining: 0,
        })?;
        Self::decode(opcode, stream, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    async fn round_trip(msg: Message) {
        let bytes = msg.encode().unwrap();
        let byte = bytes[0];
        let opcode = Opcode::from_byte(byte).unwrap();
        let mut cursor = std::io::Cursor::new(bytes[1..].to_vec());
        // Message::decode reads from a TcpStream; round-trip instead through
        // a loopback pair so the async read machinery is exercised for real.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_bound = listener.local_addr().unwrap();
        let writer = tokio::net::TcpStream::connect(addr_bound).await.unwrap();
        let (mut reader, _) = listener.accept().await.unwrap();
        let mut writer = writer;
        tokio::io::AsyncWriteExt::write_all(&mut writer, cursor.get_mut())
            .await
            .unwrap();
        drop(writer);
        let decoded = Message::decode(opcode, &mut reader, addr()).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn round_trips_search_request() {
        round_trip(Message::SearchRequest {
            origin_ip: "127.0.0.1".into(),
            origin_port: "10001".into(),
            filename: "x".into(),
            ttl: 9,
            holders: vec![Holder::new("127.0.0.1", "10002")],
        })
        .await;
    }

    #[tokio::test]
    async fn round_trips_download_reply_found() {
        round_trip(Message::DownloadReply {
            code: DownloadCode::RemoteFound,
            ip: String::new(),
            port: String::new(),
            filename: "f".into(),
            data: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        })
        .await;
    }

    #[tokio::test]
    async fn round_trips_join_reply_refused() {
        round_trip(Message::JoinReply {
            contact_port: None,
        })
        .await;
    }

    #[tokio::test]
    async fn round_trips_neighbours_reply_empty() {
        round_trip(Message::NeighboursReply { holders: vec![] }).await;
    }
}
