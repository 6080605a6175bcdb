//! The servent's own tick loop: accepting new connections, polling
//! every open socket for readiness, routing whatever arrives, and
//! aging the search log — all on one thread, one pass at a time.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::download::{self, DownloadStart, PendingDownload, ReceiveOutcome};
use crate::error::Result;
use crate::local::{self, LocalPoll};
use crate::lookup;
use crate::neighbours::NeighbourManager;
use crate::router::{self, Request, SearchLog, SearchOutcome};
use crate::transport::{self, Readiness};
use crate::wire::{DownloadCode, Holder, Message};

const ACCEPT_TIMEOUT: Duration = Duration::from_millis(100);
const AWAIT_TIMEOUT: Duration = Duration::from_millis(10);
const LOOP_MIN_DURATION: Duration = Duration::from_millis(50);
const DEBUG_DUMP_INTERVAL: Duration = Duration::from_secs(10);

/// Everything one servent process owns: its listening endpoint, its
/// local control channel, the neighbour mesh, and the in-flight work
/// a tick produced but hasn't dispatched yet.
pub struct Servent {
    listener: TcpListener,
    local: Option<TcpStream>,
    local_addr: Option<SocketAddr>,
    local_handshaked: bool,
    neighbours: NeighbourManager,
    /// Accepted-but-not-yet-classified connections: neither the local
    /// channel nor an established neighbour until their opening opcode
    /// is read. Polled with a bounded timeout each tick rather than
    /// read eagerly, so a slow or silent peer can never stall every
    /// other source of work.
    awaiting: Vec<(TcpStream, SocketAddr)>,
    search_log: SearchLog,
    pending_downloads: Vec<PendingDownload>,
    queue: VecDeque<Request>,
    share_dir: PathBuf,
    rng: StdRng,
    running: bool,
    last_dump: Instant,
}

impl Servent {
    /// Binds the listening socket and, for a `--contact` servent, runs
    /// the join sequence before the tick loop starts.
    pub async fn bootstrap(config: &Config) -> Result<Self> {
        let listener = transport::create_listening(config.listen_port).await?;
        let mut neighbours = NeighbourManager::new(config.listen_port);

        if let Some(seed) = config.contact {
            neighbours.bootstrap(seed).await?;
            if neighbours.set.is_empty() {
                warn!("join sequence produced no neighbours; continuing alone");
            }
        }

        Ok(Self {
            listener,
            local: None,
            local_addr: None,
            local_handshaked: false,
            neighbours,
            awaiting: Vec::new(),
            search_log: SearchLog::new(),
            pending_downloads: Vec::new(),
            queue: VecDeque::new(),
            share_dir: config.share_dir.clone(),
            rng: StdRng::from_entropy(),
            running: true,
            last_dump: Instant::now(),
        })
    }

    fn self_ip(&self) -> IpAddr {
        self.neighbours
            .self_ip
            .unwrap_or_else(|| "127.0.0.1".parse().unwrap())
    }

    fn contact_port(&self) -> u16 {
        self.neighbours.listen_port
    }

    /// Runs until a `LOCAL_EXIT` is received or the overlay is lost
    /// with no way back in.
    pub async fn run(&mut self) -> Result<()> {
        while self.running {
            let tick_start = Instant::now();
            self.accept_tick().await?;
            self.awaiting_tick().await;
            self.dump_neighbours_periodically();
            self.neighbour_tick().await;
            self.download_tick().await;
            self.local_tick().await;
            self.dispatch_tick().await;
            let elapsed = tick_start.elapsed();
            self.search_log.age(elapsed);
            if elapsed < LOOP_MIN_DURATION {
                tokio::time::sleep(LOOP_MIN_DURATION - elapsed).await;
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn accept_tick(&mut self) -> Result<()> {
        tokio::select! {
            accepted = transport::accept_deadline(&self.listener, ACCEPT_TIMEOUT) => {
                if let Some((stream, addr)) = accepted? {
                    self.awaiting.push((stream, addr));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                self.running = false;
            }
        }
        Ok(())
    }

    /// Polls every accepted-but-unclassified connection for readiness,
    /// bounded by [`AWAIT_TIMEOUT`], and classifies whatever became
    /// readable this tick. A connection that never sends anything just
    /// keeps waiting in `awaiting` indefinitely rather than blocking
    /// the rest of the tick.
    async fn awaiting_tick(&mut self) {
        let pending = std::mem::take(&mut self.awaiting);
        let mut still_awaiting = Vec::with_capacity(pending.len());
        for (stream, addr) in pending {
            match transport::poll_readable(&stream, AWAIT_TIMEOUT).await {
                Readiness::Timeout => still_awaiting.push((stream, addr)),
                Readiness::Hangup => {}
                Readiness::Ready => self.handle_new_connection(stream, addr).await,
            }
        }
        self.awaiting = still_awaiting;
    }

    fn dump_neighbours_periodically(&mut self) {
        if self.last_dump.elapsed() < DEBUG_DUMP_INTERVAL {
            return;
        }
        self.last_dump = Instant::now();
        debug!(count = self.neighbours.set.len(), "neighbour dump");
    }

    async fn handle_new_connection(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let message = match Message::read_from(&mut stream, addr).await {
            Ok(m) => m,
            Err(e) => {
                warn!(%addr, %e, "dropping connection: malformed opening message");
                return;
            }
        };

        match message {
            Message::LocalHandshakeClient => {
                match local::complete_handshake(stream, addr, self.local_handshaked).await {
                    local::HandshakeOutcome::Completed(stream) => {
                        info!(%addr, "local front-end attached");
                        self.local = Some(stream);
                        self.local_addr = Some(addr);
                        self.local_handshaked = true;
                    }
                    local::HandshakeOutcome::RejectedNonLocal => {
                        warn!(%addr, "rejected local handshake from non-loopback source");
                    }
                    local::HandshakeOutcome::RejectedDuplicate => {
                        warn!(%addr, "rejected second local front-end connection");
                    }
                    local::HandshakeOutcome::Fatal(reason) => {
                        tracing::error!(%addr, %reason, "fatal local handshake failure");
                        self.running = false;
                    }
                }
            }
            Message::Join {
                rescue,
                contact_port,
            } => {
                if let Err(e) = self
                    .neighbours
                    .accept_join(stream, rescue, contact_port, &mut self.rng)
                    .await
                {
                    warn!(%addr, %e, "failed to service JOIN");
                }
            }
            Message::NeighboursRequest => {
                let reply = self.neighbours.neighbours_reply();
                if let Err(e) = reply.write_to(&mut stream, addr).await {
                    warn!(%addr, %e, "failed to answer NEIGHBOURS_REQUEST");
                }
            }
            Message::DownloadRequest { filename } => {
                self.queue.push_back(Request::DownloadRemote { socket: stream, filename });
            }
            other => {
                warn!(%addr, opcode = ?other.opcode(), "unexpected opening message, dropping");
            }
        }
    }

    async fn local_tick(&mut self) {
        let Some(stream) = self.local.as_mut() else {
            return;
        };
        let addr = self.local_addr.unwrap();

        match transport::poll_readable(stream, Duration::ZERO).await {
            Readiness::Timeout => {}
            Readiness::Hangup => {
                info!("local front-end disconnected");
                self.local = None;
                self.local_addr = None;
                self.local_handshaked = false;
            }
            Readiness::Ready => match local::read_local_request(stream, addr).await {
                Ok(LocalPoll::Idle) => {}
                Ok(LocalPoll::Exit) => {
                    info!("LOCAL_EXIT received, shutting down");
                    self.running = false;
                }
                Ok(LocalPoll::Queued(request)) => self.queue.push_back(request),
                Err(e) => warn!(%e, "malformed message on local channel"),
            },
        }
    }

    async fn neighbour_tick(&mut self) {
        let mut departed = Vec::new();
        let mut incoming = Vec::new();

        for (index, neighbour) in self.neighbours.set.iter_mut().enumerate() {
            match transport::poll_readable(&neighbour.stream, Duration::ZERO).await {
                Readiness::Timeout => {}
                Readiness::Hangup => departed.push(index),
                Readiness::Ready => {
                    match Message::read_from(&mut neighbour.stream, neighbour.peer_addr).await {
                        Ok(Message::SearchRequest {
                            origin_ip,
                            origin_port,
                            filename,
                            ttl,
                            holders,
                        }) => incoming.push(Request::SearchRemote {
                            source: neighbour.peer_addr,
                            origin_ip,
                            origin_port,
                            filename,
                            ttl,
                            known_holders: holders,
                        }),
                        Ok(Message::SearchReply { filename, holders }) => {
                            incoming.push(Request::SearchReplyArrived { filename, holders })
                        }
                        Ok(Message::Leave) => departed.push(index),
                        Ok(other) => warn!(
                            addr = %neighbour.peer_addr,
                            opcode = ?other.opcode(),
                            "unexpected message from neighbour"
                        ),
                        Err(_) => departed.push(index),
                    }
                }
            }
        }

        self.queue.extend(incoming);

        // Remove highest indices first so earlier indices stay valid.
        departed.sort_unstable();
        departed.dedup();
        for index in departed.into_iter().rev() {
            if self.neighbours.handle_departure(index).await
                == crate::neighbours::DepartureOutcome::OverlayLost
            {
                warn!("overlay lost: no neighbours remain, shutting down");
                self.running = false;
            }
        }
    }

    async fn download_tick(&mut self) {
        let mut still_pending = Vec::new();
        let pending = std::mem::take(&mut self.pending_downloads);
        for mut pending_dl in pending {
            match transport::poll_readable(&pending_dl.stream, Duration::ZERO).await {
                Readiness::Timeout => still_pending.push(pending_dl),
                Readiness::Hangup => {
                    self.report_download_result(
                        pending_dl.ip,
                        pending_dl.port,
                        pending_dl.filename,
                        DownloadCode::RemoteOffline,
                    )
                    .await;
                }
                Readiness::Ready => match download::complete_pending(&mut pending_dl).await {
                    ReceiveOutcome::Found { filename, data } => {
                        match download::save_download(&self.share_dir, &filename, &data).await {
                            Ok(_) => {
                                self.report_download_result(
                                    pending_dl.ip,
                                    pending_dl.port,
                                    filename,
                                    DownloadCode::RemoteFound,
                                )
                                .await;
                            }
                            Err(e) => warn!(%e, "failed to save downloaded file"),
                        }
                    }
                    ReceiveOutcome::NotFound { filename } => {
                        self.report_download_result(
                            pending_dl.ip,
                            pending_dl.port,
                            filename,
                            DownloadCode::RemoteNotFound,
                        )
                        .await;
                    }
                    ReceiveOutcome::ProtocolError | ReceiveOutcome::NotYet => {
                        self.report_download_result(
                            pending_dl.ip,
                            pending_dl.port,
                            pending_dl.filename.clone(),
                            DownloadCode::RemoteOffline,
                        )
                        .await;
                    }
                },
            }
        }
        self.pending_downloads = still_pending;
    }

    async fn report_download_result(
        &mut self,
        ip: IpAddr,
        port: u16,
        filename: String,
        code: DownloadCode,
    ) {
        if let (Some(stream), Some(addr)) = (self.local.as_mut(), self.local_addr) {
            let _ = local::reply_download_result(stream, addr, ip, port, filename, code).await;
        }
    }

    /// Drains and dispatches the pending-request queue, but only once
    /// at least one neighbour exists — with none, a flood has nowhere
    /// to go and a download has no path off this machine, so the
    /// queue is simply left to accumulate until a neighbour arrives.
    async fn dispatch_tick(&mut self) {
        if self.neighbours.set.is_empty() {
            return;
        }
        let requests: Vec<Request> = self.queue.drain(..).collect();
        for request in requests {
            self.dispatch_one(request).await;
        }
    }

    async fn dispatch_one(&mut self, request: Request) {
        match request {
            Request::SearchLocal { name } => {
                let held = lookup::file_exists(self.share_dir.clone(), name.clone()).await;
                if held {
                    let holders =
                        vec![Holder::new(self.self_ip().to_string(), self.contact_port().to_string())];
                    self.surface_search_result(name.clone(), holders).await;
                }
                let message = Message::SearchRequest {
                    origin_ip: self.self_ip().to_string(),
                    origin_port: self.contact_port().to_string(),
                    filename: name.clone(),
                    ttl: router::DEFAULT_TTL,
                    holders: vec![],
                };
                self.search_log
                    .record_if_new((name.clone(), self.self_ip().to_string(), self.contact_port().to_string()));
                self.search_log.record_route(name, None);
                router::broadcast_except(&mut self.neighbours, None, &message).await;
            }

            Request::SearchRemote { .. } => {
                let held = match &request {
                    Request::SearchRemote { filename, .. } => {
                        lookup::file_exists(self.share_dir.clone(), filename.clone()).await
                    }
                    _ => unreachable!(),
                };
                let self_ip = self.self_ip();
                let contact_port = self.contact_port();
                match router::route_search(
                    &mut self.search_log,
                    self_ip,
                    contact_port,
                    held,
                    request,
                ) {
                    SearchOutcome::AnswerLocally { filename, holders } => {
                        self.surface_search_result(filename, holders).await;
                    }
                    SearchOutcome::Routed {
                        source,
                        reply,
                        forward,
                    } => {
                        if let Some(reply) = reply {
                            if let Some(neighbour) = self.neighbours.set.get_mut(source) {
                                let _ = reply.write_to(&mut neighbour.stream, source).await;
                            }
                        }
                        if let Some(forward) = forward {
                            router::broadcast_except(&mut self.neighbours, Some(source), &forward).await;
                        }
                    }
                }
            }

            Request::SearchReplyArrived { filename, holders } => {
                match self.search_log.route_for(&filename) {
                    Some(None) => self.surface_search_result(filename, holders).await,
                    Some(Some(ingress)) => {
                        let message = Message::SearchReply { filename, holders };
                        if let Some(neighbour) = self.neighbours.set.get_mut(ingress) {
                            let _ = message.write_to(&mut neighbour.stream, ingress).await;
                        }
                    }
                    None => {
                        warn!(%filename, "dropping SEARCH_REPLY with no known route");
                    }
                }
            }

            Request::DownloadLocal { ip, port, filename } => {
                let held = lookup::file_exists(self.share_dir.clone(), filename.clone()).await;
                match download::start_download(ip, port, filename.clone(), held).await {
                    DownloadStart::Local => {
                        self.report_download_result(ip, port, filename, DownloadCode::Local).await;
                    }
                    DownloadStart::RemoteOffline => {
                        self.report_download_result(ip, port, filename, DownloadCode::RemoteOffline)
                            .await;
                    }
                    DownloadStart::Pending(pending) => self.pending_downloads.push(pending),
                }
            }

            Request::DownloadRemote { socket, filename } => {
                let held = lookup::file_exists(self.share_dir.clone(), filename.clone()).await;
                let data = if held {
                    tokio::fs::read(self.share_dir.join(&filename)).await.ok()
                } else {
                    None
                };
                if let Err(e) =
                    download::serve_download(socket, filename, self.self_ip(), self.contact_port(), data)
                        .await
                {
                    warn!(%e, "failed to serve DOWNLOAD_REQUEST");
                }
            }
        }
    }

    async fn surface_search_result(&mut self, filename: String, holders: Vec<Holder>) {
        if let (Some(stream), Some(addr)) = (self.local.as_mut(), self.local_addr) {
            let _ = local::reply_search_result(stream, addr, filename, holders).await;
        }
    }

    async fn shutdown(&mut self) {
        router::broadcast_except(&mut self.neighbours, None, &Message::Leave).await;
        info!("servent shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// Grabs an ephemeral port by binding and immediately releasing it.
    /// Racy in theory, fine for a local test harness.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn config(listen_port: u16, contact: Option<(IpAddr, u16)>, share_dir: PathBuf) -> Config {
        Config {
            listen_port,
            contact,
            share_dir,
        }
    }

    /// Performs the local handshake over a fresh connection to `port`
    /// and returns the stream ready for `LOCAL_SEARCH`/`LOCAL_DOWNLOAD`.
    async fn attach_front_end(port: u16) -> (TcpStream, SocketAddr) {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let addr = stream.local_addr().unwrap();
        Message::LocalHandshakeClient.write_to(&mut stream, addr).await.unwrap();
        match Message::read_from(&mut stream, addr).await.unwrap() {
            Message::LocalHandshakeServer => {}
            other => panic!("unexpected handshake reply: {other:?}"),
        }
        (stream, addr)
    }

    #[tokio::test]
    async fn two_servent_search_and_download_round_trip() {
        let share_a = tempfile::tempdir().unwrap();
        let share_b = tempfile::tempdir().unwrap();
        tokio::fs::write(share_a.path().join("shared.txt"), b"hello overlay")
            .await
            .unwrap();

        let port_a = free_port().await;
        let port_b = free_port().await;

        let mut servent_a = Servent::bootstrap(&config(port_a, None, share_a.path().to_path_buf()))
            .await
            .unwrap();
        let task_a = tokio::spawn(async move {
            let _ = servent_a.run().await;
        });

        let mut servent_b = Servent::bootstrap(&config(
            port_b,
            Some((Ipv4Addr::LOCALHOST.into(), port_a)),
            share_b.path().to_path_buf(),
        ))
        .await
        .unwrap();
        assert_eq!(servent_b.neighbours.set.len(), 1, "B should have joined A");
        let task_b = tokio::spawn(async move {
            let _ = servent_b.run().await;
        });

        let (mut front_b, addr_b) = attach_front_end(port_b).await;

        Message::LocalSearch {
            filename: "shared.txt".into(),
        }
        .write_to(&mut front_b, addr_b)
        .await
        .unwrap();

        let (found_ip, found_port) = match Message::read_from(&mut front_b, addr_b).await.unwrap() {
            Message::LocalSearchResult { filename, holders } => {
                assert_eq!(filename, "shared.txt");
                assert_eq!(holders.len(), 1);
                (holders[0].ip.clone(), holders[0].port.clone())
            }
            other => panic!("unexpected reply to LOCAL_SEARCH: {other:?}"),
        };
        assert_eq!(found_port, port_a.to_string());

        Message::LocalDownload {
            ip: found_ip.clone(),
            port: found_port.clone(),
            filename: "shared.txt".into(),
        }
        .write_to(&mut front_b, addr_b)
        .await
        .unwrap();

        match Message::read_from(&mut front_b, addr_b).await.unwrap() {
            Message::LocalDownloadResult {
                filename, code, ..
            } => {
                assert_eq!(filename, "shared.txt");
                assert_eq!(code, DownloadCode::RemoteFound);
            }
            other => panic!("unexpected reply to LOCAL_DOWNLOAD: {other:?}"),
        }

        let downloaded = tokio::fs::read(share_b.path().join("shared.txt")).await.unwrap();
        assert_eq!(downloaded, b"hello overlay");

        task_a.abort();
        task_b.abort();
    }
}
