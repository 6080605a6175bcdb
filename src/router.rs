//! The request router: the sum type of work queued during a tick, the
//! search log that suppresses duplicate flood forwarding, and the
//! dispatch logic that decides whether a search is answered, forwarded
//! or replied to along its back-path.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::neighbours::NeighbourManager;
use crate::wire::{Holder, Message};

pub const DEFAULT_TTL: u8 = 10;
pub const LOG_ENTRY_TTL: Duration = Duration::from_secs(30);

/// Work created during a tick, dispatched once the tick has finished
/// observing all of its I/O sources.
pub enum Request {
    SearchLocal {
        name: String,
    },
    SearchRemote {
        /// The neighbour this request arrived on, identified by its
        /// stable per-connection address rather than a slot index
        /// (slots can shift as neighbours depart mid-tick).
        source: SocketAddr,
        origin_ip: String,
        origin_port: String,
        filename: String,
        ttl: u8,
        known_holders: Vec<Holder>,
    },
    DownloadLocal {
        ip: IpAddr,
        port: u16,
        filename: String,
    },
    DownloadRemote {
        socket: TcpStream,
        filename: String,
    },
    /// A `SEARCH_REPLY` arrived on a neighbour connection; routing it
    /// (deliver locally vs. forward further back) needs a lookup in
    /// the search log's route table, which the neighbour poll loop
    /// cannot do itself without re-borrowing the neighbour set it is
    /// already iterating.
    SearchReplyArrived {
        filename: String,
        holders: Vec<Holder>,
    },
}

/// The `(filename, origin_ip, origin_port)` key a search log entry is
/// recorded against.
pub type SearchKey = (String, String, String);

/// Per-servent memory of recently observed `SEARCH_REQUEST` tuples,
/// used to suppress duplicate forwarding, plus a filename-keyed route
/// table recording where a later `SEARCH_REPLY` for that filename
/// should go: back to a specific neighbour, or straight to the local
/// front-end when `None` (we originated the search ourselves). A
/// filename collision between two concurrently outstanding searches
/// from different origins resolves to "last route wins" — the wire
/// format carries no search identifier beyond the filename, so this
/// is the best this protocol can do without widening the messages.
#[derive(Debug, Default)]
pub struct SearchLog {
    entries: HashMap<SearchKey, Duration>,
    routes: HashMap<String, (Option<SocketAddr>, Duration)>,
}

impl SearchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns whether `key` was newly recorded (i.e. this is not a
    /// duplicate). A duplicate leaves the existing entry's remaining
    /// TTL untouched.
    pub fn record_if_new(&mut self, key: SearchKey) -> bool {
        if self.entries.contains_key(&key) {
            false
        } else {
            self.entries.insert(key, LOG_ENTRY_TTL);
            true
        }
    }

    /// Records (or refreshes) where a `SEARCH_REPLY` for `filename`
    /// should be routed: `Some(ingress)` to forward it back to that
    /// neighbour, `None` because we originated the search and want it
    /// delivered to our own local front-end.
    pub fn record_route(&mut self, filename: String, ingress: Option<SocketAddr>) {
        self.routes.insert(filename, (ingress, LOG_ENTRY_TTL));
    }

    /// Looks up the route recorded for `filename`, if any is still live.
    pub fn route_for(&self, filename: &str) -> Option<Option<SocketAddr>> {
        self.routes.get(filename).map(|(route, _)| *route)
    }

    /// Decrements every entry's remaining TTL by `elapsed` and evicts
    /// entries that have reached zero.
    pub fn age(&mut self, elapsed: Duration) {
        self.entries.retain(|_, ttl| {
            if *ttl <= elapsed {
                false
            } else {
                *ttl -= elapsed;
                true
            }
        });
        self.routes.retain(|_, (_, ttl)| {
            if *ttl <= elapsed {
                false
            } else {
                *ttl -= elapsed;
                true
            }
        });
    }
}

/// Outcome of dispatching a single `SearchRemote` request, telling the
/// servent loop what to do about the network and the front-end.
#[derive(Debug)]
pub enum SearchOutcome {
    /// We are the origin: surface this as a local search result.
    AnswerLocally { filename: String, holders: Vec<Holder> },
    /// Routed: exactly one of `reply`/`forward` is ever set. `reply`
    /// fires for a duplicate or a TTL-exhausted request, sent back
    /// along `source`; `forward` fires for a first sighting with TTL
    /// remaining, flooded to every other neighbour.
    Routed {
        source: SocketAddr,
        reply: Option<Message>,
        forward: Option<Message>,
    },
}

/// Decides how to route a just-received `SearchRemote` request (4.5.2).
/// `held_locally` tells whether our own share directory holds the file
/// (already resolved by the caller, since the lookup itself is async
/// and this function is not). Forwarding and replying are mutually
/// exclusive: a first sighting with TTL remaining only appends our own
/// holder entry and keeps flooding; only a duplicate or TTL-exhausted
/// sighting turns around and replies along the ingress socket with
/// whatever holders have accumulated so far.
pub fn route_search(
    log: &mut SearchLog,
    self_ip: IpAddr,
    own_contact_port: u16,
    held_locally: bool,
    req: Request,
) -> SearchOutcome {
    let Request::SearchRemote {
        source,
        origin_ip,
        origin_port,
        filename,
        ttl,
        known_holders,
    } = req
    else {
        unreachable!("route_search called with a non-SearchRemote request");
    };

    if origin_ip.parse::<IpAddr>().map(|ip| ip == self_ip).unwrap_or(false) {
        return SearchOutcome::AnswerLocally {
            filename,
            holders: known_holders,
        };
    }

    let key: SearchKey = (filename.clone(), origin_ip.clone(), origin_port.clone());
    let unique = log.record_if_new(key);

    if unique && ttl > 0 {
        let mut holders = known_holders;
        if held_locally {
            holders.push(Holder::new(self_ip.to_string(), own_contact_port.to_string()));
        }
        log.record_route(filename.clone(), Some(source));
        let forward = Message::SearchRequest {
            origin_ip,
            origin_port,
            filename,
            ttl: ttl - 1,
            holders,
        };
        SearchOutcome::Routed {
            source,
            reply: None,
            forward: Some(forward),
        }
    } else {
        let reply = Message::SearchReply {
            filename,
            holders: known_holders,
        };
        SearchOutcome::Routed {
            source,
            reply: Some(reply),
            forward: None,
        }
    }
}

/// Broadcasts `message` to every neighbour in `neighbours` except the
/// one whose connection address is `except` (if any). Errors on
/// individual sends are swallowed — a send failure to one neighbour
/// does not abort the broadcast to the rest; that neighbour will be
/// reaped as a departure on its next poll.
pub async fn broadcast_except(
    neighbours: &mut NeighbourManager,
    except: Option<SocketAddr>,
    message: &Message,
) {
    for neighbour in neighbours.set.iter_mut() {
        if Some(neighbour.peer_addr) == except {
            continue;
        }
        let _ = message.write_to(&mut neighbour.stream, neighbour.peer_addr).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn answers_locally_when_origin_is_self() {
        let mut log = SearchLog::new();
        let req = Request::SearchRemote {
            source: addr("10.0.0.2:9"),
            origin_ip: "10.0.0.1".into(),
            origin_port: "10001".into(),
            filename: "x".into(),
            ttl: 5,
            known_holders: vec![Holder::new("10.0.0.5", "10005")],
        };
        match route_search(&mut log, ip("10.0.0.1"), 10001, false, req) {
            SearchOutcome::AnswerLocally { filename, holders } => {
                assert_eq!(filename, "x");
                assert_eq!(holders.len(), 1);
            }
            _ => panic!("expected AnswerLocally"),
        }
        assert!(log.is_empty());
    }

    #[test]
    fn forwards_unique_request_with_ttl_decremented() {
        let mut log = SearchLog::new();
        let req = Request::SearchRemote {
            source: addr("10.0.0.2:9"),
            origin_ip: "10.0.0.9".into(),
            origin_port: "10009".into(),
            filename: "x".into(),
            ttl: 3,
            known_holders: vec![],
        };
        match route_search(&mut log, ip("10.0.0.1"), 10001, true, req) {
            SearchOutcome::Routed {
                source,
                reply,
                forward,
            } => {
                assert_eq!(source, addr("10.0.0.2:9"));
                // held locally and a first sighting: append our holder and
                // keep flooding, but do not reply yet.
                assert!(reply.is_none());
                match forward {
                    Some(Message::SearchRequest { ttl, holders, .. }) => {
                        assert_eq!(ttl, 2);
                        assert_eq!(holders.len(), 1);
                    }
                    _ => panic!("expected SearchRequest"),
                }
            }
            other => panic!("expected Routed, got {other:?}"),
        }
        assert_eq!(log.len(), 1);
        assert_eq!(log.route_for("x"), Some(Some(addr("10.0.0.2:9"))));
    }

    #[test]
    fn replies_on_ingress_when_duplicate() {
        let mut log = SearchLog::new();
        log.record_if_new(("x".into(), "10.0.0.9".into(), "10009".into()));

        let req = Request::SearchRemote {
            source: addr("10.0.0.2:9"),
            origin_ip: "10.0.0.9".into(),
            origin_port: "10009".into(),
            filename: "x".into(),
            ttl: 3,
            known_holders: vec![],
        };
        // held_locally = true, but a duplicate never appends: the holder
        // entry must not reach the origin twice.
        match route_search(&mut log, ip("10.0.0.1"), 10001, true, req) {
            SearchOutcome::Routed {
                source,
                reply,
                forward,
            } => {
                assert_eq!(source, addr("10.0.0.2:9"));
                match reply {
                    Some(Message::SearchReply { holders, .. }) => assert!(holders.is_empty()),
                    _ => panic!("expected a reply for a duplicate request"),
                }
                assert!(forward.is_none());
            }
            other => panic!("expected Routed, got {other:?}"),
        }
    }

    #[test]
    fn replies_on_ingress_when_ttl_exhausted() {
        let mut log = SearchLog::new();
        let req = Request::SearchRemote {
            source: addr("10.0.0.2:9"),
            origin_ip: "10.0.0.9".into(),
            origin_port: "10009".into(),
            filename: "x".into(),
            ttl: 0,
            known_holders: vec![],
        };
        match route_search(&mut log, ip("10.0.0.1"), 10001, false, req) {
            SearchOutcome::Routed { reply, forward, .. } => {
                assert!(reply.is_some());
                assert!(forward.is_none());
            }
            other => panic!("expected Routed, got {other:?}"),
        }
    }

    #[test]
    fn search_log_ages_out_entries() {
        let mut log = SearchLog::new();
        log.record_if_new(("x".into(), "1.2.3.4".into(), "9".into()));
        log.record_route("x".into(), None);
        assert_eq!(log.len(), 1);
        log.age(LOG_ENTRY_TTL);
        assert!(log.is_empty());
        assert_eq!(log.route_for("x"), None);
    }
}
