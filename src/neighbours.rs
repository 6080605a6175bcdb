//! The neighbour manager: joining the overlay, accepting incoming
//! joins, and repairing the neighbour set on departure.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;

use crate::error::{Result, ServentError};
use crate::transport;
use crate::wire::{Holder, Message};

pub const MAX_NEIGHBOURS: usize = 5;
pub const MIN_NEIGHBOURS: usize = 2;
pub const JOIN_CHANCE: f64 = 0.5;
pub const JOIN_MAX_ATTEMPTS: u32 = 3;
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_DELAY: Duration = Duration::from_secs(1);

/// A single open connection to a peer we route overlay traffic
/// through, along with the port that peer listens on for new joins.
#[derive(Debug)]
pub struct Neighbour {
    pub stream: TcpStream,
    pub remote_ip: IpAddr,
    pub contact_port: u16,
    /// The ephemeral address of this specific connection. Stable for
    /// the connection's lifetime, used to identify "the socket a
    /// search request arrived on" across a tick even though neighbour
    /// slots can be reordered or removed.
    pub peer_addr: SocketAddr,
}

impl Neighbour {
    fn matches(&self, ip: IpAddr, port: u16) -> bool {
        self.remote_ip.to_canonical() == ip.to_canonical() && self.contact_port == port
    }
}

/// A fixed-capacity collection of neighbour slots (invariant: never
/// more than [`MAX_NEIGHBOURS`] entries, never two entries for the
/// same canonicalised `(ip, contact_port)`).
#[derive(Debug, Default)]
pub struct NeighbourSet {
    slots: Vec<Neighbour>,
}

impl NeighbourSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= MAX_NEIGHBOURS
    }

    pub fn contains(&self, ip: IpAddr, port: u16) -> bool {
        self.slots.iter().any(|n| n.matches(ip, port))
    }

    pub fn insert(&mut self, neighbour: Neighbour) -> Result<()> {
        if self.is_full() {
            return Err(ServentError::Saturation {
                have: self.slots.len(),
                want: MAX_NEIGHBOURS,
            });
        }
        self.slots.push(neighbour);
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Neighbour {
        self.slots.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbour> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Neighbour> {
        self.slots.iter_mut()
    }

    pub fn contacts(&self) -> Vec<(IpAddr, u16)> {
        self.slots.iter().map(|n| (n.remote_ip, n.contact_port)).collect()
    }

    pub fn index_of(&self, peer_addr: SocketAddr) -> Option<usize> {
        self.slots.iter().position(|n| n.peer_addr == peer_addr)
    }

    pub fn get_mut(&mut self, peer_addr: SocketAddr) -> Option<&mut Neighbour> {
        self.slots.iter_mut().find(|n| n.peer_addr == peer_addr)
    }
}

/// Whether the neighbour set can still sustain the overlay after a
/// departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureOutcome {
    Ok,
    OverlayLost,
}

pub struct NeighbourManager {
    pub set: NeighbourSet,
    pub self_ip: Option<IpAddr>,
    pub listen_port: u16,
}

impl NeighbourManager {
    pub fn new(listen_port: u16) -> Self {
        Self {
            set: NeighbourSet::new(),
            self_ip: None,
            listen_port,
        }
    }

    fn learn_self_ip_from(&mut self, addr: SocketAddr) {
        if self.self_ip.is_none() {
            self.self_ip = Some(addr.ip());
        }
    }

    /// Opens a fresh connection to `seed`, requests its neighbour
    /// list, and learns `self_ip` from the local endpoint of this
    /// connection if it is not already known (4.4.1 step 1).
    async fn request_neighbours(&mut self, seed: (IpAddr, u16)) -> Result<Vec<Holder>> {
        let target: SocketAddr = seed.into();
        let mut stream = transport::connect_with_retry(target, CONNECT_ATTEMPTS, CONNECT_DELAY).await?;
        let addr = transport::peer_endpoint(&stream)?;
        if self.self_ip.is_none() {
            let local = transport::local_endpoint(&stream)?;
            self.self_ip = Some(local.ip());
        }
        Message::NeighboursRequest.write_to(&mut stream, addr).await?;
        match Message::read_from(&mut stream, addr).await? {
            Message::NeighboursReply { holders } => Ok(holders),
            other => Err(ServentError::UnexpectedOpcode {
                addr,
                opcode: other.opcode(),
            }),
        }
    }

    /// Sends a `JOIN` to `(ip, port)`. Returns `Some(())` and installs
    /// the neighbour on acceptance, `None` on refusal.
    async fn try_join(&mut self, ip: IpAddr, port: u16, rescue: bool) -> Result<Option<()>> {
        if self.set.contains(ip, port) {
            return Ok(None);
        }
        let target: SocketAddr = (ip, port).into();
        let mut stream = transport::connect_with_retry(target, 1, CONNECT_DELAY).await?;
        let addr = transport::peer_endpoint(&stream)?;
        self.learn_self_ip_from_if_needed(&stream)?;
        Message::Join {
            rescue,
            contact_port: self.listen_port.to_string(),
        }
        .write_to(&mut stream, addr)
        .await?;
        match Message::read_from(&mut stream, addr).await? {
            Message::JoinReply {
                contact_port: Some(port_str),
            } => {
                let contact_port: u16 = port_str
                    .parse()
                    .map_err(|_| ServentError::LengthOverflow { len: 0, remaining: 0 })?;
                self.set.insert(Neighbour {
                    stream,
                    remote_ip: ip,
                    contact_port,
                    peer_addr: addr,
                })?;
                Ok(Some(()))
            }
            Message::JoinReply { contact_port: None } => Ok(None),
            other => Err(ServentError::UnexpectedOpcode {
                addr,
                opcode: other.opcode(),
            }),
        }
    }

    fn learn_self_ip_from_if_needed(&mut self, stream: &TcpStream) -> Result<()> {
        if self.self_ip.is_none() {
            let local = transport::local_endpoint(stream)?;
            self.self_ip = Some(local.ip());
        }
        Ok(())
    }

    /// Runs the full join sequence starting from `seed` (4.4.1): request
    /// the seed's neighbours, attempt `JOIN` against each (and against
    /// the seed itself when the list was short or empty), and — while
    /// still short of [`MIN_NEIGHBOURS`] and at least one response was
    /// obtained — retry through a newly-joined peer, bounded by
    /// [`JOIN_MAX_ATTEMPTS`].
    pub async fn bootstrap(&mut self, seed: (IpAddr, u16)) -> Result<()> {
        let mut seed = seed;
        let mut attempts_left = JOIN_MAX_ATTEMPTS;

        loop {
            if self.set.len() >= MIN_NEIGHBOURS || attempts_left == 0 {
                return Ok(());
            }
            attempts_left -= 1;

            let holders = match self.request_neighbours(seed).await {
                Ok(holders) => holders,
                Err(_) => return Ok(()),
            };

            let mut targets: Vec<(IpAddr, u16)> = holders
                .iter()
                .filter_map(|h| {
                    let ip: IpAddr = h.ip.parse().ok()?;
                    let port: u16 = h.port.parse().ok()?;
                    if Some(ip) == self.self_ip { None } else { Some((ip, port)) }
                })
                .collect();

            let list_was_short = targets.len() < MAX_NEIGHBOURS;
            let list_was_empty = holders.is_empty();
            if list_was_short && !targets.contains(&seed) {
                targets.push(seed);
            }

            let mut got_any_response = false;
            let mut joined_this_round = Vec::new();

            for target in &targets {
                let rescue = list_was_empty && *target == seed;
                match self.try_join(target.0, target.1, rescue).await {
                    Ok(Some(())) => {
                        got_any_response = true;
                        joined_this_round.push(*target);
                    }
                    Ok(None) => got_any_response = true,
                    Err(_) => {}
                }
            }

            if self.set.len() >= MIN_NEIGHBOURS || !got_any_response {
                return Ok(());
            }
            let Some(next_seed) = joined_this_round.into_iter().next() else {
                return Ok(());
            };
            seed = next_seed;
        }
    }

    /// Server-side accept policy for an incoming `JOIN` (4.4.2).
    pub async fn accept_join(
        &mut self,
        mut stream: TcpStream,
        rescue: bool,
        joiner_port: String,
        rng: &mut impl rand::RngCore,
    ) -> Result<()> {
        let addr = transport::peer_endpoint(&stream)?;
        self.learn_self_ip_from(addr);

        let accept = if self.set.is_full() {
            false
        } else if rescue {
            true
        } else {
            rng.gen_bool(JOIN_CHANCE)
        };

        if accept {
            Message::JoinReply {
                contact_port: Some(self.listen_port.to_string()),
            }
            .write_to(&mut stream, addr)
            .await?;
            let contact_port: u16 = joiner_port
                .parse()
                .map_err(|_| ServentError::LengthOverflow { len: 0, remaining: 0 })?;
            self.set.insert(Neighbour {
                stream,
                remote_ip: addr.ip(),
                contact_port,
                peer_addr: addr,
            })?;
        } else {
            Message::JoinReply { contact_port: None }
                .write_to(&mut stream, addr)
                .await?;
        }
        Ok(())
    }

    /// Removes the departed neighbour at `index` and, if the set fell
    /// below [`MIN_NEIGHBOURS`] but is not empty, re-runs the join
    /// sequence through a surviving neighbour (4.4.3).
    pub async fn handle_departure(&mut self, index: usize) -> DepartureOutcome {
        self.set.remove_at(index);

        if !self.set.is_empty() && self.set.len() < MIN_NEIGHBOURS {
            if let Some(reseed) = self.set.contacts().into_iter().next() {
                let _ = self.bootstrap(reseed).await;
            }
        }

        if self.set.is_empty() {
            DepartureOutcome::OverlayLost
        } else {
            DepartureOutcome::Ok
        }
    }

    /// Builds the `NEIGHBOURS_REPLY` for an incoming `NEIGHBOURS_REQUEST` (4.4.4).
    pub fn neighbours_reply(&self) -> Message {
        let holders = self
            .set
            .iter()
            .map(|n| Holder::new(n.remote_ip.to_string(), n.contact_port.to_string()))
            .collect();
        Message::NeighboursReply { holders }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbour_set_respects_capacity() {
        let mut set = NeighbourSet::new();
        assert!(!set.is_full());
        assert_eq!(set.len(), 0);
        assert!(!set.contains("127.0.0.1".parse().unwrap(), 1));
    }
}
