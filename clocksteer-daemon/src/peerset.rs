//! The peer set: every server we poll, grouped by the hostname that
//! produced it, with duplicate addresses parked and the poll pacing
//! state that ramps polling up over the first minute.

use tracing::{debug, info};

use crate::peer::{self, Peer, PeerState};
use crate::Error;

/// All peers that came out of one supplied hostname.
#[derive(Debug)]
pub struct Group {
    pub hostname: String,
    pub npeer: usize,
}

/// Stable index of a peer within the set.
pub type PeerId = usize;

#[derive(Debug)]
pub struct PeerSet {
    peers: Vec<Peer>,
    groups: Vec<Group>,
    /// Pollable (non-duplicate) peers in rotation order; the head is
    /// always the least recently polled.
    rotation: Vec<PeerId>,
    t0: f64,
    init_duration: f64,
    init_packets: f64,
    poll_period: f64,
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSet {
    pub fn new() -> PeerSet {
        PeerSet {
            peers: Vec::new(),
            groups: Vec::new(),
            rotation: Vec::new(),
            t0: 1.0,
            init_duration: 64.0,
            init_packets: 6.0,
            poll_period: 64.0,
        }
    }

    /// Resolve a hostname and add one peer per address. Addresses already
    /// owned by another peer are added as `Duplicate` and linked to the
    /// owner. Returns how many peers were added.
    pub fn add_hostname(&mut self, hostname: &str) -> Result<usize, Error> {
        let addrs = peer::resolve(hostname)?;
        if addrs.is_empty() {
            return Err(Error::NoAddresses(hostname.to_owned()));
        }

        let group = self.groups.len();
        self.groups.push(Group {
            hostname: hostname.to_owned(),
            npeer: 0,
        });

        let mut added = 0;
        for addr in addrs {
            let mut np = Peer::new(hostname, addr, Some(group));
            let owner = self
                .peers
                .iter()
                .position(|other| other.addr == Some(addr));
            match owner {
                Some(owner) => {
                    debug!(host = hostname, ip = %np.ip, "duplicate address");
                    np.state = PeerState::Duplicate;
                    // Point at the owner's representative, not the owner
                    // itself, so chains stay shallow from the start.
                    np.other = Some(self.resolve_owner(owner));
                    self.peers.push(np);
                }
                None => {
                    self.peers.push(np);
                    self.rotation.push(self.peers.len() - 1);
                }
            }
            self.groups[group].npeer += 1;
            added += 1;
        }
        info!(host = hostname, peers = added, "added server");
        Ok(added)
    }

    /// Add a peer reconstructed from a trace header.
    pub fn add_sim(&mut self, hostname: &str, ip: &str) {
        let group = self.groups.len();
        self.groups.push(Group {
            hostname: hostname.to_owned(),
            npeer: 1,
        });
        self.peers.push(Peer::new_sim(hostname, ip, Some(group)));
        self.rotation.push(self.peers.len() - 1);
    }

    /// Follow duplicate links to the peer that owns the address,
    /// compressing the path on the way.
    pub fn resolve_owner(&mut self, id: PeerId) -> PeerId {
        let mut root = id;
        while let Some(next) = self.peers[root].other {
            root = next;
        }
        let mut cursor = id;
        while let Some(next) = self.peers[cursor].other {
            self.peers[cursor].other = Some(root);
            cursor = next;
        }
        root
    }

    /// Move the head of the rotation to the tail and return it; `None`
    /// with nothing to poll.
    pub fn rotate(&mut self) -> Option<PeerId> {
        if self.rotation.is_empty() {
            return None;
        }
        let id = self.rotation.remove(0);
        self.rotation.push(id);
        Some(id)
    }

    /// Reset the pacing ramp; called whenever polling (re)starts.
    pub fn reset_pace(&mut self, poll_period: f64) {
        self.t0 = 1.0;
        self.init_duration = 64.0;
        self.init_packets = 6.0;
        self.poll_period = poll_period;
    }

    /// Seconds until the next poll.
    ///
    /// Steady state is `poll_period / npeer`. During the first
    /// `init_duration` seconds the spacing grows geometrically so that
    /// about `init_packets` polls per peer land inside the window.
    pub fn next_spacing(&mut self) -> f64 {
        let npeer = self.rotation.len() as f64;
        assert!(npeer > 0.0);

        let mut d = self.poll_period / npeer;
        if self.t0 < self.init_duration {
            let dt = (self.init_duration.ln() / (self.init_packets * npeer)).exp();
            if self.t0 * dt < self.init_duration {
                d = self.t0 * dt - self.t0;
            }
        }
        self.t0 += d;
        d
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn pollable(&self) -> usize {
        self.rotation.len()
    }

    pub fn get(&self, id: PeerId) -> &Peer {
        &self.peers[id]
    }

    pub fn get_mut(&mut self, id: PeerId) -> &mut Peer {
        &mut self.peers[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut()
    }

    /// Locate a simulated peer by its trace identity.
    pub fn find(&self, hostname: &str, ip: &str) -> Option<PeerId> {
        self.peers
            .iter()
            .position(|np| np.hostname == hostname && np.ip == ip)
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }
}
