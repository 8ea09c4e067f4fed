// starnet-node - self-organizing UDP star overlay for peer discovery,
// RTT-based hub election, and broadcast relay.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::Mutex;

use crate::error::{StarNetError, StarNetResult};
use crate::peer::{Peer, PeerName, PeerRecord};

/// Thread-safe membership table. All mutations are serialized under a
/// single lock; the self-peer's name and address are kept outside the
/// locked map since they are always present and always live, and every
/// other site reaches peers only through this directory - no owning
/// references to a `Peer` are held elsewhere.
pub struct Directory {
    self_name: PeerName,
    self_addr: SocketAddr,
    max_nodes: u8,
    peers: Mutex<HashMap<PeerName, Peer>>,
    /// Self's own last (rtt_sum, network_size), mirroring what a `Peer`
    /// record holds for everyone else - self has no `Peer` entry of its
    /// own in `peers`.
    self_sum: Mutex<Option<(f64, u8)>>,
}

impl Directory {
    pub fn new(self_name: PeerName, self_addr: SocketAddr) -> Self {
        Self::with_max_nodes(self_name, self_addr, u8::MAX)
    }

    /// `max_nodes` bounds the overlay size the user configured at launch;
    /// once `size()` reaches it, newly-gossiped or re-stamped peers are no
    /// longer admitted.
    pub fn with_max_nodes(self_name: PeerName, self_addr: SocketAddr, max_nodes: u8) -> Self {
        Self {
            self_name,
            self_addr,
            max_nodes,
            peers: Mutex::new(HashMap::new()),
            self_sum: Mutex::new(None),
        }
    }

    fn at_capacity(&self, peers: &HashMap<PeerName, Peer>) -> bool {
        1 + peers.values().filter(|p| p.live).count() >= self.max_nodes as usize
    }

    pub fn self_name(&self) -> &PeerName {
        &self.self_name
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    fn self_record(&self) -> PeerRecord {
        PeerRecord {
            name: self.self_name.as_str().to_string(),
            ip: self.self_addr.ip().to_string(),
            port: self.self_addr.port(),
        }
    }

    /// Inserts a new peer, or revives it if it is known but dead. No-op if
    /// already live.
    pub async fn add(&self, peer: Peer) {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(&peer.name) {
            Some(existing) if !existing.live => existing.revive(),
            Some(_) => {}
            None if !self.at_capacity(&peers) => {
                peers.insert(peer.name.clone(), peer);
            }
            None => {}
        }
    }

    pub async fn exists(&self, name: &PeerName) -> bool {
        if name == &self.self_name {
            return true;
        }
        self.peers
            .lock()
            .await
            .get(name)
            .map(|p| p.live)
            .unwrap_or(false)
    }

    /// Returns a clone of the live peer, or the self-peer's address if
    /// `name` is self. Fails if `name` is unknown or dead.
    pub async fn get_addr(&self, name: &PeerName) -> StarNetResult<SocketAddr> {
        if name == &self.self_name {
            return Ok(self.self_addr);
        }
        let peers = self.peers.lock().await;
        match peers.get(name) {
            Some(p) if p.live => Ok(p.addr),
            _ => Err(StarNetError::UnknownPeer(name.to_string())),
        }
    }

    pub async fn get(&self, name: &PeerName) -> StarNetResult<Peer> {
        let peers = self.peers.lock().await;
        match peers.get(name) {
            Some(p) if p.live => Ok(p.clone()),
            _ => Err(StarNetError::UnknownPeer(name.to_string())),
        }
    }

    /// Re-stamps a peer's advertised address from the UDP source tuple,
    /// inserting the peer if unknown.
    pub async fn restamp_addr(&self, name: &PeerName, addr: SocketAddr) {
        if name == &self.self_name {
            return;
        }
        let mut peers = self.peers.lock().await;
        match peers.get_mut(name) {
            Some(p) => {
                p.addr = addr;
                if !p.live {
                    p.revive();
                }
            }
            None if !self.at_capacity(&peers) => {
                peers.insert(name.clone(), Peer::new(name.clone(), addr));
            }
            None => {}
        }
    }

    /// Bumps a peer's last-heartbeat stamp to now. No-op for an unknown or
    /// self name.
    pub async fn touch_heartbeat(&self, name: &PeerName) {
        if name == &self.self_name {
            return;
        }
        let mut peers = self.peers.lock().await;
        if let Some(p) = peers.get_mut(name) {
            p.touch_heartbeat();
        }
    }

    /// Marks a peer dead. Preferred over deletion so a re-joiner with the
    /// same name revives the existing record instead of starting fresh.
    pub async fn remove(&self, name: &PeerName) {
        let mut peers = self.peers.lock().await;
        if let Some(p) = peers.get_mut(name) {
            p.live = false;
        }
    }

    /// Count of live peers, self included.
    pub async fn size(&self) -> usize {
        let peers = self.peers.lock().await;
        1 + peers.values().filter(|p| p.live).count()
    }

    pub async fn snapshot_live(&self) -> Vec<Peer> {
        let peers = self.peers.lock().await;
        peers.values().filter(|p| p.live).cloned().collect()
    }

    /// Records self's own RTT-sum measurement and the network size it was
    /// measured against.
    pub async fn record_self_sum(&self, sum: f64, size: u8) {
        *self.self_sum.lock().await = Some((sum, size));
    }

    /// Self's own last (rtt_sum, network_size), for `show-status`.
    pub async fn self_sum(&self) -> Option<(f64, u8)> {
        *self.self_sum.lock().await
    }

    /// Records the last measured one-way RTT to a peer, as observed during
    /// this node's own election round.
    pub async fn record_rtt(&self, name: &PeerName, rtt: f64) {
        let mut peers = self.peers.lock().await;
        if let Some(p) = peers.get_mut(name) {
            p.last_rtt = Some(rtt);
        }
    }

    /// Updates a peer's reported RTT-sum/network-size from an inbound
    /// stage='2' broadcast.
    pub async fn record_peer_sum(&self, name: &PeerName, sum: f64, size: u8) {
        let mut peers = self.peers.lock().await;
        if let Some(p) = peers.get_mut(name) {
            p.last_rtt_sum = Some(sum);
            p.last_network_size = Some(size);
        }
    }

    /// Serializes all live peers (self included) as the gossip payload for
    /// a Discovery reply. Dead peers are never gossiped.
    pub async fn serialize_live(&self) -> Vec<PeerRecord> {
        let peers = self.peers.lock().await;
        let mut out = vec![self.self_record()];
        out.extend(peers.values().filter(|p| p.live).map(PeerRecord::from_peer));
        out
    }

    /// Merges a foreign directory snapshot in: unknown records are
    /// inserted live, known-but-dead records are revived, a known live
    /// record's address is never overwritten.
    ///
    /// Returns the names that were newly discovered or revived, for the
    /// caller to log.
    pub async fn merge(&self, records: Vec<PeerRecord>) -> StarNetResult<Vec<PeerName>> {
        let mut discovered = Vec::new();
        let mut peers = self.peers.lock().await;
        for record in records {
            let name = PeerName::new(record.name.trim())?;
            if name == self.self_name {
                continue;
            }
            let addr = record.to_addr()?;
            match peers.get_mut(&name) {
                Some(existing) if !existing.live => {
                    existing.revive();
                    discovered.push(name);
                }
                Some(_) => {
                    // Known and live: never overwrite the address.
                }
                None if !self.at_capacity(&peers) => {
                    peers.insert(name.clone(), Peer::new(name.clone(), addr));
                    discovered.push(name);
                }
                None => {}
            }
        }
        Ok(discovered)
    }

    /// Returns true iff no known peer shares `poc_addr` — the point of
    /// contact's identity by name is unknown until its first reply, so
    /// address is what we match on to detect bootstrap completion.
    pub async fn poc_not_yet_known(&self, poc_addr: SocketAddr) -> bool {
        let peers = self.peers.lock().await;
        !peers.values().any(|p| p.live && p.addr == poc_addr)
    }

    /// Computes the hub: the live peer (self included) with minimum
    /// reported RTT-sum among those whose reported network size matches
    /// the directory's current size. Ties favor self, then lexicographic
    /// name order.
    pub async fn check_hub(&self) -> (PeerName, f64) {
        let self_sum = *self.self_sum.lock().await;
        let peers = self.peers.lock().await;
        let current_size = 1 + peers.values().filter(|p| p.live).count();

        let mut best: Option<(PeerName, f64)> = match self_sum {
            Some((sum, size)) if size as usize == current_size => {
                Some((self.self_name.clone(), sum))
            }
            _ => None,
        };

        for p in peers.values().filter(|p| p.live) {
            let (Some(sum), Some(size)) = (p.last_rtt_sum, p.last_network_size) else {
                continue;
            };
            if size as usize != current_size {
                continue;
            }
            best = Some(match best {
                None => (p.name.clone(), sum),
                Some((best_name, best_sum)) => {
                    if sum < best_sum
                        || (sum == best_sum && tie_break(&p.name, &best_name, &self.self_name))
                    {
                        (p.name.clone(), sum)
                    } else {
                        (best_name, best_sum)
                    }
                }
            });
        }

        best.unwrap_or_else(|| (self.self_name.clone(), self_sum.map(|(s, _)| s).unwrap_or(0.0)))
    }
}

/// Tie-break rule: self always wins, otherwise lexicographically smaller
/// name wins. `candidate` is the peer being considered as a replacement
/// for `incumbent`.
fn tie_break(candidate: &PeerName, incumbent: &PeerName, self_name: &PeerName) -> bool {
    if incumbent == self_name {
        return false;
    }
    if candidate == self_name {
        return true;
    }
    candidate < incumbent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn name(s: &str) -> PeerName {
        PeerName::new(s).unwrap()
    }

    #[tokio::test]
    async fn add_then_exists_then_remove_then_revive() {
        let dir = Directory::new(name("A"), addr(3000));
        dir.add(Peer::new(name("B"), addr(3001))).await;

        assert!(dir.exists(&name("B")).await);
        assert_eq!(dir.size().await, 2);

        dir.remove(&name("B")).await;
        assert!(!dir.exists(&name("B")).await);
        assert_eq!(dir.size().await, 1);

        dir.add(Peer::new(name("B"), addr(3002))).await;
        assert!(dir.exists(&name("B")).await);
        let got = dir.get(&name("B")).await.unwrap();
        // revive preserves the prior address, only the liveness flips
        assert_eq!(got.addr, addr(3001));
    }

    #[tokio::test]
    async fn merge_never_overwrites_live_address() {
        let dir = Directory::new(name("A"), addr(3000));
        dir.add(Peer::new(name("B"), addr(3001))).await;

        dir.merge(vec![PeerRecord {
            name: "B".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 9999,
        }])
        .await
        .unwrap();

        let got = dir.get(&name("B")).await.unwrap();
        assert_eq!(got.addr, addr(3001));
    }

    #[tokio::test]
    async fn add_is_rejected_once_max_nodes_reached() {
        let dir = Directory::with_max_nodes(name("A"), addr(3000), 2);
        dir.add(Peer::new(name("B"), addr(3001))).await;
        assert_eq!(dir.size().await, 2);

        dir.add(Peer::new(name("C"), addr(3002))).await;
        assert_eq!(dir.size().await, 2);
        assert!(!dir.exists(&name("C")).await);
    }

    #[tokio::test]
    async fn check_hub_self_wins_trivially_with_no_other_candidates() {
        let dir = Directory::new(name("A"), addr(3000));
        let (hub, _) = dir.check_hub().await;
        assert_eq!(hub, name("A"));
    }

    #[tokio::test]
    async fn check_hub_picks_minimum_sum_among_matching_size() {
        let dir = Directory::new(name("A"), addr(3000));
        dir.add(Peer::new(name("B"), addr(3001))).await;
        dir.add(Peer::new(name("C"), addr(3002))).await;

        // current size = 3 (self + B + C)
        dir.record_self_sum(0.9, 3).await;
        dir.record_peer_sum(&name("B"), 0.5, 3).await;
        dir.record_peer_sum(&name("C"), 0.2, 3).await;

        let (hub, sum) = dir.check_hub().await;
        assert_eq!(hub, name("C"));
        assert_eq!(sum, 0.2);
    }

    #[tokio::test]
    async fn check_hub_ignores_stale_network_size() {
        let dir = Directory::new(name("A"), addr(3000));
        dir.add(Peer::new(name("B"), addr(3001))).await;
        dir.add(Peer::new(name("C"), addr(3002))).await;

        // B reported a sum against an old, smaller network size.
        dir.record_self_sum(0.9, 3).await;
        dir.record_peer_sum(&name("B"), 0.01, 2).await;

        let (hub, _) = dir.check_hub().await;
        assert_eq!(hub, name("A"));
    }

    #[tokio::test]
    async fn ties_prefer_self_then_lexicographic() {
        let dir = Directory::new(name("B"), addr(3000));
        dir.add(Peer::new(name("A"), addr(3001))).await;
        dir.add(Peer::new(name("C"), addr(3002))).await;

        dir.record_self_sum(0.5, 3).await;
        dir.record_peer_sum(&name("A"), 0.5, 3).await;
        dir.record_peer_sum(&name("C"), 0.5, 3).await;

        let (hub, _) = dir.check_hub().await;
        assert_eq!(hub, name("B"));
    }
}
