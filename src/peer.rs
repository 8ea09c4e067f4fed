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

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{StarNetError, StarNetResult};

/// Wire width of a peer name field: 16 bytes, space-padded.
pub const NAME_WIDTH: usize = 16;

/// A peer's identity. Immutable once constructed, ASCII, 1-16 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerName(String);

impl PeerName {
    pub fn new(name: impl Into<String>) -> StarNetResult<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > NAME_WIDTH {
            return Err(StarNetError::NameTooLong(name));
        }
        Ok(Self(name))
    }

    /// Left-pads the name with spaces to exactly 16 bytes for the wire,
    /// space-padded and right-justified.
    pub fn to_wire_bytes(&self) -> [u8; NAME_WIDTH] {
        let mut buf = [b' '; NAME_WIDTH];
        let bytes = self.0.as_bytes();
        buf[NAME_WIDTH - bytes.len()..].copy_from_slice(bytes);
        buf
    }

    /// Parses a 16-byte space-padded, right-justified wire field back into
    /// a name.
    pub fn from_wire_bytes(bytes: &[u8; NAME_WIDTH]) -> StarNetResult<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| StarNetError::MalformedPacket)?;
        Self::new(text.trim_start())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record of a known peer: identity, address, liveness, and the last
/// RTT/election state reported for it.
///
/// Invariants: `name` never changes after construction; a dead peer is
/// never handed to the outbound send path; a peer reappearing with the
/// same name revives the existing record rather than creating a new one.
#[derive(Debug, Clone)]
pub struct Peer {
    pub name: PeerName,
    pub addr: SocketAddr,
    pub live: bool,
    pub last_heartbeat: Instant,
    pub last_rtt: Option<f64>,
    pub last_rtt_sum: Option<f64>,
    pub last_network_size: Option<u8>,
}

impl Peer {
    pub fn new(name: PeerName, addr: SocketAddr) -> Self {
        Self {
            name,
            addr,
            live: true,
            last_heartbeat: Instant::now(),
            last_rtt: None,
            last_rtt_sum: None,
            last_network_size: None,
        }
    }

    /// Revives a previously-dead peer: live again, heartbeat stamped,
    /// RTT/election state reset (it is stale relative to the new session).
    pub fn revive(&mut self) {
        self.live = true;
        self.last_heartbeat = Instant::now();
        self.last_rtt = None;
        self.last_rtt_sum = None;
        self.last_network_size = None;
    }

    pub fn is_unresponsive(&self, timeout: std::time::Duration) -> bool {
        self.last_heartbeat.elapsed() > timeout
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }
}

/// `{name, ip, port}` as gossiped in a Discovery reply payload.
/// Serialization boundary only — `Peer` itself never derives Serialize
/// directly because it carries non-serializable runtime state (`Instant`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl PeerRecord {
    pub fn from_peer(peer: &Peer) -> Self {
        Self {
            name: peer.name.as_str().to_string(),
            ip: peer.addr.ip().to_string(),
            port: peer.addr.port(),
        }
    }

    pub fn to_addr(&self) -> StarNetResult<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| StarNetError::MalformedPacket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_through_wire_bytes() {
        let name = PeerName::new("A").unwrap();
        let wire = name.to_wire_bytes();
        assert_eq!(&wire, b"               A");
        assert_eq!(PeerName::from_wire_bytes(&wire).unwrap(), name);
    }

    #[test]
    fn name_too_long_rejected() {
        assert!(PeerName::new("this-name-is-way-too-long").is_err());
    }

    #[test]
    fn revive_resets_rtt_state() {
        let mut peer = Peer::new(PeerName::new("B").unwrap(), "127.0.0.1:3000".parse().unwrap());
        peer.live = false;
        peer.last_rtt = Some(0.1);
        peer.last_rtt_sum = Some(1.2);
        peer.last_network_size = Some(3);

        peer.revive();

        assert!(peer.live);
        assert!(peer.last_rtt.is_none());
        assert!(peer.last_rtt_sum.is_none());
        assert!(peer.last_network_size.is_none());
    }
}
