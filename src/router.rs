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

//! Message router: decode, re-stamp, ack, enqueue, watchdog.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::directory::Directory;
use crate::protocol::{
    AppPayload, DiscoveryPayload, Header, HeartbeatPayload, Message, MessageKey, RttPayload,
    TYPE_ACK,
};
use crate::transport::{RawDatagram, Transport};
use std::sync::Arc;

/// An inbound message, already decoded and matched to a sender address,
/// handed off to a subsystem's queue.
pub struct Inbound<P> {
    pub header: Header,
    pub payload: P,
    pub from: SocketAddr,
}

/// Timestamp of the most recent inbound datagram of any kind. Read by the
/// inactivity watchdog that shuts the node down once it has heard nothing
/// for too long.
pub struct LastContact(Mutex<Instant>);

impl LastContact {
    pub fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    pub fn touch(&self) {
        *self.0.lock().unwrap() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.0.lock().unwrap().elapsed()
    }
}

impl Default for LastContact {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded remembered-message set, application-level dedup for retransmits
/// whose ACK was lost in one direction. Oldest entries fall off once the
/// set exceeds `SEEN_CAPACITY`.
const SEEN_CAPACITY: usize = 4096;

struct SeenSet {
    order: VecDeque<MessageKey>,
    members: HashSet<MessageKey>,
}

impl SeenSet {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(SEEN_CAPACITY),
            members: HashSet::with_capacity(SEEN_CAPACITY),
        }
    }

    /// Returns true if `key` was already seen; otherwise records it.
    fn check_and_insert(&mut self, key: MessageKey) -> bool {
        if self.members.contains(&key) {
            return true;
        }
        if self.order.len() >= SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.members.insert(key);
        false
    }
}

pub struct Router {
    transport: Arc<Transport>,
    directory: Arc<Directory>,
    last_contact: Arc<LastContact>,
    seen: Mutex<SeenSet>,
    discovery_tx: mpsc::UnboundedSender<Inbound<DiscoveryPayload>>,
    heartbeat_tx: mpsc::UnboundedSender<Inbound<HeartbeatPayload>>,
    rtt_tx: mpsc::UnboundedSender<Inbound<RttPayload>>,
    app_tx: mpsc::UnboundedSender<Inbound<AppPayload>>,
}

pub struct RouterQueues {
    pub discovery_rx: mpsc::UnboundedReceiver<Inbound<DiscoveryPayload>>,
    pub heartbeat_rx: mpsc::UnboundedReceiver<Inbound<HeartbeatPayload>>,
    pub rtt_rx: mpsc::UnboundedReceiver<Inbound<RttPayload>>,
    pub app_rx: mpsc::UnboundedReceiver<Inbound<AppPayload>>,
}

impl Router {
    pub fn new(
        transport: Arc<Transport>,
        directory: Arc<Directory>,
        last_contact: Arc<LastContact>,
    ) -> (Self, RouterQueues) {
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let (rtt_tx, rtt_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();

        (
            Self {
                transport,
                directory,
                last_contact,
                seen: Mutex::new(SeenSet::new()),
                discovery_tx,
                heartbeat_tx,
                rtt_tx,
                app_tx,
            },
            RouterQueues {
                discovery_rx,
                heartbeat_rx,
                rtt_rx,
                app_rx,
            },
        )
    }

    /// Consumes raw datagrams off `raw_rx` forever, applying the five-step
    /// pipeline: decode, re-stamp, ack, enqueue, touch watchdog.
    pub async fn run(self: Arc<Self>, mut raw_rx: mpsc::UnboundedReceiver<RawDatagram>) {
        while let Some(RawDatagram { bytes, from }) = raw_rx.recv().await {
            let (header, message) = match Message::decode(&bytes) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::debug!("router: dropping malformed datagram from {from}: {e}");
                    continue;
                }
            };

            self.last_contact.touch();

            if header.type_code == TYPE_ACK {
                if let Message::Ack(ack) = message {
                    self.transport.ack_received(&ack.acked).await;
                }
                continue;
            }

            if self.directory.exists(&header.sender).await {
                self.directory.restamp_addr(&header.sender, from).await;
            }

            let key = MessageKey::from(&header);
            self.transport.send_ack(key.clone(), from).await;

            if self.seen.lock().unwrap().check_and_insert(key) {
                continue;
            }

            match message {
                Message::Discovery(payload) => {
                    let _ = self.discovery_tx.send(Inbound {
                        header,
                        payload,
                        from,
                    });
                }
                Message::Heartbeat(payload) => {
                    let _ = self.heartbeat_tx.send(Inbound {
                        header,
                        payload,
                        from,
                    });
                }
                Message::Rtt(payload) => {
                    let _ = self.rtt_tx.send(Inbound {
                        header,
                        payload,
                        from,
                    });
                }
                Message::App(payload) => {
                    let _ = self.app_tx.send(Inbound {
                        header,
                        payload,
                        from,
                    });
                }
                Message::Ack(_) => unreachable!("handled above"),
            }
        }
    }
}
