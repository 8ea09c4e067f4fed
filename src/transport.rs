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

//! Reliable-datagram layer over a single UDP socket.
//!
//! Three long-running activities, one queue each, matching the teacher's
//! shape of a dedicated task per channel: the recv loop forwards raw
//! datagrams to the router, the send loop drains the outbox to the wire,
//! and the retransmit scanner walks the oldest-first pending-ACK queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::error::{StarNetError, StarNetResult};
use crate::peer::PeerName;
use crate::protocol::{Message, MessageId, MessageKey, TYPE_ACK};

/// Datagrams up to this size are accepted.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Oldest pending entry older than this is due for retransmission.
const ACK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Retransmit scanner sleep between scans.
const RETRANSMIT_SCAN_INTERVAL: Duration = Duration::from_millis(300);

/// A message is retried at most this many times before being dropped.
const MAX_RETRANSMITS: u8 = 5;

struct PendingAck {
    key: MessageKey,
    bytes: Bytes,
    dest: SocketAddr,
    last_sent: Instant,
    retransmits: u8,
}

/// A raw inbound datagram, handed to the router for decoding.
pub struct RawDatagram {
    pub bytes: Bytes,
    pub from: SocketAddr,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    self_name: PeerName,
    next_id: AtomicU64,
    outbox_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>>,
    pending: Mutex<VecDeque<PendingAck>>,
}

impl Transport {
    pub async fn bind(self_name: PeerName, host: &str, port: u16) -> StarNetResult<Self> {
        let addr = format!("{host}:{port}");
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| StarNetError::BindFailed {
                addr: addr.clone(),
                source,
            })?;

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket: Arc::new(socket),
            self_name,
            next_id: AtomicU64::new(0),
            outbox_tx,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub fn local_addr(&self) -> StarNetResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn next_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueues `message` for transmission to `dest`. Non-ACK messages are
    /// also recorded into the pending-ACK set so they get retransmitted
    /// until acknowledged.
    pub async fn send(&self, message: Message, dest: SocketAddr) -> MessageId {
        let id = self.next_id();
        let type_code = message.type_code();
        let bytes = message.encode(self.self_name.clone(), id);
        let key = MessageKey {
            sender: self.self_name.clone(),
            uuid: (id % 10_000) as u16,
        };

        if type_code != TYPE_ACK {
            let mut pending = self.pending.lock().await;
            pending.push_back(PendingAck {
                key,
                bytes: bytes.clone(),
                dest,
                last_sent: Instant::now(),
                retransmits: 0,
            });
        }

        let _ = self.outbox_tx.send((bytes, dest));
        id
    }

    /// Sends a pre-keyed ack without touching the pending-ACK set.
    pub async fn send_ack(&self, acked: MessageKey, dest: SocketAddr) {
        let id = self.next_id();
        let bytes = Message::Ack(crate::protocol::AckPayload::new(acked)).encode(self.self_name.clone(), id);
        let _ = self.outbox_tx.send((bytes, dest));
    }

    /// Removes a pending entry whose key matches an inbound ACK. Unmatched
    /// ACKs are dropped silently.
    pub async fn ack_received(&self, key: &MessageKey) {
        let mut pending = self.pending.lock().await;
        if let Some(pos) = pending.iter().position(|p| &p.key == key) {
            pending.remove(pos);
        }
    }

    /// Blocks forever reading datagrams and forwarding them to `out`.
    pub async fn run_recv_loop(self: Arc<Self>, out: mpsc::UnboundedSender<RawDatagram>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let bytes = Bytes::copy_from_slice(&buf[..len]);
                    if out.send(RawDatagram { bytes, from }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("transport: recv_from failed: {e}");
                }
            }
        }
    }

    /// Blocks forever draining the outbox to the wire.
    pub async fn run_send_loop(self: Arc<Self>) {
        let mut rx = self
            .outbox_rx
            .lock()
            .await
            .take()
            .expect("run_send_loop called more than once");

        while let Some((bytes, dest)) = rx.recv().await {
            if let Err(e) = self.socket.send_to(&bytes, dest).await {
                log::warn!("transport: send_to {dest} failed: {e}");
            }
        }
    }

    /// Blocks forever inspecting the oldest pending-ACK entry, retransmitting
    /// or dropping it once its retransmit budget is exhausted.
    pub async fn run_retransmit_loop(self: Arc<Self>) {
        loop {
            sleep(RETRANSMIT_SCAN_INTERVAL).await;

            let due = {
                let mut pending = self.pending.lock().await;
                match pending.front() {
                    Some(front) if front.last_sent.elapsed() > ACK_TIMEOUT => pending.pop_front(),
                    _ => None,
                }
            };

            let Some(mut entry) = due else { continue };

            entry.retransmits += 1;
            if entry.retransmits >= MAX_RETRANSMITS {
                log::warn!(
                    "transport: dropping message to {} after {} retransmits",
                    entry.dest,
                    entry.retransmits
                );
                continue;
            }

            entry.last_sent = Instant::now();
            let _ = self.outbox_tx.send((entry.bytes.clone(), entry.dest));
            self.pending.lock().await.push_back(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HeartbeatPayload;

    #[tokio::test]
    async fn send_records_pending_ack_for_non_ack_messages() {
        let transport = Transport::bind(PeerName::new("A").unwrap(), "127.0.0.1", 0)
            .await
            .unwrap();
        let dest = "127.0.0.1:4000".parse().unwrap();

        transport
            .send(Message::Heartbeat(HeartbeatPayload::ping()), dest)
            .await;

        assert_eq!(transport.pending.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn ack_received_clears_matching_pending_entry() {
        let transport = Transport::bind(PeerName::new("A").unwrap(), "127.0.0.1", 0)
            .await
            .unwrap();
        let dest = "127.0.0.1:4001".parse().unwrap();

        transport
            .send(Message::Heartbeat(HeartbeatPayload::ping()), dest)
            .await;
        let key = transport.pending.lock().await.front().unwrap().key.clone();

        transport.ack_received(&key).await;

        assert!(transport.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unmatched_ack_is_a_noop() {
        let transport = Transport::bind(PeerName::new("A").unwrap(), "127.0.0.1", 0)
            .await
            .unwrap();
        let dest = "127.0.0.1:4002".parse().unwrap();
        transport
            .send(Message::Heartbeat(HeartbeatPayload::ping()), dest)
            .await;

        transport
            .ack_received(&MessageKey {
                sender: PeerName::new("Z").unwrap(),
                uuid: 9999,
            })
            .await;

        assert_eq!(transport.pending.lock().await.len(), 1);
    }
}
