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

//! RTT measurement and hub election.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use std::sync::Arc;

use crate::directory::Directory;
use crate::peer::PeerName;
use crate::protocol::RttPayload;
use crate::router::Inbound;
use crate::transport::Transport;

pub(crate) const JOIN_DELAY: Duration = Duration::from_secs(3);
const OPPORTUNISTIC_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const COLLECT_WINDOW: Duration = Duration::from_secs(6);
const POLL_GRANULARITY: Duration = Duration::from_millis(500);

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The countdown controlling when the next election round fires. Any
/// membership change pulls it in to `now + 3s`; a completed round rearms it
/// to `now + 60s` for opportunistic re-measurement; a timed-out round
/// reschedules for `now + 1s`.
pub struct ElectionScheduler {
    fire_at: StdMutex<Instant>,
}

impl ElectionScheduler {
    pub fn new() -> Self {
        Self {
            fire_at: StdMutex::new(Instant::now() + OPPORTUNISTIC_INTERVAL),
        }
    }

    pub fn trigger_on_membership_change(&self) {
        *self.fire_at.lock().unwrap() = Instant::now() + JOIN_DELAY;
    }

    fn rearm_opportunistic(&self) {
        *self.fire_at.lock().unwrap() = Instant::now() + OPPORTUNISTIC_INTERVAL;
    }

    fn retry_soon(&self) {
        *self.fire_at.lock().unwrap() = Instant::now() + RETRY_DELAY;
    }

    fn due(&self) -> bool {
        Instant::now() >= *self.fire_at.lock().unwrap()
    }

    /// Seconds until the countdown elapses (negative once past due), for
    /// tests elsewhere in the crate to assert which branch fired without
    /// reaching into the private `fire_at` field.
    #[cfg(test)]
    pub(crate) fn seconds_until_due(&self) -> f64 {
        let fire_at = *self.fire_at.lock().unwrap();
        fire_at.saturating_duration_since(Instant::now()).as_secs_f64()
    }
}

impl Default for ElectionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// The locally-known elected hub: name and its RTT-sum, kept current by
/// both the round protocol (step 6) and inbound stage='2' handling.
pub struct HubState {
    current: StdMutex<(PeerName, f64)>,
}

impl HubState {
    pub fn new(self_name: PeerName) -> Self {
        Self {
            current: StdMutex::new((self_name, 0.0)),
        }
    }

    pub fn get(&self) -> (PeerName, f64) {
        self.current.lock().unwrap().clone()
    }

    fn set(&self, hub: (PeerName, f64)) {
        *self.current.lock().unwrap() = hub;
    }
}

struct RttReply {
    sender: PeerName,
    at: Instant,
}

pub struct ElectionEngine {
    transport: Arc<Transport>,
    directory: Arc<Directory>,
    scheduler: Arc<ElectionScheduler>,
    hub: Arc<HubState>,
    reply_tx: mpsc::UnboundedSender<RttReply>,
    reply_rx: Mutex<mpsc::UnboundedReceiver<RttReply>>,
}

impl ElectionEngine {
    pub fn new(
        transport: Arc<Transport>,
        directory: Arc<Directory>,
        scheduler: Arc<ElectionScheduler>,
        hub: Arc<HubState>,
    ) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            directory,
            scheduler,
            hub,
            reply_tx,
            reply_rx: Mutex::new(reply_rx),
        }
    }

    /// Polls the countdown and runs a round whenever it elapses.
    pub async fn run_scheduler(self: Arc<Self>) {
        loop {
            sleep(POLL_GRANULARITY).await;
            if self.scheduler.due() {
                self.run_round().await;
            }
        }
    }

    /// Consumes the RTT queue forever: replies to probes, feeds stage='1'
    /// replies to whichever round is currently collecting, and applies
    /// stage='2' broadcasts to the directory.
    pub async fn run_inbound(
        self: Arc<Self>,
        mut rtt_rx: mpsc::UnboundedReceiver<Inbound<RttPayload>>,
    ) {
        while let Some(Inbound {
            header,
            payload,
            from,
        }) = rtt_rx.recv().await
        {
            match payload {
                RttPayload::Probe { .. } => {
                    self.transport
                        .send(
                            crate::protocol::Message::Rtt(RttPayload::Reply {
                                send_time: epoch_now(),
                            }),
                            from,
                        )
                        .await;
                }
                RttPayload::Reply { .. } => {
                    let _ = self.reply_tx.send(RttReply {
                        sender: header.sender,
                        at: Instant::now(),
                    });
                }
                RttPayload::Sum {
                    network_size,
                    rtt_sum,
                } => {
                    self.directory
                        .record_peer_sum(&header.sender, rtt_sum, network_size)
                        .await;
                    let hub = self.directory.check_hub().await;
                    self.hub.set(hub);
                }
            }
        }
    }

    /// One election round: snapshot, probe, collect, compute, broadcast,
    /// elect.
    async fn run_round(&self) {
        let live = self.directory.snapshot_live().await;
        if live.is_empty() {
            self.hub.set(self.directory.check_hub().await);
            self.scheduler.rearm_opportunistic();
            return;
        }

        // Discard any reply left over from a round that already gave up
        // waiting for it; otherwise it would be mistaken for an answer to
        // this round's probes below, with a send time from the past.
        {
            let mut reply_rx = self.reply_rx.lock().await;
            while reply_rx.try_recv().is_ok() {}
        }

        let mut send_times = HashMap::with_capacity(live.len());
        for peer in &live {
            send_times.insert(peer.name.clone(), Instant::now());
            self.transport
                .send(
                    crate::protocol::Message::Rtt(RttPayload::Probe {
                        send_time: epoch_now(),
                    }),
                    peer.addr,
                )
                .await;
        }

        let mut rtts: HashMap<PeerName, f64> = HashMap::with_capacity(live.len());
        let deadline = Instant::now() + COLLECT_WINDOW;
        let mut reply_rx = self.reply_rx.lock().await;

        while rtts.len() < send_times.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, reply_rx.recv()).await {
                Ok(Some(reply)) => {
                    if let Some(sent_at) = send_times.get(&reply.sender) {
                        rtts.entry(reply.sender)
                            .or_insert_with(|| reply.at.saturating_duration_since(*sent_at).as_secs_f64());
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        drop(reply_rx);

        if rtts.len() < send_times.len() {
            log::debug!(
                "election: round timed out with {}/{} replies",
                rtts.len(),
                send_times.len()
            );
            self.scheduler.retry_soon();
            return;
        }

        for (name, rtt) in &rtts {
            self.directory.record_rtt(name, *rtt).await;
        }

        let sum: f64 = rtts.values().sum();
        let network_size = (live.len() + 1) as u8;
        self.directory.record_self_sum(sum, network_size).await;

        for peer in &live {
            self.transport
                .send(
                    crate::protocol::Message::Rtt(RttPayload::Sum {
                        network_size,
                        rtt_sum: sum,
                    }),
                    peer.addr,
                )
                .await;
        }

        let hub = self.directory.check_hub().await;
        self.hub.set(hub);
        self.scheduler.rearm_opportunistic();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use crate::peer::Peer;
    use crate::router::{LastContact, Router};
    use tokio::net::UdpSocket;

    fn name(s: &str) -> PeerName {
        PeerName::new(s).unwrap()
    }

    #[test]
    fn trigger_on_membership_change_pulls_countdown_in_to_about_3s() {
        let scheduler = ElectionScheduler::new();
        scheduler.trigger_on_membership_change();
        let secs = scheduler.seconds_until_due();
        assert!(secs > 0.0 && secs <= JOIN_DELAY.as_secs_f64(), "expected ~3s countdown, got {secs}");
    }

    #[test]
    fn fresh_scheduler_starts_armed_for_opportunistic_interval() {
        let scheduler = ElectionScheduler::new();
        let secs = scheduler.seconds_until_due();
        assert!(secs > JOIN_DELAY.as_secs_f64(), "expected >3s countdown, got {secs}");
    }

    /// End-to-end round: self probes a single live peer over real loopback
    /// sockets, the peer answers with a stage-1 reply, and the round
    /// computes a sum and elects self as the sole hub candidate.
    #[tokio::test]
    async fn round_computes_sum_and_elects_self_with_one_responsive_peer() {
        let directory = Arc::new(Directory::new(name("A"), "127.0.0.1:0".parse().unwrap()));

        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();
        directory.add(Peer::new(name("B"), peer_addr)).await;

        // Bare-bones stand-in for peer "B": answers every RTT probe with a
        // stage-1 reply.
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((len, from)) = peer_socket.recv_from(&mut buf).await else {
                    return;
                };
                if let Ok((_, Message::Rtt(RttPayload::Probe { .. }))) = Message::decode(&buf[..len]) {
                    let reply = Message::Rtt(RttPayload::Reply { send_time: epoch_now() }).encode(name("B"), 1);
                    let _ = peer_socket.send_to(&reply, from).await;
                }
            }
        });

        let transport = Arc::new(Transport::bind(name("A"), "127.0.0.1", 0).await.unwrap());
        let last_contact = Arc::new(LastContact::new());
        let (router, queues) = Router::new(transport.clone(), directory.clone(), last_contact);
        let router = Arc::new(router);

        let scheduler = Arc::new(ElectionScheduler::new());
        let hub = Arc::new(HubState::new(name("A")));
        let engine = Arc::new(ElectionEngine::new(transport.clone(), directory.clone(), scheduler, hub.clone()));

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        tokio::spawn(transport.clone().run_recv_loop(raw_tx));
        tokio::spawn(transport.clone().run_send_loop());
        tokio::spawn(router.run(raw_rx));
        tokio::spawn(engine.clone().run_inbound(queues.rtt_rx));

        engine.run_round().await;

        let (hub_name, _) = hub.get();
        assert_eq!(hub_name, name("A"));
        let (sum, size) = directory.self_sum().await.expect("self sum should be recorded");
        assert!(sum >= 0.0);
        assert_eq!(size, 2);
    }
}
