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

//! Failure detector: heartbeat ping/timeout loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::activity_log::ActivityLog;
use crate::directory::Directory;
use crate::election::ElectionScheduler;
use crate::protocol::{HeartbeatPayload, Message};
use crate::router::Inbound;
use crate::transport::Transport;

const PING_INTERVAL: Duration = Duration::from_secs(3);
const TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Peers unresponsive longer than this are evicted. Chosen above two ping
/// intervals so a single lost ping does not cause a false eviction.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(7);

pub struct FailureDetector {
    transport: Arc<Transport>,
    directory: Arc<Directory>,
    scheduler: Arc<ElectionScheduler>,
    log: Arc<ActivityLog>,
}

impl FailureDetector {
    pub fn new(
        transport: Arc<Transport>,
        directory: Arc<Directory>,
        scheduler: Arc<ElectionScheduler>,
        log: Arc<ActivityLog>,
    ) -> Self {
        Self {
            transport,
            directory,
            scheduler,
            log,
        }
    }

    /// Every `PING_INTERVAL`, sends a one-shot ping to every live peer.
    /// Liveness is proven by the pong, not by the ping itself.
    pub async fn run_ping_loop(self: Arc<Self>) {
        loop {
            sleep(PING_INTERVAL).await;
            for peer in self.directory.snapshot_live().await {
                self.transport
                    .send(Message::Heartbeat(HeartbeatPayload::ping()), peer.addr)
                    .await;
            }
        }
    }

    /// Every `TIMEOUT_SCAN_INTERVAL`, evicts peers that have gone quiet for
    /// longer than `HEARTBEAT_TIMEOUT` and schedules a re-election.
    pub async fn run_timeout_loop(self: Arc<Self>) {
        loop {
            sleep(TIMEOUT_SCAN_INTERVAL).await;
            for peer in self.directory.snapshot_live().await {
                if peer.is_unresponsive(HEARTBEAT_TIMEOUT) {
                    self.directory.remove(&peer.name).await;
                    self.log
                        .append(&format!("evicted unresponsive peer {}", peer.name))
                        .await;
                    self.scheduler.trigger_on_membership_change();
                }
            }
        }
    }

    /// Consumes the heartbeat queue forever: pings get a pong, pongs bump
    /// the sender's last-heartbeat stamp.
    pub async fn run_inbound(
        self: Arc<Self>,
        mut heartbeat_rx: mpsc::UnboundedReceiver<Inbound<HeartbeatPayload>>,
    ) {
        while let Some(Inbound {
            header,
            payload,
            from,
        }) = heartbeat_rx.recv().await
        {
            if payload.is_pong {
                self.directory.restamp_addr(&header.sender, from).await;
                self.directory.touch_heartbeat(&header.sender).await;
            } else {
                self.transport
                    .send(Message::Heartbeat(HeartbeatPayload::pong()), from)
                    .await;
            }
        }
    }
}
