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

//! Membership / peer-discovery engine: point-of-contact bootstrap and
//! gossip.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::activity_log::ActivityLog;
use crate::directory::Directory;
use crate::election::ElectionScheduler;
use crate::peer::PeerName;
use crate::protocol::{DiscoveryPayload, Message};
use crate::router::Inbound;
use crate::transport::Transport;

const BOOTSTRAP_RETRY: Duration = Duration::from_secs(2);

pub struct DiscoveryEngine {
    transport: Arc<Transport>,
    directory: Arc<Directory>,
    scheduler: Arc<ElectionScheduler>,
    log: Arc<ActivityLog>,
    poc: Option<SocketAddr>,
}

impl DiscoveryEngine {
    pub fn new(
        transport: Arc<Transport>,
        directory: Arc<Directory>,
        scheduler: Arc<ElectionScheduler>,
        log: Arc<ActivityLog>,
        poc: Option<SocketAddr>,
    ) -> Self {
        Self {
            transport,
            directory,
            scheduler,
            log,
            poc,
        }
    }

    /// Sends stage-0 Discovery to the configured point of contact every
    /// `BOOTSTRAP_RETRY` until it has answered. A no-op if this node has no
    /// PoC (it is the bootstrap itself).
    pub async fn run_bootstrap(self: Arc<Self>) {
        let Some(poc) = self.poc else { return };

        while self.directory.poc_not_yet_known(poc).await {
            self.transport
                .send(Message::Discovery(DiscoveryPayload::request()), poc)
                .await;
            sleep(BOOTSTRAP_RETRY).await;
        }
    }

    /// Consumes the Discovery queue forever.
    pub async fn run_inbound(
        self: Arc<Self>,
        mut discovery_rx: mpsc::UnboundedReceiver<Inbound<DiscoveryPayload>>,
    ) {
        while let Some(Inbound {
            header,
            payload,
            from,
        }) = discovery_rx.recv().await
        {
            if payload.disconnect {
                self.directory.remove(&header.sender).await;
                self.log
                    .append(&format!("{} disconnected", header.sender))
                    .await;
                self.scheduler.trigger_on_membership_change();
                continue;
            }

            if payload.direction_reply {
                self.handle_reply(header.sender, payload, from).await;
            } else {
                self.handle_request(header.sender, from).await;
            }
        }
    }

    async fn handle_request(&self, sender: PeerName, from: SocketAddr) {
        let known_already = self.directory.exists(&sender).await;

        let snapshot = self.directory.serialize_live().await;
        self.transport
            .send(Message::Discovery(DiscoveryPayload::reply(snapshot)), from)
            .await;

        if !known_already {
            // Handshake completion: the requester doesn't yet know us by
            // name either, so introduce ourselves symmetrically.
            self.transport
                .send(Message::Discovery(DiscoveryPayload::request()), from)
                .await;
        }
    }

    async fn handle_reply(&self, _sender: PeerName, payload: DiscoveryPayload, _from: SocketAddr) {
        match self.directory.merge(payload.peers).await {
            Ok(discovered) => {
                for name in &discovered {
                    self.log.append(&format!("discovered peer {name}")).await;
                }
                self.scheduler.trigger_on_membership_change();
            }
            Err(e) => log::debug!("discovery: malformed gossip payload: {e}"),
        }
    }
}
