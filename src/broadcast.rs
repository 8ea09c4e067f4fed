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

//! Application-message broadcast engine, routed through the elected hub.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::activity_log::ActivityLog;
use crate::directory::Directory;
use crate::election::HubState;
use crate::peer::PeerName;
use crate::protocol::{AppPayload, Message};
use crate::router::Inbound;
use crate::transport::Transport;

pub struct BroadcastEngine {
    transport: Arc<Transport>,
    directory: Arc<Directory>,
    hub: Arc<HubState>,
    log: Arc<ActivityLog>,
}

impl BroadcastEngine {
    pub fn new(
        transport: Arc<Transport>,
        directory: Arc<Directory>,
        hub: Arc<HubState>,
        log: Arc<ActivityLog>,
    ) -> Self {
        Self {
            transport,
            directory,
            hub,
            log,
        }
    }

    /// Originates a broadcast from this node: sends directly to the hub if
    /// someone else holds that role, or fans out immediately if this node
    /// is the hub.
    pub async fn originate_text(&self, data: impl Into<Bytes>) {
        let origin = self.directory.self_name().clone();
        self.originate(AppPayload::text(true, origin, data)).await;
    }

    pub async fn originate_file(&self, file_name: String, data: impl Into<Bytes>) {
        let origin = self.directory.self_name().clone();
        self.originate(AppPayload::file(true, origin, file_name, data))
            .await;
    }

    async fn originate(&self, payload: AppPayload) {
        let (hub_name, _) = self.hub.get();
        if hub_name == *self.directory.self_name() {
            let origin = payload.origin.clone();
            self.fan_out(
                AppPayload {
                    forward: false,
                    origin: payload.origin,
                    file_name: payload.file_name,
                    data: payload.data,
                },
                &origin,
            )
            .await;
            return;
        }
        match self.directory.get_addr(&hub_name).await {
            Ok(addr) => {
                self.transport.send(Message::App(payload), addr).await;
            }
            Err(e) => log::warn!("broadcast: hub {hub_name} unreachable: {e}"),
        }
    }

    /// Consumes the App queue forever. A `forward='1'` message is only
    /// fanned out if we are currently the hub; any other receiver (the
    /// flag is stale, or was never meant for us) just delivers it locally
    /// instead of re-fanning it.
    pub async fn run_inbound(self: Arc<Self>, mut app_rx: mpsc::UnboundedReceiver<Inbound<AppPayload>>) {
        while let Some(Inbound { payload, .. }) = app_rx.recv().await {
            let (hub_name, _) = self.hub.get();
            if payload.forward && hub_name == *self.directory.self_name() {
                let origin = payload.origin.clone();
                self.fan_out(
                    AppPayload {
                        forward: false,
                        origin: payload.origin,
                        file_name: payload.file_name,
                        data: payload.data,
                    },
                    &origin,
                )
                .await;
            } else {
                self.deliver(payload).await;
            }
        }
    }

    /// Relays `payload` (already stamped `forward='0'`) to every live peer
    /// except `origin`, and delivers a copy to ourselves if we are not the
    /// origin.
    async fn fan_out(&self, payload: AppPayload, origin: &PeerName) {
        for peer in self.directory.snapshot_live().await {
            if &peer.name == origin {
                continue;
            }
            self.transport
                .send(Message::App(payload.clone()), peer.addr)
                .await;
        }

        if self.directory.self_name() != origin {
            self.deliver(payload).await;
        }
    }

    async fn deliver(&self, payload: AppPayload) {
        match payload.file_name {
            Some(name) => {
                let out_name = format!("{}-{}", self.directory.self_name(), name);
                match tokio::fs::write(&out_name, &payload.data).await {
                    Ok(()) => {
                        self.log
                            .append(&format!("received file {out_name} from {}", payload.origin))
                            .await;
                    }
                    Err(e) => log::warn!("broadcast: failed to write {out_name}: {e}"),
                }
            }
            None => {
                let text = String::from_utf8_lossy(&payload.data);
                println!("[{}] {}", payload.origin, text);
                self.log
                    .append(&format!("message from {}: {}", payload.origin, text))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use crate::peer::Peer;
    use crate::protocol::{Header, TYPE_APP};
    use tokio::net::UdpSocket;
    use tokio::time::{timeout, Duration};

    fn name(s: &str) -> PeerName {
        PeerName::new(s).unwrap()
    }

    async fn bystander() -> (UdpSocket, std::net::SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn hub_originating_fans_out_with_forward_cleared() {
        let directory = Arc::new(Directory::new(name("HUB"), "127.0.0.1:0".parse().unwrap()));
        let (peer_sock, peer_addr) = bystander().await;
        directory.add(Peer::new(name("P"), peer_addr)).await;

        let transport = Arc::new(Transport::bind(name("HUB"), "127.0.0.1", 0).await.unwrap());
        let hub = Arc::new(HubState::new(name("HUB")));
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(ActivityLog::new_in(tmp.path(), "HUB"));
        let engine = BroadcastEngine::new(transport, directory, hub, log);

        engine.originate_text(b"hello".to_vec()).await;

        let mut buf = [0u8; 1024];
        let (len, _) = timeout(Duration::from_secs(2), peer_sock.recv_from(&mut buf))
            .await
            .expect("peer should have received a fanned-out packet")
            .unwrap();
        let (_, message) = Message::decode(&buf[..len]).unwrap();
        match message {
            Message::App(p) => {
                assert!(!p.forward, "hub fan-out must clear the forward flag");
                assert_eq!(&p.data[..], b"hello");
            }
            _ => panic!("wrong message type"),
        }
    }

    #[tokio::test]
    async fn non_hub_originator_sends_directly_to_hub_with_forward_set() {
        let directory = Arc::new(Directory::new(name("A"), "127.0.0.1:0".parse().unwrap()));
        let (hub_sock, hub_addr) = bystander().await;
        directory.add(Peer::new(name("HUB"), hub_addr)).await;

        let transport = Arc::new(Transport::bind(name("A"), "127.0.0.1", 0).await.unwrap());
        let hub = Arc::new(HubState::new(name("HUB")));
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(ActivityLog::new_in(tmp.path(), "A"));
        let engine = BroadcastEngine::new(transport, directory, hub, log);

        engine.originate_text(b"hi".to_vec()).await;

        let mut buf = [0u8; 1024];
        let (len, _) = timeout(Duration::from_secs(2), hub_sock.recv_from(&mut buf))
            .await
            .expect("hub should have received the direct-send")
            .unwrap();
        let (header, message) = Message::decode(&buf[..len]).unwrap();
        assert_eq!(header.sender, name("A"));
        match message {
            Message::App(p) => assert!(p.forward, "non-hub originator must ask the hub to forward"),
            _ => panic!("wrong message type"),
        }
    }

    /// Regression test: a non-hub receiver that gets a stale/foreign
    /// `forward='1'` packet must deliver it locally rather than re-fanning
    /// it out to its own peers.
    #[tokio::test]
    async fn non_hub_receiver_does_not_refan_forwarded_message() {
        let directory = Arc::new(Directory::new(name("B"), "127.0.0.1:0".parse().unwrap()));
        let (bystander_sock, bystander_addr) = bystander().await;
        directory.add(Peer::new(name("C"), bystander_addr)).await;

        let transport = Arc::new(Transport::bind(name("B"), "127.0.0.1", 0).await.unwrap());
        // self ("B") is explicitly not the hub.
        let hub = Arc::new(HubState::new(name("HUBX")));
        let tmp = tempfile::tempdir().unwrap();
        let log = Arc::new(ActivityLog::new_in(tmp.path(), "B"));
        let engine = Arc::new(BroadcastEngine::new(transport, directory, hub, log));

        let (app_tx, app_rx) = mpsc::unbounded_channel();
        tokio::spawn(engine.clone().run_inbound(app_rx));

        app_tx
            .send(Inbound {
                header: Header::new(TYPE_APP, name("A"), 1),
                payload: AppPayload::text(true, name("A"), b"hello".to_vec()),
                from: "127.0.0.1:1".parse().unwrap(),
            })
            .unwrap();

        let mut buf = [0u8; 1024];
        let result = timeout(Duration::from_millis(500), bystander_sock.recv_from(&mut buf)).await;
        assert!(
            result.is_err(),
            "a non-hub receiver must not re-fan a forward='1' message"
        );
    }
}
