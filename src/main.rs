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

mod activity_log;
mod broadcast;
mod config;
mod directory;
mod discovery;
mod election;
mod error;
mod heartbeat;
mod peer;
mod protocol;
mod router;
mod transport;

use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;

use activity_log::ActivityLog;
use broadcast::BroadcastEngine;
use config::{Cli, NodeConfig};
use directory::Directory;
use discovery::DiscoveryEngine;
use election::{ElectionEngine, ElectionScheduler, HubState};
use heartbeat::FailureDetector;
use router::{LastContact, Router};
use transport::Transport;

/// After this long with no inbound packet of any type, the node exits.
const NO_CONTACT_TIMEOUT: Duration = Duration::from_secs(180);
const WATCHDOG_POLL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let config = match NodeConfig::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

/// The node's own address as advertised to peers: this host's outbound IP
/// plus the configured local port, discovered by connecting a scratch UDP
/// socket outward and reading back the local address the kernel picked.
fn self_ip() -> std::io::Result<IpAddr> {
    let probe = StdUdpSocket::bind("0.0.0.0:0")?;
    probe.connect("8.8.8.8:80")?;
    Ok(probe.local_addr()?.ip())
}

async fn run(config: NodeConfig) -> error::StarNetResult<ExitCode> {
    let self_ip = self_ip().unwrap_or(IpAddr::from([127, 0, 0, 1]));
    let self_addr = SocketAddr::new(self_ip, config.local_port);

    let transport = Arc::new(Transport::bind(config.name.clone(), "0.0.0.0", config.local_port).await?);
    let directory = Arc::new(Directory::with_max_nodes(
        config.name.clone(),
        self_addr,
        config.max_nodes,
    ));
    let log = Arc::new(ActivityLog::new(config.name.as_str()));
    let scheduler = Arc::new(ElectionScheduler::new());
    let hub = Arc::new(HubState::new(config.name.clone()));
    let last_contact = Arc::new(LastContact::new());

    log.append(&format!(
        "node {} listening on {} (max_nodes={})",
        config.name, self_addr, config.max_nodes
    ))
    .await;

    let (router, queues) = Router::new(transport.clone(), directory.clone(), last_contact.clone());
    let router = Arc::new(router);

    let discovery = Arc::new(DiscoveryEngine::new(
        transport.clone(),
        directory.clone(),
        scheduler.clone(),
        log.clone(),
        config.poc,
    ));
    let failure_detector = Arc::new(FailureDetector::new(
        transport.clone(),
        directory.clone(),
        scheduler.clone(),
        log.clone(),
    ));
    let election = Arc::new(ElectionEngine::new(
        transport.clone(),
        directory.clone(),
        scheduler.clone(),
        hub.clone(),
    ));
    let broadcast = Arc::new(BroadcastEngine::new(
        transport.clone(),
        directory.clone(),
        hub.clone(),
        log.clone(),
    ));

    let (raw_tx, raw_rx) = mpsc::unbounded_channel();

    tokio::spawn(transport.clone().run_recv_loop(raw_tx));
    tokio::spawn(transport.clone().run_send_loop());
    tokio::spawn(transport.clone().run_retransmit_loop());
    tokio::spawn(router.clone().run(raw_rx));

    tokio::spawn(discovery.clone().run_inbound(queues.discovery_rx));
    tokio::spawn(discovery.clone().run_bootstrap());

    tokio::spawn(failure_detector.clone().run_ping_loop());
    tokio::spawn(failure_detector.clone().run_timeout_loop());
    tokio::spawn(failure_detector.clone().run_inbound(queues.heartbeat_rx));

    tokio::spawn(election.clone().run_inbound(queues.rtt_rx));
    tokio::spawn(election.clone().run_scheduler());

    tokio::spawn(broadcast.clone().run_inbound(queues.app_rx));

    let watchdog_contact = last_contact.clone();
    let watchdog_log = log.clone();
    let watchdog_name = config.name.clone();
    tokio::spawn(async move {
        loop {
            sleep(WATCHDOG_POLL).await;
            if watchdog_contact.elapsed() > NO_CONTACT_TIMEOUT {
                watchdog_log
                    .append(&format!(
                        "{watchdog_name}: no contact for over {}s, exiting",
                        NO_CONTACT_TIMEOUT.as_secs()
                    ))
                    .await;
                std::process::exit(1);
            }
        }
    });

    run_shell(directory, transport, broadcast, log, hub).await
}

/// Reads whitespace-tokenised commands from stdin until `disconnect` or
/// EOF.
async fn run_shell(
    directory: Arc<Directory>,
    transport: Arc<Transport>,
    broadcast: Arc<BroadcastEngine>,
    log: Arc<ActivityLog>,
    hub: Arc<HubState>,
) -> error::StarNetResult<ExitCode> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("send") => {
                let rest: Vec<&str> = tokens.collect();
                handle_send(&rest, &broadcast).await;
            }
            Some("show-status") => show_status(&directory, &hub).await,
            Some("show-log") => println!("{}", log.read_all().await),
            Some("disconnect") => {
                announce_disconnect(&directory, &transport).await;
                log.append("disconnecting").await;
                return Ok(ExitCode::SUCCESS);
            }
            Some(other) => {
                println!("unknown command: {other} (expected send/show-status/show-log/disconnect)");
            }
            None => {}
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Announces departure to every live peer. No acknowledgement is awaited;
/// stragglers are left to the failure detector.
async fn announce_disconnect(directory: &Directory, transport: &Transport) {
    for peer in directory.snapshot_live().await {
        transport
            .send(
                protocol::Message::Discovery(protocol::DiscoveryPayload::disconnect_notice()),
                peer.addr,
            )
            .await;
    }
}

async fn handle_send(tokens: &[&str], broadcast: &BroadcastEngine) {
    let Some(first) = tokens.first() else {
        println!("usage: send <text...> | send <path>");
        return;
    };

    if Path::new(first).is_file() {
        match tokio::fs::read(first).await {
            Ok(data) => {
                let file_name = Path::new(first)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| first.to_string());
                broadcast.originate_file(file_name, data).await;
            }
            Err(e) => println!("failed to read {first}: {e}"),
        }
        return;
    }

    let text = tokens.join(" ");
    broadcast.originate_text(text.into_bytes()).await;
}

async fn show_status(directory: &Directory, hub: &HubState) {
    let live = directory.snapshot_live().await;
    println!("{:<16} {:>10}", "peer", "rtt(s)");
    let mut shortest: Option<f64> = None;
    for peer in &live {
        match peer.last_rtt {
            Some(rtt) => {
                println!("{:<16} {:>10.4}", peer.name.as_str(), rtt);
                shortest = Some(shortest.map_or(rtt, |s: f64| s.min(rtt)));
            }
            None => println!("{:<16} {:>10}", peer.name.as_str(), "-"),
        }
    }

    match shortest {
        Some(rtt) => println!("shortest RTT: {rtt:.4}s"),
        None => println!("shortest RTT: n/a"),
    }

    match directory.self_sum().await {
        Some((sum, _)) => println!("self RTT-sum: {sum:.4}"),
        None => println!("self RTT-sum: n/a"),
    }

    let (hub_name, hub_sum) = hub.get();
    println!("hub: {hub_name} (sum {hub_sum:.4})");
}
