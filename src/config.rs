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

//! CLI configuration: `name local_port poc_host poc_port max_nodes`.

use std::net::{SocketAddr, ToSocketAddrs};

use clap::Parser;

use crate::error::{StarNetError, StarNetResult};
use crate::peer::PeerName;

#[derive(Parser, Debug)]
#[command(name = "starnet-node", about = "Self-organizing UDP star overlay node")]
pub struct Cli {
    /// This node's identity, 1-16 ASCII bytes.
    pub name: String,

    /// UDP port this node listens on.
    pub local_port: u16,

    /// Point-of-contact host. "0" means this node has no PoC.
    pub poc_host: String,

    /// Point-of-contact port. 0 means this node has no PoC.
    pub poc_port: u16,

    /// Upper bound on the number of nodes this overlay will ever hold.
    pub max_nodes: u8,
}

/// Resolved, validated configuration for one node.
pub struct NodeConfig {
    pub name: PeerName,
    pub local_port: u16,
    pub poc: Option<SocketAddr>,
    pub max_nodes: u8,
}

impl NodeConfig {
    pub fn from_cli(cli: Cli) -> StarNetResult<Self> {
        let name = PeerName::new(cli.name)?;

        let poc = if cli.poc_host == "0" || cli.poc_port == 0 {
            None
        } else {
            // `to_socket_addrs` resolves hostnames (e.g. "localhost") as well
            // as literal IPs, unlike a plain `SocketAddr` parse.
            let addr = (cli.poc_host.as_str(), cli.poc_port)
                .to_socket_addrs()
                .map_err(StarNetError::IoError)?
                .next()
                .ok_or(StarNetError::MalformedPacket)?;
            Some(addr)
        };

        Ok(Self {
            name,
            local_port: cli.local_port,
            poc,
            max_nodes: cli.max_nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(poc_host: &str, poc_port: u16) -> Cli {
        Cli {
            name: "A".to_string(),
            local_port: 3000,
            poc_host: poc_host.to_string(),
            poc_port,
            max_nodes: 8,
        }
    }

    #[test]
    fn zero_host_means_no_poc() {
        let cfg = NodeConfig::from_cli(cli("0", 3001)).unwrap();
        assert!(cfg.poc.is_none());
    }

    #[test]
    fn zero_port_means_no_poc() {
        let cfg = NodeConfig::from_cli(cli("localhost", 0)).unwrap();
        assert!(cfg.poc.is_none());
    }

    #[test]
    fn real_poc_resolves_to_socket_addr() {
        let cfg = NodeConfig::from_cli(cli("127.0.0.1", 3001)).unwrap();
        assert_eq!(cfg.poc, Some("127.0.0.1:3001".parse().unwrap()));
    }
}
