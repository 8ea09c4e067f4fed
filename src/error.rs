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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StarNetError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("malformed packet")]
    MalformedPacket,

    #[error("unknown message type code {0:?}")]
    UnknownTypeCode(u8),

    #[error("peer name exceeds 16 bytes: {0}")]
    NameTooLong(String),

    #[error("unknown or dead peer {0}")]
    UnknownPeer(String),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("socket bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StarNetResult<T> = std::result::Result<T, StarNetError>;
