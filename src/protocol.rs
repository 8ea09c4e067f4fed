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

//! Wire codec for the five StarNet message types.
//!
//! Every packet starts with a fixed 21-byte header: `type(1) |
//! sender_name(16) | uuid(4 ASCII digits)`. The per-type payload follows.
//! Numeric payload fields are decimal ASCII, not binary - a fixed textual
//! layout keeps decoding trivial at the cost of a few wasted bytes.

use bytes::{BufMut, Bytes, BytesMut};

use nom::bytes::complete::take;
use nom::combinator::map_res;
use nom::IResult;

use crate::error::{StarNetError, StarNetResult};
use crate::peer::{PeerName, PeerRecord, NAME_WIDTH};

/// Message-id counter is widened to 64 bits in memory; only the low 4
/// decimal digits are ever rendered on the wire, so the in-memory counter
/// simply outlives the wire field's wraparound instead of colliding at it.
pub type MessageId = u64;

const UUID_WIDTH: usize = 4;
pub const HEADER_WIDTH: usize = 1 + NAME_WIDTH + UUID_WIDTH;

fn render_uuid(id: MessageId) -> [u8; UUID_WIDTH] {
    let wrapped = id % 10_000;
    let s = format!("{wrapped:04}");
    let mut buf = [0u8; UUID_WIDTH];
    buf.copy_from_slice(s.as_bytes());
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub type_code: u8,
    pub sender: PeerName,
    /// The wire-rendered (wrapped) uuid, as received. Dedup is keyed on
    /// `(sender, wire_uuid)`; widening the in-memory counter to 64 bits only
    /// postpones the wrap, it does not remove the on-wire de-dup key.
    pub uuid: u16,
}

impl Header {
    pub fn new(type_code: u8, sender: PeerName, uuid: MessageId) -> Self {
        let wrapped = (uuid % 10_000) as u16;
        Self {
            type_code,
            sender,
            uuid: wrapped,
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_WIDTH);
        buf.put_u8(self.type_code);
        buf.put_slice(&self.sender.to_wire_bytes());
        buf.put_slice(&render_uuid(self.uuid as MessageId));
        buf
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, type_code) = nom::number::complete::u8(input)?;

        let (input, sender) = map_res(take(NAME_WIDTH), |b: &[u8]| {
            let arr: [u8; NAME_WIDTH] = b.try_into().map_err(|_| StarNetError::MalformedPacket)?;
            PeerName::from_wire_bytes(&arr)
        })(input)?;

        let (input, uuid) = map_res(take(UUID_WIDTH), |b: &[u8]| {
            std::str::from_utf8(b)
                .map_err(|_| StarNetError::MalformedPacket)?
                .parse::<u16>()
                .map_err(|_| StarNetError::MalformedPacket)
        })(input)?;

        Ok((
            input,
            Header {
                type_code,
                sender,
                uuid,
            },
        ))
    }
}

/// Message-id: sender name + wire uuid, unique within a sender's lifetime
/// modulo wraparound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub sender: PeerName,
    pub uuid: u16,
}

impl From<&Header> for MessageKey {
    fn from(h: &Header) -> Self {
        Self {
            sender: h.sender.clone(),
            uuid: h.uuid,
        }
    }
}

pub const TYPE_DISCOVERY: u8 = b'D';
pub const TYPE_HEARTBEAT: u8 = b'H';
pub const TYPE_RTT: u8 = b'R';
pub const TYPE_APP: u8 = b'A';
pub const TYPE_ACK: u8 = b'K';

#[derive(Debug, Clone)]
pub enum Message {
    Discovery(DiscoveryPayload),
    Heartbeat(HeartbeatPayload),
    Rtt(RttPayload),
    App(AppPayload),
    Ack(AckPayload),
}

impl Message {
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Discovery(_) => TYPE_DISCOVERY,
            Message::Heartbeat(_) => TYPE_HEARTBEAT,
            Message::Rtt(_) => TYPE_RTT,
            Message::App(_) => TYPE_APP,
            Message::Ack(_) => TYPE_ACK,
        }
    }

    /// Full on-wire packet: header + payload.
    pub fn encode(&self, sender: PeerName, uuid: MessageId) -> Bytes {
        let mut buf = Header::new(self.type_code(), sender, uuid).to_bytes();
        match self {
            Message::Discovery(p) => p.encode_into(&mut buf),
            Message::Heartbeat(p) => p.encode_into(&mut buf),
            Message::Rtt(p) => p.encode_into(&mut buf),
            Message::App(p) => p.encode_into(&mut buf),
            Message::Ack(p) => p.encode_into(&mut buf),
        }
        buf.freeze()
    }

    /// Decodes a full packet into its header and typed payload.
    pub fn decode(input: &[u8]) -> StarNetResult<(Header, Message)> {
        let (rest, header) = Header::parse(input).map_err(|_| StarNetError::MalformedPacket)?;
        let message = match header.type_code {
            TYPE_DISCOVERY => Message::Discovery(DiscoveryPayload::parse(rest)?),
            TYPE_HEARTBEAT => Message::Heartbeat(HeartbeatPayload::parse(rest)?),
            TYPE_RTT => Message::Rtt(RttPayload::parse(rest)?),
            TYPE_APP => Message::App(AppPayload::parse(rest)?),
            TYPE_ACK => Message::Ack(AckPayload::parse(rest)?),
            other => return Err(StarNetError::UnknownTypeCode(other)),
        };
        Ok((header, message))
    }
}

/// `direction(1) | disconnect(1) | payload(json)`.
#[derive(Debug, Clone)]
pub struct DiscoveryPayload {
    pub direction_reply: bool,
    pub disconnect: bool,
    pub peers: Vec<PeerRecord>,
}

impl DiscoveryPayload {
    pub fn request() -> Self {
        Self {
            direction_reply: false,
            disconnect: false,
            peers: Vec::new(),
        }
    }

    pub fn reply(peers: Vec<PeerRecord>) -> Self {
        Self {
            direction_reply: true,
            disconnect: false,
            peers,
        }
    }

    pub fn disconnect_notice() -> Self {
        Self {
            direction_reply: false,
            disconnect: true,
            peers: Vec::new(),
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(if self.direction_reply { b'1' } else { b'0' });
        buf.put_u8(if self.disconnect { b'1' } else { b'0' });
        if !self.disconnect {
            let json = serde_json::to_vec(&self.peers).unwrap_or_default();
            buf.put_slice(&json);
        }
    }

    fn parse(input: &[u8]) -> StarNetResult<Self> {
        let (input, direction) = tag_byte(input)?;
        let (input, disconnect) = tag_byte(input)?;
        let disconnect = disconnect == b'1';
        let peers = if disconnect || input.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(input)?
        };
        Ok(Self {
            direction_reply: direction == b'1',
            disconnect,
            peers,
        })
    }
}

/// `direction(1)`, no payload.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPayload {
    pub is_pong: bool,
}

impl HeartbeatPayload {
    pub fn ping() -> Self {
        Self { is_pong: false }
    }

    pub fn pong() -> Self {
        Self { is_pong: true }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(if self.is_pong { b'1' } else { b'0' });
    }

    fn parse(input: &[u8]) -> StarNetResult<Self> {
        let (_, direction) = tag_byte(input)?;
        Ok(Self {
            is_pong: direction == b'1',
        })
    }
}

/// RTT message, three stages.
#[derive(Debug, Clone)]
pub enum RttPayload {
    /// Stage 0: probe. Stage 1: reply. Body is a send-time echo; the
    /// measuring side always uses its own remembered send-time to compute
    /// RTT, so this field is carried for wire fidelity only.
    Probe { send_time: f64 },
    Reply { send_time: f64 },
    /// Stage 2: sum broadcast.
    Sum { network_size: u8, rtt_sum: f64 },
}

impl RttPayload {
    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RttPayload::Probe { send_time } => {
                buf.put_u8(b'0');
                buf.put_slice(format!("{send_time}").as_bytes());
            }
            RttPayload::Reply { send_time } => {
                buf.put_u8(b'1');
                buf.put_slice(format!("{send_time}").as_bytes());
            }
            RttPayload::Sum {
                network_size,
                rtt_sum,
            } => {
                buf.put_u8(b'2');
                buf.put_slice(format!("{network_size}").as_bytes());
                buf.put_slice(format!("{rtt_sum}").as_bytes());
            }
        }
    }

    fn parse(input: &[u8]) -> StarNetResult<Self> {
        let (rest, stage) = tag_byte(input)?;
        match stage {
            b'0' => Ok(RttPayload::Probe {
                send_time: parse_f64(rest)?,
            }),
            b'1' => Ok(RttPayload::Reply {
                send_time: parse_f64(rest)?,
            }),
            b'2' => {
                if rest.is_empty() {
                    return Err(StarNetError::MalformedPacket);
                }
                let network_size = (rest[0] as char)
                    .to_digit(10)
                    .ok_or(StarNetError::MalformedPacket)? as u8;
                let rtt_sum = parse_f64(&rest[1..])?;
                Ok(RttPayload::Sum {
                    network_size,
                    rtt_sum,
                })
            }
            _ => Err(StarNetError::MalformedPacket),
        }
    }
}

/// `forward(1) | is_file(1) | sender(16) | [name_len(2) | filename] | data`.
#[derive(Debug, Clone)]
pub struct AppPayload {
    pub forward: bool,
    pub origin: PeerName,
    pub file_name: Option<String>,
    pub data: Bytes,
}

impl AppPayload {
    pub fn text(forward: bool, origin: PeerName, data: impl Into<Bytes>) -> Self {
        Self {
            forward,
            origin,
            file_name: None,
            data: data.into(),
        }
    }

    pub fn file(forward: bool, origin: PeerName, file_name: String, data: impl Into<Bytes>) -> Self {
        Self {
            forward,
            origin,
            file_name: Some(file_name),
            data: data.into(),
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(if self.forward { b'1' } else { b'0' });
        buf.put_u8(if self.file_name.is_some() { b'1' } else { b'0' });
        buf.put_slice(&self.origin.to_wire_bytes());
        if let Some(name) = &self.file_name {
            buf.put_slice(format!("{:02}", name.len()).as_bytes());
            buf.put_slice(name.as_bytes());
        }
        buf.put_slice(&self.data);
    }

    fn parse(input: &[u8]) -> StarNetResult<Self> {
        if input.len() < 2 + NAME_WIDTH {
            return Err(StarNetError::MalformedPacket);
        }
        let forward = input[0] == b'1';
        let is_file = input[1] == b'1';
        let name_bytes: [u8; NAME_WIDTH] = input[2..2 + NAME_WIDTH]
            .try_into()
            .map_err(|_| StarNetError::MalformedPacket)?;
        let origin = PeerName::from_wire_bytes(&name_bytes)?;
        let rest = &input[2 + NAME_WIDTH..];

        if is_file {
            if rest.len() < 2 {
                return Err(StarNetError::MalformedPacket);
            }
            let name_len: usize = std::str::from_utf8(&rest[..2])
                .map_err(|_| StarNetError::MalformedPacket)?
                .parse()
                .map_err(|_| StarNetError::MalformedPacket)?;
            if rest.len() < 2 + name_len {
                return Err(StarNetError::MalformedPacket);
            }
            let file_name = std::str::from_utf8(&rest[2..2 + name_len])
                .map_err(|_| StarNetError::MalformedPacket)?
                .to_string();
            let data = Bytes::copy_from_slice(&rest[2 + name_len..]);
            Ok(Self {
                forward,
                origin,
                file_name: Some(file_name),
                data,
            })
        } else {
            Ok(Self {
                forward,
                origin,
                file_name: None,
                data: Bytes::copy_from_slice(rest),
            })
        }
    }
}

/// Payload is the 20-byte message-id being acknowledged.
#[derive(Debug, Clone)]
pub struct AckPayload {
    pub acked: MessageKey,
}

impl AckPayload {
    pub fn new(acked: MessageKey) -> Self {
        Self { acked }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.acked.sender.to_wire_bytes());
        buf.put_slice(format!("{:04}", self.acked.uuid).as_bytes());
    }

    fn parse(input: &[u8]) -> StarNetResult<Self> {
        if input.len() < NAME_WIDTH + UUID_WIDTH {
            return Err(StarNetError::MalformedPacket);
        }
        let name_bytes: [u8; NAME_WIDTH] = input[..NAME_WIDTH]
            .try_into()
            .map_err(|_| StarNetError::MalformedPacket)?;
        let sender = PeerName::from_wire_bytes(&name_bytes)?;
        let uuid_str = std::str::from_utf8(&input[NAME_WIDTH..NAME_WIDTH + UUID_WIDTH])
            .map_err(|_| StarNetError::MalformedPacket)?;
        let uuid: u16 = uuid_str.parse().map_err(|_| StarNetError::MalformedPacket)?;
        Ok(Self {
            acked: MessageKey { sender, uuid },
        })
    }
}

fn tag_byte(input: &[u8]) -> StarNetResult<(&[u8], u8)> {
    if input.is_empty() {
        return Err(StarNetError::MalformedPacket);
    }
    Ok((&input[1..], input[0]))
}

fn parse_f64(input: &[u8]) -> StarNetResult<f64> {
    std::str::from_utf8(input)
        .map_err(|_| StarNetError::MalformedPacket)?
        .parse()
        .map_err(|_| StarNetError::MalformedPacket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PeerName {
        PeerName::new(s).unwrap()
    }

    #[test]
    fn header_round_trips() {
        let bytes = Message::Heartbeat(HeartbeatPayload::ping()).encode(name("A"), 42);
        let (header, _) = Message::decode(&bytes).unwrap();
        assert_eq!(header.type_code, TYPE_HEARTBEAT);
        assert_eq!(header.sender, name("A"));
        assert_eq!(header.uuid, 42);
    }

    #[test]
    fn uuid_wraps_at_10000() {
        let bytes = Message::Heartbeat(HeartbeatPayload::ping()).encode(name("A"), 10_042);
        let (header, _) = Message::decode(&bytes).unwrap();
        assert_eq!(header.uuid, 42);
    }

    #[test]
    fn discovery_request_round_trips() {
        let msg = Message::Discovery(DiscoveryPayload::request());
        let bytes = msg.encode(name("A"), 1);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::Discovery(p) => {
                assert!(!p.direction_reply);
                assert!(!p.disconnect);
                assert!(p.peers.is_empty());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn discovery_reply_carries_peer_records() {
        let peers = vec![PeerRecord {
            name: "B".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 3001,
        }];
        let msg = Message::Discovery(DiscoveryPayload::reply(peers.clone()));
        let bytes = msg.encode(name("A"), 1);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::Discovery(p) => {
                assert!(p.direction_reply);
                assert_eq!(p.peers.len(), 1);
                assert_eq!(p.peers[0].name, "B");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn discovery_disconnect_ignores_payload() {
        let msg = Message::Discovery(DiscoveryPayload::disconnect_notice());
        let bytes = msg.encode(name("A"), 1);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::Discovery(p) => assert!(p.disconnect),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rtt_probe_and_reply_round_trip() {
        let msg = Message::Rtt(RttPayload::Probe { send_time: 123.5 });
        let bytes = msg.encode(name("A"), 1);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::Rtt(RttPayload::Probe { send_time }) => assert_eq!(send_time, 123.5),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rtt_sum_round_trips() {
        let msg = Message::Rtt(RttPayload::Sum {
            network_size: 3,
            rtt_sum: 0.456,
        });
        let bytes = msg.encode(name("A"), 1);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::Rtt(RttPayload::Sum {
                network_size,
                rtt_sum,
            }) => {
                assert_eq!(network_size, 3);
                assert_eq!(rtt_sum, 0.456);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn app_text_round_trips() {
        let msg = Message::App(AppPayload::text(true, name("A"), "hello world"));
        let bytes = msg.encode(name("A"), 1);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::App(p) => {
                assert!(p.forward);
                assert!(p.file_name.is_none());
                assert_eq!(&p.data[..], b"hello world");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn app_file_round_trips_with_binary_data() {
        let data: Vec<u8> = (0..=255u8).collect();
        let msg = Message::App(AppPayload::file(
            false,
            name("A"),
            "payload.bin".to_string(),
            data.clone(),
        ));
        let bytes = msg.encode(name("A"), 1);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::App(p) => {
                assert_eq!(p.file_name.as_deref(), Some("payload.bin"));
                assert_eq!(&p.data[..], &data[..]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ack_round_trips() {
        let key = MessageKey {
            sender: name("B"),
            uuid: 7,
        };
        let msg = Message::Ack(AckPayload::new(key.clone()));
        let bytes = msg.encode(name("A"), 1);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::Ack(p) => assert_eq!(p.acked, key),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let mut bytes = Message::Heartbeat(HeartbeatPayload::ping()).encode(name("A"), 1).to_vec();
        bytes[0] = b'Z';
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(Message::decode(&[b'H', b'A']).is_err());
    }
}
