// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::flow::FlowKey;
use crate::Error;
use std::convert::TryInto;
use std::fmt;
use std::net::Ipv4Addr;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
/// IP protocol number of PAUSE control frames.
pub const PROTO_PAUSE: u8 = 0xFE;
/// IP protocol number of congestion notifications.
pub const PROTO_CN: u8 = 0xFF;

pub const IPV4_HEADER_SIZE: u32 = 20;
pub const UDP_HEADER_SIZE: u32 = 8;
pub const TCP_HEADER_SIZE: u32 = 20;
pub const PAUSE_HEADER_SIZE: u32 = 12;
pub const CN_HEADER_SIZE: u32 = 16;

pub const DEFAULT_TTL: u8 = 64;

/// The two ECN bits of the IPv4 TOS byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Ecn {
    NotEct = 0,
    Ect1 = 1,
    Ect0 = 2,
    Ce = 3,
}

impl Ecn {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Ecn::NotEct,
            1 => Ecn::Ect1,
            2 => Ecn::Ect0,
            _ => Ecn::Ce,
        }
    }

    pub fn is_ect(self) -> bool {
        matches!(self, Ecn::Ect0 | Ecn::Ect1)
    }
}

impl Default for Ecn {
    fn default() -> Self {
        Ecn::NotEct
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ipv4Header {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub ecn: Ecn,
    pub identification: u16,
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Self {
            source: Ipv4Addr::UNSPECIFIED,
            destination: Ipv4Addr::UNSPECIFIED,
            protocol: PROTO_UDP,
            ttl: DEFAULT_TTL,
            ecn: Ecn::NotEct,
            identification: 0,
        }
    }
}

/// Source and destination ports of a TCP or UDP header.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TransportHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

/// Payload of a PAUSE frame: the class to pause, for how long, and the queue
/// depth (in packets) at the time the frame was generated.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PauseHeader {
    pub class: u32,
    pub time_us: u32,
    pub queue_len: u32,
}

impl PauseHeader {
    pub fn new(time_us: u32, queue_len: u32, class: u32) -> Self {
        Self {
            class,
            time_us,
            queue_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; PAUSE_HEADER_SIZE as usize] {
        let mut bytes = [0u8; PAUSE_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.class.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.time_us.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.queue_len.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < PAUSE_HEADER_SIZE as usize {
            return Err(Error::MalformedPause);
        }
        let word = |i: usize| -> Result<u32, Error> {
            let raw: [u8; 4] = (&bytes[i..i + 4])
                .try_into()
                .map_err(|_| Error::MalformedPause)?;
            Ok(u32::from_be_bytes(raw))
        };
        Ok(Self {
            class: word(0)?,
            time_us: word(4)?,
            queue_len: word(8)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// Opaque application data of the given length in bytes.
    Data(u32),
    /// Serialized PAUSE header.
    Pause([u8; PAUSE_HEADER_SIZE as usize]),
    /// Congestion notification about the given flow.
    CongestionNotification(FlowKey),
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub uid: u64,
    pub ip: Ipv4Header,
    pub transport: Option<TransportHeader>,
    pub payload: Payload,
    /// Interface index the packet was last received on, set by the receiving
    /// device and consumed by the egress device to learn upstream neighbours.
    pub ingress: Option<usize>,
}

impl Packet {
    /// A data packet. Ports are only carried for TCP and UDP.
    pub fn data(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: u8,
        src_port: u16,
        dst_port: u16,
        payload_bytes: u32,
    ) -> Self {
        let transport = match protocol {
            PROTO_TCP | PROTO_UDP => Some(TransportHeader { src_port, dst_port }),
            _ => None,
        };
        Packet {
            uid: 0,
            ip: Ipv4Header {
                source,
                destination,
                protocol,
                ..Default::default()
            },
            transport,
            payload: Payload::Data(payload_bytes),
            ingress: None,
        }
    }

    /// A PAUSE control frame: link-local broadcast with TTL 1.
    pub fn pause(source: Ipv4Addr, header: &PauseHeader, identification: u16) -> Self {
        Packet {
            uid: 0,
            ip: Ipv4Header {
                source,
                destination: Ipv4Addr::BROADCAST,
                protocol: PROTO_PAUSE,
                ttl: 1,
                ecn: Ecn::NotEct,
                identification,
            },
            transport: None,
            payload: Payload::Pause(header.to_bytes()),
            ingress: None,
        }
    }

    pub fn congestion_notification(source: Ipv4Addr, destination: Ipv4Addr, flow: FlowKey) -> Self {
        Packet {
            uid: 0,
            ip: Ipv4Header {
                source,
                destination,
                protocol: PROTO_CN,
                ..Default::default()
            },
            transport: None,
            payload: Payload::CongestionNotification(flow),
            ingress: None,
        }
    }

    pub fn with_uid(mut self, uid: u64) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_ecn(mut self, ecn: Ecn) -> Self {
        self.ip.ecn = ecn;
        self
    }

    pub fn is_pause(&self) -> bool {
        self.ip.protocol == PROTO_PAUSE
    }

    /// Decode the PAUSE header of a control frame.
    pub fn pause_header(&self) -> Result<PauseHeader, Error> {
        match (&self.payload, self.is_pause()) {
            (Payload::Pause(bytes), true) => PauseHeader::from_bytes(bytes),
            _ => Err(Error::MalformedPause),
        }
    }

    /// Size on the wire in bytes.
    pub fn size(&self) -> u32 {
        let transport = match (self.ip.protocol, self.transport) {
            (PROTO_TCP, Some(_)) => TCP_HEADER_SIZE,
            (PROTO_UDP, Some(_)) => UDP_HEADER_SIZE,
            _ => 0,
        };
        let payload = match &self.payload {
            Payload::Data(bytes) => *bytes,
            Payload::Pause(_) => PAUSE_HEADER_SIZE,
            Payload::CongestionNotification(_) => CN_HEADER_SIZE,
        };
        IPV4_HEADER_SIZE
            .saturating_add(transport)
            .saturating_add(payload)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "#{} {} -> {} proto {} ttl {} {:?} {}B",
            self.uid,
            self.ip.source,
            self.ip.destination,
            self.ip.protocol,
            self.ip.ttl,
            self.ip.ecn,
            self.size()
        )
    }
}
