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

use crate::packet::{Ipv4Header, Packet, PROTO_TCP, PROTO_UDP};
use std::fmt;
use std::net::Ipv4Addr;

/// Size of the canonical flow key encoding.
pub const FLOW_KEY_BYTES: usize = 16;

/// The five-tuple identity of a flow.
///
/// A key built from an IP header alone has zero ports. Ports are filled in
/// once the transport header has been inspected (TCP and UDP only).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, src_port: u16, dst_port: u16) -> Self {
        Self {
            src,
            dst,
            proto,
            src_port,
            dst_port,
        }
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.src_port = port;
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.dst_port = port;
    }

    /// The key packed into two 64-bit halves: `src << 32 | dst`, and
    /// `proto << 32 | src_port << 16 | dst_port`.
    pub fn halves(&self) -> (u64, u64) {
        let hi = (u64::from(u32::from(self.src)) << 32) | u64::from(u32::from(self.dst));
        let lo = (u64::from(self.proto) << 32)
            | (u64::from(self.src_port) << 16)
            | u64::from(self.dst_port);
        (hi, lo)
    }

    pub fn from_halves(hi: u64, lo: u64) -> Self {
        Self {
            src: Ipv4Addr::from((hi >> 32) as u32),
            dst: Ipv4Addr::from(hi as u32),
            proto: (lo >> 32) as u8,
            src_port: (lo >> 16) as u16,
            dst_port: lo as u16,
        }
    }

    /// Canonical big-endian encoding of the two halves.
    pub fn to_bytes(&self) -> [u8; FLOW_KEY_BYTES] {
        let (hi, lo) = self.halves();
        let mut bytes = [0u8; FLOW_KEY_BYTES];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; FLOW_KEY_BYTES]) -> Self {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..]);
        Self::from_halves(u64::from_be_bytes(hi), u64::from_be_bytes(lo))
    }
}

impl From<&Ipv4Header> for FlowKey {
    fn from(header: &Ipv4Header) -> Self {
        FlowKey::new(header.source, header.destination, header.protocol, 0, 0)
    }
}

impl From<&Packet> for FlowKey {
    fn from(packet: &Packet) -> Self {
        let mut key = FlowKey::from(&packet.ip);
        if let (PROTO_TCP, Some(t)) | (PROTO_UDP, Some(t)) = (packet.ip.protocol, packet.transport)
        {
            key.set_src_port(t.src_port);
            key.set_dst_port(t.dst_port);
        }
        key
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}:{} {} {}:{}]",
            self.src, self.src_port, self.proto, self.dst, self.dst_port
        )
    }
}
