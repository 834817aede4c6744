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

//! Hash based multipath routing.
//!
//! Interfaces of a switch are numbered so that interface 0 is the loopback,
//! interfaces `1..=U` face down and `U+1..=2U` face up. A lookup consults, in
//! order, static destination routes, pinned flow routes, and finally a salted
//! hash of the flow key that picks one of the uplinks.

use crate::config::RoutingConfiguration;
use crate::flow::FlowKey;
use crate::hash::HashFunction;
use crate::packet::{Packet, Payload, DEFAULT_TTL, PROTO_CN};
use crate::sim::SimTime;
use crate::topology::FatTreeAddressing;
use crate::Error;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

// Table entries live for `lifetime` after their last use.
fn expired(last: SimTime, lifetime: SimTime, now: SimTime) -> bool {
    last + lifetime < now
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DestinationRoute {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub port: usize,
}

impl DestinationRoute {
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        u32::from(addr) & mask == u32::from(self.destination) & mask
    }
}

/// A flow pinned to a port after a reroute.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlowRoute {
    pub key: FlowKey,
    pub last: SimTime,
    pub port: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CongestionRecord {
    pub key: FlowKey,
    pub last: SimTime,
    pub count: u32,
    /// Switches that reported congestion for the flow. Only kept with
    /// intelligent reroute enabled.
    pub congestion_points: BTreeSet<Ipv4Addr>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Interface {
    pub address: Ipv4Addr,
    pub forwarding: bool,
}

/// Where a locally originated packet leaves the node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutputRoute {
    pub port: usize,
    /// Address of the output interface.
    pub source: Ipv4Addr,
}

/// What to do with a received packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InputRoute {
    /// Deliver to this node; carries the input interface.
    Local(usize),
    Forward(OutputRoute),
}

pub struct HashRouting {
    interfaces: Vec<Interface>,
    dest_routes: Vec<DestinationRoute>,
    flow_routes: Vec<FlowRoute>,
    congestion: Vec<CongestionRecord>,
    hash: Box<dyn HashFunction>,
    rng: Xoshiro256StarStar,
    /// Address plan of the fat tree this switch is part of.
    addressing: Option<FatTreeAddressing>,
    lifetime: SimTime,
    reroute_threshold: u32,
    reroute_on_congestion: bool,
    intelligent_reroute: bool,
}

impl HashRouting {
    pub fn new(config: &RoutingConfiguration, hash: Box<dyn HashFunction>) -> Self {
        Self {
            interfaces: vec![Interface {
                address: Ipv4Addr::LOCALHOST,
                forwarding: true,
            }],
            dest_routes: Vec::new(),
            flow_routes: Vec::new(),
            congestion: Vec::new(),
            hash,
            rng: Xoshiro256StarStar::seed_from_u64(config.seed),
            addressing: None,
            lifetime: config.lifetime(),
            reroute_threshold: config.reroute_threshold,
            reroute_on_congestion: config.reroute_on_congestion,
            intelligent_reroute: config.intelligent_reroute,
        }
    }

    /// Reseed the generator that picks reroute ports.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Xoshiro256StarStar::seed_from_u64(seed);
        self
    }

    /// Place the switch in a fat tree. Congestion notifications are only
    /// acted upon by edge switches, which needs the address plan.
    pub fn with_addressing(mut self, addressing: FatTreeAddressing) -> Self {
        self.addressing = Some(addressing);
        self
    }

    fn is_edge(&self, addr: Ipv4Addr) -> bool {
        self.addressing.map_or(false, |a| a.is_edge(addr))
    }

    /// Add the next interface. Returns its index.
    pub fn add_interface(&mut self, address: Ipv4Addr) -> usize {
        self.interfaces.push(Interface {
            address,
            forwarding: true,
        });
        self.interfaces.len() - 1
    }

    pub fn set_forwarding(&mut self, iface: usize, forwarding: bool) {
        if let Some(i) = self.interfaces.get_mut(iface) {
            i.forwarding = forwarding;
        }
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn interface_address(&self, iface: usize) -> Option<Ipv4Addr> {
        self.interfaces.get(iface).map(|i| i.address)
    }

    /// Number of uplinks, `U`.
    pub fn num_uplinks(&self) -> usize {
        (self.interfaces.len() - 1) / 2
    }

    /// Salt of the hash: the address of interface 1.
    fn salt(&self) -> u32 {
        self.interface_address(1).map_or(0, u32::from)
    }

    /// Routes are matched in insertion order; the first match wins.
    pub fn add_route(&mut self, destination: Ipv4Addr, mask: Ipv4Addr, port: usize) {
        log::trace!("new route for interface {}: {}/{}", port, destination, mask);
        self.dest_routes.push(DestinationRoute {
            destination,
            mask,
            port,
        });
    }

    pub fn dest_routes(&self) -> &[DestinationRoute] {
        &self.dest_routes
    }

    pub fn flow_routes(&self) -> &[FlowRoute] {
        &self.flow_routes
    }

    pub fn congestion_records(&self) -> &[CongestionRecord] {
        &self.congestion
    }

    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        addr.is_broadcast() || self.interfaces.iter().any(|i| i.address == addr)
    }

    fn request_dest_route(&self, addr: Ipv4Addr) -> Option<usize> {
        self.dest_routes
            .iter()
            .find(|r| r.matches(addr))
            .map(|r| r.port)
    }

    fn request_flow_route(&mut self, key: &FlowKey, now: SimTime) -> Option<usize> {
        let lifetime = self.lifetime;
        self.flow_routes.retain(|r| !expired(r.last, lifetime, now));
        let route = self.flow_routes.iter_mut().find(|r| r.key == *key)?;
        route.last = now;
        Some(route.port)
    }

    fn hash_port(&mut self, key: &FlowKey) -> Result<usize, Error> {
        let uplinks = self.num_uplinks();
        if uplinks == 0 {
            return Err(Error::NoUplinks);
        }
        let salt = self.salt();
        let h = self.hash.hash(salt, key);
        Ok((h % uplinks as u64) as usize + uplinks + 1)
    }

    /// Egress interface for a flow.
    pub fn select_output_port(&mut self, key: &FlowKey, now: SimTime) -> Result<usize, Error> {
        if let Some(port) = self.request_dest_route(key.dst) {
            log::trace!("destination {} routed to port {}", key.dst, port);
            return Ok(port);
        }
        if let Some(port) = self.request_flow_route(key, now) {
            log::trace!("{} routed as a flow to port {}", key, port);
            return Ok(port);
        }
        let port = self.hash_port(key)?;
        log::trace!("packet of {} hash-routed to port {}", key, port);
        Ok(port)
    }

    fn output_route(&self, port: usize) -> Result<OutputRoute, Error> {
        let source = self.interface_address(port).ok_or(Error::NoUplinks)?;
        Ok(OutputRoute { port, source })
    }

    /// Route a packet originated at this node.
    pub fn route_output(&mut self, packet: &Packet, now: SimTime) -> Result<OutputRoute, Error> {
        let dst = packet.ip.destination;
        if dst.is_multicast() || dst.is_broadcast() {
            log::trace!("non-unicast destination {} is not supported", dst);
            return Err(Error::NoRoute(dst));
        }
        let port = self.select_output_port(&FlowKey::from(packet), now)?;
        self.output_route(port)
    }

    /// Route a packet received on `iif`.
    pub fn route_input(
        &mut self,
        packet: &Packet,
        iif: usize,
        now: SimTime,
    ) -> Result<InputRoute, Error> {
        self.handle_congestion_signal(packet, now)?;

        let dst = packet.ip.destination;
        if dst.is_multicast() || dst.is_broadcast() {
            log::trace!("non-unicast destination {} is not supported", dst);
            return Err(Error::NoRoute(dst));
        }
        if self.is_local(dst) {
            return Ok(InputRoute::Local(iif));
        }
        if !self.interfaces.get(iif).map_or(false, |i| i.forwarding) {
            log::trace!("forwarding disabled for interface {}", iif);
            return Err(Error::NoRoute(dst));
        }
        let port = self.select_output_port(&FlowKey::from(packet), now)?;
        Ok(InputRoute::Forward(self.output_route(port)?))
    }

    /// Pin `key` to a random uplink other than `old_port`.
    pub fn request_reroute(
        &mut self,
        key: &FlowKey,
        old_port: usize,
        now: SimTime,
    ) -> Result<usize, Error> {
        let uplinks = self.num_uplinks();
        if uplinks == 0 {
            return Err(Error::NoUplinks);
        }
        let candidates: Vec<usize> = (uplinks + 1..=2 * uplinks)
            .filter(|&p| p != old_port)
            .collect();
        if candidates.is_empty() {
            return Err(Error::NoAlternatePort(old_port));
        }
        let port = candidates[self.rng.gen_range(0..candidates.len())];
        log::info!("reroute flow {} from port {} to {}", key, old_port, port);

        let lifetime = self.lifetime;
        self.flow_routes.retain(|r| !expired(r.last, lifetime, now));
        match self.flow_routes.iter_mut().find(|r| r.key == *key) {
            Some(route) => route.port = port,
            None => self.flow_routes.push(FlowRoute {
                key: *key,
                last: now,
                port,
            }),
        }
        Ok(port)
    }

    /// Count a congestion signal for `key`. Returns true once every
    /// `reroute_threshold` signals seen within the record lifetime.
    pub fn track_congestion_signal(
        &mut self,
        key: &FlowKey,
        congestion_point: Ipv4Addr,
        now: SimTime,
    ) -> bool {
        let lifetime = self.lifetime;
        self.congestion.retain(|r| !expired(r.last, lifetime, now));
        let intelligent = self.intelligent_reroute;
        let threshold = self.reroute_threshold;
        match self.congestion.iter_mut().find(|r| r.key == *key) {
            Some(record) => {
                record.count += 1;
                record.last = now;
                if intelligent {
                    record.congestion_points.insert(congestion_point);
                }
                log::info!(
                    "flow {} set with count {}, thresh={}, CP={}",
                    key,
                    record.count,
                    threshold,
                    congestion_point
                );
                if record.count >= threshold {
                    record.count = 0;
                    true
                } else {
                    false
                }
            }
            None => {
                log::info!(
                    "flow {} not found. Create new record. CP={}",
                    key,
                    congestion_point
                );
                let mut congestion_points = BTreeSet::new();
                if intelligent {
                    congestion_points.insert(congestion_point);
                }
                self.congestion.push(CongestionRecord {
                    key: *key,
                    last: now,
                    count: 1,
                    congestion_points,
                });
                false
            }
        }
    }

    /// React to a congestion notification routed through an edge switch:
    /// when it is headed for one of our hosts and the flow has been flagged
    /// often enough, move the flow to another uplink. Returns the new port.
    pub fn handle_congestion_signal(
        &mut self,
        packet: &Packet,
        now: SimTime,
    ) -> Result<Option<usize>, Error> {
        if packet.ip.protocol != PROTO_CN || !self.reroute_on_congestion {
            return Ok(None);
        }
        if !self.interface_address(1).map_or(false, |a| self.is_edge(a)) {
            return Ok(None);
        }
        let key = match &packet.payload {
            Payload::CongestionNotification(key) => *key,
            _ => return Err(Error::ProtocolViolation("congestion notification without flow".to_string())),
        };
        let old_port = self.select_output_port(&key, now)?;
        let source = packet.ip.source;
        if self.request_dest_route(packet.ip.destination).is_some()
            && self.track_congestion_signal(&key, source, now)
            && (packet.ip.ttl == DEFAULT_TTL || !self.is_edge(source))
        {
            let port = self.request_reroute(&key, old_port, now)?;
            return Ok(Some(port));
        }
        log::debug!("CN for {} forwarded to host", key);
        Ok(None)
    }
}
