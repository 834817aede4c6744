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

//! The simulated world: nodes running hash routing over PFC devices,
//! connected by point-to-point channels.

use crate::config::{DeviceConfiguration, LinkConfiguration};
use crate::device::{DeviceId, LinkLayer, QbbNetDevice};
use crate::flow::FlowKey;
use crate::packet::{Ecn, Packet};
use crate::routing::{HashRouting, InputRoute};
use crate::sim::{Scheduler, SimTime};
use crate::Error;
use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NodeKind {
    Host,
    Edge,
    Aggregation,
    Core,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeStats {
    pub sent: u64,
    pub delivered: u64,
    pub delivered_bytes: u64,
    pub forwarded: u64,
    /// Routing requests that found no route.
    pub routing_failures: u64,
    pub ttl_expired: u64,
    /// Packets a device refused to take.
    pub send_failures: u64,
}

pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub routing: HashRouting,
    /// Indexed by interface; interface 0 is the loopback and has no device.
    devices: Vec<Option<QbbNetDevice>>,
    channels: Vec<Option<EdgeIndex>>,
    pub stats: NodeStats,
}

impl Node {
    pub fn new(name: &str, kind: NodeKind, routing: HashRouting) -> Self {
        Self {
            name: name.to_string(),
            kind,
            routing,
            devices: vec![None],
            channels: vec![None],
            stats: NodeStats::default(),
        }
    }

    pub fn num_interfaces(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, iface: usize) -> Option<&QbbNetDevice> {
        self.devices.get(iface).and_then(Option::as_ref)
    }

    pub fn devices(&self) -> impl Iterator<Item = &QbbNetDevice> {
        self.devices.iter().flatten()
    }

    /// Address of interface 1, if any.
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.routing.interface_address(1)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.address() {
            Some(addr) => write!(f, "{} ({})", self.name, addr),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A full duplex point-to-point link between two devices.
#[derive(Copy, Clone, Debug)]
pub struct Channel {
    pub ends: [DeviceId; 2],
    pub link: LinkConfiguration,
}

impl Channel {
    pub fn peer(&self, id: DeviceId) -> Option<DeviceId> {
        match self.ends {
            [a, b] if a == id => Some(b),
            [a, b] if b == id => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} {}bps {}ns",
            self.ends[0].iface, self.ends[1].iface, self.link.rate_bps, self.link.delay_ns
        )
    }
}

/// A packet that reached its destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Delivery {
    pub uid: u64,
    pub node: NodeIndex,
    pub at: SimTime,
    pub flow: FlowKey,
    pub bytes: u32,
    pub ecn: Ecn,
}

pub type TxAvailableHandler = Rc<dyn Fn(&mut Network, &mut Scheduler<Network>, DeviceId, u64)>;

pub struct Network {
    topo: UnGraph<Node, Channel>,
    addresses: HashMap<Ipv4Addr, DeviceId>,
    tx_handlers: HashMap<DeviceId, Vec<TxAvailableHandler>>,
    deliveries: Vec<Delivery>,
    /// Devices each data packet was sent through, when tracing.
    paths: Option<HashMap<u64, Vec<DeviceId>>>,
    next_uid: u64,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Self {
            topo: UnGraph::default(),
            addresses: HashMap::new(),
            tx_handlers: HashMap::new(),
            deliveries: Vec::new(),
            paths: None,
            next_uid: 1,
        }
    }

    pub fn add_node(&mut self, name: &str, kind: NodeKind, routing: HashRouting) -> NodeIndex {
        self.topo.add_node(Node::new(name, kind, routing))
    }

    fn add_interface(
        &mut self,
        node: NodeIndex,
        address: Ipv4Addr,
        config: &DeviceConfiguration,
    ) -> Result<DeviceId, Error> {
        let n = self.topo.node_weight_mut(node).ok_or(Error::InvalidNode(node))?;
        let iface = n.routing.add_interface(address);
        let id = DeviceId::new(node, iface);
        n.devices.push(Some(QbbNetDevice::new(id, address, config)?));
        n.channels.push(None);
        self.addresses.insert(address, id);
        Ok(id)
    }

    /// Connect `a` and `b` with a new channel, adding an interface with the
    /// given address on each side.
    pub fn connect(
        &mut self,
        a: (NodeIndex, Ipv4Addr),
        b: (NodeIndex, Ipv4Addr),
        link: LinkConfiguration,
        config: &DeviceConfiguration,
    ) -> Result<(DeviceId, DeviceId), Error> {
        let da = self.add_interface(a.0, a.1, config)?;
        let db = self.add_interface(b.0, b.1, config)?;
        let edge = self.topo.add_edge(
            a.0,
            b.0,
            Channel {
                ends: [da, db],
                link,
            },
        );
        for id in [da, db].iter() {
            if let Some(n) = self.topo.node_weight_mut(id.node) {
                n.channels[id.iface] = Some(edge);
            }
        }
        log::trace!("connect {} <-> {}", da, db);
        Ok((da, db))
    }

    /// Enable or disable forwarding of packets received on `iface` of `node`.
    pub fn set_forwarding(
        &mut self,
        node: NodeIndex,
        iface: usize,
        forwarding: bool,
    ) -> Result<(), Error> {
        let n = self.node_mut(node)?;
        if iface == 0 || iface >= n.num_interfaces() {
            return Err(Error::InvalidInterface(node, iface));
        }
        n.routing.set_forwarding(iface, forwarding);
        Ok(())
    }

    pub fn node(&self, node: NodeIndex) -> Result<&Node, Error> {
        self.topo.node_weight(node).ok_or(Error::InvalidNode(node))
    }

    pub fn node_mut(&mut self, node: NodeIndex) -> Result<&mut Node, Error> {
        self.topo.node_weight_mut(node).ok_or(Error::InvalidNode(node))
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.topo.node_indices()
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<NodeIndex> {
        self.topo
            .node_indices()
            .filter(|n| self.topo[*n].kind == kind)
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.topo.node_count()
    }

    pub fn channel_count(&self) -> usize {
        self.topo.edge_count()
    }

    pub fn channel(&self, id: DeviceId) -> Option<&Channel> {
        let node = self.topo.node_weight(id.node)?;
        let edge = node.channels.get(id.iface).copied().flatten()?;
        self.topo.edge_weight(edge)
    }

    /// The device at the other end of the channel of `id`.
    pub fn peer(&self, id: DeviceId) -> Option<DeviceId> {
        self.channel(id).and_then(|c| c.peer(id))
    }

    /// The device owning `addr`.
    pub fn device_by_address(&self, addr: Ipv4Addr) -> Option<DeviceId> {
        self.addresses.get(&addr).copied()
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Record the devices every data packet goes through.
    pub fn enable_path_tracing(&mut self) {
        self.paths.get_or_insert_with(HashMap::new);
    }

    pub fn path(&self, uid: u64) -> Option<&[DeviceId]> {
        self.paths.as_ref()?.get(&uid).map(Vec::as_slice)
    }

    pub fn add_tx_available_handler(&mut self, id: DeviceId, handler: TxAvailableHandler) {
        self.tx_handlers.entry(id).or_default().push(handler);
    }

    /// Sum of the device statistics over all devices.
    pub fn total_pauses_sent(&self) -> u64 {
        self.topo
            .node_weights()
            .flat_map(|n| n.devices())
            .map(|d| d.stats().pauses_sent)
            .sum()
    }

    pub fn to_graphviz(&self) -> String {
        format!("{}", Dot::with_config(&self.topo, &[DotConfig::EdgeNoLabel]))
    }

    /// Originate `packet` at `node`. Returns the uid assigned to it.
    pub fn send_from(
        &mut self,
        sched: &mut Scheduler<Network>,
        node: NodeIndex,
        packet: Packet,
    ) -> Result<u64, Error> {
        let uid = self.next_uid;
        self.next_uid += 1;
        let mut packet = packet.with_uid(uid);
        packet.ingress = None;
        let now = sched.now();
        let n = self.node_mut(node)?;
        let route = match n.routing.route_output(&packet, now) {
            Ok(route) => route,
            Err(e) => {
                n.stats.routing_failures += 1;
                return Err(e);
            }
        };
        n.stats.sent += 1;
        log::trace!("{} sends {} via port {}", n, packet, route.port);
        QbbNetDevice::send(self, sched, DeviceId::new(node, route.port), packet)?;
        Ok(uid)
    }

    /// IP layer processing of a packet received on `iif` of `node`.
    fn ip_receive(
        &mut self,
        sched: &mut Scheduler<Network>,
        node: NodeIndex,
        iif: usize,
        mut packet: Packet,
    ) {
        let now = sched.now();
        let n = match self.topo.node_weight_mut(node) {
            Some(n) => n,
            None => return,
        };
        match n.routing.route_input(&packet, iif, now) {
            Ok(InputRoute::Local(_)) => {
                n.stats.delivered += 1;
                n.stats.delivered_bytes += u64::from(packet.size());
                log::debug!("{} delivered {} at {}", n.name, packet, now);
                self.deliveries.push(Delivery {
                    uid: packet.uid,
                    node,
                    at: now,
                    flow: FlowKey::from(&packet),
                    bytes: packet.size(),
                    ecn: packet.ip.ecn,
                });
            }
            Ok(InputRoute::Forward(route)) => {
                if packet.ip.ttl <= 1 {
                    n.stats.ttl_expired += 1;
                    log::warn!("{} TTL expired for {}", n.name, packet);
                    return;
                }
                packet.ip.ttl -= 1;
                n.stats.forwarded += 1;
                let out = DeviceId::new(node, route.port);
                if let Err(e) = QbbNetDevice::send(self, sched, out, packet) {
                    log::error!("{} forward: {}", out, e);
                    if let Some(n) = self.topo.node_weight_mut(node) {
                        n.stats.send_failures += 1;
                    }
                }
            }
            Err(e) => {
                n.stats.routing_failures += 1;
                log::debug!("{} drop {}: {}", n.name, packet, e);
            }
        }
    }
}

impl LinkLayer for Network {
    fn device(&self, id: DeviceId) -> Option<&QbbNetDevice> {
        self.topo.node_weight(id.node)?.device(id.iface)
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut QbbNetDevice> {
        self.topo
            .node_weight_mut(id.node)?
            .devices
            .get_mut(id.iface)
            .and_then(Option::as_mut)
    }

    fn is_link_up(&self, id: DeviceId) -> bool {
        self.channel(id).is_some()
    }

    fn tx_time(&self, id: DeviceId, bytes: u32) -> Result<SimTime, Error> {
        let channel = self.channel(id).ok_or(Error::LinkDown(id))?;
        Ok(channel.link.tx_time(bytes))
    }

    fn channel_transmit(
        &mut self,
        sched: &mut Scheduler<Self>,
        id: DeviceId,
        packet: Packet,
        tx_time: SimTime,
    ) -> Result<(), Error> {
        let channel = *self.channel(id).ok_or(Error::LinkDown(id))?;
        let peer = channel.peer(id).ok_or(Error::LinkDown(id))?;
        if let Some(paths) = self.paths.as_mut() {
            if !packet.is_pause() {
                paths.entry(packet.uid).or_default().push(id);
            }
        }
        sched.schedule(tx_time + channel.link.delay(), move |w: &mut Network, s| {
            if let Err(e) = QbbNetDevice::receive(w, s, peer, packet) {
                log::error!("{} receive: {}", peer, e);
            }
        });
        Ok(())
    }

    fn deliver_up(&mut self, sched: &mut Scheduler<Self>, id: DeviceId, packet: Packet) {
        self.ip_receive(sched, id.node, id.iface, packet)
    }

    fn is_local(&self, node: NodeIndex, addr: Ipv4Addr) -> bool {
        self.topo
            .node_weight(node)
            .map_or(false, |n| n.routing.is_local(addr))
    }

    fn notify_tx_available(&mut self, sched: &mut Scheduler<Self>, id: DeviceId, available: u64) {
        let handlers = match self.tx_handlers.get(&id) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for handler in handlers {
            handler(self, sched, id, available);
        }
    }
}
