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

use crate::config::Config;
use crate::hash::HashKind;
use crate::network::{Network, NodeKind};
use crate::routing::HashRouting;
use crate::Error;
use petgraph::prelude::*;
use std::net::Ipv4Addr;

const HOST_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);
const EDGE_MASK: u32 = 0xFFFF_FC00;
const SUBTREE_MASK: u32 = 0xFFFE_0000;

/// Address plan of a fat tree of parameter N: https://en.wikipedia.org/wiki/Fat_tree.
///
/// The tree has 2N subtrees, each with N edge and N aggregation switches,
/// N^2 core switches and 2N^3 hosts (N per edge switch). Every interface gets
/// an address in 10.0.0.0/8, with the low 24 bits laid out as,
///
///```text
///                 | 7 bit   | 1 bit | 6 bit  | 2 bit | 8 bit   |
///   host -> edge  | subtree |   0   | edge   |  00   | host    |
///   edge -> host  | subtree |   0   | edge   |  10   | host    |
///   edge -> aggr  | subtree |   0   | edge   |  11   | aggr    |
///   aggr -> edge  | subtree |   0   | edge   |  01   | aggr    |
///
///                 | 7 bit   | 1 bit | 2 bit | 6 bit  | 8 bit   |
///   aggr -> core  | subtree |   1   |  00   | aggr   | core    |
///   core -> aggr  | subtree |   1   |  01   | core   | aggr    |
///```
///
/// Core switch `(i, m)` is the m-th core attached to aggregation switch `i`
/// of every subtree. Ids are numbered from 0 within their parent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FatTreeAddressing {
    size: u32,
}

impl FatTreeAddressing {
    pub fn new(size: usize) -> Result<Self, Error> {
        // Switch ids must fit in 6 bits and subtree ids in 7 bits.
        if size == 0 || size > 63 {
            return Err(Error::ProtocolViolation(format!(
                "fat tree size {} out of range 1..=63",
                size
            )));
        }
        Ok(Self { size: size as u32 })
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn num_subtrees(&self) -> usize {
        2 * self.size()
    }

    pub fn num_cores(&self) -> usize {
        self.size() * self.size()
    }

    pub fn num_hosts(&self) -> usize {
        self.num_subtrees() * self.size() * self.size()
    }

    fn lower(subtree: usize, edge: usize, kind: u32, id: usize) -> Ipv4Addr {
        let a = (((((10 << 7) + subtree as u32) << 7) + edge as u32) << 2) + kind;
        Ipv4Addr::from((a << 8) + id as u32)
    }

    fn upper(subtree: usize, kind: u32, switch: usize, id: usize) -> Ipv4Addr {
        let a = (((((10 << 7) + subtree as u32) << 3) + kind) << 6) + switch as u32;
        Ipv4Addr::from((a << 8) + id as u32)
    }

    /// Host `host` below edge switch `edge` of subtree `subtree`.
    pub fn host(&self, subtree: usize, edge: usize, host: usize) -> Ipv4Addr {
        Self::lower(subtree, edge, 0, host)
    }

    pub fn edge_to_host(&self, subtree: usize, edge: usize, host: usize) -> Ipv4Addr {
        Self::lower(subtree, edge, 2, host)
    }

    pub fn edge_to_aggr(&self, subtree: usize, edge: usize, aggr: usize) -> Ipv4Addr {
        Self::lower(subtree, edge, 3, aggr)
    }

    pub fn aggr_to_edge(&self, subtree: usize, edge: usize, aggr: usize) -> Ipv4Addr {
        Self::lower(subtree, edge, 1, aggr)
    }

    pub fn aggr_to_core(&self, subtree: usize, aggr: usize, core: usize) -> Ipv4Addr {
        Self::upper(subtree, 4, aggr, core)
    }

    pub fn core_to_aggr(&self, subtree: usize, aggr: usize, core: usize) -> Ipv4Addr {
        Self::upper(subtree, 5, core, aggr)
    }

    pub fn subtree_of(addr: Ipv4Addr) -> usize {
        ((u32::from(addr) >> 17) & 0x7F) as usize
    }

    pub fn edge_of(addr: Ipv4Addr) -> usize {
        ((u32::from(addr) >> 10) & 0x3F) as usize
    }

    /// Whether `addr` is the host facing interface of an edge switch of
    /// this tree.
    pub fn is_edge(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        (a & 0x0001_0000) == 0
            && (a & 0x0000_0300) == 0x0000_0200
            && Self::subtree_of(addr) < self.num_subtrees()
            && Self::edge_of(addr) < self.size()
    }

    /// Index of host `(subtree, edge, host)` in `FatTree::hosts`.
    pub fn host_index(&self, subtree: usize, edge: usize, host: usize) -> usize {
        (subtree * self.size() + edge) * self.size() + host
    }
}

/// Node handles of a built fat tree, in address order.
#[derive(Clone, Debug)]
pub struct FatTree {
    pub addressing: FatTreeAddressing,
    /// `edges[subtree * N + i]`
    pub edges: Vec<NodeIndex>,
    /// `aggrs[subtree * N + i]`
    pub aggrs: Vec<NodeIndex>,
    /// `cores[i * N + m]`
    pub cores: Vec<NodeIndex>,
    /// `hosts[(subtree * N + edge) * N + m]`
    pub hosts: Vec<NodeIndex>,
}

impl FatTree {
    pub fn host_address(&self, index: usize) -> Ipv4Addr {
        let n = self.addressing.size();
        self.addressing
            .host(index / (n * n), (index / n) % n, index % n)
    }
}

/// Build a fat tree of `config.fat_tree.size` into a new network.
///
/// Nodes are created switch by switch per subtree (N edges then N
/// aggregation switches), then the cores, then the hosts. Interfaces are
/// created host links first, then edge-aggregation, then aggregation-core
/// links, so that on every switch the downlinks are interfaces `1..=N` and
/// the uplinks `N+1..=2N`.
pub fn fat_tree(config: &Config) -> Result<(Network, FatTree), Error> {
    let addressing = FatTreeAddressing::new(config.fat_tree.size)?;
    let n = addressing.size();
    let hash = if config.fat_tree.packet_spray {
        HashKind::Random
    } else {
        config.routing.hash
    };

    let mut net = Network::new();
    let mut seed = config.routing.seed;
    let mut add = |net: &mut Network, name: String, kind: NodeKind| {
        seed = seed.wrapping_add(1);
        let routing = HashRouting::new(&config.routing, hash.build(seed))
            .with_seed(seed)
            .with_addressing(addressing);
        net.add_node(&name, kind, routing)
    };

    let mut edges = Vec::with_capacity(2 * n * n);
    let mut aggrs = Vec::with_capacity(2 * n * n);
    for j in 0..addressing.num_subtrees() {
        for i in 0..n {
            edges.push(add(&mut net, format!("edge_{}_{}", j, i), NodeKind::Edge));
        }
        for i in 0..n {
            aggrs.push(add(&mut net, format!("aggr_{}_{}", j, i), NodeKind::Aggregation));
        }
    }
    let cores: Vec<NodeIndex> = (0..addressing.num_cores())
        .map(|c| add(&mut net, format!("core_{}_{}", c / n, c % n), NodeKind::Core))
        .collect();
    let hosts: Vec<NodeIndex> = (0..addressing.num_hosts())
        .map(|h| {
            add(
                &mut net,
                format!("host_{}_{}_{}", h / (n * n), (h / n) % n, h % n),
                NodeKind::Host,
            )
        })
        .collect();

    let device = &config.device;
    let any = Ipv4Addr::UNSPECIFIED;

    // Host to edge.
    for j in 0..addressing.num_subtrees() {
        for i in 0..n {
            for m in 0..n {
                let edge = edges[j * n + i];
                let host = hosts[addressing.host_index(j, i, m)];
                let host_addr = addressing.host(j, i, m);
                net.connect(
                    (edge, addressing.edge_to_host(j, i, m)),
                    (host, host_addr),
                    config.fat_tree.host_edge,
                    device,
                )?;
                net.node_mut(host)?.routing.add_route(any, any, 1);
                net.node_mut(edge)?.routing.add_route(host_addr, HOST_MASK, m + 1);
            }
        }
    }

    // Edge to aggregation.
    for j in 0..addressing.num_subtrees() {
        for i in 0..n {
            for m in 0..n {
                let aggr = aggrs[j * n + m];
                let edge = edges[j * n + i];
                let aggr_addr = addressing.aggr_to_edge(j, i, m);
                net.connect(
                    (aggr, aggr_addr),
                    (edge, addressing.edge_to_aggr(j, i, m)),
                    config.fat_tree.edge_aggr,
                    device,
                )?;
                let prefix = u32::from(aggr_addr) & EDGE_MASK;
                net.node_mut(aggr)?.routing.add_route(
                    Ipv4Addr::from(prefix),
                    Ipv4Addr::from(EDGE_MASK),
                    i + 1,
                );
            }
        }
    }

    // Aggregation to core.
    for j in 0..addressing.num_subtrees() {
        for i in 0..n {
            for m in 0..n {
                let core = cores[i * n + m];
                let aggr = aggrs[j * n + i];
                let aggr_addr = addressing.aggr_to_core(j, i, m);
                net.connect(
                    (core, addressing.core_to_aggr(j, i, m)),
                    (aggr, aggr_addr),
                    config.fat_tree.aggr_core,
                    device,
                )?;
                let prefix = u32::from(aggr_addr) & SUBTREE_MASK;
                net.node_mut(core)?.routing.add_route(
                    Ipv4Addr::from(prefix),
                    Ipv4Addr::from(SUBTREE_MASK),
                    j + 1,
                );
            }
        }
    }

    log::debug!(
        "fat tree of size {}: {} nodes, {} channels",
        n,
        net.node_count(),
        net.channel_count()
    );
    Ok((
        net,
        FatTree {
            addressing,
            edges,
            aggrs,
            cores,
            hosts,
        },
    ))
}
