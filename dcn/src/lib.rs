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


//! Data-plane model of a lossless multipath datacenter fabric: priority flow
//! control devices that PAUSE their upstream neighbours, and hash based
//! multipath routing with flow pinning and congestion triggered rerouting,
//! running on a discrete-event simulated network.

mod config;
mod device;
mod error;
mod flow;
mod hash;
mod network;
mod packet;
mod queue;
mod routing;
mod sim;
pub mod topology;
mod traffic;

pub use crate::config::{
    Config, DeviceConfiguration, FatTreeConfiguration, LinkConfiguration, RoutingConfiguration,
    NUM_CLASSES,
};
pub use crate::device::{default_classifier, Classifier, DeviceId, DeviceStats, LinkLayer, QbbNetDevice};
pub use crate::error::Error;
pub use crate::flow::{FlowKey, FLOW_KEY_BYTES};
pub use crate::hash::{super_fast_hash, HashFunction, HashKind, HsiehHash, RandomHash};
pub use crate::network::{Channel, Delivery, Network, Node, NodeKind, NodeStats, TxAvailableHandler};
pub use crate::packet::{
    Ecn, Ipv4Header, Packet, PauseHeader, Payload, TransportHeader, CN_HEADER_SIZE, DEFAULT_TTL,
    IPV4_HEADER_SIZE, PAUSE_HEADER_SIZE, PROTO_CN, PROTO_PAUSE, PROTO_TCP, PROTO_UDP,
    TCP_HEADER_SIZE, UDP_HEADER_SIZE,
};
pub use crate::queue::{PriorityQueue, QueueBank};
pub use crate::routing::{
    CongestionRecord, DestinationRoute, FlowRoute, HashRouting, InputRoute, Interface,
    OutputRoute,
};
pub use crate::sim::{EventId, Scheduler, SimTime};
pub use crate::topology::{fat_tree, FatTree, FatTreeAddressing};
pub use crate::traffic::BulkSender;
pub use petgraph::graph::NodeIndex;
