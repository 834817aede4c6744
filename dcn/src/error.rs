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

use petgraph::prelude::*;
use std::fmt;
use std::net::Ipv4Addr;

use crate::DeviceId;

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Error {
    /// The destination cannot be resolved by hash routing (non-unicast, or
    /// forwarding disabled on the ingress interface).
    NoRoute(Ipv4Addr),
    /// A hash lookup was attempted on a node that has no uplinks.
    NoUplinks,
    /// A reroute was requested but no uplink other than the given one exists.
    NoAlternatePort(usize),
    InvalidNode(NodeIndex),
    InvalidInterface(NodeIndex, usize),
    InvalidDevice(DeviceId),
    /// No channel is attached to the device.
    LinkDown(DeviceId),
    MalformedPause,
    ProtocolViolation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoRoute(addr) => write!(f, "ERROR: No route to host {}", addr),
            Self::NoAlternatePort(port) => {
                write!(f, "ERROR: No uplink other than port {} to reroute to", port)
            }
            Self::InvalidNode(n) => write!(f, "ERROR: Invalid node {}", n.index()),
            Self::InvalidInterface(n, i) => {
                write!(f, "ERROR: Invalid interface {} for node {}", i, n.index())
            }
            Self::InvalidDevice(id) => write!(f, "ERROR: No device at {}", id),
            Self::LinkDown(id) => write!(f, "ERROR: Link down at {}", id),
            Self::ProtocolViolation(msg) => write!(f, "ERROR: Protocol violation: {}", msg),
            _ => write!(f, "{:?}", self),
        }
    }
}

// Lets `anyhow::Result` carry our errors in the scenario binaries.
impl std::error::Error for Error {}
