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

use crate::device::{DeviceId, LinkLayer, QbbNetDevice};
use crate::flow::FlowKey;
use crate::network::Network;
use crate::packet::Packet;
use crate::sim::{Scheduler, SimTime};
use petgraph::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug)]
struct SenderState {
    node: NodeIndex,
    device: DeviceId,
    flow: FlowKey,
    payload_bytes: u32,
    remaining: u64,
    sent: u64,
    failed: bool,
}

impl SenderState {
    fn packet(&self) -> Packet {
        Packet::data(
            self.flow.src,
            self.flow.dst,
            self.flow.proto,
            self.flow.src_port,
            self.flow.dst_port,
            self.payload_bytes,
        )
    }
}

/// Sends `packets` data packets of one flow from a host, as fast as the
/// send credit of the host's device allows.
///
/// Sending resumes from the device's tx-available notifications, so the
/// sender keeps at most a threshold worth of bytes queued on the host.
#[derive(Clone, Debug)]
pub struct BulkSender {
    state: Rc<RefCell<SenderState>>,
}

impl BulkSender {
    /// A sender on host `node`, which transmits on interface 1.
    pub fn new(node: NodeIndex, flow: FlowKey, packets: u64, payload_bytes: u32) -> Self {
        Self {
            state: Rc::new(RefCell::new(SenderState {
                node,
                device: DeviceId::new(node, 1),
                flow,
                payload_bytes,
                remaining: packets,
                sent: 0,
                failed: false,
            })),
        }
    }

    pub fn flow(&self) -> FlowKey {
        self.state.borrow().flow
    }

    pub fn sent(&self) -> u64 {
        self.state.borrow().sent
    }

    pub fn remaining(&self) -> u64 {
        self.state.borrow().remaining
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().remaining == 0
    }

    /// Whether a send was refused by the network.
    pub fn failed(&self) -> bool {
        self.state.borrow().failed
    }

    /// Register for tx-available notifications and send the first burst.
    pub fn start(&self, net: &mut Network, sched: &mut Scheduler<Network>) {
        let device = self.state.borrow().device;
        let state = Rc::clone(&self.state);
        net.add_tx_available_handler(
            device,
            Rc::new(
                move |net: &mut Network, sched: &mut Scheduler<Network>, _: DeviceId, _: u64| {
                    Self::pump(&state, net, sched)
                },
            ),
        );
        log::debug!("{} starts {} at {}", device, self.flow(), sched.now());
        Self::pump(&self.state, net, sched);
    }

    /// `start` at virtual time `at`.
    pub fn start_at(&self, sched: &mut Scheduler<Network>, at: SimTime) {
        let sender = self.clone();
        sched.schedule_at(at, move |net: &mut Network, s| sender.start(net, s));
    }

    fn pump(state: &Rc<RefCell<SenderState>>, net: &mut Network, sched: &mut Scheduler<Network>) {
        loop {
            // Reserve the packet before sending: the send may call back
            // into this function.
            let (node, packet) = {
                let mut s = state.borrow_mut();
                if s.remaining == 0 {
                    return;
                }
                let packet = s.packet();
                let credit = net.device(s.device).map_or(0, QbbNetDevice::tx_available);
                if credit < u64::from(packet.size()) {
                    return;
                }
                s.remaining -= 1;
                s.sent += 1;
                (s.node, packet)
            };
            if let Err(e) = net.send_from(sched, node, packet) {
                log::warn!("sender on node {} stops: {}", node.index(), e);
                let mut s = state.borrow_mut();
                s.sent -= 1;
                s.remaining = 0;
                s.failed = true;
                return;
            }
        }
    }
}
