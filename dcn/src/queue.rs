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

use crate::packet::{Ecn, Packet};
use crate::Error;
use log::trace;
use std::collections::VecDeque;

/// An unbounded FIFO of packets with byte and packet counters.
///
/// Enqueue never fails. When a mark threshold is configured, ECN capable
/// packets that would bring the queue to or past the threshold are marked
/// CE; packets that are not ECN capable are left alone.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    packets: VecDeque<Packet>,
    bytes: u64,
    mark_threshold: Option<u64>,
    received_bytes: u64,
    sent_bytes: u64,
    marked: u64,
}

impl PriorityQueue {
    pub fn new(mark_threshold: Option<u64>) -> Self {
        Self {
            mark_threshold,
            ..Default::default()
        }
    }

    pub fn enqueue(&mut self, mut packet: Packet) {
        let size = u64::from(packet.size());
        if let Some(threshold) = self.mark_threshold {
            if self.bytes + size >= threshold && packet.ip.ecn.is_ect() {
                trace!("mark CE on {}", packet);
                packet.ip.ecn = Ecn::Ce;
                self.marked += 1;
            }
        }
        self.bytes += size;
        self.received_bytes += size;
        self.packets.push_back(packet);
    }

    pub fn dequeue(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        let size = u64::from(packet.size());
        self.bytes -= size;
        self.sent_bytes += size;
        Some(packet)
    }

    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn byte_len(&self) -> u64 {
        self.bytes
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Total bytes ever enqueued.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Total bytes ever dequeued.
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    /// Number of packets marked CE on enqueue.
    pub fn marked(&self) -> u64 {
        self.marked
    }
}

/// One queue per priority class of an interface.
#[derive(Debug)]
pub struct QueueBank {
    queues: Vec<PriorityQueue>,
}

impl QueueBank {
    pub fn new(num_classes: usize, mark_threshold: Option<u64>) -> Result<Self, Error> {
        if num_classes == 0 {
            return Err(Error::ProtocolViolation(
                "a queue bank needs at least one class".to_string(),
            ));
        }
        Ok(Self {
            queues: (0..num_classes)
                .map(|_| PriorityQueue::new(mark_threshold))
                .collect(),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.queues.len()
    }

    fn queue(&self, class: usize) -> Result<&PriorityQueue, Error> {
        self.queues.get(class).ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "class {} out of range 0..{}",
                class,
                self.queues.len()
            ))
        })
    }

    fn queue_mut(&mut self, class: usize) -> Result<&mut PriorityQueue, Error> {
        let len = self.queues.len();
        self.queues.get_mut(class).ok_or_else(|| {
            Error::ProtocolViolation(format!("class {} out of range 0..{}", class, len))
        })
    }

    pub fn enqueue(&mut self, class: usize, packet: Packet) -> Result<(), Error> {
        self.queue_mut(class)?.enqueue(packet);
        Ok(())
    }

    pub fn dequeue(&mut self, class: usize) -> Result<Option<Packet>, Error> {
        Ok(self.queue_mut(class)?.dequeue())
    }

    pub fn peek(&self, class: usize) -> Result<Option<&Packet>, Error> {
        Ok(self.queue(class)?.peek())
    }

    pub fn byte_len(&self, class: usize) -> Result<u64, Error> {
        Ok(self.queue(class)?.byte_len())
    }

    pub fn packet_count(&self, class: usize) -> Result<usize, Error> {
        Ok(self.queue(class)?.packet_count())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(PriorityQueue::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PriorityQueue> {
        self.queues.iter()
    }
}
