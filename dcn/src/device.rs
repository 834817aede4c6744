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

//! Priority flow control ("QBB") point-to-point device.
//!
//! A device owns one unbounded queue per priority class and never drops a
//! packet. Instead, when a class queue grows past the configured threshold it
//! asks the upstream neighbour that last fed that class to stop, by sending a
//! PAUSE frame out of the interface the traffic came in on. A device that
//! receives a PAUSE stops serving the named class until the pause expires.
//!
//! Device operations need access to sibling devices of the same node (PAUSE
//! frames leave through another interface) and to the channel, so they are
//! associated functions over the simulated world rather than methods.

use crate::config::DeviceConfiguration;
use crate::packet::{Packet, PauseHeader};
use crate::queue::QueueBank;
use crate::sim::{EventId, Scheduler, SimTime};
use crate::Error;
use itertools::Itertools;
use petgraph::prelude::*;
use std::fmt;
use std::net::Ipv4Addr;

/// Identifies an interface of a node and the device attached to it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceId {
    pub node: NodeIndex,
    pub iface: usize,
}

impl DeviceId {
    pub fn new(node: NodeIndex, iface: usize) -> Self {
        Self { node, iface }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[node {} dev {}]", self.node.index(), self.iface)
    }
}

/// What a device needs from the world it lives in.
pub trait LinkLayer: Sized + 'static {
    fn device(&self, id: DeviceId) -> Option<&QbbNetDevice>;
    fn device_mut(&mut self, id: DeviceId) -> Option<&mut QbbNetDevice>;
    /// Whether a channel is attached to the device.
    fn is_link_up(&self, id: DeviceId) -> bool;
    /// Serialisation time of `bytes` on the channel of `id`.
    fn tx_time(&self, id: DeviceId, bytes: u32) -> Result<SimTime, Error>;
    /// Put a packet on the channel of `id`. The world delivers it to the peer
    /// device after `tx_time` plus the propagation delay.
    fn channel_transmit(
        &mut self,
        sched: &mut Scheduler<Self>,
        id: DeviceId,
        packet: Packet,
        tx_time: SimTime,
    ) -> Result<(), Error>;
    /// Hand a received data packet to the node's IP layer.
    fn deliver_up(&mut self, sched: &mut Scheduler<Self>, id: DeviceId, packet: Packet);
    /// Whether `addr` is one of the addresses of `node`.
    fn is_local(&self, node: NodeIndex, addr: Ipv4Addr) -> bool;
    /// Tell the listeners of `id` that `available` bytes can be sent.
    fn notify_tx_available(&mut self, sched: &mut Scheduler<Self>, id: DeviceId, available: u64);
}

/// Maps a packet to its priority class.
pub type Classifier = fn(&Packet) -> usize;

/// Every packet goes to class 0.
pub fn default_classifier(_: &Packet) -> usize {
    0
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceStats {
    pub enqueued: u64,
    pub transmitted: u64,
    pub transmitted_bytes: u64,
    pub received: u64,
    pub pauses_sent: u64,
    pub pauses_received: u64,
    /// PAUSE frames dropped because flow control is disabled.
    pub pauses_discarded: u64,
    /// Times the transmitter had queued packets but every class holding them
    /// was paused.
    pub backpressure: u64,
}

pub struct QbbNetDevice {
    id: DeviceId,
    /// Address of the interface; source of generated PAUSE frames.
    address: Ipv4Addr,
    config: DeviceConfiguration,
    queues: QueueBank,
    paused: Vec<bool>,
    resume_events: Vec<Option<EventId>>,
    recheck_events: Vec<Option<EventId>>,
    /// The interface that most recently fed each class.
    upstream: Vec<Option<usize>>,
    last_class: usize,
    busy: bool,
    classifier: Classifier,
    pause_identification: u16,
    stats: DeviceStats,
}

impl fmt::Debug for QbbNetDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QbbNetDevice")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("paused", &self.paused)
            .field("last_class", &self.last_class)
            .field("busy", &self.busy)
            .finish()
    }
}

impl QbbNetDevice {
    pub fn new(id: DeviceId, address: Ipv4Addr, config: &DeviceConfiguration) -> Result<Self, Error> {
        let queues = QueueBank::new(config.num_classes, config.ecn_threshold)?;
        let n = config.num_classes;
        Ok(Self {
            id,
            address,
            config: config.clone(),
            queues,
            paused: vec![false; n],
            resume_events: vec![None; n],
            recheck_events: vec![None; n],
            upstream: vec![None; n],
            last_class: n - 1,
            busy: false,
            classifier: default_classifier,
            pause_identification: 0,
            stats: DeviceStats::default(),
        })
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn qbb_enabled(&self) -> bool {
        self.config.qbb_enabled
    }

    pub fn num_classes(&self) -> usize {
        self.queues.num_classes()
    }

    pub fn is_paused(&self, class: usize) -> bool {
        self.paused.get(class).copied().unwrap_or(false)
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn last_class(&self) -> usize {
        self.last_class
    }

    pub fn upstream(&self, class: usize) -> Option<usize> {
        self.upstream.get(class).copied().flatten()
    }

    pub fn queues(&self) -> &QueueBank {
        &self.queues
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Bytes the class can still take before reaching the PAUSE threshold.
    pub fn send_credit(&self, class: usize) -> Result<u64, Error> {
        Ok(self.config.threshold.saturating_sub(self.queues.byte_len(class)?))
    }

    /// Send credit of the default class.
    pub fn tx_available(&self) -> u64 {
        self.send_credit(0).unwrap_or(0)
    }

    /// One line per class: paused flag and occupancy.
    pub fn status(&self) -> String {
        format!(
            "{} qbb={} busy={} last_class={}\n{}",
            self.id,
            self.config.qbb_enabled,
            self.busy,
            self.last_class,
            self.queues
                .iter()
                .enumerate()
                .map(|(class, q)| format!(
                    "  class {}: paused={} packets={} bytes={}",
                    class,
                    self.paused[class],
                    q.packet_count(),
                    q.byte_len()
                ))
                .format("\n")
        )
    }

    fn check_class(&self, class: usize) -> Result<(), Error> {
        if class >= self.num_classes() {
            return Err(Error::ProtocolViolation(format!(
                "{} class {} out of range 0..{}",
                self.id,
                class,
                self.num_classes()
            )));
        }
        Ok(())
    }

    /// Queue a packet for transmission, or put a PAUSE frame straight on the
    /// wire.
    pub fn send<W: LinkLayer>(
        world: &mut W,
        sched: &mut Scheduler<W>,
        id: DeviceId,
        mut packet: Packet,
    ) -> Result<(), Error> {
        if !world.is_link_up(id) {
            return Err(Error::LinkDown(id));
        }
        let dev = world.device_mut(id).ok_or(Error::InvalidDevice(id))?;

        if packet.is_pause() {
            if !dev.config.qbb_enabled {
                dev.stats.pauses_discarded += 1;
                return Ok(());
            }
            dev.stats.pauses_sent += 1;
            log::info!("{} deliver PAUSE at {}", id, sched.now());
            // Out of band: bypasses the queues and the busy transmitter.
            let tx_time = world.tx_time(id, packet.size())?;
            return world.channel_transmit(sched, id, packet, tx_time);
        }

        let class = (dev.classifier)(&packet);
        dev.check_class(class)?;
        if let Some(ingress) = packet.ingress.take() {
            log::trace!("{} class {} fed from dev {}", id, class, ingress);
            dev.upstream[class] = Some(ingress);
        }
        let source = packet.ip.source;
        dev.queues.enqueue(class, packet)?;
        dev.stats.enqueued += 1;
        log::debug!(
            "{} queue {} length {}",
            id,
            class,
            dev.queues.packet_count(class)?
        );
        let qbb_enabled = dev.config.qbb_enabled;

        Self::dequeue_and_transmit(world, sched, id)?;

        if qbb_enabled && !world.is_local(id.node, source) {
            // A pending recheck re-evaluates the queue on its own.
            let recheck_pending = world
                .device(id)
                .and_then(|dev| dev.recheck_events[class])
                .map_or(false, |event| sched.is_pending(event));
            if !recheck_pending {
                Self::check_queue_full(world, sched, id, class)?;
            }
        }
        Ok(())
    }

    /// Start transmitting the next packet, serving unpaused classes round
    /// robin. Does nothing while the transmitter is busy.
    pub fn dequeue_and_transmit<W: LinkLayer>(
        world: &mut W,
        sched: &mut Scheduler<W>,
        id: DeviceId,
    ) -> Result<(), Error> {
        let dev = world.device_mut(id).ok_or(Error::InvalidDevice(id))?;
        if dev.busy {
            return Ok(());
        }

        let n = dev.num_classes();
        let mut empty = true;
        let mut class = dev.last_class;
        let mut next = None;
        for _ in 0..n {
            class = (class + 1) % n;
            if dev.queues.packet_count(class)? > 0 {
                empty = false;
            }
            if dev.paused[class] && dev.config.qbb_enabled {
                continue;
            }
            if let Some(packet) = dev.queues.dequeue(class)? {
                next = Some((class, packet));
                break;
            }
        }

        let (class, packet) = match next {
            Some(next) => next,
            None => {
                if !empty {
                    dev.stats.backpressure += 1;
                    log::info!("{} PAUSE prohibits send at {}", id, sched.now());
                }
                return Ok(());
            }
        };

        dev.last_class = class;
        dev.busy = true;
        dev.stats.transmitted += 1;
        dev.stats.transmitted_bytes += u64::from(packet.size());
        let available = dev.tx_available();
        log::debug!(
            "{} dequeue from queue {}, now has len={}",
            id,
            class,
            dev.queues.packet_count(class)?
        );

        let tx_time = world.tx_time(id, packet.size())?;
        sched.schedule(tx_time, move |w: &mut W, s: &mut Scheduler<W>| {
            if let Err(e) = Self::transmit_complete(w, s, id) {
                log::error!("{} transmit complete: {}", id, e);
            }
        });
        world.channel_transmit(sched, id, packet, tx_time)?;
        if available > 0 {
            world.notify_tx_available(sched, id, available);
        }
        Ok(())
    }

    pub fn transmit_complete<W: LinkLayer>(
        world: &mut W,
        sched: &mut Scheduler<W>,
        id: DeviceId,
    ) -> Result<(), Error> {
        let dev = world.device_mut(id).ok_or(Error::InvalidDevice(id))?;
        if !dev.busy {
            return Err(Error::ProtocolViolation(format!(
                "{} transmit complete while idle",
                id
            )));
        }
        dev.busy = false;
        Self::dequeue_and_transmit(world, sched, id)
    }

    /// A packet arrived from the channel. PAUSE frames update the pause state
    /// of this device; everything else goes up to the IP layer tagged with
    /// the receiving interface.
    pub fn receive<W: LinkLayer>(
        world: &mut W,
        sched: &mut Scheduler<W>,
        id: DeviceId,
        mut packet: Packet,
    ) -> Result<(), Error> {
        let dev = world.device_mut(id).ok_or(Error::InvalidDevice(id))?;
        if !packet.is_pause() {
            dev.stats.received += 1;
            packet.ingress = Some(id.iface);
            log::debug!("{} received packet {}", id, packet);
            world.deliver_up(sched, id, packet);
            return Ok(());
        }

        dev.stats.pauses_received += 1;
        if !dev.config.qbb_enabled {
            return Ok(());
        }
        let header = packet.pause_header()?;
        let class = header.class as usize;
        dev.check_class(class)?;
        log::debug!(
            "{} received PAUSE. Pausing queue {} for {}us",
            id,
            class,
            header.time_us
        );
        dev.paused[class] = true;
        if let Some(event) = dev.resume_events[class].take() {
            sched.cancel(event);
        }
        let event = sched.schedule(
            SimTime::from_micros(u64::from(header.time_us)),
            move |w: &mut W, s: &mut Scheduler<W>| {
                if let Err(e) = Self::resume(w, s, id, class) {
                    log::error!("{} resume: {}", id, e);
                }
            },
        );
        dev.resume_events[class] = Some(event);
        Ok(())
    }

    /// The pause of `class` expired.
    pub fn resume<W: LinkLayer>(
        world: &mut W,
        sched: &mut Scheduler<W>,
        id: DeviceId,
        class: usize,
    ) -> Result<(), Error> {
        let dev = world.device_mut(id).ok_or(Error::InvalidDevice(id))?;
        dev.check_class(class)?;
        if !dev.paused[class] {
            return Err(Error::ProtocolViolation(format!(
                "{} resume of class {} that is not paused",
                id, class
            )));
        }
        dev.paused[class] = false;
        dev.resume_events[class] = None;
        log::info!("{} queue {} resumed at {}", id, class, sched.now());
        Self::dequeue_and_transmit(world, sched, id)
    }

    /// If `class` is above the threshold, PAUSE the interface that last fed
    /// it and re-evaluate after half the pause time.
    pub fn check_queue_full<W: LinkLayer>(
        world: &mut W,
        sched: &mut Scheduler<W>,
        id: DeviceId,
        class: usize,
    ) -> Result<(), Error> {
        let dev = world.device_mut(id).ok_or(Error::InvalidDevice(id))?;
        let bytes = dev.queues.byte_len(class)?;
        if bytes <= dev.config.threshold {
            return Ok(());
        }

        let header = PauseHeader::new(
            dev.config.pause_time_us,
            dev.queues.packet_count(class)? as u32,
            class as u32,
        );
        dev.pause_identification = dev.pause_identification.wrapping_add(1);
        let pause = Packet::pause(dev.address, &header, dev.pause_identification);
        log::info!(
            "{} queue {} bytes {} send PAUSE at {}",
            id,
            class,
            bytes,
            sched.now()
        );

        if let Some(event) = dev.recheck_events[class].take() {
            sched.cancel(event);
        }
        let recheck = SimTime::from_micros(u64::from(dev.config.pause_time_us / 2));
        let event = sched.schedule(recheck, move |w: &mut W, s: &mut Scheduler<W>| {
            if let Err(e) = Self::check_queue_full(w, s, id, class) {
                log::error!("{} recheck: {}", id, e);
            }
        });
        dev.recheck_events[class] = Some(event);

        let upstream = dev.upstream[class];
        match upstream {
            Some(iface) => {
                log::debug!("{} sending pause to interface {}", id, iface);
                Self::send(world, sched, DeviceId::new(id.node, iface), pause)
            }
            None => {
                log::debug!("{} no upstream neighbour for queue {}", id, class);
                Ok(())
            }
        }
    }
}
