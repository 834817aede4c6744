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

//! Discrete-event scheduling.
//!
//! The simulation is single threaded: an event is a closure that receives the
//! simulated world and the scheduler, and may schedule further events. Events
//! are ordered by `(time, sequence)`, so events at the same virtual time run
//! in the order they were scheduled.

use log::trace;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::ops::{Add, Sub};

/// Virtual time in nanoseconds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SimTime(pub u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }
    pub fn from_micros(us: u64) -> Self {
        SimTime(us.saturating_mul(1_000))
    }
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms.saturating_mul(1_000_000))
    }
    pub fn from_secs_f64(secs: f64) -> Self {
        SimTime((secs * 1e9) as u64)
    }
    pub fn as_nanos(self) -> u64 {
        self.0
    }
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }
}

impl Add for SimTime {
    type Output = SimTime;
    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl Sub for SimTime {
    type Output = SimTime;
    fn sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.9}s", self.as_secs_f64())
    }
}

/// Handle of a scheduled event, used for cancellation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventId(u64);

pub type Action<W> = Box<dyn FnOnce(&mut W, &mut Scheduler<W>)>;

pub struct Scheduler<W> {
    now: SimTime,
    next_seq: u64,
    /// Ordered by (time, sequence); entries whose action was cancelled stay
    /// in the heap and are skipped when popped.
    queue: BinaryHeap<Reverse<(SimTime, u64)>>,
    /// Live actions by sequence number. An event is pending iff it is here.
    actions: HashMap<u64, Action<W>>,
    stopped: bool,
    executed: u64,
}

impl<W> Default for Scheduler<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Scheduler<W> {
    pub fn new() -> Self {
        Scheduler {
            now: SimTime::ZERO,
            next_seq: 0,
            queue: BinaryHeap::new(),
            actions: HashMap::new(),
            stopped: false,
            executed: 0,
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of events executed so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Number of live (not yet executed, not cancelled) events.
    pub fn pending(&self) -> usize {
        self.actions.len()
    }

    /// Schedule `action` to run `delay` after the current time.
    pub fn schedule<F>(&mut self, delay: SimTime, action: F) -> EventId
    where
        F: FnOnce(&mut W, &mut Scheduler<W>) + 'static,
    {
        let at = self.now + delay;
        self.schedule_at(at, action)
    }

    /// Schedule `action` at an absolute time. Times in the past are clamped to
    /// now.
    pub fn schedule_at<F>(&mut self, at: SimTime, action: F) -> EventId
    where
        F: FnOnce(&mut W, &mut Scheduler<W>) + 'static,
    {
        let at = std::cmp::max(at, self.now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse((at, seq)));
        self.actions.insert(seq, Box::new(action));
        trace!("schedule event {} at {}", seq, at);
        EventId(seq)
    }

    /// Cancel a pending event. Returns false if the event already ran or was
    /// already cancelled. A cancelled event never fires.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.actions.remove(&id.0).is_some()
    }

    pub fn is_pending(&self, id: EventId) -> bool {
        self.actions.contains_key(&id.0)
    }

    /// Stop the run loop after the current event.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn pop_live(&mut self, end: SimTime) -> Option<(SimTime, Action<W>)> {
        while let Some(Reverse((at, seq))) = self.queue.peek().copied() {
            if at > end {
                return None;
            }
            self.queue.pop();
            if let Some(action) = self.actions.remove(&seq) {
                return Some((at, action));
            }
        }
        None
    }

    /// Execute the next live event, if any. Returns false when no event is left.
    pub fn step(&mut self, world: &mut W) -> bool {
        match self.pop_live(SimTime::MAX) {
            Some((at, action)) => {
                self.now = at;
                self.executed += 1;
                action(world, self);
                true
            }
            None => false,
        }
    }

    /// Run until no events are left or `stop` is called.
    pub fn run(&mut self, world: &mut W) {
        self.run_until(world, SimTime::MAX)
    }

    /// Run all events scheduled at or before `end`, then advance the clock to
    /// `end` (unless stopped earlier or `end` is unbounded).
    pub fn run_until(&mut self, world: &mut W, end: SimTime) {
        self.stopped = false;
        while !self.stopped {
            match self.pop_live(end) {
                Some((at, action)) => {
                    self.now = at;
                    self.executed += 1;
                    action(world, self);
                }
                None => {
                    if end != SimTime::MAX {
                        self.now = std::cmp::max(self.now, end);
                    }
                    break;
                }
            }
        }
    }
}
