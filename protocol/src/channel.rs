//! # Clocked Multicast Channel
//!
//! A [`ChannelState`] is the replication state of one audience: the channel clock and a
//! bounded log of the most recent messages, kept for retransmission.
//!
//! [`ReliableChannel`] guards a channel state and implements ordered delivery on top of an
//! unreliable multicast transport. Missing clocks are requested from the sender of the
//! message that revealed the gap, before that message is delivered.

use crate::{
    address::NodeAddress,
    message::{Audience, Command, Envelope},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Channel clock mismatch: expected {expected}, received {received}")]
pub struct ClockMismatch {
    pub expected: u64,
    pub received: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelState {
    clock: u64,
    log: BTreeMap<u64, Command>,
    capacity: usize,
}

impl ChannelState {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            clock: 0,
            log: BTreeMap::new(),
            capacity,
        }
    }

    #[must_use]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clocks currently retained, oldest first
    pub fn logged_clocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.log.keys().copied()
    }

    /// Advance the clock for a locally originated message and retain it.
    pub fn stamp(&mut self, command: Command) -> u64 {
        self.clock += 1;
        self.record(self.clock, command);
        self.clock
    }

    /// Accept the message following the current clock.
    pub fn accept(&mut self, clock: u64, command: Command) -> Result<(), ClockMismatch> {
        self.advance(clock)?;
        self.record(clock, command);
        Ok(())
    }

    /// Advance over a clock whose message can't be recovered anymore.
    pub fn skip(&mut self, clock: u64) -> Result<(), ClockMismatch> {
        self.advance(clock)
    }

    /// Advance over a whole range of clocks at once. The range has to start right after the
    /// current clock.
    pub fn skip_range(&mut self, clocks: Range<u64>) -> Result<(), ClockMismatch> {
        if clocks.is_empty() {
            return Ok(());
        }
        self.advance(clocks.start)?;
        self.clock = clocks.end - 1;
        Ok(())
    }

    #[must_use]
    pub fn replay(&self, clock: u64) -> Option<&Command> {
        self.log.get(&clock)
    }

    fn advance(&mut self, clock: u64) -> Result<(), ClockMismatch> {
        let expected = self.clock.saturating_add(1);
        if clock != expected {
            return Err(ClockMismatch {
                expected,
                received: clock,
            });
        }
        self.clock = clock;
        Ok(())
    }

    fn record(&mut self, clock: u64, command: Command) {
        self.log.insert(clock, command);
        while self.log.len() > self.capacity {
            self.log.pop_first();
        }
    }
}

/// Outcome of [`ReliableChannel::receive`]
#[derive(Debug, PartialEq, Eq)]
pub enum Arrival {
    /// Our own multicast, looped back by the network
    Loopback,
    /// Envelope without a clock, it doesn't belong on a channel
    Unclocked,
    /// Already seen, or older than what we've seen
    Stale { clock: u64, local: u64 },
    /// Delivered, together with the gap before it
    Delivered {
        clock: u64,
        recovered: Vec<u64>,
        /// Clocks the sender couldn't replay
        lost: Vec<u64>,
        /// Clocks too old for the sender to still retain, never requested
        evicted: Range<u64>,
    },
    /// The channel clock moved under us while filling the gap
    Inconsistent(ClockMismatch),
}

pub struct ReliableChannel {
    audience: Audience,
    local: NodeAddress,
    state: Mutex<ChannelState>,
    // Serializes receivers, so that gap filling for one envelope completes before the next.
    // The state lock itself is never held across a fetch or a delivery.
    delivery: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReliableChannel {
    #[must_use]
    pub fn new(audience: Audience, local: NodeAddress, capacity: usize) -> Self {
        Self {
            audience,
            local,
            state: Mutex::new(ChannelState::new(capacity)),
            delivery: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn audience(&self) -> Audience {
        self.audience
    }

    #[must_use]
    pub fn clock(&self) -> u64 {
        lock(&self.state).clock()
    }

    /// Copy of the current state, for state transfer
    #[must_use]
    pub fn state(&self) -> ChannelState {
        lock(&self.state).clone()
    }

    /// Take over a state received through state transfer, unless the channel has already
    /// moved up to or past its clock. Returns whether the state was taken.
    ///
    /// Waits for a receive in progress, the clock never moves backwards.
    pub fn restore(&self, state: ChannelState) -> bool {
        let _delivery = lock(&self.delivery);
        let mut current = lock(&self.state);
        if current.clock() >= state.clock() {
            return false;
        }
        *current = state;
        true
    }

    /// Stamp a command with the next clock and retain it, in one step.
    #[must_use]
    pub fn stamp(&self, command: Command) -> Envelope {
        let clock = lock(&self.state).stamp(command.clone());
        Envelope::multicast(command, self.local.clone(), clock)
    }

    /// Answer a retransmission request. The replay carries no clock.
    #[must_use]
    pub fn replay(&self, clock: u64) -> Option<Envelope> {
        lock(&self.state)
            .replay(clock)
            .map(|command| Envelope::unicast(command.clone(), self.local.clone()))
    }

    /// Deliver `envelope` in clock order.
    ///
    /// Every clock between the local clock and the envelope's clock is requested with `fetch`
    /// first. Clocks older than the channel capacity allows the sender to retain are skipped
    /// in one step without asking. Clocks that can't be fetched are lost, and the clock moves
    /// past them.
    ///
    /// `deliver` is called once per accepted message, in increasing clock order.
    pub fn receive<F, D>(&self, envelope: Envelope, mut fetch: F, mut deliver: D) -> Arrival
    where
        F: FnMut(u64) -> Option<Command>,
        D: FnMut(u64, Command),
    {
        let Some(clock) = envelope.clock else {
            return Arrival::Unclocked;
        };
        if envelope.sender == self.local {
            return Arrival::Loopback;
        }

        let _delivery = lock(&self.delivery);
        let (local, capacity) = {
            let state = lock(&self.state);
            (state.clock(), state.capacity() as u64)
        };
        if clock <= local {
            return Arrival::Stale { clock, local };
        }

        // The sender retains clocks after `clock - capacity` at most
        let window = clock.saturating_sub(capacity).saturating_add(1).max(local + 1);
        let evicted = local + 1..window;
        if let Err(mismatch) = lock(&self.state).skip_range(evicted.clone()) {
            return Arrival::Inconsistent(mismatch);
        }

        let mut recovered = Vec::new();
        let mut lost = Vec::new();
        for missing in window..clock {
            let command = fetch(missing);
            let mut state = lock(&self.state);
            match command {
                Some(command) => {
                    if let Err(mismatch) = state.accept(missing, command.clone()) {
                        return Arrival::Inconsistent(mismatch);
                    }
                    drop(state);
                    deliver(missing, command);
                    recovered.push(missing);
                }
                None => {
                    if let Err(mismatch) = state.skip(missing) {
                        return Arrival::Inconsistent(mismatch);
                    }
                    lost.push(missing);
                }
            }
        }

        let command = envelope.command;
        if let Err(mismatch) = lock(&self.state).accept(clock, command.clone()) {
            return Arrival::Inconsistent(mismatch);
        }
        deliver(clock, command);
        Arrival::Delivered {
            clock,
            recovered,
            lost,
            evicted,
        }
    }
}
