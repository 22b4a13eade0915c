// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One link's ring pair, doorbell and TX lock
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal
//! TEST_COVERAGE: 4 unit tests
//!
//! INVARIANTS:
//!   - The TX push happens only while the link's HwMutex id is held
//!   - The doorbell is rung after the lock is released
//!   - Only the pump pops the RX ring
//!   - The first hardware fault is kept; later ones are only logged

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::error;
use nexus_hal::{Doorbell, IrqLine};
use nexus_hwmutex::HwMutex;
use parking_lot::Mutex;

use crate::error::{HardwareFault, ProtocolViolation};
use crate::message::Message;
use crate::ring::{RingChannel, RingError};

/// Per-link counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Messages pushed into the TX ring (control included).
    pub sent: u64,
    /// Messages popped from the RX ring.
    pub received: u64,
    /// Push attempts that found the TX ring full.
    pub ring_full: u64,
    /// Inbound messages dropped as protocol violations.
    pub violations: u64,
    /// Link resets performed.
    pub resets: u64,
    /// Most recent protocol violation.
    pub last_violation: Option<ProtocolViolation>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    ring_full: AtomicU64,
    violations: AtomicU64,
    resets: AtomicU64,
}

pub(crate) struct LinkTransport {
    name: String,
    dest: u8,
    tx: RingChannel,
    rx: RingChannel,
    doorbell: Arc<dyn Doorbell>,
    hwmutex: Arc<HwMutex>,
    tx_lock: usize,
    spin_budget: Duration,
    down: AtomicBool,
    fault: Mutex<Option<HardwareFault>>,
    last_violation: Mutex<Option<ProtocolViolation>>,
    counters: Counters,
}

impl LinkTransport {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        dest: u8,
        tx: RingChannel,
        rx: RingChannel,
        doorbell: Arc<dyn Doorbell>,
        hwmutex: Arc<HwMutex>,
        tx_lock: usize,
        spin_budget: Duration,
    ) -> Self {
        Self {
            name,
            dest,
            tx,
            rx,
            doorbell,
            hwmutex,
            tx_lock,
            spin_budget,
            down: AtomicBool::new(false),
            fault: Mutex::new(None),
            last_violation: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dest(&self) -> u8 {
        self.dest
    }

    pub(crate) fn irq(&self) -> &IrqLine {
        self.doorbell.irq()
    }

    /// One push attempt under the TX lock. `Ok(false)` means the ring is full.
    pub(crate) fn try_send(&self, msg: &Message) -> Result<bool, HardwareFault> {
        let pushed = {
            let _guard = self.hwmutex.lock(self.tx_lock, self.spin_budget)?;
            self.tx.try_push(msg)
        };
        match pushed {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                self.doorbell.trigger()?;
                Ok(true)
            }
            Err(RingError::Full) => {
                self.counters.ring_full.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(err) => Err(HardwareFault::Ring(err)),
        }
    }

    /// Rings the remote without pushing, so a full ring gets drained.
    pub(crate) fn nudge(&self) -> Result<(), HardwareFault> {
        Ok(self.doorbell.trigger()?)
    }

    pub(crate) fn pending(&self) -> Result<bool, HardwareFault> {
        Ok(self.doorbell.pending()?)
    }

    pub(crate) fn ack(&self) -> Result<(), HardwareFault> {
        Ok(self.doorbell.clear()?)
    }

    /// Pops the RX ring until empty, handing each message to `sink`.
    pub(crate) fn drain(&self, mut sink: impl FnMut(Message)) -> Result<usize, HardwareFault> {
        let mut drained = 0;
        loop {
            match self.rx.try_pop() {
                Ok(msg) => {
                    drained += 1;
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    sink(msg);
                }
                Err(RingError::Empty) => return Ok(drained),
                Err(err) => return Err(HardwareFault::Ring(err)),
            }
        }
    }

    /// Skips everything unread in the RX ring. Only valid with the pump stopped.
    pub(crate) fn discard_rx(&self) -> Result<usize, HardwareFault> {
        self.rx.discard_all().map_err(HardwareFault::Ring)
    }

    pub(crate) fn record_violation(&self, violation: ProtocolViolation) {
        self.counters.violations.fetch_add(1, Ordering::Relaxed);
        *self.last_violation.lock() = Some(violation);
    }

    pub(crate) fn record_reset(&self) {
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks the link down. Returns `true` for the first fault.
    pub(crate) fn set_fault(&self, fault: HardwareFault) -> bool {
        let mut slot = self.fault.lock();
        self.down.store(true, Ordering::Release);
        if slot.is_some() {
            error!("sipc: link {} (dest {}) further fault: {fault}", self.name, self.dest);
            return false;
        }
        error!("sipc: link {} (dest {}) faulted: {fault}", self.name, self.dest);
        *slot = Some(fault);
        true
    }

    pub(crate) fn set_down(&self) {
        self.down.store(true, Ordering::Release);
    }

    pub(crate) fn clear_fault(&self) {
        let mut slot = self.fault.lock();
        *slot = None;
        self.down.store(false, Ordering::Release);
    }

    pub(crate) fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    pub(crate) fn fault(&self) -> Option<HardwareFault> {
        self.fault.lock().clone()
    }

    pub(crate) fn stats(&self) -> LinkStats {
        LinkStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            ring_full: self.counters.ring_full.load(Ordering::Relaxed),
            violations: self.counters.violations.load(Ordering::Relaxed),
            resets: self.counters.resets.load(Ordering::Relaxed),
            last_violation: *self.last_violation.lock(),
        }
    }
}
