// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-link worker draining the RX ring
//! OWNERS: @runtime
//!
//! The pump sleeps on the link's interrupt line for at most the poll
//! interval, drains the RX ring, dispatches, then acknowledges the doorbell.
//! Polling covers remotes that cannot raise the interrupt in some power
//! states. The line latches, so a doorbell that lands between the drain and
//! the acknowledge still wakes the next iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, trace};

use crate::error::SipcError;
use crate::mux::LinkCore;

pub(crate) struct Pump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Pump {
    pub(crate) fn spawn(core: Arc<LinkCore>) -> Result<Self, SipcError> {
        let stop = Arc::new(AtomicBool::new(false));
        let name = format!("sipc-pump/{}", core.transport.name());
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(name)
                .spawn(move || run(&core, &stop))
                .map_err(|err| SipcError::PumpSpawn(err.to_string()))?
        };
        Ok(Self { stop, handle: Some(handle) })
    }

    /// Stops the worker and waits for it to exit.
    pub(crate) fn stop(&mut self, core: &LinkCore) {
        self.stop.store(true, Ordering::Release);
        core.transport.irq().raise();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("sipc: pump for {} panicked", core.transport.name());
            }
        }
    }
}

fn run(core: &LinkCore, stop: &AtomicBool) {
    let interval = core.options().poll_interval;
    debug!("sipc: pump for {} started", core.transport.name());
    while !stop.load(Ordering::Acquire) && !core.transport.is_down() {
        let rang = core.transport.irq().wait_timeout(interval);
        if stop.load(Ordering::Acquire) {
            break;
        }
        match core.service() {
            Ok(drained) => trace!("sipc: {} drained {drained} (irq: {rang})", core.transport.name()),
            Err(fault) => {
                core.fail(fault);
                break;
            }
        }
    }
    debug!("sipc: pump for {} exiting", core.transport.name());
}
