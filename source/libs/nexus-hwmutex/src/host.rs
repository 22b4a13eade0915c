// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host model of the hardware lock block
//!
//! OWNERS: @runtime
//!
//! Each core sees the block through its own [`SimulatedPort`], which stamps
//! reads with that core's master tag the way the bus fabric does on silicon.
//! Reading a free token takes it and returns zero; reading a taken token
//! returns the holder's tag. Writing the version's release sentinel frees the
//! token, any other value is ignored.

use std::sync::Arc;

use nexus_hal::Bus;
use parking_lot::Mutex;

use crate::{Version, HWMUTEX_MAX_LOCKS, REG_LOCK_COUNT, REG_VERSION};

const V1_REGISTER: u32 = 0x0000_0100;

/// Shared state of a simulated lock block.
pub struct SimulatedHwMutexBlock {
    version: Version,
    implemented: usize,
    tokens: Mutex<[u32; HWMUTEX_MAX_LOCKS]>,
}

impl SimulatedHwMutexBlock {
    /// Creates a block implementing `implemented` locks (clamped to the bank size).
    pub fn new(version: Version, implemented: usize) -> Arc<Self> {
        Arc::new(Self {
            version,
            implemented: implemented.min(HWMUTEX_MAX_LOCKS),
            tokens: Mutex::new([0; HWMUTEX_MAX_LOCKS]),
        })
    }

    /// Bus view of the block for the core tagged `master`.
    pub fn port(self: &Arc<Self>, master: u32) -> SimulatedPort {
        SimulatedPort { block: Arc::clone(self), master }
    }

    /// Current holder of `id`, if any.
    pub fn holder(&self, id: usize) -> Option<u32> {
        let tokens = self.tokens.lock();
        tokens.get(id).copied().filter(|tag| *tag != 0)
    }

    fn token_index(&self, addr: usize) -> Option<usize> {
        let base = self.version.token(0);
        let offset = addr.checked_sub(base)?;
        let index = offset / 4;
        (offset % 4 == 0 && index < self.implemented).then_some(index)
    }
}

/// One core's bus port into a [`SimulatedHwMutexBlock`].
pub struct SimulatedPort {
    block: Arc<SimulatedHwMutexBlock>,
    master: u32,
}

impl Bus for SimulatedPort {
    fn read(&self, addr: usize) -> u32 {
        match addr {
            REG_VERSION => match self.block.version {
                Version::V0 => 0,
                Version::V1 => V1_REGISTER,
            },
            REG_LOCK_COUNT => self.block.implemented as u32,
            _ => {
                let Some(index) = self.block.token_index(addr) else {
                    return 0;
                };
                let mut tokens = self.block.tokens.lock();
                match tokens[index] {
                    0 => {
                        tokens[index] = self.master;
                        0
                    }
                    holder => holder,
                }
            }
        }
    }

    fn write(&self, addr: usize, value: u32) {
        let Some(index) = self.block.token_index(addr) else {
            return;
        };
        if value == self.block.version.not_taken() {
            self.block.tokens.lock()[index] = 0;
        }
    }
}
