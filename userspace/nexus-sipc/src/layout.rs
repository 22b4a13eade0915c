// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Placement of a link's slot arrays and cursors inside the shared region
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (must match remote firmware)
//! TEST_COVERAGE: 6 unit tests
//!
//! The cursor block starts right after the two slot arrays and holds four
//! words: (write, read) of the lower-addressed ring, then (write, read) of the
//! higher-addressed ring. Ordering by address rather than by role means the
//! remote, whose TX is our RX, computes the same offsets.

use serde::Deserialize;

use crate::error::ConfigError;
use crate::message::MESSAGE_SIZE;

/// Bytes taken by the cursor block.
pub const CURSOR_BLOCK_SIZE: usize = 16;

/// Byte placement of one slot array, as configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct RingGeometry {
    /// Byte offset of the first slot.
    pub base: usize,
    /// Size of the slot array in bytes.
    pub size: usize,
}

impl RingGeometry {
    /// Geometry from a byte base and size.
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Geometry holding `slots` messages starting at `base`.
    pub const fn with_slots(base: usize, slots: usize) -> Self {
        Self { base, size: slots * MESSAGE_SIZE }
    }

    /// Number of message slots.
    pub const fn slot_count(&self) -> usize {
        self.size / MESSAGE_SIZE
    }

    /// First byte after the slot array.
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    fn validate(&self, ring: &'static str) -> Result<(), ConfigError> {
        if self.base % 4 != 0 {
            return Err(ConfigError::Misaligned { ring, base: self.base });
        }
        if self.size % MESSAGE_SIZE != 0 {
            return Err(ConfigError::RingSize { ring, size: self.size });
        }
        let slots = self.slot_count();
        if slots < 2 || !slots.is_power_of_two() {
            return Err(ConfigError::SlotCount { ring, slots });
        }
        if self.base.checked_add(self.size).is_none() {
            return Err(ConfigError::RingSize { ring, size: self.size });
        }
        Ok(())
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Resolved offsets of one ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
    /// Byte offset of slot 0.
    pub slots_base: usize,
    /// Power-of-two slot count.
    pub slot_count: usize,
    /// Byte offset of the write cursor word.
    pub write_cursor: usize,
    /// Byte offset of the read cursor word.
    pub read_cursor: usize,
}

impl RingLayout {
    /// Bytes from `slots_base` through the end of the cursor block.
    pub(crate) fn extent(&self) -> usize {
        self.write_cursor.max(self.read_cursor) + 4
    }
}

/// Resolved layout of a link, from one side's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkLayout {
    /// Ring this side writes.
    pub tx: RingLayout,
    /// Ring this side reads.
    pub rx: RingLayout,
    /// Bytes of shared region the link occupies.
    pub footprint: usize,
}

impl LinkLayout {
    /// Validates both geometries and places the cursor block.
    pub fn new(tx: RingGeometry, rx: RingGeometry) -> Result<Self, ConfigError> {
        tx.validate("tx")?;
        rx.validate("rx")?;
        if tx.overlaps(&rx) {
            return Err(ConfigError::Overlap);
        }
        let cursors = align4(tx.end().max(rx.end()));
        let (tx_pair, rx_pair) = if tx.base < rx.base {
            (cursors, cursors + 8)
        } else {
            (cursors + 8, cursors)
        };
        Ok(Self {
            tx: RingLayout {
                slots_base: tx.base,
                slot_count: tx.slot_count(),
                write_cursor: tx_pair,
                read_cursor: tx_pair + 4,
            },
            rx: RingLayout {
                slots_base: rx.base,
                slot_count: rx.slot_count(),
                write_cursor: rx_pair,
                read_cursor: rx_pair + 4,
            },
            footprint: cursors + CURSOR_BLOCK_SIZE,
        })
    }

    /// TX at offset 0 followed directly by RX.
    pub fn contiguous(tx_slots: usize, rx_slots: usize) -> Result<Self, ConfigError> {
        let tx = RingGeometry::with_slots(0, tx_slots);
        Self::new(tx, RingGeometry::with_slots(tx.end(), rx_slots))
    }

    /// The same link seen from the remote processor.
    pub fn mirrored(&self) -> Self {
        Self { tx: self.rx, rx: self.tx, footprint: self.footprint }
    }

    /// Checks that the link fits in a region of `available` bytes.
    pub fn check_region(&self, available: usize) -> Result<(), ConfigError> {
        if self.footprint > available {
            return Err(ConfigError::RegionTooSmall { needed: self.footprint, available });
        }
        Ok(())
    }
}

const fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}
