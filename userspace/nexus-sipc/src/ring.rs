// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-slot ring in shared memory (one direction of a link)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (must match remote firmware)
//! TEST_COVERAGE: 6 unit tests + tests/ring_props.rs
//!
//! INVARIANTS:
//!   - Exactly one writer advances the write cursor, one reader the read cursor
//!   - Slot words are written before the write cursor is published (release)
//!   - A slot is read only after the write cursor covering it is observed (acquire)
//!   - At most `slot_count - 1` slots are unread; one slot tells full from empty
//!   - Cursor values from shared memory are range-checked before indexing

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nexus_hal::SharedRegion;

use crate::error::ConfigError;
use crate::layout::RingLayout;
use crate::message::{Message, MESSAGE_SIZE, MESSAGE_WORDS};

/// Outcome of a ring operation that could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// No free slot; backpressure for the producer.
    #[error("ring full")]
    Full,
    /// Nothing to read.
    #[error("ring empty")]
    Empty,
    /// A cursor in shared memory points outside the ring.
    #[error("cursor value {cursor} outside ring of {slot_count} slots")]
    Corrupt {
        /// Value read from shared memory.
        cursor: u32,
        /// Slots in the ring.
        slot_count: usize,
    },
}

/// One direction of a link.
pub struct RingChannel {
    region: Arc<SharedRegion>,
    layout: RingLayout,
    mask: u32,
}

impl RingChannel {
    /// Binds a ring to its region, checking that the layout fits.
    pub fn new(region: Arc<SharedRegion>, layout: RingLayout) -> Result<Self, ConfigError> {
        let slots = layout.slot_count;
        if slots < 2 || !slots.is_power_of_two() || slots > u32::MAX as usize {
            return Err(ConfigError::SlotCount { ring: "ring", slots });
        }
        let slot_bytes = slots * MESSAGE_SIZE;
        if !region.contains(layout.slots_base, slot_bytes) || !region.contains(0, layout.extent()) {
            return Err(ConfigError::RegionTooSmall {
                needed: (layout.slots_base + slot_bytes).max(layout.extent()),
                available: region.len(),
            });
        }
        Ok(Self { region, layout, mask: (slots - 1) as u32 })
    }

    /// Slots in the ring.
    pub fn slot_count(&self) -> usize {
        self.layout.slot_count
    }

    /// Messages the ring can hold at once.
    pub fn capacity(&self) -> usize {
        self.layout.slot_count - 1
    }

    /// Unread messages.
    pub fn len(&self) -> Result<usize, RingError> {
        let write = self.cursor(self.layout.write_cursor, Ordering::Acquire)?;
        let read = self.cursor(self.layout.read_cursor, Ordering::Acquire)?;
        Ok((write.wrapping_sub(read) & self.mask) as usize)
    }

    /// Returns `true` when nothing is unread.
    pub fn is_empty(&self) -> Result<bool, RingError> {
        Ok(self.len()? == 0)
    }

    fn cursor(&self, offset: usize, order: Ordering) -> Result<u32, RingError> {
        let value = self.region.load(offset, order);
        if value > self.mask {
            return Err(RingError::Corrupt { cursor: value, slot_count: self.layout.slot_count });
        }
        Ok(value)
    }

    fn slot_offset(&self, index: u32) -> usize {
        self.layout.slots_base + index as usize * MESSAGE_SIZE
    }

    /// Producer side: appends `msg` unless the ring is full.
    pub fn try_push(&self, msg: &Message) -> Result<(), RingError> {
        let write = self.cursor(self.layout.write_cursor, Ordering::Relaxed)?;
        let next = (write + 1) & self.mask;
        let read = self.cursor(self.layout.read_cursor, Ordering::Acquire)?;
        if next == read {
            return Err(RingError::Full);
        }
        let at = self.slot_offset(write);
        for (i, word) in msg.to_words().into_iter().enumerate() {
            self.region.store(at + i * 4, word, Ordering::Relaxed);
        }
        self.region.store(self.layout.write_cursor, next, Ordering::Release);
        Ok(())
    }

    /// Consumer side: removes the oldest message.
    pub fn try_pop(&self) -> Result<Message, RingError> {
        let read = self.cursor(self.layout.read_cursor, Ordering::Relaxed)?;
        let write = self.cursor(self.layout.write_cursor, Ordering::Acquire)?;
        if read == write {
            return Err(RingError::Empty);
        }
        let at = self.slot_offset(read);
        let mut words = [0u32; MESSAGE_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.region.load(at + i * 4, Ordering::Relaxed);
        }
        self.region.store(self.layout.read_cursor, (read + 1) & self.mask, Ordering::Release);
        Ok(Message::from_words(words))
    }

    /// Consumer side: drops everything unread. Returns how many slots were skipped.
    pub fn discard_all(&self) -> Result<usize, RingError> {
        let read = self.cursor(self.layout.read_cursor, Ordering::Relaxed)?;
        let write = self.cursor(self.layout.write_cursor, Ordering::Acquire)?;
        self.region.store(self.layout.read_cursor, write, Ordering::Release);
        Ok((write.wrapping_sub(read) & self.mask) as usize)
    }
}

impl core::fmt::Debug for RingChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingChannel").field("layout", &self.layout).finish()
    }
}
