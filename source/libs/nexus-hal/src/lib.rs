// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams shared by inter-processor drivers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 6 unit tests + tests/doorbell.rs
//!
//! PUBLIC API:
//!   - Bus: 32-bit register block access
//!   - SharedRegion: word-addressed memory shared with a remote processor
//!   - Doorbell: query-pending / clear-pending / trigger-remote interrupt ops
//!   - IrqLine: latched edge notification standing in for the interrupt line
//!   - HostDoorbell: in-process doorbell pair for host builds
//!
//! INVARIANTS:
//!   - SharedRegion offsets are byte offsets and must be 4-byte aligned
//!   - IrqLine::raise is never lost: it latches until a waiter consumes it

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Result alias for HAL operations.
pub type Result<T> = core::result::Result<T, HalError>;

/// Errors reported by hardware collaborators.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// A shared region cannot be created with the requested size.
    #[error("invalid shared region size {0} (must be a non-zero multiple of 4)")]
    RegionSize(usize),
    /// The device behind the operation did not respond.
    #[error("device offline: {0}")]
    Offline(&'static str),
}

/// Basic bus access trait shared by user drivers.
pub trait Bus {
    /// Reads the 32-bit register at byte offset `addr`.
    fn read(&self, addr: usize) -> u32;
    /// Writes `value` to the 32-bit register at byte offset `addr`.
    fn write(&self, addr: usize, value: u32);
}

/// Memory shared with a remote processor, accessed one 32-bit word at a time.
///
/// Every access is an atomic word access so a reader on the other side never
/// observes a torn word. Ordering between words is the caller's business.
pub struct SharedRegion {
    words: Box<[AtomicU32]>,
}

impl SharedRegion {
    /// Allocates a zeroed region of `len` bytes.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 || len % 4 != 0 {
            return Err(HalError::RegionSize(len));
        }
        let words = (0..len / 4).map(|_| AtomicU32::new(0)).collect();
        Ok(Self { words })
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * 4
    }

    /// Returns `true` for a zero-length region (never constructed by `new`).
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns `true` when `[offset, offset + len)` lies inside the region.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len())
    }

    /// Loads the word at byte offset `offset`.
    ///
    /// Panics if `offset` is outside the region; callers validate layouts up front.
    #[inline]
    pub fn load(&self, offset: usize, order: Ordering) -> u32 {
        debug_assert_eq!(offset % 4, 0, "unaligned shared region access");
        self.words[offset / 4].load(order)
    }

    /// Stores `value` at byte offset `offset`.
    #[inline]
    pub fn store(&self, offset: usize, value: u32, order: Ordering) {
        debug_assert_eq!(offset % 4, 0, "unaligned shared region access");
        self.words[offset / 4].store(value, order);
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion").field("len", &self.len()).finish()
    }
}

/// Latched edge notification.
///
/// `raise` sets the latch and wakes one waiter; `wait_timeout` consumes it.
#[derive(Default)]
pub struct IrqLine {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl IrqLine {
    /// Creates a line with the latch clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the line.
    pub fn raise(&self) {
        let mut raised = self.raised.lock();
        *raised = true;
        self.cond.notify_all();
    }

    /// Consumes the latch without waiting. Returns whether it was set.
    pub fn take(&self) -> bool {
        std::mem::take(&mut *self.raised.lock())
    }

    /// Waits up to `timeout` for the line, consuming the latch.
    ///
    /// Returns `true` when the line was raised and `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut raised = self.raised.lock();
        while !*raised {
            match deadline {
                Some(at) => {
                    if self.cond.wait_until(&mut raised, at).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut raised),
            }
        }
        std::mem::take(&mut *raised)
    }
}

/// Interrupt-based notification to and from a remote processor.
pub trait Doorbell: Send + Sync {
    /// Returns `true` when the remote has rung us and we have not acknowledged it.
    fn pending(&self) -> Result<bool>;
    /// Acknowledges a pending doorbell.
    fn clear(&self) -> Result<()>;
    /// Rings the remote side.
    fn trigger(&self) -> Result<()>;
    /// Line raised whenever the remote rings us.
    fn irq(&self) -> &IrqLine;
}

#[derive(Default)]
struct DoorbellSide {
    pending: AtomicBool,
    irq: IrqLine,
}

/// In-process doorbell endpoint; see [`HostDoorbell::pair`].
pub struct HostDoorbell {
    local: Arc<DoorbellSide>,
    remote: Arc<DoorbellSide>,
    offline: AtomicBool,
}

impl HostDoorbell {
    /// Creates two connected endpoints: triggering one raises the other.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(DoorbellSide::default());
        let b = Arc::new(DoorbellSide::default());
        (
            Self { local: Arc::clone(&a), remote: Arc::clone(&b), offline: AtomicBool::new(false) },
            Self { local: b, remote: a, offline: AtomicBool::new(false) },
        )
    }

    /// Makes every subsequent operation on this endpoint fail (fault injection).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(HalError::Offline("doorbell"));
        }
        Ok(())
    }
}

impl Doorbell for HostDoorbell {
    fn pending(&self) -> Result<bool> {
        self.check()?;
        Ok(self.local.pending.load(Ordering::Acquire))
    }

    fn clear(&self) -> Result<()> {
        self.check()?;
        self.local.pending.store(false, Ordering::Release);
        Ok(())
    }

    fn trigger(&self) -> Result<()> {
        self.check()?;
        self.remote.pending.store(true, Ordering::Release);
        self.remote.irq.raise();
        Ok(())
    }

    fn irq(&self) -> &IrqLine {
        &self.local.irq
    }
}
