// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-core mutual exclusion backed by a hardware lock register block
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 9 unit tests + tests/contention.rs
//!
//! PUBLIC API:
//!   - HwMutex::probe(): read the version/count registers once and pick a protocol
//!   - HwMutex::emulated(): bank without hardware (every id uses a CAS word)
//!   - HwMutex::try_lock()/lock()/lock_until(): scoped acquisition via HwMutexGuard
//!   - HwMutex::owner_snapshot(): last-known owner and counters for diagnostics
//!   - SimulatedHwMutexBlock: host model of the register block
//!
//! INVARIANTS:
//!   - Release happens only when a HwMutexGuard drops; there is no bare unlock
//!   - The protocol version is fixed at probe time, never re-read per call
//!   - Ids the hardware does not implement fall back to emulation transparently
//!   - Spinning is always bounded by a caller-supplied budget or deadline

#![forbid(unsafe_code)]

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use nexus_hal::Bus;
use nexus_sync::{spin_until, Deadline};

mod host;
pub use host::{SimulatedHwMutexBlock, SimulatedPort};

/// Number of lock ids in a bank.
pub const HWMUTEX_MAX_LOCKS: usize = 64;
/// Register reporting how many locks the hardware implements.
pub const REG_LOCK_COUNT: usize = 0xff8;
/// Register reporting the protocol version.
pub const REG_VERSION: usize = 0xffc;
/// First token register of a version 0 block.
pub const TOKEN_BASE_V0: usize = 0x80;
/// First token register of a version 1 block.
pub const TOKEN_BASE_V1: usize = 0x800;
/// Value written to a version 0 token to release it.
pub const NOT_TAKEN_V0: u32 = 0x55aa_10c5;
/// Value written to a version 1 token to release it.
pub const NOT_TAKEN_V1: u32 = 0x1;

// A token read of zero means the read itself took the lock.
const FREE: u32 = 0;

/// Result alias for lock operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the lock bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The lock id is outside the bank.
    #[error("hwmutex id {0} out of range")]
    InvalidId(usize),
    /// The spin budget ran out while another owner held the lock.
    #[error("hwmutex {id} still held by owner {owner:#x} when the spin budget ran out")]
    SpinTimeout {
        /// Lock id.
        id: usize,
        /// Owner tag last observed on the lock.
        owner: u32,
    },
    /// Owner tags must be non-zero; zero reads as "free".
    #[error("hwmutex owner tag must be non-zero")]
    InvalidOwner,
}

/// Register layout of the lock block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    /// Tokens at 0x80, released with [`NOT_TAKEN_V0`].
    V0,
    /// Tokens at 0x800, released with [`NOT_TAKEN_V1`].
    V1,
}

impl Version {
    /// Decodes the version register.
    pub const fn from_register(raw: u32) -> Self {
        if raw == 0 {
            Self::V0
        } else {
            Self::V1
        }
    }

    /// Byte offset of the token register for `id`.
    pub const fn token(self, id: usize) -> usize {
        match self {
            Self::V0 => TOKEN_BASE_V0 + 4 * id,
            Self::V1 => TOKEN_BASE_V1 + 4 * id,
        }
    }

    /// Sentinel that releases a token.
    pub const fn not_taken(self) -> u32 {
        match self {
            Self::V0 => NOT_TAKEN_V0,
            Self::V1 => NOT_TAKEN_V1,
        }
    }
}

struct Hardware {
    bus: Arc<dyn Bus + Send + Sync>,
    version: Version,
    implemented: usize,
}

#[derive(Default)]
struct LockRecord {
    emulated: AtomicU32,
    held: AtomicBool,
    last_owner: AtomicU32,
    acquisitions: AtomicU64,
    contended: AtomicU64,
}

/// Diagnostic view of one lock id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OwnerSnapshot {
    /// Whether the id is backed by the hardware block.
    pub hardware: bool,
    /// Whether this bank currently holds the lock.
    pub held: bool,
    /// Owner tag seen on the last attempt (ours on success, theirs on contention).
    pub last_owner: u32,
    /// Successful acquisitions through this bank.
    pub acquisitions: u64,
    /// Attempts that found the lock taken.
    pub contended: u64,
}

/// Bank of cross-core locks.
pub struct HwMutex {
    hw: Option<Hardware>,
    owner: u32,
    locks: Box<[LockRecord]>,
}

impl HwMutex {
    /// Probes the lock block behind `bus`. `owner` tags this core in diagnostics.
    pub fn probe(bus: Arc<dyn Bus + Send + Sync>, owner: u32) -> Result<Self> {
        if owner == FREE {
            return Err(Error::InvalidOwner);
        }
        let version = Version::from_register(bus.read(REG_VERSION));
        let implemented = (bus.read(REG_LOCK_COUNT) as usize).min(HWMUTEX_MAX_LOCKS);
        info!("hwmutex: {version:?} block with {implemented} hardware locks");
        Ok(Self {
            hw: Some(Hardware { bus, version, implemented }),
            owner,
            locks: new_records(),
        })
    }

    /// Bank with no hardware: every id is emulated.
    pub fn emulated(owner: u32) -> Result<Self> {
        if owner == FREE {
            return Err(Error::InvalidOwner);
        }
        Ok(Self { hw: None, owner, locks: new_records() })
    }

    /// Protocol version found at probe time.
    pub fn version(&self) -> Option<Version> {
        self.hw.as_ref().map(|hw| hw.version)
    }

    /// Number of ids backed by hardware.
    pub fn hardware_locks(&self) -> usize {
        self.hw.as_ref().map_or(0, |hw| hw.implemented)
    }

    /// Owner tag of this bank.
    pub fn owner_tag(&self) -> u32 {
        self.owner
    }

    fn record(&self, id: usize) -> Result<&LockRecord> {
        self.locks.get(id).ok_or(Error::InvalidId(id))
    }

    fn hardware_for(&self, id: usize) -> Option<&Hardware> {
        self.hw.as_ref().filter(|hw| id < hw.implemented)
    }

    // One read-modify-write on the token; never waits.
    fn attempt(&self, id: usize, record: &LockRecord) -> bool {
        let seen = match self.hardware_for(id) {
            Some(hw) => hw.bus.read(hw.version.token(id)),
            None => match record.emulated.compare_exchange(
                FREE,
                self.owner,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => FREE,
                Err(current) => current,
            },
        };
        if seen == FREE {
            fence(Ordering::Acquire);
            record.held.store(true, Ordering::Relaxed);
            record.last_owner.store(self.owner, Ordering::Relaxed);
            record.acquisitions.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            record.last_owner.store(seen, Ordering::Relaxed);
            record.contended.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn release(&self, id: usize) {
        let Some(record) = self.locks.get(id) else {
            return;
        };
        record.held.store(false, Ordering::Relaxed);
        fence(Ordering::Release);
        match self.hardware_for(id) {
            Some(hw) => hw.bus.write(hw.version.token(id), hw.version.not_taken()),
            None => record.emulated.store(FREE, Ordering::Release),
        }
    }

    /// Single acquisition attempt.
    pub fn try_lock(&self, id: usize) -> Result<Option<HwMutexGuard<'_>>> {
        let record = self.record(id)?;
        Ok(self.attempt(id, record).then(|| HwMutexGuard { mutex: self, id }))
    }

    /// Spins for at most `budget` waiting for the lock.
    pub fn lock(&self, id: usize, budget: Duration) -> Result<HwMutexGuard<'_>> {
        self.lock_until(id, Deadline::after(budget))
    }

    /// Spins until the lock is taken or `deadline` expires.
    pub fn lock_until(&self, id: usize, deadline: Deadline) -> Result<HwMutexGuard<'_>> {
        let record = self.record(id)?;
        match spin_until(deadline, || self.attempt(id, record).then_some(())) {
            Some(()) => Ok(HwMutexGuard { mutex: self, id }),
            None => {
                let owner = record.last_owner.load(Ordering::Relaxed);
                debug!("hwmutex: id {id} spin budget exhausted, owner {owner:#x}");
                Err(Error::SpinTimeout { id, owner })
            }
        }
    }

    /// Diagnostic snapshot for `id`.
    pub fn owner_snapshot(&self, id: usize) -> Result<OwnerSnapshot> {
        let record = self.record(id)?;
        Ok(OwnerSnapshot {
            hardware: self.hardware_for(id).is_some(),
            held: record.held.load(Ordering::Relaxed),
            last_owner: record.last_owner.load(Ordering::Relaxed),
            acquisitions: record.acquisitions.load(Ordering::Relaxed),
            contended: record.contended.load(Ordering::Relaxed),
        })
    }
}

impl core::fmt::Debug for HwMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HwMutex")
            .field("version", &self.version())
            .field("hardware_locks", &self.hardware_locks())
            .field("owner", &format_args!("{:#x}", self.owner))
            .finish()
    }
}

fn new_records() -> Box<[LockRecord]> {
    (0..HWMUTEX_MAX_LOCKS).map(|_| LockRecord::default()).collect()
}

/// Held lock; dropping it releases the lock.
#[must_use = "dropping the guard releases the lock immediately"]
#[derive(Debug)]
pub struct HwMutexGuard<'a> {
    mutex: &'a HwMutex,
    id: usize,
}

impl HwMutexGuard<'_> {
    /// Lock id held by this guard.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HwMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedBus {
        version: u32,
        count: u32,
        token: AtomicU32,
        reads: Mutex<Vec<usize>>,
        writes: Mutex<Vec<(usize, u32)>>,
    }

    impl ScriptedBus {
        fn new(version: u32, count: u32) -> Arc<Self> {
            Arc::new(Self {
                version,
                count,
                token: AtomicU32::new(FREE),
                reads: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
            })
        }
    }

    impl Bus for ScriptedBus {
        fn read(&self, addr: usize) -> u32 {
            self.reads.lock().push(addr);
            match addr {
                REG_VERSION => self.version,
                REG_LOCK_COUNT => self.count,
                _ => self.token.load(Ordering::SeqCst),
            }
        }

        fn write(&self, addr: usize, value: u32) {
            self.writes.lock().push((addr, value));
        }
    }

    #[test]
    fn v0_uses_low_tokens_and_v0_sentinel() {
        let bus = ScriptedBus::new(0, 32);
        let mutex = HwMutex::probe(bus.clone(), 0xa).unwrap();
        assert_eq!(mutex.version(), Some(Version::V0));
        drop(mutex.try_lock(3).unwrap().expect("free lock"));
        assert_eq!(bus.reads.lock().last(), Some(&(TOKEN_BASE_V0 + 12)));
        assert_eq!(bus.writes.lock().as_slice(), &[(TOKEN_BASE_V0 + 12, NOT_TAKEN_V0)]);
    }

    #[test]
    fn v1_uses_high_tokens_and_v1_sentinel() {
        let bus = ScriptedBus::new(0x100, 32);
        let mutex = HwMutex::probe(bus.clone(), 0xa).unwrap();
        assert_eq!(mutex.version(), Some(Version::V1));
        drop(mutex.lock(5, Duration::from_millis(10)).unwrap());
        assert_eq!(bus.writes.lock().as_slice(), &[(TOKEN_BASE_V1 + 20, NOT_TAKEN_V1)]);
    }

    #[test]
    fn version_is_probed_once() {
        let bus = ScriptedBus::new(0x100, 8);
        let mutex = HwMutex::probe(bus.clone(), 0xa).unwrap();
        for _ in 0..4 {
            drop(mutex.try_lock(1).unwrap());
        }
        let version_reads = bus.reads.lock().iter().filter(|a| **a == REG_VERSION).count();
        assert_eq!(version_reads, 1);
    }

    #[test]
    fn unimplemented_ids_fall_back_to_emulation() {
        let bus = ScriptedBus::new(0, 4);
        let mutex = HwMutex::probe(bus.clone(), 0xa).unwrap();
        let guard = mutex.try_lock(10).unwrap().expect("emulated lock is free");
        assert!(!mutex.owner_snapshot(10).unwrap().hardware);
        assert!(mutex.try_lock(10).unwrap().is_none());
        drop(guard);
        assert!(mutex.try_lock(10).unwrap().is_some());
        assert!(bus.writes.lock().is_empty());
    }

    #[test]
    fn taken_token_reports_owner() {
        let bus = ScriptedBus::new(0x100, 8);
        bus.token.store(0x5, Ordering::SeqCst);
        let mutex = HwMutex::probe(bus, 0xa).unwrap();
        assert!(mutex.try_lock(2).unwrap().is_none());
        let snap = mutex.owner_snapshot(2).unwrap();
        assert_eq!(snap.last_owner, 0x5);
        assert_eq!(snap.contended, 1);
        assert!(!snap.held);
    }

    #[test]
    fn spin_budget_exhaustion_is_an_error() {
        let bus = ScriptedBus::new(0, 8);
        bus.token.store(0x7, Ordering::SeqCst);
        let mutex = HwMutex::probe(bus, 0xa).unwrap();
        let err = mutex.lock(1, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err, Error::SpinTimeout { id: 1, owner: 0x7 });
    }

    #[test]
    fn out_of_range_id_rejected() {
        let mutex = HwMutex::emulated(0xa).unwrap();
        assert_eq!(mutex.try_lock(HWMUTEX_MAX_LOCKS).unwrap_err(), Error::InvalidId(64));
        assert_eq!(mutex.owner_snapshot(99).unwrap_err(), Error::InvalidId(99));
    }

    #[test]
    fn zero_owner_rejected() {
        assert_eq!(HwMutex::emulated(0).unwrap_err(), Error::InvalidOwner);
    }

    #[test]
    fn guard_tracks_held_state() {
        let mutex = HwMutex::emulated(0xa).unwrap();
        let guard = mutex.lock(7, Duration::from_millis(10)).unwrap();
        assert_eq!(guard.id(), 7);
        assert!(mutex.owner_snapshot(7).unwrap().held);
        drop(guard);
        let snap = mutex.owner_snapshot(7).unwrap();
        assert!(!snap.held);
        assert_eq!(snap.acquisitions, 1);
        assert_eq!(snap.last_owner, 0xa);
    }
}
