//! Deadlines and bounded spinning for code that polls hardware.
//!
//! Nothing here loops forever unless the caller passes [`Deadline::never`].

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

// Check the clock every 128 attempts; `Instant::now` is not free.
const SPIN_CHECK_MASK: u32 = 0x7f;
const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Point in time after which a blocking operation gives up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub const fn never() -> Self {
        Self { at: None }
    }

    /// A deadline that has already expired.
    pub fn now() -> Self {
        Self { at: Some(Instant::now()) }
    }

    /// Expires `budget` from now. Budgets too large to represent never expire.
    pub fn after(budget: Duration) -> Self {
        Self { at: Instant::now().checked_add(budget) }
    }

    /// The expiry instant, or `None` for [`Deadline::never`].
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry; `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Exponential backoff: CPU relax hints first, then yields, then short sleeps.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Returns `true` once the backoff has escalated to sleeping.
    pub fn is_sleeping(&self) -> bool {
        self.step > YIELD_LIMIT
    }

    /// Waits a little longer than last time.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(MAX_SLEEP);
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// Like [`Backoff::snooze`], but never sleeps past `deadline`.
    pub fn snooze_until(&mut self, deadline: Deadline) {
        if self.is_sleeping() {
            let nap = deadline.remaining().map_or(MAX_SLEEP, |left| left.min(MAX_SLEEP));
            std::thread::sleep(nap);
        } else {
            self.snooze();
        }
    }
}

/// Retries `attempt` until it yields a value or `deadline` expires.
///
/// The deadline is consulted periodically rather than on every attempt, so an
/// operation that is about to succeed is not slowed down by clock reads.
pub fn spin_until<T>(deadline: Deadline, mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
    let mut backoff = Backoff::new();
    let mut spins: u32 = 0;
    loop {
        if let Some(value) = attempt() {
            return Some(value);
        }
        if (spins & SPIN_CHECK_MASK) == 0 && deadline.is_expired() {
            return None;
        }
        spins = spins.wrapping_add(1);
        backoff.snooze_until(deadline);
    }
}
