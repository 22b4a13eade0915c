// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-channel lifecycle, peer-open latch and receive queue
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal
//! TEST_COVERAGE: 12 unit tests
//!
//! Lifecycle: `Unused -> Waiting -> Opened -> Free -> Unused`.
//!
//! INVARIANTS:
//!   - All state lives under one mutex; one condvar wakes every waiter on the channel
//!   - The pump never blocks here: a full queue drops its oldest message
//!   - A reset bumps the epoch; waiters that saw the old epoch fail with LinkReset
//!   - The channel lock is never held across a ring push
//!   - Returning to `Unused` ends the session: the queue is emptied and an
//!     unacknowledged close forgets the peer latch

use std::collections::VecDeque;

use log::{debug, warn};
use nexus_sync::Deadline;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{ProtocolViolation, SipcError};
use crate::message::Message;

/// Local lifecycle state of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Closed; `open_channel` allowed.
    Unused,
    /// CONNECT sent, waiting for the peer's CONNECT.
    Waiting,
    /// Both sides open.
    Opened,
    /// `close_channel` in progress; no new sends.
    Free,
}

/// Per-channel counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Data messages queued by the pump.
    pub delivered: u64,
    /// Messages taken by `receive`.
    pub received: u64,
    /// Messages pushed by `send`.
    pub sent: u64,
    /// Messages dropped because the receive queue was full.
    pub dropped: u64,
    /// Inbound traffic that broke the channel protocol.
    pub violations: u64,
    /// Closes that timed out waiting for the peer.
    pub close_unacked: u64,
}

struct ChannelInner {
    state: ChannelState,
    peer_open: bool,
    // Set by a close the peer never answered; its DISCONNECT may still arrive.
    late_disconnect: bool,
    down: bool,
    busy: usize,
    epoch: u64,
    queue: VecDeque<Message>,
    stats: ChannelStats,
}

pub(crate) struct Channel {
    id: u16,
    dest: u8,
    depth: usize,
    inner: Mutex<ChannelInner>,
    cond: Condvar,
}

type Guard<'a> = MutexGuard<'a, ChannelInner>;

impl Channel {
    pub(crate) fn new(id: u16, dest: u8, depth: usize) -> Self {
        Self {
            id,
            dest,
            depth,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Unused,
                peer_open: false,
                late_disconnect: false,
                down: false,
                busy: 0,
                epoch: 0,
                queue: VecDeque::with_capacity(depth),
                stats: ChannelStats::default(),
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        self.inner.lock().stats
    }

    #[cfg(test)]
    pub(crate) fn peer_open(&self) -> bool {
        self.inner.lock().peer_open
    }

    // Returns `true` once the deadline has passed.
    fn wait(&self, inner: &mut Guard<'_>, deadline: Deadline) -> bool {
        match deadline.instant() {
            Some(at) => {
                self.cond.wait_until(inner, at);
                deadline.is_expired()
            }
            None => {
                self.cond.wait(inner);
                false
            }
        }
    }

    fn check_link(&self, inner: &ChannelInner, epoch: u64) -> Result<(), SipcError> {
        if inner.epoch != epoch {
            return Err(SipcError::LinkReset);
        }
        if inner.down {
            return Err(SipcError::LinkDown(self.dest));
        }
        Ok(())
    }

    fn invalid(&self, state: ChannelState) -> SipcError {
        SipcError::InvalidState { channel: self.id, state }
    }

    /// `Unused -> Waiting`. Returns the epoch the open belongs to.
    pub(crate) fn begin_open(&self) -> Result<u64, SipcError> {
        let mut inner = self.inner.lock();
        self.check_link(&inner, inner.epoch)?;
        if inner.state != ChannelState::Unused {
            return Err(self.invalid(inner.state));
        }
        inner.state = ChannelState::Waiting;
        debug!("sipc: dest {} ch {} waiting for peer", self.dest, self.id);
        Ok(inner.epoch)
    }

    /// Undoes `begin_open` when the CONNECT could not be sent.
    pub(crate) fn abort_open(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch && inner.state == ChannelState::Waiting {
            inner.state = ChannelState::Unused;
        }
    }

    /// Blocks until the peer-open latch is set, then `Waiting -> Opened`.
    pub(crate) fn wait_open(&self, epoch: u64, deadline: Deadline) -> Result<(), SipcError> {
        let mut inner = self.inner.lock();
        loop {
            if let Err(err) = self.check_link(&inner, epoch) {
                if inner.epoch == epoch {
                    self.end_session(&mut inner);
                }
                return Err(err);
            }
            match inner.state {
                ChannelState::Opened => return Ok(()),
                ChannelState::Waiting if inner.peer_open => {
                    inner.state = ChannelState::Opened;
                    debug!("sipc: dest {} ch {} opened", self.dest, self.id);
                    return Ok(());
                }
                ChannelState::Waiting => {}
                other => return Err(self.invalid(other)),
            }
            if self.wait(&mut inner, deadline) && !inner.peer_open {
                self.end_session(&mut inner);
                debug!("sipc: dest {} ch {} open timed out", self.dest, self.id);
                return Err(SipcError::Timeout);
            }
        }
    }

    /// `Opened -> Free`. Returns the epoch the close belongs to.
    pub(crate) fn begin_close(&self) -> Result<u64, SipcError> {
        let mut inner = self.inner.lock();
        self.check_link(&inner, inner.epoch)?;
        if inner.state != ChannelState::Opened {
            return Err(self.invalid(inner.state));
        }
        inner.state = ChannelState::Free;
        Ok(inner.epoch)
    }

    /// Waits for sends already in flight to finish.
    pub(crate) fn wait_idle(&self, epoch: u64, deadline: Deadline) -> Result<(), SipcError> {
        let mut inner = self.inner.lock();
        while inner.busy > 0 {
            if inner.epoch != epoch {
                return Err(SipcError::LinkReset);
            }
            if self.wait(&mut inner, deadline) && inner.busy > 0 {
                return Err(self.unacked(&mut inner));
            }
        }
        Ok(())
    }

    /// Blocks until the peer has closed, then `Free -> Unused`.
    pub(crate) fn wait_closed(&self, epoch: u64, deadline: Deadline) -> Result<(), SipcError> {
        let mut inner = self.inner.lock();
        loop {
            if let Err(err) = self.check_link(&inner, epoch) {
                if inner.epoch == epoch {
                    self.end_session(&mut inner);
                }
                return Err(err);
            }
            if !inner.peer_open || inner.state == ChannelState::Unused {
                self.end_session(&mut inner);
                debug!("sipc: dest {} ch {} closed", self.dest, self.id);
                return Ok(());
            }
            if self.wait(&mut inner, deadline) && inner.peer_open {
                return Err(self.unacked(&mut inner));
            }
        }
    }

    /// Releases the channel after a close that could not finish.
    pub(crate) fn abort_close(&self, epoch: u64) -> SipcError {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return SipcError::LinkReset;
        }
        self.unacked(&mut inner)
    }

    fn unacked(&self, inner: &mut Guard<'_>) -> SipcError {
        if inner.peer_open {
            inner.peer_open = false;
            inner.late_disconnect = true;
        }
        self.end_session(inner);
        inner.stats.close_unacked += 1;
        warn!("sipc: dest {} ch {} close not acknowledged by peer", self.dest, self.id);
        SipcError::CloseNotAcknowledged(self.id)
    }

    // Back to `Unused`; anything still queued belonged to the old session.
    fn end_session(&self, inner: &mut Guard<'_>) {
        inner.state = ChannelState::Unused;
        let stale = inner.queue.len();
        if stale > 0 {
            inner.queue.clear();
            debug!("sipc: dest {} ch {} discarded {stale} unread messages", self.dest, self.id);
        }
    }

    /// Admits one send. The ticket keeps `close_channel` waiting until it drops.
    pub(crate) fn begin_send(&self) -> Result<SendTicket<'_>, SipcError> {
        let mut inner = self.inner.lock();
        self.check_link(&inner, inner.epoch)?;
        if inner.state != ChannelState::Opened {
            return Err(self.invalid(inner.state));
        }
        if !inner.peer_open {
            return Err(SipcError::Disconnected(self.id));
        }
        inner.busy += 1;
        Ok(SendTicket { channel: self, sent: false })
    }

    /// Takes the oldest queued message, waiting until `deadline`.
    ///
    /// Queued messages are handed out even after the peer closed, but only
    /// while the local side is still `Opened` or `Free`.
    pub(crate) fn receive(&self, deadline: Deadline, non_blocking: bool) -> Result<Message, SipcError> {
        let mut inner = self.inner.lock();
        let epoch = inner.epoch;
        loop {
            let open = matches!(inner.state, ChannelState::Opened | ChannelState::Free);
            if open {
                if let Some(msg) = inner.queue.pop_front() {
                    inner.stats.received += 1;
                    return Ok(msg);
                }
            }
            self.check_link(&inner, epoch)?;
            if !open {
                return Err(self.invalid(inner.state));
            }
            if !inner.peer_open {
                return Err(SipcError::Disconnected(self.id));
            }
            if non_blocking {
                return Err(SipcError::WouldBlock);
            }
            if self.wait(&mut inner, deadline) && inner.queue.is_empty() {
                return Err(SipcError::Timeout);
            }
        }
    }

    /// Remote CONNECT.
    pub(crate) fn on_connect(&self) -> Result<(), ProtocolViolation> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let duplicate = match state {
            ChannelState::Free => true,
            ChannelState::Opened => inner.peer_open,
            ChannelState::Unused | ChannelState::Waiting => false,
        };
        if duplicate {
            inner.stats.violations += 1;
            return Err(ProtocolViolation::UnexpectedConnect {
                channel: self.id,
                state,
                peer_open: inner.peer_open,
            });
        }
        inner.peer_open = true;
        inner.late_disconnect = false;
        if state == ChannelState::Waiting {
            inner.state = ChannelState::Opened;
            debug!("sipc: dest {} ch {} opened by peer CONNECT", self.dest, self.id);
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Remote DISCONNECT.
    pub(crate) fn on_disconnect(&self) -> Result<(), ProtocolViolation> {
        let mut inner = self.inner.lock();
        if !inner.peer_open && inner.late_disconnect {
            inner.late_disconnect = false;
            debug!("sipc: dest {} ch {} late DISCONNECT after unacknowledged close", self.dest, self.id);
            return Ok(());
        }
        if !inner.peer_open {
            inner.stats.violations += 1;
            return Err(ProtocolViolation::UnexpectedDisconnect { channel: self.id, state: inner.state });
        }
        inner.peer_open = false;
        if inner.state == ChannelState::Free {
            self.end_session(&mut inner);
        }
        debug!("sipc: dest {} ch {} peer closed ({:?})", self.dest, self.id, inner.state);
        self.cond.notify_all();
        Ok(())
    }

    /// Remote data; queued while the channel is open or closing.
    pub(crate) fn on_data(&self, msg: Message) -> Result<(), ProtocolViolation> {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::Opened | ChannelState::Free => {}
            state => {
                inner.stats.violations += 1;
                return Err(ProtocolViolation::DataNotOpen { channel: self.id, command: msg.command, state });
            }
        }
        if inner.queue.len() >= self.depth {
            inner.queue.pop_front();
            inner.stats.dropped += 1;
            warn!("sipc: dest {} ch {} receive queue full, dropped oldest", self.dest, self.id);
        }
        inner.queue.push_back(msg);
        inner.stats.delivered += 1;
        self.cond.notify_all();
        Ok(())
    }

    pub(crate) fn count_violation(&self) {
        self.inner.lock().stats.violations += 1;
    }

    /// Back to `Unused` with the latch clear and the queue empty.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = ChannelState::Unused;
        inner.peer_open = false;
        inner.late_disconnect = false;
        inner.down = false;
        inner.queue.clear();
        inner.epoch = inner.epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Fails every current and future waiter with `LinkDown`.
    pub(crate) fn mark_down(&self) {
        let mut inner = self.inner.lock();
        inner.down = true;
        self.cond.notify_all();
    }
}

/// In-flight send on a channel.
pub(crate) struct SendTicket<'a> {
    channel: &'a Channel,
    sent: bool,
}

impl SendTicket<'_> {
    pub(crate) fn complete(mut self) {
        self.sent = true;
    }
}

impl Drop for SendTicket<'_> {
    fn drop(&mut self) {
        let mut inner = self.channel.inner.lock();
        inner.busy -= 1;
        if self.sent {
            inner.stats.sent += 1;
        }
        if inner.busy == 0 {
            self.channel.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn data(n: u32) -> Message {
        Message::new(0x20, 1, [n, 0, 0, 0])
    }

    fn opened(depth: usize) -> Channel {
        let ch = Channel::new(1, 2, depth);
        let epoch = ch.begin_open().unwrap();
        ch.on_connect().unwrap();
        ch.wait_open(epoch, Deadline::now()).unwrap();
        ch
    }

    #[test]
    fn second_open_is_invalid() {
        let ch = Channel::new(1, 2, 4);
        ch.begin_open().unwrap();
        assert_eq!(
            ch.begin_open().unwrap_err(),
            SipcError::InvalidState { channel: 1, state: ChannelState::Waiting }
        );
    }

    #[test]
    fn open_times_out_back_to_unused() {
        let ch = Channel::new(1, 2, 4);
        let epoch = ch.begin_open().unwrap();
        let start = Instant::now();
        let err = ch.wait_open(epoch, Deadline::after(Duration::from_millis(30))).unwrap_err();
        assert_eq!(err, SipcError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(ch.state(), ChannelState::Unused);
    }

    #[test]
    fn latched_connect_opens_immediately() {
        let ch = Channel::new(1, 2, 4);
        ch.on_connect().unwrap();
        assert_eq!(ch.state(), ChannelState::Unused);
        let epoch = ch.begin_open().unwrap();
        ch.wait_open(epoch, Deadline::now()).unwrap();
        assert_eq!(ch.state(), ChannelState::Opened);
    }

    #[test]
    fn connect_wakes_blocked_opener() {
        let ch = Arc::new(Channel::new(1, 2, 4));
        let epoch = ch.begin_open().unwrap();
        let opener = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.wait_open(epoch, Deadline::after(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(10));
        ch.on_connect().unwrap();
        assert_eq!(opener.join().unwrap(), Ok(()));
    }

    #[test]
    fn data_before_open_is_violation() {
        let ch = Channel::new(1, 2, 4);
        assert_eq!(
            ch.on_data(data(1)).unwrap_err(),
            ProtocolViolation::DataNotOpen { channel: 1, command: 0x20, state: ChannelState::Unused }
        );
        assert_eq!(ch.stats().violations, 1);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let ch = opened(2);
        for n in 0..3 {
            ch.on_data(data(n)).unwrap();
        }
        assert_eq!(ch.stats().dropped, 1);
        assert_eq!(ch.receive(Deadline::now(), true).unwrap().params[0], 1);
        assert_eq!(ch.receive(Deadline::now(), true).unwrap().params[0], 2);
        assert_eq!(ch.receive(Deadline::now(), true).unwrap_err(), SipcError::WouldBlock);
    }

    #[test]
    fn peer_close_drains_then_disconnects() {
        let ch = opened(4);
        ch.on_data(data(7)).unwrap();
        ch.on_disconnect().unwrap();
        assert!(matches!(ch.begin_send(), Err(SipcError::Disconnected(1))));
        assert_eq!(ch.receive(Deadline::now(), true).unwrap().params[0], 7);
        assert_eq!(ch.receive(Deadline::never(), false).unwrap_err(), SipcError::Disconnected(1));
    }

    #[test]
    fn close_waits_for_in_flight_send() {
        let ch = opened(4);
        let ticket = ch.begin_send().unwrap();
        let epoch = ch.begin_close().unwrap();
        assert!(matches!(ch.begin_send(), Err(SipcError::InvalidState { .. })));
        thread::scope(|s| {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ticket.complete();
            });
            ch.wait_idle(epoch, Deadline::after(Duration::from_secs(5))).unwrap();
        });
        assert_eq!(ch.stats().sent, 1);
        ch.on_disconnect().unwrap();
        ch.wait_closed(epoch, Deadline::now()).unwrap();
        assert_eq!(ch.state(), ChannelState::Unused);
    }

    fn close_unacked(ch: &Channel) -> SipcError {
        let epoch = ch.begin_close().unwrap();
        ch.wait_idle(epoch, Deadline::now()).unwrap();
        ch.wait_closed(epoch, Deadline::after(Duration::from_millis(20))).unwrap_err()
    }

    #[test]
    fn unacked_close_forgets_peer_open() {
        let ch = opened(4);
        assert_eq!(close_unacked(&ch), SipcError::CloseNotAcknowledged(1));
        assert_eq!(ch.state(), ChannelState::Unused);
        assert!(!ch.peer_open());

        let epoch = ch.begin_open().unwrap();
        let err = ch.wait_open(epoch, Deadline::after(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err, SipcError::Timeout);
        assert_eq!(ch.state(), ChannelState::Unused);
    }

    #[test]
    fn late_disconnect_after_unacked_close_is_benign() {
        let ch = opened(4);
        close_unacked(&ch);
        ch.on_disconnect().unwrap();
        assert_eq!(ch.stats().violations, 0);
        assert_eq!(ch.stats().close_unacked, 1);
        assert!(ch.on_disconnect().is_err());
        assert_eq!(ch.stats().violations, 1);
    }

    #[test]
    fn closed_session_leaves_nothing_to_receive() {
        let ch = opened(4);
        ch.on_data(data(111)).unwrap();
        ch.on_disconnect().unwrap();
        let epoch = ch.begin_close().unwrap();
        ch.wait_idle(epoch, Deadline::now()).unwrap();
        ch.wait_closed(epoch, Deadline::now()).unwrap();
        assert_eq!(
            ch.receive(Deadline::now(), true).unwrap_err(),
            SipcError::InvalidState { channel: 1, state: ChannelState::Unused }
        );

        ch.on_connect().unwrap();
        let epoch = ch.begin_open().unwrap();
        ch.wait_open(epoch, Deadline::now()).unwrap();
        assert_eq!(ch.receive(Deadline::now(), true).unwrap_err(), SipcError::WouldBlock);
        assert_eq!(ch.stats().received, 0);
    }

    #[test]
    fn reset_fails_waiters_with_link_reset() {
        let ch = Arc::new(opened(4));
        let receiver = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.receive(Deadline::after(Duration::from_secs(5)), false))
        };
        thread::sleep(Duration::from_millis(10));
        ch.reset();
        assert_eq!(receiver.join().unwrap(), Err(SipcError::LinkReset));
        assert_eq!(ch.state(), ChannelState::Unused);
        assert!(!ch.peer_open());
    }
}
