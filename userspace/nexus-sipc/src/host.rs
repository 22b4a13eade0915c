// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host stand-in for the remote processor's side of a link
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (test and bring-up helper)
//! TEST_COVERAGE: 2 unit tests + every integration test
//!
//! [`loopback`] builds a link's parameters together with a [`RemotePeer`]
//! that reads and writes the mirrored rings and rings the doorbell, the way
//! remote firmware would. A [`Responder`] runs the peer on its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;
use nexus_hal::{Doorbell, HostDoorbell, SharedRegion};
use nexus_sync::{Backoff, Deadline};
use parking_lot::Mutex;

use crate::error::{HardwareFault, SipcError};
use crate::layout::{LinkLayout, RingGeometry};
use crate::message::{Message, CMD_CONNECT, CMD_DISCONNECT};
use crate::registry::LinkParams;
use crate::ring::{RingChannel, RingError};

/// The remote end of a host link.
pub struct RemotePeer {
    tx: RingChannel,
    rx: RingChannel,
    doorbell: HostDoorbell,
}

impl RemotePeer {
    /// Pushes `msg` towards the local side and rings its doorbell.
    pub fn send(&self, msg: Message) -> Result<(), RingError> {
        self.tx.try_push(&msg)?;
        // Only fails when fault injection took this endpoint offline.
        let _ = self.doorbell.trigger();
        Ok(())
    }

    /// Pushes `msg`, retrying while the ring is full, for at most `timeout`.
    pub fn send_timeout(&self, msg: Message, timeout: Duration) -> Result<(), RingError> {
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::new();
        loop {
            match self.send(msg) {
                Err(RingError::Full) if !deadline.is_expired() => backoff.snooze_until(deadline),
                other => return other,
            }
        }
    }

    /// CONNECT for `channel`.
    pub fn connect(&self, channel: u16) -> Result<(), RingError> {
        self.send(Message::connect(channel))
    }

    /// DISCONNECT for `channel`.
    pub fn disconnect(&self, channel: u16) -> Result<(), RingError> {
        self.send(Message::disconnect(channel))
    }

    /// Next message from the local side, if any.
    pub fn pop(&self) -> Option<Message> {
        self.rx.try_pop().ok()
    }

    /// Waits up to `timeout` for a message from the local side.
    pub fn wait_message(&self, timeout: Duration) -> Option<Message> {
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(msg) = self.pop() {
                return Some(msg);
            }
            let left = deadline.remaining().unwrap_or(Duration::MAX);
            if left.is_zero() {
                return None;
            }
            self.doorbell.irq().wait_timeout(left);
            let _ = self.doorbell.clear();
        }
    }

    /// Messages written by the local side and not yet popped.
    pub fn backlog(&self) -> usize {
        self.rx.len().unwrap_or(0)
    }

    /// This end's doorbell.
    pub fn doorbell(&self) -> &HostDoorbell {
        &self.doorbell
    }

    /// Runs the peer on a thread that answers according to `behavior`.
    pub fn spawn_responder(self, behavior: PeerBehavior) -> Responder {
        Responder::spawn(self, behavior)
    }
}

/// How a [`Responder`] reacts to traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerBehavior {
    /// Reads everything, answers nothing.
    Silent,
    /// Answers CONNECT with CONNECT and DISCONNECT with DISCONNECT.
    AckControl,
    /// Like `AckControl`, and sends every data message back on its channel.
    Echo,
}

/// Remote peer running on its own thread.
pub struct Responder {
    stop: Arc<AtomicBool>,
    seen: Arc<Mutex<Vec<Message>>>,
    handle: Option<JoinHandle<RemotePeer>>,
}

impl Responder {
    fn spawn(peer: RemotePeer, behavior: PeerBehavior) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let stop = Arc::clone(&stop);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let Some(msg) = peer.wait_message(Duration::from_millis(5)) else {
                        continue;
                    };
                    seen.lock().push(msg);
                    let reply = match (behavior, msg.command) {
                        (PeerBehavior::Silent, _) => None,
                        (_, CMD_CONNECT) => Some(Message::connect(msg.channel)),
                        (_, CMD_DISCONNECT) => Some(Message::disconnect(msg.channel)),
                        (PeerBehavior::Echo, _) => Some(msg),
                        (PeerBehavior::AckControl, _) => None,
                    };
                    if let Some(reply) = reply {
                        if let Err(err) = peer.send_timeout(reply, Duration::from_secs(1)) {
                            debug!("sipc host peer: reply dropped: {err}");
                        }
                    }
                }
                peer
            })
        };
        Self { stop, seen, handle: Some(handle) }
    }

    /// Every message the responder has read so far.
    pub fn seen(&self) -> Vec<Message> {
        self.seen.lock().clone()
    }

    /// Stops the thread and hands the peer back.
    pub fn stop(mut self) -> Option<RemotePeer> {
        self.halt()
    }

    fn halt(&mut self) -> Option<RemotePeer> {
        self.stop.store(true, Ordering::Release);
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.halt();
    }
}

/// A host link: parameters for the local registry plus the remote end.
pub struct Loopback {
    /// Pass to `ProcessorRegistry::register_link`.
    pub params: LinkParams,
    /// Remote side of the link.
    pub peer: RemotePeer,
    /// The local doorbell endpoint, for fault injection.
    pub doorbell: Arc<HostDoorbell>,
    /// Region shared by both ends.
    pub region: Arc<SharedRegion>,
}

/// Builds a link with `tx_slots`/`rx_slots` rings laid out back to back.
pub fn loopback(name: &str, dest: u8, tx_slots: usize, rx_slots: usize) -> Result<Loopback, SipcError> {
    let tx = RingGeometry::with_slots(0, tx_slots);
    let rx = RingGeometry::with_slots(tx.end(), rx_slots);
    let layout = LinkLayout::new(tx, rx)?;
    let region = SharedRegion::new(layout.footprint)
        .map(Arc::new)
        .map_err(HardwareFault::Region)?;
    let remote = layout.mirrored();
    let (local_bell, remote_bell) = HostDoorbell::pair();
    let doorbell = Arc::new(local_bell);
    let peer = RemotePeer {
        tx: RingChannel::new(Arc::clone(&region), remote.tx)?,
        rx: RingChannel::new(Arc::clone(&region), remote.rx)?,
        doorbell: remote_bell,
    };
    let params = LinkParams::new(name, dest, tx, rx, Arc::clone(&region), doorbell.clone());
    Ok(Loopback { params, peer, doorbell, region })
}
