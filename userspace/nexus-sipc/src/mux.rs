// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Channel multiplexer over one link
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: tests/handshake.rs, tests/backpressure.rs, tests/concurrency.rs
//!
//! PUBLIC API:
//!   - Link::open_channel()/close_channel(): CONNECT/DISCONNECT handshake
//!   - Link::send()/receive(): data traffic on an opened channel
//!   - Link::reset(): recover from a remote crash
//!   - Link::shutdown(): stop the pump and fail every waiter with LinkDown
//!
//! Control and data share the channel id; only `command` tells them apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use nexus_hal::{Doorbell, SharedRegion};
use nexus_hwmutex::HwMutex;
use nexus_sync::{Backoff, Deadline};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelState, ChannelStats};
use crate::error::{ConfigError, HardwareFault, ProtocolViolation, SipcError};
use crate::layout::LinkLayout;
use crate::message::{is_control_command, Message, CMD_CONNECT, CMD_DISCONNECT, CONNECT_MAGIC, DISCONNECT_MAGIC};
use crate::pump::Pump;
use crate::registry::LinkOptions;
use crate::ring::RingChannel;
use crate::transport::{LinkStats, LinkTransport};
use crate::{Result, Wait};

/// Shared handle to a registered link.
pub type LinkHandle = Arc<Link>;

pub(crate) struct LinkCore {
    pub(crate) transport: LinkTransport,
    channels: Box<[Channel]>,
    options: LinkOptions,
    closed: AtomicBool,
}

impl LinkCore {
    pub(crate) fn options(&self) -> &LinkOptions {
        &self.options
    }

    fn channel(&self, id: u16) -> Result<&Channel> {
        self.channels.get(usize::from(id)).ok_or_else(|| {
            ConfigError::UnknownChannel { channel: id, count: self.channels.len() }.into()
        })
    }

    fn check_up(&self) -> Result<()> {
        if self.transport.is_down() {
            return Err(SipcError::LinkDown(self.transport.dest()));
        }
        Ok(())
    }

    /// Takes the link down after a hardware fault and wakes every waiter.
    pub(crate) fn fail(&self, fault: HardwareFault) -> SipcError {
        if self.transport.set_fault(fault.clone()) {
            self.channels.iter().for_each(Channel::mark_down);
        }
        SipcError::HardwareFault(fault)
    }

    /// Pushes `msg`, retrying while the TX ring is full.
    fn push(&self, msg: &Message, wait: Wait, deadline: Deadline) -> Result<()> {
        let mut backoff = Backoff::new();
        loop {
            self.check_up()?;
            match self.transport.try_send(msg) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(fault) => return Err(self.fail(fault)),
            }
            if wait.is_non_blocking() {
                return Err(SipcError::RingFull);
            }
            if deadline.is_expired() {
                return Err(SipcError::Timeout);
            }
            // Wake the remote in case it missed the doorbell for the backlog.
            if let Err(fault) = self.transport.nudge() {
                return Err(self.fail(fault));
            }
            backoff.snooze_until(deadline);
        }
    }

    /// One pump iteration: drain, dispatch, acknowledge.
    pub(crate) fn service(&self) -> core::result::Result<usize, HardwareFault> {
        let pending = self.transport.pending()?;
        let drained = self.transport.drain(|msg| self.dispatch(msg))?;
        if pending {
            self.transport.ack()?;
        }
        Ok(drained)
    }

    fn dispatch(&self, msg: Message) {
        let Some(channel) = self.channels.get(usize::from(msg.channel)) else {
            self.violation(ProtocolViolation::UnknownChannel(msg.channel));
            return;
        };
        let magic = match msg.command {
            CMD_CONNECT => Some(CONNECT_MAGIC),
            CMD_DISCONNECT => Some(DISCONNECT_MAGIC),
            _ => None,
        };
        if let Some(expected) = magic {
            if msg.params[0] != expected {
                channel.count_violation();
                self.violation(ProtocolViolation::BadMagic {
                    channel: msg.channel,
                    command: msg.command,
                    magic: msg.params[0],
                });
                return;
            }
        }
        let outcome = match msg.command {
            CMD_CONNECT => channel.on_connect(),
            CMD_DISCONNECT => channel.on_disconnect(),
            _ => channel.on_data(msg),
        };
        if let Err(violation) = outcome {
            self.violation(violation);
        }
    }

    fn violation(&self, violation: ProtocolViolation) {
        warn!("sipc: link {} dropped message: {violation}", self.transport.name());
        self.transport.record_violation(violation);
    }
}

/// One registered link and its channels.
pub struct Link {
    core: Arc<LinkCore>,
    pump: Mutex<Option<Pump>>,
}

impl Link {
    /// Builds the link and starts its pump.
    pub(crate) fn start(
        name: String,
        dest: u8,
        layout: LinkLayout,
        region: Arc<SharedRegion>,
        doorbell: Arc<dyn Doorbell>,
        hwmutex: Arc<HwMutex>,
        options: LinkOptions,
    ) -> Result<LinkHandle> {
        let tx = RingChannel::new(Arc::clone(&region), layout.tx)?;
        let rx = RingChannel::new(region, layout.rx)?;
        let transport =
            LinkTransport::new(name, dest, tx, rx, doorbell, hwmutex, options.tx_lock, options.spin_budget);
        // Channel ids are u16 on the wire; the registry caps the count below that.
        let channels = (0..options.channel_count)
            .map(|id| Channel::new(id as u16, dest, options.queue_depth))
            .collect();
        let core = Arc::new(LinkCore { transport, channels, options, closed: AtomicBool::new(false) });
        let pump = Pump::spawn(Arc::clone(&core))?;
        Ok(Arc::new(Self { core, pump: Mutex::new(Some(pump)) }))
    }

    /// Link name.
    pub fn name(&self) -> &str {
        self.core.transport.name()
    }

    /// Destination processor id.
    pub fn dest(&self) -> u8 {
        self.core.transport.dest()
    }

    /// Number of channels on the link.
    pub fn channel_count(&self) -> usize {
        self.core.channels.len()
    }

    /// Options the link was registered with.
    pub fn options(&self) -> &LinkOptions {
        self.core.options()
    }

    /// Opens `channel`: sends CONNECT and waits for the peer's CONNECT.
    ///
    /// Completes at once when the peer has already opened its end. On timeout
    /// the channel goes back to `Unused`.
    pub fn open_channel(&self, channel: u16, wait: Wait) -> Result<()> {
        let ch = self.core.channel(channel)?;
        let deadline = wait.deadline();
        let epoch = ch.begin_open()?;
        if let Err(err) = self.core.push(&Message::connect(channel), wait, deadline) {
            ch.abort_open(epoch);
            return Err(err);
        }
        ch.wait_open(epoch, deadline)
    }

    /// Closes `channel`: waits for in-flight sends, sends DISCONNECT and
    /// waits for the peer's DISCONNECT.
    ///
    /// The channel is `Unused` afterwards even when the peer never answers;
    /// that case returns [`SipcError::CloseNotAcknowledged`].
    pub fn close_channel(&self, channel: u16, wait: Wait) -> Result<()> {
        let ch = self.core.channel(channel)?;
        let deadline = wait.deadline();
        let epoch = ch.begin_close()?;
        ch.wait_idle(epoch, deadline)?;
        match self.core.push(&Message::disconnect(channel), wait, deadline) {
            Ok(()) => ch.wait_closed(epoch, deadline),
            Err(SipcError::Timeout | SipcError::RingFull) => Err(ch.abort_close(epoch)),
            Err(err) => {
                ch.abort_close(epoch);
                Err(err)
            }
        }
    }

    /// Sends `msg` on `channel`. The channel id in `msg` is overwritten.
    pub fn send(&self, channel: u16, msg: Message, wait: Wait) -> Result<()> {
        if is_control_command(msg.command) {
            return Err(SipcError::ReservedCommand(msg.command));
        }
        let ch = self.core.channel(channel)?;
        let deadline = wait.deadline();
        let ticket = ch.begin_send()?;
        self.core.push(&Message { channel, ..msg }, wait, deadline)?;
        ticket.complete();
        Ok(())
    }

    /// Takes the next message queued for `channel`.
    pub fn receive(&self, channel: u16, wait: Wait) -> Result<Message> {
        self.core.channel(channel)?.receive(wait.deadline(), wait.is_non_blocking())
    }

    /// Current lifecycle state of `channel`.
    pub fn channel_state(&self, channel: u16) -> Result<ChannelState> {
        Ok(self.core.channel(channel)?.state())
    }

    /// Counters of `channel`.
    pub fn channel_stats(&self, channel: u16) -> Result<ChannelStats> {
        Ok(self.core.channel(channel)?.stats())
    }

    /// Link counters.
    pub fn stats(&self) -> LinkStats {
        self.core.transport.stats()
    }

    /// Returns `true` after a hardware fault or shutdown.
    pub fn is_down(&self) -> bool {
        self.core.transport.is_down()
    }

    /// The fault that took the link down, if any.
    pub fn fault(&self) -> Option<HardwareFault> {
        self.core.transport.fault()
    }

    /// Recovers from a remote crash.
    ///
    /// Stops the pump, discards unread RX traffic, returns every channel to
    /// `Unused` and fails current waiters with [`SipcError::LinkReset`], then
    /// restarts the pump. Clears a previous hardware fault. The TX ring is
    /// left alone; it belongs to the remote's reader.
    pub fn reset(&self) -> Result<()> {
        // The pump lock orders reset against shutdown.
        let mut pump = self.pump.lock();
        if self.core.closed.load(Ordering::Acquire) {
            return Err(SipcError::LinkDown(self.dest()));
        }
        if let Some(mut running) = pump.take() {
            running.stop(&self.core);
        }
        let discarded = self.core.transport.discard_rx().map_err(|fault| self.core.fail(fault))?;
        self.core.transport.clear_fault();
        self.core.channels.iter().for_each(Channel::reset);
        self.core.transport.record_reset();
        self.core.transport.irq().take();
        info!("sipc: link {} reset, {discarded} unread messages discarded", self.name());
        *pump = Some(Pump::spawn(Arc::clone(&self.core))?);
        Ok(())
    }

    /// Stops the pump. Every pending and later call fails with `LinkDown`.
    pub fn shutdown(&self) {
        let mut pump = self.pump.lock();
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.transport.set_down();
        self.core.channels.iter().for_each(Channel::mark_down);
        if let Some(mut running) = pump.take() {
            running.stop(&self.core);
        }
        info!("sipc: link {} (dest {}) shut down", self.name(), self.dest());
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(mut running) = self.pump.get_mut().take() {
            running.stop(&self.core);
        }
    }
}

impl core::fmt::Debug for Link {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name())
            .field("dest", &self.dest())
            .field("channels", &self.channel_count())
            .field("down", &self.is_down())
            .finish()
    }
}
