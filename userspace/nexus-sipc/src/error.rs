// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error taxonomy of the shared-memory IPC core
//! OWNERS: @runtime
//!
//! ERROR CONDITIONS:
//!   - ConfigError: bad geometry or unknown link/channel; raised at registration/open
//!   - SipcError::Timeout: caller's bound elapsed; recoverable
//!   - ProtocolViolation: recorded by the pump and counted, never returned
//!   - HardwareFault: lock spin exhausted, doorbell or shared region failure

use nexus_hal::HalError;

use crate::channel::ChannelState;
use crate::ring::RingError;

/// Static configuration problems. Never recoverable at runtime.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Slot count is not a power of two of at least 2.
    #[error("{ring} ring has {slots} slots; need a power of two >= 2")]
    SlotCount {
        /// Ring name.
        ring: &'static str,
        /// Offending slot count.
        slots: usize,
    },
    /// Ring byte size is not a whole number of messages.
    #[error("{ring} ring size {size} is not a whole number of 20-byte slots")]
    RingSize {
        /// Ring name.
        ring: &'static str,
        /// Offending size.
        size: usize,
    },
    /// Ring base is not word aligned.
    #[error("{ring} ring base {base:#x} is not 4-byte aligned")]
    Misaligned {
        /// Ring name.
        ring: &'static str,
        /// Offending base.
        base: usize,
    },
    /// TX and RX slot arrays share bytes.
    #[error("tx and rx rings overlap")]
    Overlap,
    /// The link does not fit in its shared region.
    #[error("link needs {needed} bytes of shared memory, region has {available}")]
    RegionTooSmall {
        /// Bytes required by the layout.
        needed: usize,
        /// Bytes in the region.
        available: usize,
    },
    /// Destination processor id outside the registry table.
    #[error("processor id {0} out of range")]
    ProcessorOutOfRange(u8),
    /// A link for this processor already exists.
    #[error("processor id {0} already has a link")]
    DuplicateLink(u8),
    /// Two configured links share a name.
    #[error("link name {0:?} used twice")]
    DuplicateName(String),
    /// No link is registered for this processor.
    #[error("no link registered for processor id {0}")]
    UnknownLink(u8),
    /// Channel id beyond the link's channel count.
    #[error("channel {channel} out of range (link has {count} channels)")]
    UnknownChannel {
        /// Requested channel.
        channel: u16,
        /// Channels on the link.
        count: usize,
    },
    /// Channel count of zero or above the protocol limit.
    #[error("channel count {0} out of range")]
    ChannelCount(usize),
    /// Receive queue depth of zero.
    #[error("receive queue depth must be at least 1")]
    QueueDepth,
    /// TX lock id outside the hardware mutex bank.
    #[error("tx lock id {0} out of range")]
    LockId(usize),
    /// Global registry used before `init_global`.
    #[error("processor registry not initialised")]
    RegistryUninitialised,
    /// `init_global` called twice.
    #[error("processor registry already initialised")]
    RegistryInitialised,
}

/// Traffic the pump dropped because it broke the channel protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// Message for a channel the link does not have.
    #[error("message for unknown channel {0}")]
    UnknownChannel(u16),
    /// Control message with the wrong magic parameter.
    #[error("command {command:#06x} on channel {channel} has bad magic {magic:#x}")]
    BadMagic {
        /// Channel.
        channel: u16,
        /// Control command.
        command: u16,
        /// Received `params[0]`.
        magic: u32,
    },
    /// CONNECT that does not fit the channel state.
    #[error("unexpected CONNECT on channel {channel} ({state:?}, peer open: {peer_open})")]
    UnexpectedConnect {
        /// Channel.
        channel: u16,
        /// Local state.
        state: ChannelState,
        /// Peer-open latch.
        peer_open: bool,
    },
    /// DISCONNECT from a peer that never opened.
    #[error("unexpected DISCONNECT on channel {channel} ({state:?})")]
    UnexpectedDisconnect {
        /// Channel.
        channel: u16,
        /// Local state.
        state: ChannelState,
    },
    /// Data on a channel that is not open.
    #[error("data {command:#06x} on channel {channel} in state {state:?}")]
    DataNotOpen {
        /// Channel.
        channel: u16,
        /// Payload tag.
        command: u16,
        /// Local state.
        state: ChannelState,
    },
}

/// Faults that take a link down.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HardwareFault {
    /// The TX lock could not be taken within the spin budget.
    #[error("tx lock: {0}")]
    HwMutex(#[from] nexus_hwmutex::Error),
    /// A doorbell operation failed.
    #[error("doorbell: {0}")]
    Doorbell(#[from] HalError),
    /// The shared region could not be mapped or allocated.
    #[error("shared region: {0}")]
    Region(HalError),
    /// A cursor in shared memory holds an impossible value.
    #[error("ring: {0}")]
    Ring(RingError),
}

/// Errors returned by link and channel operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SipcError {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The caller's timeout elapsed.
    #[error("operation timed out")]
    Timeout,
    /// Non-blocking call found nothing to do.
    #[error("operation would block")]
    WouldBlock,
    /// Non-blocking send found the TX ring full.
    #[error("tx ring full")]
    RingFull,
    /// The channel is not in a state that allows the call.
    #[error("channel {channel} is {state:?}")]
    InvalidState {
        /// Channel.
        channel: u16,
        /// Current state.
        state: ChannelState,
    },
    /// The remote side closed the channel.
    #[error("peer closed channel {0}")]
    Disconnected(u16),
    /// Close timed out; the channel was released locally anyway.
    #[error("close of channel {0} not acknowledged by peer")]
    CloseNotAcknowledged(u16),
    /// CONNECT/DISCONNECT cannot be sent as data.
    #[error("command {0:#06x} is reserved for channel control")]
    ReservedCommand(u16),
    /// The link was reset while the call was in progress.
    #[error("link reset")]
    LinkReset,
    /// The link faulted or was shut down.
    #[error("link {0} is down")]
    LinkDown(u8),
    /// A hardware collaborator failed; the link is now down.
    #[error("hardware fault: {0}")]
    HardwareFault(#[from] HardwareFault),
    /// The pump thread could not be started.
    #[error("failed to start pump thread: {0}")]
    PumpSpawn(String),
}
