// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory inter-processor IPC core
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module + tests/
//!
//! PUBLIC API:
//!   - ProcessorRegistry: links keyed by destination processor id
//!   - Link: open_channel/close_channel/send/receive on one link
//!   - open_channel()/close_channel()/send()/receive(): same, over the global registry
//!   - Message: the 20-byte wire record
//!   - SipcConfig: TOML link description
//!   - host::loopback(): in-process link with a simulated remote
//!
//! DEPENDENCIES:
//!   - nexus-hal: shared region, doorbell and interrupt line seams
//!   - nexus-hwmutex: cross-core lock guarding the TX push
//!   - nexus-sync: deadlines and bounded backoff
//!
//! Layering, bottom up: [`RingChannel`] moves messages through shared memory,
//! a link transport guards the TX ring with the HwMutex and owns the doorbell,
//! a pump thread per link drains RX and feeds channel queues, and [`Link`]
//! runs the per-channel handshake on top.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(missing_docs)]

use std::time::Duration;

use nexus_sync::Deadline;

mod channel;
pub mod config;
mod error;
pub mod host;
mod layout;
mod message;
mod mux;
mod pump;
mod registry;
mod ring;
mod transport;

pub use channel::{ChannelState, ChannelStats};
pub use config::{HwMutexConfig, LinkConfig, SipcConfig};
pub use error::{ConfigError, HardwareFault, ProtocolViolation, SipcError};
pub use layout::{LinkLayout, RingGeometry, RingLayout, CURSOR_BLOCK_SIZE};
pub use message::{
    is_control_command, Message, CMD_CONNECT, CMD_DISCONNECT, CONNECT_MAGIC, DISCONNECT_MAGIC,
    MESSAGE_SIZE, MESSAGE_WORDS,
};
pub use mux::{Link, LinkHandle};
pub use registry::{LinkOptions, LinkParams, LinkResources, ProcessorRegistry, MAX_CHANNELS, MAX_PROCESSORS};
pub use ring::{RingChannel, RingError};
pub use transport::LinkStats;

/// Result alias for link and channel operations.
pub type Result<T> = core::result::Result<T, SipcError>;

/// How long an operation may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return immediately if no progress can be made.
    NonBlocking,
    /// Block until either the operation completes or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Millisecond timeout convention: `0` never blocks, negative blocks forever.
    pub fn from_millis(timeout_ms: i64) -> Self {
        match u64::try_from(timeout_ms) {
            Ok(0) => Self::NonBlocking,
            Ok(ms) => Self::Timeout(Duration::from_millis(ms)),
            Err(_) => Self::Blocking,
        }
    }

    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }

    /// Deadline starting now. Non-blocking calls get one that has already passed.
    pub fn deadline(self) -> Deadline {
        match self {
            Self::Blocking => Deadline::never(),
            Self::NonBlocking => Deadline::now(),
            Self::Timeout(duration) => Deadline::after(duration),
        }
    }
}

/// Opens `channel` on the link to `dest` in the global registry.
pub fn open_channel(dest: u8, channel: u16, timeout_ms: i64) -> Result<()> {
    ProcessorRegistry::global()?.lookup(dest)?.open_channel(channel, Wait::from_millis(timeout_ms))
}

/// Closes `channel` on the link to `dest` in the global registry.
pub fn close_channel(dest: u8, channel: u16, timeout_ms: i64) -> Result<()> {
    ProcessorRegistry::global()?.lookup(dest)?.close_channel(channel, Wait::from_millis(timeout_ms))
}

/// Sends `msg` on `channel` of the link to `dest` in the global registry.
pub fn send(dest: u8, channel: u16, msg: Message, timeout_ms: i64) -> Result<()> {
    ProcessorRegistry::global()?.lookup(dest)?.send(channel, msg, Wait::from_millis(timeout_ms))
}

/// Receives from `channel` of the link to `dest` in the global registry.
pub fn receive(dest: u8, channel: u16, timeout_ms: i64) -> Result<Message> {
    ProcessorRegistry::global()?.lookup(dest)?.receive(channel, Wait::from_millis(timeout_ms))
}
