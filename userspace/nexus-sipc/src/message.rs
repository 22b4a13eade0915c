// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-size wire message shared with remote firmware
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (wire format is frozen)
//! TEST_COVERAGE: 4 unit tests
//!
//! Wire layout (little-endian, 20 bytes):
//!
//! ```text
//! +0  command: u16
//! +2  channel: u16
//! +4  params[0..4]: u32
//! ```
//!
//! In the shared region a slot is five 32-bit words; word 0 packs
//! `command | channel << 16`, which is the same bytes read as a word.

/// Size of one message slot in bytes.
pub const MESSAGE_SIZE: usize = 20;
/// Size of one message slot in 32-bit words.
pub const MESSAGE_WORDS: usize = MESSAGE_SIZE / 4;

/// Opens a channel; travels on the channel being opened.
pub const CMD_CONNECT: u16 = 0x0001;
/// Closes a channel; travels on the channel being closed.
pub const CMD_DISCONNECT: u16 = 0x0002;
/// `params[0]` of every CONNECT.
pub const CONNECT_MAGIC: u32 = 0xbeee;
/// `params[0]` of every DISCONNECT.
pub const DISCONNECT_MAGIC: u32 = 0xeddd;

/// One slot of the ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Message {
    /// Control opcode or payload-type tag.
    pub command: u16,
    /// Logical channel on the link.
    pub channel: u16,
    /// Opaque parameters.
    pub params: [u32; 4],
}

impl Message {
    /// Builds a message.
    pub const fn new(command: u16, channel: u16, params: [u32; 4]) -> Self {
        Self { command, channel, params }
    }

    /// Data message; the channel is stamped by `send`.
    pub const fn data(command: u16, params: [u32; 4]) -> Self {
        Self::new(command, 0, params)
    }

    /// CONNECT for `channel`.
    pub const fn connect(channel: u16) -> Self {
        Self::new(CMD_CONNECT, channel, [CONNECT_MAGIC, 0, 0, 0])
    }

    /// DISCONNECT for `channel`.
    pub const fn disconnect(channel: u16) -> Self {
        Self::new(CMD_DISCONNECT, channel, [DISCONNECT_MAGIC, 0, 0, 0])
    }

    /// Returns `true` for CONNECT/DISCONNECT.
    pub const fn is_control(&self) -> bool {
        is_control_command(self.command)
    }

    /// Encodes to the 20-byte wire form.
    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut out = [0u8; MESSAGE_SIZE];
        out[0..2].copy_from_slice(&self.command.to_le_bytes());
        out[2..4].copy_from_slice(&self.channel.to_le_bytes());
        for (i, param) in self.params.iter().enumerate() {
            let at = 4 + i * 4;
            out[at..at + 4].copy_from_slice(&param.to_le_bytes());
        }
        out
    }

    /// Decodes the 20-byte wire form.
    pub fn from_bytes(bytes: &[u8; MESSAGE_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            command: u16::from_le_bytes([bytes[0], bytes[1]]),
            channel: u16::from_le_bytes([bytes[2], bytes[3]]),
            params: [word(4), word(8), word(12), word(16)],
        }
    }

    pub(crate) fn to_words(self) -> [u32; MESSAGE_WORDS] {
        let [p0, p1, p2, p3] = self.params;
        [u32::from(self.command) | (u32::from(self.channel) << 16), p0, p1, p2, p3]
    }

    pub(crate) fn from_words(words: [u32; MESSAGE_WORDS]) -> Self {
        let [head, p0, p1, p2, p3] = words;
        Self { command: head as u16, channel: (head >> 16) as u16, params: [p0, p1, p2, p3] }
    }
}

/// Returns `true` for commands reserved for channel control.
pub const fn is_control_command(command: u16) -> bool {
    command == CMD_CONNECT || command == CMD_DISCONNECT
}
