//! Command packets and hardware command states.
//!
//! A [`CommandPacket`] is the fixed-layout descriptor submitted to a compute unit's
//! execution queue. This layer owns the header; the payload belongs to whoever
//! encodes instructions for a given hardware generation.

use std::fmt::Write as _;
use std::time::Instant;

use itertools::Itertools;
use once_cell::sync::Lazy;
use snafu::ensure;

use crate::error::{PayloadOverflowSnafu, Result};

/// Payload capacity in 32-bit words (a 4 KiB packet minus its header).
pub const PACKET_PAYLOAD_WORDS: usize = 1020;

/// Hardware command state, ordered by discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(strum::FromRepr, strum::IntoStaticStr, strum::EnumIter)]
#[repr(u8)]
pub enum CmdState {
    #[default]
    New = 1,
    Queued = 2,
    Running = 3,
    Completed = 4,
    Error = 5,
    Abort = 6,
    Submitted = 7,
    Timeout = 8,
    NoResponse = 9,
    SkError = 10,
    SkCrashed = 11,
    Max = 12,
}

impl CmdState {
    /// Whether the command reached a terminal state.
    ///
    /// Every state at or above `Completed` is terminal, except `Timeout` which the
    /// driver reports while the command is still outstanding.
    pub fn is_done(self) -> bool {
        self >= CmdState::Completed && self != CmdState::Timeout
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Kind of command carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketType {
    /// Control-protocol kernel start (register writes in the payload).
    #[default]
    Ctrl,
    /// Soft-kernel start.
    SoftKernel,
}

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub state: CmdState,
    pub opcode: u8,
    pub packet_type: PacketType,
    pub stat_enabled: bool,
    pub cu_mask: u32,
    pub extra_cu_masks: u8,
    count: usize,
    payload: Box<[u32; PACKET_PAYLOAD_WORDS]>,
}

impl Default for CommandPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandPacket {
    pub fn new() -> Self {
        Self {
            state: CmdState::New,
            opcode: 0,
            packet_type: PacketType::Ctrl,
            stat_enabled: false,
            cu_mask: 0,
            extra_cu_masks: 0,
            count: 0,
            payload: Box::new([0; PACKET_PAYLOAD_WORDS]),
        }
    }

    /// Reset the header for a fresh submission and clear the payload.
    pub fn reset(&mut self) {
        self.state = CmdState::New;
        self.opcode = 0;
        self.packet_type = PacketType::Ctrl;
        self.stat_enabled = true;
        self.extra_cu_masks = 0;
        self.payload[..self.count].fill(0);
        self.count = 0;
    }

    /// Number of payload words in use.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn payload(&self) -> &[u32] {
        &self.payload[..self.count]
    }

    /// Replace the payload, leaving the packet untouched if `words` does not fit.
    pub fn try_set_payload(&mut self, words: &[u32]) -> Result<()> {
        ensure!(
            words.len() <= PACKET_PAYLOAD_WORDS,
            PayloadOverflowSnafu { words: words.len(), capacity: PACKET_PAYLOAD_WORDS }
        );
        self.payload[..self.count].fill(0);
        self.payload[..words.len()].copy_from_slice(words);
        self.count = words.len();
        Ok(())
    }

    /// Append one payload word, failing when the packet is full.
    pub fn try_push(&mut self, word: u32) -> Result<()> {
        ensure!(
            self.count < PACKET_PAYLOAD_WORDS,
            PayloadOverflowSnafu { words: self.count + 1, capacity: PACKET_PAYLOAD_WORDS }
        );
        self.payload[self.count] = word;
        self.count += 1;
        Ok(())
    }

    /// Replace the payload. Panics if `words` exceeds [`PACKET_PAYLOAD_WORDS`].
    pub fn set_payload(&mut self, words: &[u32]) {
        if let Err(e) = self.try_set_payload(words) {
            panic!("{e}");
        }
    }

    /// Append one payload word. Panics when the packet is full.
    pub fn push(&mut self, word: u32) {
        if let Err(e) = self.try_push(word) {
            panic!("{e}");
        }
    }

    /// `xxd`-style dump of the header and used payload, 8 words per line.
    pub fn hexdump(&self) -> String {
        let header = [
            self.state as u32,
            self.opcode as u32,
            matches!(self.packet_type, PacketType::SoftKernel) as u32,
            self.stat_enabled as u32,
            self.cu_mask,
            self.extra_cu_masks as u32,
            self.count as u32,
        ];
        let words = header.iter().chain(self.payload()).chunks(8);
        let mut out = String::new();
        for (line, chunk) in words.into_iter().enumerate() {
            let _ = writeln!(out, "{:08x}: {}", line * 32, chunk.map(|word| format!("{word:08x}")).join(" "));
        }
        out
    }
}

/// Driver-recorded monotonic timestamps (ns) of a command's state transitions.
///
/// A zero stamp means the state was never reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdTimestamps {
    pub new: u64,
    pub running: u64,
    pub completed: u64,
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since the first call in this process.
///
/// Never returns zero, so a zero stamp can mark "not reached".
pub fn monotonic_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64 + 1
}
