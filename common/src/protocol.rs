//! Inbound link text protocol.
//!
//! `ACTIVATE`, `ACTIVATE:<mask>`, `RELEASE` and `HEARTBEAT`, plus the
//! `DOWN`, `DOWN:<mask>`, `UP` and `PING` spellings older UIs send. The mask is
//! a single digit 1-7 with bit 0 addressing channel 1.

use crate::types::ChannelMask;

/// Largest inbound frame the transports accept. Valid commands are far
/// shorter; the cap keeps a hostile peer on the open AP from exhausting heap.
pub const MAX_FRAME_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `None` means every channel the build has.
    Activate(Option<ChannelMask>),
    Release,
    Heartbeat,
}

pub fn parse_command(raw: &str) -> Option<Command> {
    let message = raw.trim_end_matches('\0').trim();

    if let Some(mask) = message
        .strip_prefix("ACTIVATE:")
        .or_else(|| message.strip_prefix("DOWN:"))
    {
        return parse_mask(mask).map(|mask| Command::Activate(Some(mask)));
    }

    match message {
        "ACTIVATE" | "DOWN" => Some(Command::Activate(None)),
        "RELEASE" | "UP" => Some(Command::Release),
        "HEARTBEAT" | "PING" => Some(Command::Heartbeat),
        _ => None,
    }
}

fn parse_mask(digits: &str) -> Option<ChannelMask> {
    match digits.as_bytes() {
        [digit @ b'1'..=b'7'] => Some(ChannelMask::from_bits(digit - b'0')),
        _ => None,
    }
}
