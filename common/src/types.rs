use serde::{Deserialize, Serialize};

/// Hard ceiling on channels; one WS2812 pixel carries at most three gates.
pub const MAX_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    Boot,
    Ready,
    Firing,
    Disconnected,
    /// Reserved for hardware-fault detection. Nothing transitions here yet.
    Error,
}

impl SystemState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::Ready => "READY",
            Self::Firing => "FIRING",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// One solenoid output.
///
/// `active == false` always implies `level == 0` and `release_pending == false`;
/// the engine is the only writer and keeps that invariant on every close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Channel {
    pub active: bool,
    pub ignore_until_release: bool,
    pub release_pending: bool,
    pub level: u8,
    pub activated_at_ms: Option<u64>,
    pub generation: u32,
}

/// Bit `i` addresses channel `i` (bit 0 = channel 1 on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ChannelMask(u8);

impl ChannelMask {
    pub const EMPTY: ChannelMask = ChannelMask(0);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn all(channel_count: usize) -> Self {
        let count = channel_count.min(MAX_CHANNELS);
        Self(((1_u16 << count) - 1) as u8)
    }

    pub fn single(channel: usize) -> Self {
        if channel >= MAX_CHANNELS {
            return Self::EMPTY;
        }
        Self(1 << channel)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, channel: usize) -> bool {
        channel < 8 && self.0 & (1 << channel) != 0
    }

    pub fn insert(&mut self, channel: usize) {
        if channel < MAX_CHANNELS {
            self.0 |= 1 << channel;
        }
    }

    /// Drops bits for channels the build does not have.
    pub fn limit_to(self, channel_count: usize) -> Self {
        Self(self.0 & Self::all(channel_count).0)
    }

    pub fn channels(self) -> impl Iterator<Item = usize> {
        (0..MAX_CHANNELS).filter(move |channel| self.contains(*channel))
    }
}

/// Outbound status frame, serialized as a single JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    pub ready: bool,
    pub firing: Vec<bool>,
    pub error: bool,
    pub connected: bool,
    pub elapsed_ms: u64,
    pub last_hold_ms: u64,
}
