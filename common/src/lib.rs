pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod status;
pub mod types;

pub use config::{LedConfig, NetworkConfig, RuntimeConfig, SafetyConfig, WifiCredentials};
pub use controller::{
    Clock, CredentialStore, HandlerSlot, LedSink, LinkSink, MonotonicClock, PooferController,
    SafetyTimers, TimerHandler,
};
pub use engine::{CloseReason, EngineAction, PooferEngine, TimerEvent, TimerKind};
pub use error::PooferError;
pub use lock::StateLock;
pub use protocol::{parse_command, Command, MAX_FRAME_BYTES};
pub use status::{status_color, PixelFrame};
pub use types::{Channel, ChannelMask, Rgb, StatusFrame, SystemState, MAX_CHANNELS};
