use thiserror::Error;

use crate::engine::TimerKind;

#[derive(Debug, Error)]
pub enum PooferError {
    #[error("failed to arm {kind:?} timer for channel {channel}: {reason}")]
    TimerArm {
        channel: usize,
        kind: TimerKind,
        reason: String,
    },
    #[error("led strip write failed: {0}")]
    LedWrite(String),
    #[error("link send failed: {0}")]
    LinkSend(String),
    #[error("store error: {0}")]
    Store(String),
}
