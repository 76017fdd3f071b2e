use std::num::ParseIntError;
use thiserror::Error;

use crate::mux::engine::EngineError;
use crate::mux::frame::FrameId;

/// Errors returned by the multiplexer and its helpers.
///
/// Only `InvalidState`, `Config` and `Io` indicate a caller mistake or an
/// environment problem. The remaining variants describe flow-control outcomes
/// that leave the session intact.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Buffer or memory limits hit; retry once the consumer has pulled.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// The frame's timestamp did not fit the stream's timeline and was dropped.
    #[error("timestamp integrity check failed (restarted: {restarted})")]
    TimestampIntegrity { restarted: bool },

    /// No output was ready before the pull deadline.
    #[error("timed out waiting for data")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("multiplexer stopped")]
    Stopped,

    #[error("invalid handle")]
    InvalidHandle,

    /// A fixed table (streams, sinks, sessions) has no free slot.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("completion rejected for frame {0}")]
    CompletionRejected(FrameId),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

impl MuxError {
    /// True for outcomes a producer or consumer should simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MuxError::Timeout | MuxError::Backpressure(_) | MuxError::TimestampIntegrity { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
