//! # Stream multiplexer
//!
//! The multiplexer accepts compressed frames on several independent stream
//! queues, decides when enough correctly ordered data exists across all of
//! them, and drives a [`TransformEngine`] that emits one PCR period of output
//! per call.
//!
//! ## Flow
//!
//! - Producers call [`Multiplexer::submit`], which never blocks. The frame's
//!   decode timestamp is resolved and checked against the stream's timeline
//!   and the program clock before the frame is queued.
//! - Consumers call [`Multiplexer::pull`], the only blocking call. It waits
//!   (bounded) until every active stream has data past the next period, then
//!   runs the engine while holding the session lock.
//! - Streams running ahead of a lagging sibling can be auto-paused so the
//!   output never stalls on a stream that will not catch up.
//! - Repeated timestamp failures escalate to a full discontinuity, which
//!   eventually restarts the session with a discontinuity indicator.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use bytes::Bytes;
//! use vdkmux::config::{MuxConfig, StreamConfig};
//! use vdkmux::format::ts::{SoftwareTsEngine, STREAM_TYPE_AAC, STREAM_TYPE_H264};
//! use vdkmux::mux::{FrameMetadata, Multiplexer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mux = Multiplexer::new(MuxConfig::default(), Box::new(SoftwareTsEngine::new()))?;
//! let video = mux.attach_stream(StreamConfig::new(STREAM_TYPE_H264).with_multiplex_ahead_limit(0))?;
//! let audio = mux.attach_stream(StreamConfig::new(STREAM_TYPE_AAC).with_multiplex_ahead_limit(0))?;
//! mux.start()?;
//!
//! for i in 0..4u64 {
//!     mux.submit(video, FrameMetadata::new().with_dts(i * 3600), vec![Bytes::from(vec![0u8; 2000])])?;
//!     mux.submit(audio, FrameMetadata::new().with_dts(i * 1920), vec![Bytes::from(vec![0u8; 300])])?;
//! }
//!
//! let out = mux.pull_bytes(Duration::from_millis(200))?;
//! assert_eq!(out.len() % 188, 0);
//! mux.stop()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use crate::format::ts::clock::Timestamp;

pub mod completion;
pub mod control;
mod discontinuity;
pub mod engine;
pub mod frame;
pub mod index;
mod multiplexer;
pub mod queue;
mod readiness;
pub mod registry;
mod section;
mod timing;


pub use completion::{spawn_completion_listener, CompletionSender, CompletionStats};
pub use control::Control;
pub use engine::{
    EngineError, EngineIndexRecord, StreamBatch, StreamDescriptor, TransformEngine,
    TransformOutcome, TransformParams, TransformRequest, TransformStatus,
};
pub use frame::{index_flags, Frame, FrameId, FrameMetadata, PictureType};
pub use index::{IndexRecord, IndexSink, INDEX_RECORD_SIZE};
pub use multiplexer::{IndexSinkHandle, Multiplexer};
pub use queue::{QueueState, StreamHandle, StreamKind, StreamStatus};
pub use registry::Registry;

/// Frames one stream may hold, pending and in flight together.
pub const MAX_BUFFERS_PER_STREAM: usize = 64;
/// Frame slots kept free below `max_buffers`.
pub const BUFFER_RESERVE: usize = 5;
/// Consecutive timestamp failures tolerated before a full discontinuity.
pub const DISCONTINUITY_BUDGET: u8 = 3;
/// Streams, sections included, one multiplexer can carry.
pub const MAX_STREAMS: usize = 16;
/// Index sinks one stream can feed.
pub const MAX_SINKS_PER_STREAM: usize = 4;
/// Memory use, in percent of the budget, that forces an auto-pause.
pub const MEMORY_PAUSE_PERCENT: usize = 90;

/// Position of the multiplexer in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    New,
    /// Engine open, waiting for the first ready period.
    Started,
    Running,
    /// Every audio/video stream ended; remaining data is drained.
    Flushing,
    Flushed,
    Stopped,
}

impl fmt::Display for MuxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MuxState::New => "new",
            MuxState::Started => "started",
            MuxState::Running => "running",
            MuxState::Flushing => "flushing",
            MuxState::Flushed => "flushed",
            MuxState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Notifications broadcast to [`Multiplexer::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// A submit left the session ready to pull.
    DataAvailable(StreamHandle),
    EndOfStream(StreamHandle),
    StreamPaused(StreamHandle),
    Restarted { success: bool },
    Flushed,
}

/// Point-in-time view of the multiplexer, for diagnostics.
#[derive(Debug, Clone)]
pub struct MuxStatus {
    pub state: MuxState,
    pub last_pcr: Option<Timestamp>,
    pub min_dts: Option<Timestamp>,
    /// Distance the initial clock was wrapped below zero, diagnostics only.
    pub shift_pcr: u64,
    pub memory_used: usize,
    pub max_memory: usize,
    pub total_buffers: usize,
    pub max_buffers: usize,
    pub transforms: u64,
    pub packets: u64,
    pub restarts: u64,
}
