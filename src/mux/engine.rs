//! The seam between the multiplexer and the packet encoder.
//!
//! A [`TransformEngine`] turns the frames the multiplexer has accepted into
//! one PCR period of output. It is driven synchronously under the
//! multiplexer's lock and reports which frames it finished with.

use std::collections::VecDeque;
use thiserror::Error;

use super::frame::{Frame, FrameId};
use super::queue::StreamHandle;
use crate::config::{MuxConfig, OutputType};
use crate::format::ts::clock::Timestamp;
use crate::format::ts::types::{PTS_HZ, TS_PACKET_SIZE, TTS_PACKET_SIZE};

/// Errors raised by a transform engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was used before `open` or after `close`
    #[error("engine is not open")]
    NotOpen,

    #[error("unknown stream {0}")]
    UnknownStream(StreamHandle),

    #[error("stream {0} already added")]
    DuplicateStream(StreamHandle),

    #[error("output buffer too small: need {needed} bytes, have {available}")]
    OutputTooSmall { needed: usize, available: usize },

    #[error("transform failed: {0}")]
    Failed(String),
}

/// One-shot flags forwarded to the engine when it is opened.
pub mod global_flags {
    /// Mark the next clock reference as discontinuous.
    pub const PCR_DISCONTINUITY: u32 = 1;
    /// Bump table versions and mark them discontinuous.
    pub const TABLE_DISCONTINUITY: u32 = 2;
}

/// Session parameters handed to [`TransformEngine::open`].
#[derive(Debug, Clone)]
pub struct TransformParams {
    pub pcr_period: u64,
    pub bitrate: u64,
    pub fixed_bitrate: bool,
    pub table_generation: u32,
    pub table_period: u64,
    pub transport_stream_id: u16,
    pub program_number: u16,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    pub output_type: OutputType,
    pub provider_name: String,
    pub service_name: String,
    /// Union of [`global_flags`].
    pub global_flags: u32,
}

impl TransformParams {
    pub fn from_config(config: &MuxConfig, global_flags: u32) -> Self {
        Self {
            pcr_period: config.pcr_period,
            bitrate: config.bitrate,
            fixed_bitrate: config.fixed_bitrate,
            table_generation: config.table_generation,
            table_period: config.table_period,
            transport_stream_id: config.transport_stream_id,
            program_number: config.program_number,
            pmt_pid: config.pmt_pid,
            pcr_pid: config.pcr_pid,
            output_type: config.output_type,
            provider_name: config.provider_name.clone(),
            service_name: config.service_name.clone(),
            global_flags,
        }
    }

    pub fn packet_size(&self) -> usize {
        packet_size(self.output_type)
    }

    /// Packets that fit one period at the configured bitrate, at least one.
    pub fn packets_per_period(&self) -> usize {
        packets_per_period(self.bitrate, self.pcr_period)
    }

    /// Bytes of output one transform may produce.
    pub fn output_size(&self) -> usize {
        self.packets_per_period() * self.packet_size()
    }
}

pub(crate) fn packet_size(output_type: OutputType) -> usize {
    match output_type {
        OutputType::Ts => TS_PACKET_SIZE,
        OutputType::Tts => TTS_PACKET_SIZE,
    }
}

pub(crate) fn packets_per_period(bitrate: u64, pcr_period: u64) -> usize {
    let bits = bitrate as u128 * pcr_period as u128;
    let per_packet = PTS_HZ as u128 * TS_PACKET_SIZE as u128 * 8;
    (bits.div_ceil(per_packet) as usize).max(1)
}

/// Static description of a stream handed to [`TransformEngine::add_stream`].
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub handle: StreamHandle,
    pub pid: u16,
    pub stream_type: u8,
    pub stream_id: u8,
    pub is_section: bool,
    pub stream_is_pes: bool,
}

/// Frames of one stream visible to the engine during a transform.
#[derive(Debug)]
pub struct StreamBatch<'a> {
    pub handle: StreamHandle,
    pub paused: bool,
    /// Every frame handed over and not yet completed, oldest first.
    pub frames: &'a VecDeque<Frame>,
}

/// Input of one transform.
#[derive(Debug)]
pub struct TransformRequest<'a> {
    /// Clock reference the output period starts at.
    pub pcr: Timestamp,
    /// Emit everything, the session is ending.
    pub flush: bool,
    pub streams: Vec<StreamBatch<'a>>,
}

/// How a transform went, as far as the clock is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    Ok,
    /// Output produced, but some frame arrived later than its slot.
    DtsViolation,
    /// No usable output; the clock does not advance.
    Failed,
}

/// Index event produced by an engine, one or more tags at one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineIndexRecord {
    /// Stream the event belongs to, `None` for tables.
    pub stream: Option<StreamHandle>,
    pub flags: u32,
    pub pts: Timestamp,
    pub native_pts: u64,
    pub packet_offset: u32,
}

/// Result of one transform.
#[derive(Debug, Clone)]
pub struct TransformStatus {
    pub bytes: usize,
    pub packets: u32,
    /// Clock reference of the emitted period.
    pub pcr: Timestamp,
    pub outcome: TransformOutcome,
    /// Frames the engine no longer needs.
    pub completed: Vec<FrameId>,
    pub index: Vec<EngineIndexRecord>,
    /// Data remains that did not fit this period.
    pub unconsumed: bool,
}

/// Packet encoder driven by the multiplexer.
pub trait TransformEngine: Send {
    fn open(&mut self, params: &TransformParams) -> Result<(), EngineError>;

    fn close(&mut self);

    fn add_stream(&mut self, stream: &StreamDescriptor) -> Result<(), EngineError>;

    fn remove_stream(&mut self, handle: StreamHandle) -> Result<(), EngineError>;

    /// Produces one period of output into the scatter list `output`.
    fn run(
        &mut self,
        request: &TransformRequest<'_>,
        output: &mut [&mut [u8]],
    ) -> Result<TransformStatus, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packets_per_period() {
        // 20 Mbit/s over 50ms is 1,000,000 bits, 664.9 packets
        assert_eq!(packets_per_period(20_000_000, 4500), 665);
        assert_eq!(packets_per_period(1, 1), 1);
    }

    #[test]
    fn test_output_size_follows_framing() {
        let mut config = MuxConfig::default();
        let params = TransformParams::from_config(&config, 0);
        assert_eq!(params.output_size(), 665 * TS_PACKET_SIZE);

        config.output_type = OutputType::Tts;
        let params = TransformParams::from_config(&config, global_flags::PCR_DISCONTINUITY);
        assert_eq!(params.output_size(), 665 * TTS_PACKET_SIZE);
        assert_eq!(params.global_flags, global_flags::PCR_DISCONTINUITY);
    }
}
