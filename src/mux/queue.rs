use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;

use super::engine::StreamDescriptor;
use super::frame::{Frame, FrameId};
use super::index::IndexSink;
use super::{DISCONTINUITY_BUDGET, MAX_BUFFERS_PER_STREAM};
use crate::config::{SectionConfig, StreamConfig};
use crate::format::ts::clock::{in_time_period, ring_add, time_is_before, Timestamp};
use crate::format::ts::types::*;
use std::sync::Arc;

/// Arena index of a stream attached to a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub(crate) usize);

impl StreamHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Position of a stream in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Attached, multiplexer not started yet.
    Connected,
    /// Registered with the engine, no frame accepted yet.
    Started,
    Running,
    Paused,
    /// End of stream seen; remaining frames are drained.
    Flushing,
    Stopped,
}

/// What a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    /// Sparse stream such as subtitles.
    Scattered,
    Data,
    Section,
}

impl StreamKind {
    /// Classifies an MPEG-TS stream type.
    pub fn from_stream_type(stream_type: u8) -> Self {
        match stream_type {
            0x01 | STREAM_TYPE_MPEG2_VIDEO | 0x10 | STREAM_TYPE_H264 | STREAM_TYPE_H265 => {
                StreamKind::Video
            }
            STREAM_TYPE_MPEG1_AUDIO | 0x04 | STREAM_TYPE_AAC | 0x11 | STREAM_TYPE_AC3 | 0x87 => {
                StreamKind::Audio
            }
            _ => StreamKind::Data,
        }
    }

    pub fn is_av(&self) -> bool {
        matches!(self, StreamKind::Video | StreamKind::Audio)
    }
}

/// Stored table of a section stream, re-submitted on every start.
#[derive(Debug, Clone, Default)]
pub(crate) struct SectionState {
    pub table: Option<Bytes>,
    pub repeat_interval_ms: u32,
}

/// Point-in-time view of one stream, for diagnostics.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub handle: StreamHandle,
    pub kind: StreamKind,
    pub state: QueueState,
    pub pid: u16,
    pub first_dts: Option<Timestamp>,
    pub last_dts: Option<Timestamp>,
    pub discontinuity_budget: u8,
    pub full_discontinuity: bool,
    pub manual_pause: bool,
    pub dont_pause_other: bool,
    pub pending: usize,
    pub in_flight: usize,
    pub bytes_queued: usize,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub pauses: u64,
}

pub(crate) struct SinkLink {
    pub id: usize,
    pub sink: Arc<IndexSink>,
}

/// FIFO of frames for one elementary stream plus its timing state.
pub(crate) struct StreamQueue {
    pub handle: StreamHandle,
    pub kind: StreamKind,
    pub config: StreamConfig,
    pub pid: u16,
    pub stream_id: u8,
    pub state: QueueState,

    pub first_dts: Option<Timestamp>,
    pub last_dts: Option<Timestamp>,
    pub ftd_first_dts: Option<Timestamp>,
    pub discontinuity_budget: u8,
    pub full_discontinuity: bool,

    pub manual_pause: bool,
    pub dont_pause_other: bool,
    pub eos_detected: bool,

    pub pending: VecDeque<Frame>,
    pub in_flight: VecDeque<Frame>,
    /// Real frames held, pause markers excluded.
    pub num_buffers: usize,
    pub bytes_queued: usize,

    pub sinks: Vec<SinkLink>,
    pub section: Option<SectionState>,

    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub pauses: u64,
}

impl StreamQueue {
    pub fn new(handle: StreamHandle, config: StreamConfig, pid: u16, stream_id: u8) -> Self {
        let kind = if config.scattered {
            StreamKind::Scattered
        } else {
            StreamKind::from_stream_type(config.stream_type)
        };
        Self {
            handle,
            kind,
            config,
            pid,
            stream_id,
            state: QueueState::Connected,
            first_dts: None,
            last_dts: None,
            ftd_first_dts: None,
            discontinuity_budget: DISCONTINUITY_BUDGET,
            full_discontinuity: false,
            manual_pause: false,
            dont_pause_other: false,
            eos_detected: false,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            num_buffers: 0,
            bytes_queued: 0,
            sinks: Vec::new(),
            section: None,
            frames_accepted: 0,
            frames_rejected: 0,
            pauses: 0,
        }
    }

    pub fn new_section(handle: StreamHandle, config: &SectionConfig) -> Self {
        // Sections never take part in timestamp checks.
        let stream_config = StreamConfig::new(STREAM_TYPE_PRIVATE_PES).with_dts_integrity_threshold(0);
        let mut queue = Self::new(handle, stream_config, config.pid, 0);
        queue.kind = StreamKind::Section;
        queue.section = Some(SectionState::default());
        queue
    }

    pub fn is_section(&self) -> bool {
        self.kind == StreamKind::Section
    }

    pub fn is_av(&self) -> bool {
        self.kind.is_av()
    }

    pub fn is_scattered(&self) -> bool {
        self.kind == StreamKind::Scattered
    }

    /// Registered with the engine during the current session.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, QueueState::Connected | QueueState::Stopped)
    }

    /// Frames held in either deque, markers included.
    pub fn frame_count(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn is_full(&self) -> bool {
        self.frame_count() >= MAX_BUFFERS_PER_STREAM
    }

    /// Union of the masks of every linked sink.
    pub fn index_mask(&self) -> u32 {
        self.sinks.iter().fold(0, |mask, link| mask | link.sink.mask())
    }

    /// True when `last_dts` lies behind the program clock.
    pub fn lags(&self, last_pcr: Option<Timestamp>) -> bool {
        match (self.last_dts, last_pcr) {
            (Some(last), Some(pcr)) => time_is_before(last, pcr),
            _ => false,
        }
    }

    /// The stream has data reaching past the next period's safety margin.
    pub fn enough_data(&self, last_pcr: Option<Timestamp>, pcr_period: u64) -> bool {
        if self.is_section() {
            return true;
        }
        if self.num_buffers == 0 {
            return false;
        }
        let (Some(pcr), Some(last)) = (last_pcr, self.last_dts) else {
            return false;
        };
        !in_time_period(
            last,
            pcr,
            ring_add(pcr, pcr_period + self.config.multiplex_ahead_limit),
        )
    }

    /// Appends a frame, returning the bytes it charges against the memory budget.
    pub fn push(&mut self, frame: Frame) -> usize {
        let len = frame.length();
        if !frame.is_pause {
            self.num_buffers += 1;
            self.bytes_queued += len;
        }
        self.pending.push_back(frame);
        len
    }

    /// Moves every pending frame to the in-flight deque.
    pub fn hand_off(&mut self) {
        self.in_flight.extend(self.pending.drain(..));
    }

    /// Removes a completed in-flight frame.
    pub fn retire(&mut self, id: FrameId) -> Option<Frame> {
        let pos = self.in_flight.iter().position(|f| f.id == id)?;
        let frame = self.in_flight.remove(pos)?;
        self.release(&frame);
        Some(frame)
    }

    /// Drops pending frames matching `pred`, returning (frames, bytes) released.
    pub fn remove_pending(&mut self, pred: impl Fn(&Frame) -> bool) -> (usize, usize) {
        let mut released = (0, 0);
        for frame in std::mem::take(&mut self.pending) {
            if pred(&frame) {
                if !frame.is_pause {
                    released.0 += 1;
                    released.1 += frame.length();
                }
                self.release(&frame);
            } else {
                self.pending.push_back(frame);
            }
        }
        released
    }

    /// Drops every frame, returning (frames, bytes) released.
    pub fn clear(&mut self) -> (usize, usize) {
        let released = (self.num_buffers, self.bytes_queued);
        self.pending.clear();
        self.in_flight.clear();
        self.num_buffers = 0;
        self.bytes_queued = 0;
        released
    }

    fn release(&mut self, frame: &Frame) {
        if !frame.is_pause {
            self.num_buffers -= 1;
            self.bytes_queued -= frame.length();
        }
    }

    /// Forgets the stream's timeline.
    pub fn reset_timing(&mut self) {
        self.first_dts = None;
        self.last_dts = None;
        self.ftd_first_dts = None;
        self.discontinuity_budget = DISCONTINUITY_BUDGET;
        self.full_discontinuity = false;
        self.dont_pause_other = false;
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            handle: self.handle,
            pid: self.pid,
            stream_type: self.config.stream_type,
            stream_id: self.stream_id,
            is_section: self.is_section(),
            stream_is_pes: self.config.stream_is_pes,
        }
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            handle: self.handle,
            kind: self.kind,
            state: self.state,
            pid: self.pid,
            first_dts: self.first_dts,
            last_dts: self.last_dts,
            discontinuity_budget: self.discontinuity_budget,
            full_discontinuity: self.full_discontinuity,
            manual_pause: self.manual_pause,
            dont_pause_other: self.dont_pause_other,
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            bytes_queued: self.bytes_queued,
            frames_accepted: self.frames_accepted,
            frames_rejected: self.frames_rejected,
            pauses: self.pauses,
        }
    }
}

impl fmt::Debug for StreamQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamQueue")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("first_dts", &self.first_dts)
            .field("last_dts", &self.last_dts)
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::clock::MAX_DTS;
    use pretty_assertions::assert_eq;

    fn queue() -> StreamQueue {
        StreamQueue::new(
            StreamHandle(0),
            StreamConfig::new(STREAM_TYPE_H264).with_multiplex_ahead_limit(0),
            0x100,
            STREAM_ID_VIDEO,
        )
    }

    fn frame(id: u64, len: usize) -> Frame {
        Frame::new(FrameId(id), id * 3000, vec![Bytes::from(vec![0u8; len])])
    }

    #[test]
    fn test_classification() {
        assert_eq!(StreamKind::from_stream_type(STREAM_TYPE_H264), StreamKind::Video);
        assert_eq!(StreamKind::from_stream_type(STREAM_TYPE_AAC), StreamKind::Audio);
        assert_eq!(StreamKind::from_stream_type(0x15), StreamKind::Data);
        let section = StreamQueue::new_section(StreamHandle(1), &SectionConfig { pid: 0x30 });
        assert!(section.is_section());
        assert!(!section.is_av());
    }

    #[test]
    fn test_push_hand_off_retire_accounting() {
        let mut q = queue();
        assert_eq!(q.push(frame(1, 100)), 100);
        assert_eq!(q.push(Frame::pause_marker(FrameId(2))), 0);
        q.push(frame(3, 50));
        assert_eq!(q.num_buffers, 2);
        assert_eq!(q.bytes_queued, 150);

        q.hand_off();
        assert_eq!(q.pending.len(), 0);
        assert_eq!(q.in_flight.len(), 3);

        assert!(q.retire(FrameId(1)).is_some());
        assert!(q.retire(FrameId(1)).is_none());
        assert!(q.retire(FrameId(2)).is_some());
        assert_eq!(q.num_buffers, 1);
        assert_eq!(q.bytes_queued, 50);
    }

    #[test]
    fn test_remove_pending_only_touches_pending() {
        let mut q = queue();
        q.push(frame(1, 10));
        q.hand_off();
        q.push(frame(2, 20));
        q.push(frame(3, 30));
        assert_eq!(q.remove_pending(|_| true), (2, 50));
        assert_eq!(q.in_flight.len(), 1);
        assert_eq!(q.num_buffers, 1);
        assert_eq!(q.bytes_queued, 10);
    }

    #[test]
    fn test_enough_data_window() {
        let mut q = queue();
        q.push(frame(1, 10));
        q.last_dts = Some(4000);
        // last inside [pcr, pcr + period) is not enough
        assert!(!q.enough_data(Some(0), 4500));
        q.last_dts = Some(4500);
        assert!(q.enough_data(Some(0), 4500));
        // window crossing the wrap
        q.last_dts = Some(100);
        assert!(!q.enough_data(Some(MAX_DTS - 1000), 4500));
        assert!(!q.enough_data(None, 4500));
    }

    #[test]
    fn test_lags_is_wrap_aware() {
        let mut q = queue();
        q.last_dts = Some(10);
        assert!(!q.lags(Some(MAX_DTS - 10)));
        assert!(q.lags(Some(20)));
        assert!(!q.lags(None));
    }
}
