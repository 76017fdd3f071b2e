use bytes::Bytes;
use std::fmt;

use crate::format::ts::clock::Timestamp;

/// Index record tags. A frame's `index_flags` is a union of these bits, and a
/// record is produced for every bit that survives the sink masks.
pub mod index_flags {
    /// Payload unit start of a frame
    pub const PUSI: u32 = 1 << 0;
    /// Frame carries a presentation timestamp
    pub const PTS: u32 = 1 << 1;
    /// Intra-coded picture
    pub const I_FRAME: u32 = 1 << 2;
    /// Predicted picture
    pub const P_FRAME: u32 = 1 << 3;
    /// Bidirectionally predicted picture
    pub const B_FRAME: u32 = 1 << 4;
    /// Discontinuity information table transition
    pub const DIT: u32 = 1 << 5;
    /// Random access point transition
    pub const RAP: u32 = 1 << 6;
    /// Program association table emitted
    pub const PAT: u32 = 1 << 7;
    /// Program map table emitted
    pub const PMT: u32 = 1 << 8;
    /// Service description table emitted
    pub const SDT: u32 = 1 << 9;
    /// First frame of a stream, tagging its PES stream id
    pub const STREAM_ID: u32 = 1 << 10;
    /// First frame of a stream, tagging its stream type
    pub const STREAM_TYPE: u32 = 1 << 11;

    /// Tags only produced for tables.
    pub const TABLES: u32 = PAT | PMT | SDT;
    /// Every tag.
    pub const ALL: u32 = (1 << 12) - 1;
}

/// Identifies one frame for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coding type of a video picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    I,
    P,
    B,
}

/// Producer-supplied description of a frame.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    /// Decode time in 90kHz ticks. Ignored for PES pass-through streams.
    pub dts: Option<Timestamp>,
    /// Time in the producer's own clock domain, echoed into index records.
    pub native_time: Option<u64>,
    pub is_eos: bool,
    pub picture_type: Option<PictureType>,
    /// Frame is a random access point.
    pub random_access: bool,
    /// Frame starts a new discontinuity information period.
    pub dit_transition: bool,
}

impl FrameMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// End-of-stream marker.
    pub fn eos() -> Self {
        Self {
            is_eos: true,
            ..Self::default()
        }
    }

    pub fn with_dts(mut self, dts: Timestamp) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_native_time(mut self, native_time: u64) -> Self {
        self.native_time = Some(native_time);
        self
    }

    pub fn with_picture_type(mut self, picture_type: PictureType) -> Self {
        self.picture_type = Some(picture_type);
        self
    }

    pub fn with_random_access(mut self, random_access: bool) -> Self {
        self.random_access = random_access;
        self
    }

    pub fn with_dit_transition(mut self, dit_transition: bool) -> Self {
        self.dit_transition = dit_transition;
        self
    }
}

/// One accepted unit of compressed data owned by a stream queue.
#[derive(Debug)]
pub struct Frame {
    pub id: FrameId,
    pub dts: Timestamp,
    pub native_dts: u64,
    pub is_eos: bool,
    /// Zero-length marker telling the engine the stream paused.
    pub is_pause: bool,
    /// Output carrying this frame must signal a timeline discontinuity.
    pub discontinuity: bool,
    /// Signal a random access point in the adaptation field.
    pub random_access: bool,
    pub index_flags: u32,
    /// Section re-emission interval in 90kHz ticks, 0 for one-shot.
    pub repeat_interval: u64,
    /// Header the multiplexer generated for elementary-stream payloads.
    pub pes_header: Option<Bytes>,
    pub blocks: Vec<Bytes>,
}

impl Frame {
    pub(crate) fn new(id: FrameId, dts: Timestamp, blocks: Vec<Bytes>) -> Self {
        Self {
            id,
            dts,
            native_dts: 0,
            is_eos: false,
            is_pause: false,
            discontinuity: false,
            random_access: false,
            index_flags: 0,
            repeat_interval: 0,
            pes_header: None,
            blocks,
        }
    }

    pub(crate) fn pause_marker(id: FrameId) -> Self {
        let mut frame = Self::new(id, 0, Vec::new());
        frame.is_pause = true;
        frame
    }

    /// Payload bytes, excluding any generated PES header.
    pub fn payload_len(&self) -> usize {
        self.blocks.iter().map(Bytes::len).sum()
    }

    /// Bytes this frame charges against the memory budget.
    pub fn length(&self) -> usize {
        if self.is_pause || self.is_eos {
            return 0;
        }
        self.payload_len() + self.pes_header.as_ref().map_or(0, Bytes::len)
    }

    /// Header followed by payload blocks.
    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.pes_header.iter().chain(self.blocks.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_length_counts_header_and_blocks() {
        let mut frame = Frame::new(
            FrameId(1),
            0,
            vec![Bytes::from_static(&[1, 2, 3]), Bytes::from_static(&[4])],
        );
        assert_eq!(frame.length(), 4);
        frame.pes_header = Some(Bytes::from_static(&[0; 14]));
        assert_eq!(frame.length(), 18);
        assert_eq!(frame.chunks().count(), 3);
    }

    #[test]
    fn test_markers_are_free() {
        let pause = Frame::pause_marker(FrameId(2));
        assert!(pause.is_pause);
        assert_eq!(pause.length(), 0);

        let mut eos = Frame::new(FrameId(3), 10, vec![Bytes::from_static(&[9; 32])]);
        eos.is_eos = true;
        assert_eq!(eos.length(), 0);
    }

    #[test]
    fn test_metadata_builder() {
        let meta = FrameMetadata::new()
            .with_dts(900)
            .with_picture_type(PictureType::I)
            .with_random_access(true);
        assert_eq!(meta.dts, Some(900));
        assert_eq!(meta.picture_type, Some(PictureType::I));
        assert!(meta.random_access);
        assert!(FrameMetadata::eos().is_eos);
    }
}
