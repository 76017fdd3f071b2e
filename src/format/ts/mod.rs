//! # MPEG Transport Stream (TS)
//!
//! Building blocks for producing MPEG-TS:
//!
//! - 33-bit clock arithmetic shared with the multiplexer
//! - Program Specific Information (PAT, PMT) and SDT sections
//! - Packetized Elementary Stream (PES) headers
//! - [`SoftwareTsEngine`], a complete software packetizer
//!
//! ## Example Usage
//!
//! ```rust
//! use vdkmux::format::ts::{PESHeader, PesTiming, STREAM_ID_VIDEO};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let header = PESHeader::new(STREAM_ID_VIDEO).with_pts(900_000).to_bytes()?;
//! let timing = PesTiming::parse(&header)?;
//! assert_eq!(timing.decode_time(), Some(900_000));
//! # Ok(())
//! # }
//! ```

/// Wrap-aware 90kHz clock arithmetic
pub mod clock;

/// Software engine producing TS packets
pub mod muxer;

/// PES header handling
pub mod pes;

/// Core TS types and constants
pub mod types;

pub use muxer::SoftwareTsEngine;
pub use pes::{PESHeader, PesTiming};
pub use types::{
    TSHeader, PID_NULL, PID_PAT, PID_PMT, STREAM_ID_AUDIO, STREAM_ID_VIDEO, STREAM_TYPE_AAC,
    STREAM_TYPE_H264, STREAM_TYPE_H265, STREAM_TYPE_PRIVATE_PES, TS_PACKET_SIZE,
    TTS_PACKET_SIZE,
};
