#![doc(html_root_url = "https://docs.rs/vdkmux/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # vdkmux - real-time MPEG-TS multiplexing
//!
//! `vdkmux` interleaves independently produced compressed media frames into
//! a single transport stream. Producers push frames on per-stream queues; a
//! consumer pulls one clock reference (PCR) period of output at a time, and
//! the multiplexer makes sure every period only contains correctly ordered
//! data from all streams.
//!
//! ## Features
//!
//! ### Synchronization
//! - 33-bit wrap-aware decode timestamp and clock arithmetic
//! - Readiness evaluation across all active streams
//! - Auto-pause of streams that run too far ahead or go quiet
//! - Timestamp integrity checks escalating to a full discontinuity and an
//!   automatic restart with discontinuity signalling
//!
//! ### Output
//! - Pluggable [`TransformEngine`](mux::TransformEngine) packetizer
//! - Software reference engine producing 188-byte TS or 192-byte TTS packets
//! - PAT/PMT/SDT generation and repeating PSI/SI section streams
//! - Index records describing where tagged events landed in the output
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! vdkmux = "0.1.0"
//! ```
//!
//! ### Pulling output
//!
//! ```rust
//! use std::time::Duration;
//! use bytes::Bytes;
//! use vdkmux::config::{MuxConfig, StreamConfig};
//! use vdkmux::format::ts::{SoftwareTsEngine, STREAM_TYPE_H264};
//! use vdkmux::mux::{FrameMetadata, Multiplexer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mux = Multiplexer::new(MuxConfig::default(), Box::new(SoftwareTsEngine::new()))?;
//! let video = mux.attach_stream(StreamConfig::new(STREAM_TYPE_H264).with_multiplex_ahead_limit(0))?;
//! mux.start()?;
//!
//! for i in 0..4u64 {
//!     mux.submit(video, FrameMetadata::new().with_dts(i * 3600), vec![Bytes::from(vec![0u8; 1500])])?;
//! }
//! let period = mux.pull_bytes(Duration::from_millis(200))?;
//! assert!(!period.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! ### Streaming with tokio
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use vdkmux::config::MuxConfig;
//! use vdkmux::format::ts::SoftwareTsEngine;
//! use vdkmux::mux::Multiplexer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mux = Arc::new(Multiplexer::new(MuxConfig::from_sources()?, Box::new(SoftwareTsEngine::new()))?);
//!     // attach streams, start, spawn producers...
//!     let mut output = Box::pin(Arc::clone(&mux).output_stream());
//!     while let Some(period) = output.next().await {
//!         println!("{} bytes", period?.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `mux`: the multiplexer, its stream queues, index sinks, registry and
//!   the engine seam
//! - `format`: transport stream types, PES headers, clock arithmetic and the
//!   software engine
//! - `config`: session, stream, section and index sink settings
//! - `error`: the crate error type and `Result` alias
//! - `utils`: MPEG-2 CRC32

/// Configuration module
pub mod config;

/// Error types and utilities
pub mod error;

/// Container format implementations
pub mod format;

/// Stream multiplexer
pub mod mux;

/// Common utilities and helper functions
pub mod utils;

pub use error::{MuxError, Result};
