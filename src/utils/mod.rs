//! # Utility Functions and Types
//!
//! Helpers shared by the multiplexer and the reference packetizer.
//!
//! ## CRC Calculation
//!
//! The crc module provides MPEG-2 CRC32 calculation:
//!
//! ```rust
//! use vdkmux::utils::Crc32Mpeg2;
//!
//! # fn main() {
//! let data = b"Hello, world!";
//! let crc = Crc32Mpeg2::new().calculate(data);
//! println!("CRC32: {:08x}", crc);
//! # }
//! ```

/// CRC calculation implementations
pub mod crc;

pub use crc::Crc32Mpeg2;
