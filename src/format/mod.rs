//! Media container formats.

/// MPEG transport stream
pub mod ts;
