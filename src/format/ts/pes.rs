use super::clock::{pcr_limit, Timestamp};
use crate::error::{MuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};

const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
const PES_FIXED_HEADER_SIZE: usize = 9;

/// Packetized Elementary Stream (PES) header structure
///
/// Only the fields the multiplexer sets are modeled; everything else is
/// written with its neutral value.
#[derive(Debug, Clone, Default)]
pub struct PESHeader {
    /// Stream identifier indicating content type (video/audio/etc.)
    pub stream_id: u8,
    /// Length of the PES packet after the length field, 0 for unbounded video
    pub packet_length: u16,
    /// Data alignment indicator
    pub data_alignment: bool,
    /// Presentation Time Stamp (33 bits)
    pub pts: Option<Timestamp>,
    /// Decoding Time Stamp (33 bits)
    pub dts: Option<Timestamp>,
}

impl PESHeader {
    /// Creates a new PES header with a specific stream ID.
    pub fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            data_alignment: true,
            ..Default::default()
        }
    }

    /// Sets the Presentation Time Stamp in 90kHz ticks.
    pub fn with_pts(mut self, pts: Timestamp) -> Self {
        self.pts = Some(pcr_limit(pts));
        self
    }

    /// Sets the Decoding Time Stamp in 90kHz ticks.
    ///
    /// A DTS is only written alongside a PTS.
    pub fn with_dts(mut self, dts: Timestamp) -> Self {
        self.dts = Some(pcr_limit(dts));
        self
    }

    /// Sets the packet length from the size of the payload that follows.
    ///
    /// Payloads that do not fit the 16-bit field leave it at zero, which is
    /// only legal for video streams.
    pub fn with_payload_len(mut self, payload_len: usize) -> Self {
        let total = self.optional_len() + 3 + payload_len;
        self.packet_length = u16::try_from(total).unwrap_or(0);
        self
    }

    fn pts_dts_flags(&self) -> u8 {
        match (self.pts, self.dts) {
            (Some(_), Some(_)) => 0xc0,
            (Some(_), None) => 0x80,
            _ => 0,
        }
    }

    fn optional_len(&self) -> usize {
        match self.pts_dts_flags() {
            0xc0 => 10,
            0x80 => 5,
            _ => 0,
        }
    }

    /// Size of the serialized header.
    pub fn len(&self) -> usize {
        PES_FIXED_HEADER_SIZE + self.optional_len()
    }

    /// Always false; a PES header has a fixed part.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Writes the PES header to a BytesMut buffer.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(&PES_START_CODE);
        buf.put_u8(self.stream_id);
        buf.put_u16(self.packet_length);

        // '10' marker, no scrambling, no priority
        let mut flags = 0x80u8;
        if self.data_alignment {
            flags |= 0x04;
        }
        buf.put_u8(flags);

        let pts_dts_flags = self.pts_dts_flags();
        buf.put_u8(pts_dts_flags);
        buf.put_u8(self.optional_len() as u8);

        match (self.pts, self.dts) {
            (Some(pts), Some(dts)) => {
                write_timestamp(buf, 0x30, pts);
                write_timestamp(buf, 0x10, dts);
            }
            (Some(pts), None) => write_timestamp(buf, 0x20, pts),
            _ => {}
        }

        Ok(())
    }

    /// Serializes the header into its own buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.len());
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Timing fields found at the start of an already packetized frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesTiming {
    /// stream_id byte of the PES header
    pub stream_id: u8,
    /// Presentation Time Stamp, if the header carries one
    pub pts: Option<Timestamp>,
    /// Decoding Time Stamp, if the header carries one
    pub dts: Option<Timestamp>,
}

impl PesTiming {
    /// The time the frame must be decoded by: the DTS when present, else the PTS.
    pub fn decode_time(&self) -> Option<Timestamp> {
        self.dts.or(self.pts)
    }

    /// Parses the PES header at the start of `data`.
    ///
    /// Returns an error when the start code is missing or the header is
    /// shorter than its flags claim.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PES_FIXED_HEADER_SIZE || data[..3] != PES_START_CODE {
            return Err(MuxError::InvalidData("missing PES start code".into()));
        }

        let stream_id = data[3];
        let mut timing = Self {
            stream_id,
            pts: None,
            dts: None,
        };

        match data[7] & 0xc0 {
            0x80 => {
                timing.pts = Some(read_timestamp(field(data, 9)?));
            }
            0xc0 => {
                timing.pts = Some(read_timestamp(field(data, 9)?));
                timing.dts = Some(read_timestamp(field(data, 14)?));
            }
            _ => {}
        }

        Ok(timing)
    }
}

fn field(data: &[u8], offset: usize) -> Result<&[u8]> {
    data.get(offset..offset + 5)
        .ok_or_else(|| MuxError::InvalidData("truncated PES timestamp".into()))
}

/// Writes a 33-bit timestamp in the 5-byte PES encoding with marker bits.
fn write_timestamp(buf: &mut BytesMut, marker: u8, ts: Timestamp) {
    let ts = pcr_limit(ts);

    // First byte: marker bits and 3 MSB of timestamp
    buf.put_u8(marker | ((ts >> 29) & 0x0E) as u8 | 0x01);

    // Middle 15 bits and marker
    buf.put_u16((((ts >> 14) & 0xFFFE) | 0x01) as u16);

    // Final 15 bits and marker
    buf.put_u16((((ts << 1) & 0xFFFE) | 0x01) as u16);
}

fn read_timestamp(b: &[u8]) -> Timestamp {
    ((b[0] as u64 & 0x0e) << 29)
        | ((b[1] as u64) << 22)
        | ((b[2] as u64 & 0xfe) << 14)
        | ((b[3] as u64) << 7)
        | ((b[4] as u64) >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::clock::MAX_DTS;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pes_header_layout() {
        let header = PESHeader::new(0xe0).with_pts(90_000);
        let bytes = header.to_bytes().unwrap();

        assert_eq!(&bytes[0..3], &[0x00, 0x00, 0x01]);
        assert_eq!(bytes[3], 0xe0);
        assert_eq!(bytes[7], 0x80);
        assert_eq!(bytes[8], 5);
        assert_eq!(bytes.len(), header.len());
    }

    #[test]
    fn test_parse_pts_only() {
        let bytes = PESHeader::new(0xc0).with_pts(123_456).to_bytes().unwrap();
        let timing = PesTiming::parse(&bytes).unwrap();
        assert_eq!(timing.stream_id, 0xc0);
        assert_eq!(timing.pts, Some(123_456));
        assert_eq!(timing.dts, None);
        assert_eq!(timing.decode_time(), Some(123_456));
    }

    #[test]
    fn test_parse_pts_and_dts_at_ring_edge() {
        let bytes = PESHeader::new(0xe0)
            .with_pts(5)
            .with_dts(MAX_DTS)
            .to_bytes()
            .unwrap();
        let timing = PesTiming::parse(&bytes).unwrap();
        assert_eq!(timing.pts, Some(5));
        assert_eq!(timing.dts, Some(MAX_DTS));
        assert_eq!(timing.decode_time(), Some(MAX_DTS));
    }

    #[test]
    fn test_parse_rejects_truncated_header() {
        let bytes = PESHeader::new(0xe0).with_pts(1).to_bytes().unwrap();
        assert!(PesTiming::parse(&bytes[..11]).is_err());
        assert!(PesTiming::parse(&[0, 0, 2, 0xe0, 0, 0, 0x80, 0, 0]).is_err());
    }

    #[test]
    fn test_payload_len_sets_packet_length() {
        let header = PESHeader::new(0xc0).with_pts(0).with_payload_len(100);
        assert_eq!(header.packet_length, 3 + 5 + 100);

        let video = PESHeader::new(0xe0).with_pts(0).with_payload_len(1 << 20);
        assert_eq!(video.packet_length, 0);
    }
}
