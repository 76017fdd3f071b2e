use crate::error::Result;
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, Bytes, BytesMut};

// Stream IDs
pub const STREAM_ID_VIDEO: u8 = 0xe0;
pub const STREAM_ID_AUDIO: u8 = 0xc0;
pub const STREAM_ID_PRIVATE_1: u8 = 0xbd;
pub const STREAM_ID_METADATA: u8 = 0xfc;

// PIDs
pub const PID_PAT: u16 = 0x0000;
pub const PID_SDT: u16 = 0x0011;
pub const PID_DIT: u16 = 0x001e;
pub const PID_PMT: u16 = 0x1000;
pub const PID_NULL: u16 = 0x1fff;
pub const PID_MAX: u16 = 0x1ffe;
pub const PID_ES_BASE: u16 = 0x0100;

// Table IDs
pub const TABLE_ID_PAT: u8 = 0x00;
pub const TABLE_ID_PMT: u8 = 0x02;
pub const TABLE_ID_SDT: u8 = 0x42;

// Elementary Stream Types
pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
pub const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_PRIVATE_PES: u8 = 0x06;
pub const STREAM_TYPE_AAC: u8 = 0x0f;
pub const STREAM_TYPE_H264: u8 = 0x1b;
pub const STREAM_TYPE_H265: u8 = 0x24;
pub const STREAM_TYPE_AC3: u8 = 0x81;

// Constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TTS_PACKET_SIZE: usize = 192;
pub const TS_HEADER_SIZE: usize = 4;
pub const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;
pub const TS_SYNC_BYTE: u8 = 0x47;
pub const PTS_HZ: u64 = 90_000;
pub const PCR_HZ: u64 = 27_000_000;

#[derive(Debug, Clone)]
pub struct PATEntry {
    pub program_number: u16,
    pub program_map_pid: u16,
}

/// Program association table.
#[derive(Debug, Clone, Default)]
pub struct PAT {
    pub transport_stream_id: u16,
    pub version: u8,
    pub entries: Vec<PATEntry>,
}

impl PAT {
    pub fn new(transport_stream_id: u16) -> Self {
        Self {
            transport_stream_id,
            version: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        for entry in &self.entries {
            buf.put_u16(entry.program_number);
            buf.put_u16(entry.program_map_pid & 0x1fff | 7 << 13);
        }
        Ok(())
    }

    /// Serializes the complete PSI section including the trailing CRC.
    pub fn to_section(&self, crc: &Crc32Mpeg2) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(self.len());
        self.write_to(&mut body)?;
        Ok(psi_section(
            TABLE_ID_PAT,
            self.transport_stream_id,
            self.version,
            &body,
            crc,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct Descriptor {
    pub tag: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ElementaryStreamInfo {
    pub stream_type: u8,
    pub elementary_pid: u16,
    pub descriptors: Vec<Descriptor>,
}

/// Program map table for a single program.
#[derive(Debug, Clone, Default)]
pub struct PMT {
    pub program_number: u16,
    pub version: u8,
    pub pcr_pid: u16,
    pub program_descriptors: Vec<Descriptor>,
    pub elementary_stream_infos: Vec<ElementaryStreamInfo>,
}

impl PMT {
    pub fn new(program_number: u16, pcr_pid: u16) -> Self {
        Self {
            program_number,
            pcr_pid,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        let mut n = 4; // PCRPID + program info length

        for desc in &self.program_descriptors {
            n += 2 + desc.data.len();
        }

        for info in &self.elementary_stream_infos {
            n += 5; // stream_type + elementary_pid + ES info length
            for desc in &info.descriptors {
                n += 2 + desc.data.len();
            }
        }

        n
    }

    pub fn is_empty(&self) -> bool {
        self.elementary_stream_infos.is_empty()
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.pcr_pid & 0x1fff | 7 << 13);

        let prog_desc_len = descriptors_len(&self.program_descriptors);
        buf.put_u16((prog_desc_len as u16) & 0x3ff | 0xf << 12);
        write_descriptors(buf, &self.program_descriptors);

        for info in &self.elementary_stream_infos {
            buf.put_u8(info.stream_type);
            buf.put_u16(info.elementary_pid & 0x1fff | 7 << 13);

            let es_desc_len = descriptors_len(&info.descriptors);
            buf.put_u16((es_desc_len as u16) & 0x3ff | 0xf << 12);
            write_descriptors(buf, &info.descriptors);
        }

        Ok(())
    }

    pub fn to_section(&self, crc: &Crc32Mpeg2) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(self.len());
        self.write_to(&mut body)?;
        Ok(psi_section(
            TABLE_ID_PMT,
            self.program_number,
            self.version,
            &body,
            crc,
        ))
    }
}

/// Service description table carrying one service.
#[derive(Debug, Clone, Default)]
pub struct SDT {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub service_id: u16,
    pub provider_name: String,
    pub service_name: String,
}

impl SDT {
    pub fn to_section(&self, crc: &Crc32Mpeg2) -> Result<Bytes> {
        let provider = truncate_name(&self.provider_name);
        let service = truncate_name(&self.service_name);

        // service_descriptor: type, provider, name
        let mut desc = BytesMut::new();
        desc.put_u8(0x48);
        desc.put_u8((3 + provider.len() + service.len()) as u8);
        desc.put_u8(0x01); // digital television
        desc.put_u8(provider.len() as u8);
        desc.put_slice(provider);
        desc.put_u8(service.len() as u8);
        desc.put_slice(service);

        let mut body = BytesMut::new();
        body.put_u16(self.original_network_id);
        body.put_u8(0xff);
        body.put_u16(self.service_id);
        body.put_u8(0xfc); // no EIT
        // running_status = 4, free_CA_mode = 0
        body.put_u16(0x8000 | (desc.len() as u16 & 0x0fff));
        body.extend_from_slice(&desc);

        Ok(psi_section(
            TABLE_ID_SDT,
            self.transport_stream_id,
            0,
            &body,
            crc,
        ))
    }
}

fn truncate_name(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    &bytes[..bytes.len().min(64)]
}

fn descriptors_len(descriptors: &[Descriptor]) -> usize {
    descriptors.iter().map(|d| 2 + d.data.len()).sum()
}

fn write_descriptors(buf: &mut BytesMut, descriptors: &[Descriptor]) {
    for desc in descriptors {
        buf.put_u8(desc.tag);
        buf.put_u8(desc.data.len() as u8);
        buf.put_slice(&desc.data);
    }
}

/// Wraps a table body in the long-form PSI section syntax and appends the CRC.
pub fn psi_section(
    table_id: u8,
    extension: u16,
    version: u8,
    body: &[u8],
    crc: &Crc32Mpeg2,
) -> Bytes {
    // 5 bytes of extension/version/section numbers + body + CRC
    let section_length = 5 + body.len() + 4;
    let mut buf = BytesMut::with_capacity(3 + section_length);
    buf.put_u8(table_id);
    buf.put_u16(0xb000 | (section_length as u16 & 0x3ff));
    buf.put_u16(extension);
    buf.put_u8(0xc1 | ((version & 0x1f) << 1));
    buf.put_u8(0);
    buf.put_u8(0);
    buf.extend_from_slice(body);
    let checksum = crc.calculate(&buf);
    buf.put_u32(checksum);
    buf.freeze()
}

/// Adaptation field options the packetizer can set on a single packet.
#[derive(Debug, Clone, Default)]
pub struct AdaptationField {
    pub discontinuity: bool,
    pub random_access: bool,
    pub pcr: Option<u64>,
    /// Bytes of 0xff padding after the flagged fields.
    pub stuffing: usize,
    /// Write the flags byte even when no flag is set.
    pub extended: bool,
}

impl AdaptationField {
    /// True when nothing but the length byte would be needed.
    pub fn is_empty(&self) -> bool {
        !self.extended
            && !self.discontinuity
            && !self.random_access
            && self.pcr.is_none()
            && self.stuffing == 0
    }

    /// Pads the field so it occupies exactly `total` bytes.
    ///
    /// `total` must be at least the unpadded length.
    pub fn pad_to(&mut self, total: usize) {
        if total <= 1 && self.is_empty() {
            return;
        }
        self.extended = true;
        let fixed = 2 + if self.pcr.is_some() { 6 } else { 0 };
        self.stuffing = total.saturating_sub(fixed);
    }

    /// Bytes this field occupies including its length byte.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 1;
        }
        2 + if self.pcr.is_some() { 6 } else { 0 } + self.stuffing
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8((self.len() - 1) as u8);
        if self.is_empty() {
            return Ok(());
        }

        let mut flags = 0u8;
        if self.discontinuity {
            flags |= 0x80;
        }
        if self.random_access {
            flags |= 0x40;
        }
        if self.pcr.is_some() {
            flags |= 0x10;
        }
        buf.put_u8(flags);

        if let Some(pcr) = self.pcr {
            write_pcr(buf, pcr);
        }

        buf.put_bytes(0xff, self.stuffing);
        Ok(())
    }
}

/// Writes a 90kHz PCR base with a zero extension.
fn write_pcr(buf: &mut BytesMut, base: u64) {
    let base = base & 0x1_ffff_ffff;
    buf.put_u32((base >> 1) as u32);
    buf.put_u8((((base & 1) << 7) as u8) | 0x7e);
    buf.put_u8(0);
}

#[derive(Debug)]
pub struct TSHeader {
    pub sync_byte: u8, // Always 0x47
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub transport_priority: bool,
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_exists: bool,
    pub contains_payload: bool,
    pub continuity_counter: u8,
}

impl Default for TSHeader {
    fn default() -> Self {
        Self {
            sync_byte: TS_SYNC_BYTE,
            transport_error: false,
            payload_unit_start: false,
            transport_priority: false,
            pid: 0,
            scrambling_control: 0,
            adaptation_field_exists: false,
            contains_payload: true,
            continuity_counter: 0,
        }
    }
}

impl TSHeader {
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.sync_byte);

        let mut b1 = 0u8;
        if self.transport_error {
            b1 |= 0x80;
        }
        if self.payload_unit_start {
            b1 |= 0x40;
        }
        if self.transport_priority {
            b1 |= 0x20;
        }
        b1 |= ((self.pid >> 8) & 0x1f) as u8;
        buf.put_u8(b1);

        buf.put_u8((self.pid & 0xff) as u8);

        let mut b3 = self.scrambling_control << 6;
        if self.adaptation_field_exists {
            b3 |= 0x20;
        }
        if self.contains_payload {
            b3 |= 0x10;
        }
        b3 |= self.continuity_counter & 0x0f;
        buf.put_u8(b3);

        Ok(())
    }

    /// Reads the PID back out of a serialized packet.
    pub fn pid_of(packet: &[u8]) -> Option<u16> {
        if packet.len() < TS_HEADER_SIZE || packet[0] != TS_SYNC_BYTE {
            return None;
        }
        Some(((packet[1] as u16 & 0x1f) << 8) | packet[2] as u16)
    }
}

/// Decodes the 90kHz PCR base from a packet carrying one.
pub fn read_pcr(packet: &[u8]) -> Option<u64> {
    if packet.len() < 12 || packet[3] & 0x20 == 0 || packet[4] < 7 || packet[5] & 0x10 == 0 {
        return None;
    }
    let b = &packet[6..11];
    Some(
        (b[0] as u64) << 25
            | (b[1] as u64) << 17
            | (b[2] as u64) << 9
            | (b[3] as u64) << 1
            | (b[4] as u64) >> 7,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pat_section_has_valid_crc() {
        let crc = Crc32Mpeg2::new();
        let mut pat = PAT::new(1);
        pat.entries.push(PATEntry {
            program_number: 1,
            program_map_pid: PID_PMT,
        });
        let section = pat.to_section(&crc).unwrap();

        assert_eq!(section[0], TABLE_ID_PAT);
        let section_length = ((section[1] as usize & 0x0f) << 8) | section[2] as usize;
        assert_eq!(section.len(), 3 + section_length);
        // Running the CRC over a section including its CRC yields zero.
        assert_eq!(crc.calculate(&section), 0);
    }

    #[test]
    fn test_pmt_lists_streams() {
        let crc = Crc32Mpeg2::new();
        let mut pmt = PMT::new(1, 0x100);
        pmt.elementary_stream_infos.push(ElementaryStreamInfo {
            stream_type: STREAM_TYPE_H264,
            elementary_pid: 0x100,
            descriptors: Vec::new(),
        });
        let section = pmt.to_section(&crc).unwrap();
        assert_eq!(section[0], TABLE_ID_PMT);
        // Header (8) + pcr pid/info len (4) + one ES entry (5) + CRC (4)
        assert_eq!(section.len(), 8 + 4 + 5 + 4);
        assert_eq!(section[12], STREAM_TYPE_H264);
        assert_eq!(crc.calculate(&section), 0);
    }

    #[test]
    fn test_adaptation_field_pcr_roundtrip() {
        let mut buf = BytesMut::new();
        TSHeader {
            pid: 0x100,
            adaptation_field_exists: true,
            contains_payload: false,
            ..Default::default()
        }
        .write_to(&mut buf)
        .unwrap();
        let af = AdaptationField {
            pcr: Some(0x1_2345_6789),
            stuffing: TS_PAYLOAD_SIZE - 8,
            ..Default::default()
        };
        af.write_to(&mut buf).unwrap();

        assert_eq!(buf.len(), TS_PACKET_SIZE);
        assert_eq!(TSHeader::pid_of(&buf), Some(0x100));
        assert_eq!(read_pcr(&buf), Some(0x1_2345_6789));
    }

    #[test]
    fn test_empty_adaptation_field_is_one_byte() {
        let mut buf = BytesMut::new();
        AdaptationField::default().write_to(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0]);
    }

    #[test]
    fn test_pad_to_exact_lengths() {
        for total in 1..20 {
            let mut af = AdaptationField::default();
            af.pad_to(total);
            let mut buf = BytesMut::new();
            af.write_to(&mut buf).unwrap();
            assert_eq!(buf.len(), total);
        }

        let mut af = AdaptationField {
            pcr: Some(0),
            ..Default::default()
        };
        af.pad_to(30);
        assert_eq!(af.len(), 30);
    }
}
