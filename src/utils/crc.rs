//! CRC32 used by MPEG-2 PSI sections (ITU-T H.222.0 / ISO/IEC 13818-1).
//!
//! Polynomial 0x04C11DB7, initial value 0xFFFFFFFF, no reflection and no
//! final XOR. A section followed by its own CRC checksums to zero.

const CRC32_MPEG2: u32 = 0x04C11DB7;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if (crc & 0x80000000) != 0 {
                (crc << 1) ^ CRC32_MPEG2
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u32; 256] = build_table();

/// MPEG-2 CRC32 calculator for PSI tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Mpeg2;

impl Crc32Mpeg2 {
    /// Creates a calculator backed by the shared lookup table.
    pub fn new() -> Self {
        Self
    }

    /// Calculates the CRC32 checksum for `data`.
    ///
    /// ```
    /// use vdkmux::utils::Crc32Mpeg2;
    ///
    /// let crc = Crc32Mpeg2::new();
    /// assert_eq!(crc.calculate(&[0x01, 0x01]), 0xD66FB816);
    /// ```
    pub fn calculate(&self, data: &[u8]) -> u32 {
        data.iter().fold(0xFFFFFFFF, |crc, &byte| {
            let index = ((crc >> 24) ^ (byte as u32)) & 0xFF;
            (crc << 8) ^ TABLE[index as usize]
        })
    }

    /// Checks a section whose last four bytes are its CRC.
    pub fn verify(&self, section: &[u8]) -> bool {
        section.len() >= 4 && self.calculate(section) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_mpeg2_vector() {
        let crc = Crc32Mpeg2::new();
        assert_eq!(
            crc.calculate(&[0x01, 0x01]),
            0xD66FB816,
            "CRC32 MPEG-2 calculation failed for test vector [0x01, 0x01]"
        );
        assert_eq!(crc.calculate(&[]), 0xFFFFFFFF);
    }

    #[test]
    fn test_verify_section_with_trailing_crc() {
        let crc = Crc32Mpeg2::new();
        let mut section = vec![
            0x00, // Table ID (PAT)
            0xB0, 0x0D, // Section syntax indicator, section length
            0x00, 0x01, // Transport stream ID
            0xC1, // Version 0, current
            0x00, 0x00, // Section numbers
            0x00, 0x01, // Program number
            0xF0, 0x00, // Program map PID
        ];
        let value = crc.calculate(&section);
        section.extend_from_slice(&value.to_be_bytes());
        assert!(crc.verify(&section));

        section[9] ^= 1;
        assert!(!crc.verify(&section));
    }
}
