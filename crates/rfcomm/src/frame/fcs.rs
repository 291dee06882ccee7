//! Frame Check Sequence
//!
//! Reflected CRC-8 with generator x^8 + x^2 + x + 1 as defined by TS 07.10.

/// Value left in the register after running a valid FCS through the CRC
const FCS_GOOD: u8 = 0xCF;

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ 0xE0 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub(crate) static CRC_TABLE: [u8; 256] = build_table();

fn crc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0xFF, |crc, byte| CRC_TABLE[(crc ^ byte) as usize])
}

/// Compute the FCS octet over `data`
pub fn fcs(data: &[u8]) -> u8 {
    0xFF - crc(data)
}

/// Check a received FCS octet against the covered `data`
pub fn check_fcs(data: &[u8], fcs: u8) -> bool {
    CRC_TABLE[(crc(data) ^ fcs) as usize] == FCS_GOOD
}
