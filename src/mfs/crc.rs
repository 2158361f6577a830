//! Checksums used by MFS
//!
//! - page headers carry a CRC-8 (poly 0x07) seeded with 1
//! - chunks carry a CRC16 (CCITT polynomial, seed 0xffff, not reflected)
//!   over their payload followed by their little-endian chunk id
//! - System page chunk indices are stored XOR'ed with a 14-bit CRC of the
//!   previous chunk id

// Plain CRC-8 (poly 0x07), but seeded with 1
const CRC8_MFS: crc::Algorithm<u8> = crc::Algorithm {
    width: 8,
    poly: 0x07,
    init: 0x01,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x8d,
    residue: 0x00,
};
const CRC8: crc::Crc<u8> = crc::Crc::<u8>::new(&CRC8_MFS);

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

// This is CRC-16/IBM-3740, a.k.a. CRC-16/CCITT-FALSE.
const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_3740);

#[cfg(test)]
fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC16 over a chunk payload and its id
pub fn chunk_crc(payload: &[u8], id: u16) -> u16 {
    let mut d = CRC16.digest();
    d.update(payload);
    d.update(&id.to_le_bytes());
    d.finalize()
}

const CRC16_POLY: u16 = 0x1021;

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u16) << 8;
        let mut j = 0;
        while j < 8 {
            r = if r & 0x8000 != 0 {
                (r << 1) ^ CRC16_POLY
            } else {
                r << 1
            };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = crc16_table();

const IDX_MASK: u16 = 0x3fff;

/// Fold a chunk id through the CRC16 table, truncated to 14 bits per step.
pub fn crc_idx(w: u16) -> u16 {
    w.to_le_bytes().iter().fold(IDX_MASK, |crc, b| {
        let i = (*b ^ (crc >> 8) as u8) as usize;
        (CRC16_TABLE[i] ^ (crc << 8)) & IDX_MASK
    })
}

#[test]
fn crc8_known_values() {
    assert_eq!(crc8(&[]), CRC8_MFS.init);
    assert_eq!(crc8(b"123456789"), CRC8_MFS.check);
    let d: Vec<u8> = (0..16).collect();
    assert_eq!(crc8(&d), 0x43);
    // Nibble tables as found in the ME firmware
    const LO: [u8; 16] = [0, 7, 14, 9, 28, 27, 18, 21, 56, 63, 54, 49, 36, 35, 42, 45];
    const HI: [u8; 16] = [
        0, 112, 224, 144, 199, 183, 39, 87, 137, 249, 105, 25, 78, 62, 174, 222,
    ];
    let nibbles = d.iter().fold(1u8, |csum, b| {
        let b = b ^ csum;
        LO[(b & 0xf) as usize] ^ HI[(b >> 4) as usize]
    });
    assert_eq!(nibbles, 0x43);
}

#[test]
fn crc16_check_value() {
    assert_eq!(crc16(b"123456789"), 0x29b1);
    // The table-driven variant must agree with the crc crate.
    let manual = b"123456789".iter().fold(0xffffu16, |crc, b| {
        CRC16_TABLE[(*b ^ (crc >> 8) as u8) as usize] ^ (crc << 8)
    });
    assert_eq!(manual, 0x29b1);
}

#[test]
fn chunk_crc_covers_id() {
    assert_eq!(chunk_crc(&[0u8; 64], 200), 0x4a4b);
    assert_ne!(chunk_crc(&[0u8; 64], 200), chunk_crc(&[0u8; 64], 201));
}

#[test]
fn crc_idx_known_values() {
    assert_eq!(crc_idx(0), 0x0b5b);
    assert_eq!(crc_idx(1), 0x386a);
    assert_eq!(crc_idx(0x1234), 0x38bd);
    assert_eq!(crc_idx(0x3fff), 0x0f18);
}
