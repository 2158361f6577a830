use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use super::{Checksum, MfsError, crc::chunk_crc};

pub const CHUNK_SIZE: usize = 0x40;
pub const CHUNK_CRC_SIZE: usize = 2;
pub const RAW_CHUNK_SIZE: usize = CHUNK_SIZE + CHUNK_CRC_SIZE;

/// The atomic unit of storage: 64 bytes of payload, addressed by an id.
/// On flash, a chunk is followed by a CRC16 over its payload and id.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    pub id: u16,
    #[serde(with = "serde_bytes")]
    pub data: [u8; CHUNK_SIZE],
}

impl Chunk {
    /// Create a chunk from up to 64 bytes, padding with zeros.
    pub fn new(id: u16, payload: &[u8]) -> Self {
        let mut data = [0u8; CHUNK_SIZE];
        let l = payload.len().min(CHUNK_SIZE);
        data[..l].copy_from_slice(&payload[..l]);
        Self { id, data }
    }

    pub fn decode(raw: &[u8], id: u16) -> Result<Self, MfsError> {
        let Some((payload, crc)) = raw
            .get(..RAW_CHUNK_SIZE)
            .map(|r| r.split_at(CHUNK_SIZE))
        else {
            return Err(MfsError::Truncated {
                what: "chunk",
                size: raw.len(),
            });
        };
        let found = u16::from_le_bytes([crc[0], crc[1]]);
        let expected = chunk_crc(payload, id);
        if found != expected {
            return Err(MfsError::ChecksumMismatch(Checksum::Chunk {
                id,
                expected,
                found,
            }));
        }
        Ok(Self::new(id, payload))
    }

    pub fn crc(&self) -> u16 {
        chunk_crc(&self.data, self.id)
    }

    pub fn encode(&self) -> [u8; RAW_CHUNK_SIZE] {
        let mut raw = [0u8; RAW_CHUNK_SIZE];
        raw[..CHUNK_SIZE].copy_from_slice(&self.data);
        raw[CHUNK_SIZE..].copy_from_slice(&self.crc().to_le_bytes());
        raw
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

impl Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id;
        let crc = self.crc();
        write!(f, "chunk {id:5} (CRC {crc:04x})")
    }
}

#[test]
fn decode_encoded_chunk() {
    let payload: Vec<u8> = (0..64).collect();
    let c = Chunk::new(0x1234, &payload);
    let raw = c.encode();
    assert_eq!(Chunk::decode(&raw, 0x1234).unwrap(), c);
}

#[test]
fn bit_flip_is_detected() {
    let c = Chunk::new(300, b"some payload that is shorter than a chunk");
    let raw = c.encode();
    for byte in [0, 17, 63] {
        for bit in [0, 3, 7] {
            let mut corrupt = raw;
            corrupt[byte] ^= 1 << bit;
            assert!(matches!(
                Chunk::decode(&corrupt, 300),
                Err(MfsError::ChecksumMismatch(Checksum::Chunk { id: 300, .. }))
            ));
        }
    }
}

#[test]
fn wrong_id_is_detected() {
    let raw = Chunk::new(7, &[0xaa; 64]).encode();
    assert!(Chunk::decode(&raw, 8).is_err());
}

#[test]
fn short_payload_is_zero_padded() {
    let c = Chunk::new(1, &[1, 2]);
    assert_eq!(&c.data[..3], &[1, 2, 0]);
    assert!(!c.is_empty());
    assert!(Chunk::new(1, &[]).is_empty());
}
