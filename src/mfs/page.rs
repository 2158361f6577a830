//! MFS pages
//!
//! The MFS partition is an array of 8K pages. Every page starts with a header
//! followed by a chunk index and the chunks themselves.
//!
//! | Kind        | Index                                  | Chunks      |
//! | ----------- | -------------------------------------- | ----------- |
//! | System      | 121 words, delta-XOR encoded chunk ids | up to 120   |
//! | Data        | 122 bytes, 0 = used, 0xff = free       | exactly 122 |
//! | To be erased| none, the page is kept verbatim        | none        |
//!
//! System pages have a first chunk id of 0. Exactly one page in a healthy
//! image has a zero signature, marking it as the next one to be erased.

use core::fmt::{self, Display};
use core::mem::size_of;

use log::debug;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use super::{
    Checksum, MfsError,
    chunk::{Chunk, RAW_CHUNK_SIZE},
    crc::{crc_idx, crc8},
};
use crate::EMPTY;

pub const PAGE_SIZE: usize = 0x2000;
pub const CHUNKS_PER_SYSTEM_PAGE: usize = 120;
pub const CHUNKS_PER_DATA_PAGE: usize = 122;

pub const PAGE_SIGNATURE: u32 = 0xaa55_7887;

// The index has one more slot than there are chunks, for the terminator.
const SYSTEM_INDEX_SLOTS: usize = CHUNKS_PER_SYSTEM_PAGE + 1;
const SYSTEM_INDEX_END: u16 = 0x7fff;
const SYSTEM_INDEX_EMPTY: u16 = 0xffff;

const DATA_CHUNK_USED: u8 = 0;
const DATA_CHUNK_FREE: u8 = EMPTY;

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct PageHeader {
    pub signature: u32,
    /// Update sequence number
    pub usn: u32,
    pub num_erase: u32,
    pub next_erase: u16,
    pub first_chunk: u16,
    pub crc: u8,
    pub zero: u8,
}

pub const PAGE_HEADER_SIZE: usize = size_of::<PageHeader>();
// The CRC covers everything up to the CRC itself.
const PAGE_HEADER_CRC_SPAN: usize = PAGE_HEADER_SIZE - 2;

const SYSTEM_CHUNKS_OFFSET: usize = PAGE_HEADER_SIZE + SYSTEM_INDEX_SLOTS * 2;
const DATA_CHUNKS_OFFSET: usize = PAGE_HEADER_SIZE + CHUNKS_PER_DATA_PAGE;

impl PageHeader {
    pub fn checksum(&self) -> u8 {
        crc8(&self.as_bytes()[..PAGE_HEADER_CRC_SPAN])
    }

    /// Serialize with a freshly computed CRC.
    fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut h = *self;
        h.crc = h.checksum();
        h.zero = 0;
        let mut raw = [0u8; PAGE_HEADER_SIZE];
        raw.copy_from_slice(h.as_bytes());
        raw
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SystemPage {
    pub index: usize,
    pub header: PageHeader,
    pub chunks: Vec<Chunk>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DataPage {
    pub index: usize,
    pub header: PageHeader,
    pub chunks: Vec<Option<Chunk>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErasedPage {
    pub index: usize,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum Page {
    System(SystemPage),
    Data(DataPage),
    ToBeErased(ErasedPage),
}

impl Page {
    pub fn decode(data: &[u8], index: usize) -> Result<Self, MfsError> {
        let Some(data) = data.get(..PAGE_SIZE) else {
            return Err(MfsError::Truncated {
                what: "page",
                size: data.len(),
            });
        };
        let Ok((header, _)) = PageHeader::read_from_prefix(data) else {
            return Err(MfsError::Truncated {
                what: "page header",
                size: data.len(),
            });
        };

        let signature = header.signature;
        if signature == 0 {
            debug!("page {index}: to be erased");
            return Ok(Page::ToBeErased(ErasedPage {
                index,
                data: data.to_vec(),
            }));
        }
        if signature != PAGE_SIGNATURE {
            return Err(MfsError::InvalidMagic {
                page: index,
                found: signature,
            });
        }
        let expected = header.checksum();
        if header.crc != expected {
            return Err(MfsError::ChecksumMismatch(Checksum::Page {
                index,
                expected,
                found: header.crc,
            }));
        }
        if header.zero != 0 {
            return Err(MfsError::InvalidPageHeader { page: index });
        }

        if header.first_chunk == 0 {
            Ok(Page::System(SystemPage::decode(data, index, header)?))
        } else {
            Ok(Page::Data(DataPage::decode(data, index, header)?))
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Page::System(p) => p.encode(),
            Page::Data(p) => p.encode(),
            Page::ToBeErased(p) => p.data.clone(),
        }
    }
}

impl SystemPage {
    fn decode(data: &[u8], index: usize, header: PageHeader) -> Result<Self, MfsError> {
        let words = &data[PAGE_HEADER_SIZE..SYSTEM_CHUNKS_OFFSET];
        let mut chunks = Vec::new();
        let mut last_id = 0;
        for (i, w) in words.chunks(2).take(CHUNKS_PER_SYSTEM_PAGE).enumerate() {
            let w = u16::from_le_bytes([w[0], w[1]]);
            if w == SYSTEM_INDEX_END || w == SYSTEM_INDEX_EMPTY {
                break;
            }
            last_id = crc_idx(last_id) ^ w;
            let o = SYSTEM_CHUNKS_OFFSET + i * RAW_CHUNK_SIZE;
            chunks.push(Chunk::decode(&data[o..o + RAW_CHUNK_SIZE], last_id)?);
        }
        let usn = header.usn;
        debug!("page {index}: system, USN {usn:08x}, {} chunks", chunks.len());
        Ok(Self {
            index,
            header,
            chunks,
        })
    }

    pub fn usn(&self) -> u32 {
        self.header.usn
    }

    /// Derive the chunk index from the chunks in their current order.
    fn encode_index(&self) -> Vec<u16> {
        let mut words = Vec::with_capacity(SYSTEM_INDEX_SLOTS);
        let mut last_id = 0;
        for c in &self.chunks {
            words.push(crc_idx(last_id) ^ c.id);
            last_id = c.id;
        }
        let n = self.chunks.len();
        // A full or empty page has no room for / need of an explicit end mark.
        if n == CHUNKS_PER_SYSTEM_PAGE || n == 0 {
            words.push(SYSTEM_INDEX_EMPTY);
        } else {
            words.push(SYSTEM_INDEX_END);
        }
        words.resize(SYSTEM_INDEX_SLOTS, SYSTEM_INDEX_EMPTY);
        words
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(PAGE_SIZE);
        data.extend_from_slice(&self.header.encode());
        for w in self.encode_index() {
            data.extend_from_slice(&w.to_le_bytes());
        }
        for c in &self.chunks {
            data.extend_from_slice(&c.encode());
        }
        data.resize(PAGE_SIZE, EMPTY);
        data
    }
}

impl DataPage {
    fn decode(data: &[u8], index: usize, header: PageHeader) -> Result<Self, MfsError> {
        let first = header.first_chunk;
        let map = &data[PAGE_HEADER_SIZE..DATA_CHUNKS_OFFSET];
        let chunks = map
            .iter()
            .enumerate()
            .map(|(i, used)| {
                if *used != DATA_CHUNK_USED {
                    return Ok(None);
                }
                let o = DATA_CHUNKS_OFFSET + i * RAW_CHUNK_SIZE;
                let id = first.wrapping_add(i as u16);
                Chunk::decode(&data[o..o + RAW_CHUNK_SIZE], id).map(Some)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let used = chunks.iter().flatten().count();
        debug!("page {index}: data, first chunk {first}, {used} chunks used");
        Ok(Self {
            index,
            header,
            chunks,
        })
    }

    pub fn first_chunk(&self) -> u16 {
        self.header.first_chunk
    }

    pub fn contains(&self, id: u16) -> bool {
        let first = self.first_chunk() as usize;
        let id = id as usize;
        id >= first && id < first + CHUNKS_PER_DATA_PAGE
    }

    pub fn chunk(&self, id: u16) -> Option<&Chunk> {
        if !self.contains(id) {
            return None;
        }
        self.chunks[(id - self.first_chunk()) as usize].as_ref()
    }

    /// Put a chunk into the slot its id maps to.
    pub fn set_chunk(&mut self, chunk: Chunk) -> Result<(), MfsError> {
        if !self.contains(chunk.id) {
            return Err(MfsError::ChunkOutOfPage {
                id: chunk.id,
                page: self.index,
            });
        }
        let slot = (chunk.id - self.first_chunk()) as usize;
        self.chunks[slot] = Some(chunk);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.chunks = vec![None; CHUNKS_PER_DATA_PAGE];
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(PAGE_SIZE);
        data.extend_from_slice(&self.header.encode());
        for c in &self.chunks {
            data.push(match c {
                Some(_) => DATA_CHUNK_USED,
                None => DATA_CHUNK_FREE,
            });
        }
        for c in &self.chunks {
            match c {
                Some(c) => data.extend_from_slice(&c.encode()),
                None => data.extend_from_slice(&[EMPTY; RAW_CHUNK_SIZE]),
            }
        }
        data
    }
}

impl Display for SystemPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<u16> = self.chunks.iter().map(|c| c.id).collect();
        ids.sort();
        let ids: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        let usn = self.usn();
        write!(f, "System-{} (USN: 0x{usn:X}): {}", self.index, ids.join(", "))
    }
}

impl Display for DataPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self.chunks.iter().flatten().count();
        let first = self.first_chunk();
        write!(f, "Data-{}: {first:X} ({used} used)", self.index)
    }
}

impl Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Page::ToBeErased(p) => write!(f, "ToBeErased-{}", p.index),
            Page::System(p) => write!(f, "{p}"),
            Page::Data(p) => write!(f, "{p}"),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_header(usn: u32, first_chunk: u16) -> PageHeader {
    PageHeader {
        signature: PAGE_SIGNATURE,
        usn,
        num_erase: 1,
        next_erase: 0,
        first_chunk,
        crc: 0,
        zero: 0,
    }
}

#[test]
fn layout_fills_page() {
    assert_eq!(PAGE_HEADER_SIZE, 18);
    assert_eq!(
        SYSTEM_CHUNKS_OFFSET + CHUNKS_PER_SYSTEM_PAGE * RAW_CHUNK_SIZE + 0xc,
        PAGE_SIZE
    );
    assert_eq!(
        DATA_CHUNKS_OFFSET + CHUNKS_PER_DATA_PAGE * RAW_CHUNK_SIZE,
        PAGE_SIZE
    );
}

#[test]
fn header_crc() {
    assert_eq!(test_header(5, 0).checksum(), 0xd4);
}

#[test]
fn system_page_decode_encoded() {
    // Ids in an arbitrary order exercise the delta-XOR index.
    let chunks: Vec<Chunk> = [3u16, 0, 17, 5]
        .iter()
        .map(|id| Chunk::new(*id, &[*id as u8 + 1; 64]))
        .collect();
    let page = SystemPage {
        index: 2,
        header: test_header(5, 0),
        chunks: chunks.clone(),
    };
    let raw = page.encode();
    assert_eq!(raw.len(), PAGE_SIZE);
    let word = |i: usize| {
        let o = PAGE_HEADER_SIZE + i * 2;
        u16::from_le_bytes([raw[o], raw[o + 1]])
    };
    assert_eq!(word(0), 0x0b5b ^ 3);
    assert_eq!(word(1), crc_idx(3));
    assert_eq!(word(2), crc_idx(0) ^ 17);
    assert_eq!(word(3), crc_idx(17) ^ 5);
    // After 4 chunks, the index is terminated.
    let o = PAGE_HEADER_SIZE + 4 * 2;
    assert_eq!(&raw[o..o + 4], &[0xff, 0x7f, 0xff, 0xff]);

    let Page::System(decoded) = Page::decode(&raw, 2).unwrap() else {
        panic!("expected a system page");
    };
    assert_eq!(decoded.chunks, chunks);
    assert_eq!(decoded.usn(), 5);
    assert_eq!(decoded.encode(), raw);
}

#[test]
fn empty_system_page() {
    let page = SystemPage {
        index: 0,
        header: test_header(1, 0),
        chunks: vec![],
    };
    let raw = page.encode();
    assert!(raw[PAGE_HEADER_SIZE..].iter().all(|b| *b == EMPTY));
    let Page::System(decoded) = Page::decode(&raw, 0).unwrap() else {
        panic!("expected a system page");
    };
    assert!(decoded.chunks.is_empty());
}

#[test]
fn full_system_page() {
    let chunks: Vec<Chunk> = (0..CHUNKS_PER_SYSTEM_PAGE as u16)
        .rev()
        .map(|id| Chunk::new(id, &id.to_le_bytes()))
        .collect();
    let page = SystemPage {
        index: 0,
        header: test_header(7, 0),
        chunks: chunks.clone(),
    };
    let raw = page.encode();
    assert_eq!(raw.len(), PAGE_SIZE);
    // No end mark, the last index slot stays empty.
    let o = PAGE_HEADER_SIZE + CHUNKS_PER_SYSTEM_PAGE * 2;
    assert_eq!(&raw[o..o + 2], &[0xff, 0xff]);
    assert_eq!(o + 2, SYSTEM_CHUNKS_OFFSET);
    let end = SYSTEM_CHUNKS_OFFSET + CHUNKS_PER_SYSTEM_PAGE * RAW_CHUNK_SIZE;
    assert!(raw[end..].iter().all(|b| *b == EMPTY));

    let Page::System(decoded) = Page::decode(&raw, 0).unwrap() else {
        panic!("expected a system page");
    };
    assert_eq!(decoded.chunks, chunks);
    assert_eq!(decoded.encode(), raw);
}

#[test]
fn data_page_decode_encoded() {
    let mut page = DataPage {
        index: 1,
        header: test_header(0, 0x100),
        chunks: vec![None; CHUNKS_PER_DATA_PAGE],
    };
    page.set_chunk(Chunk::new(0x100, b"first")).unwrap();
    page.set_chunk(Chunk::new(0x179, b"last")).unwrap();
    assert!(page.set_chunk(Chunk::new(0x17a, b"beyond")).is_err());
    assert!(page.set_chunk(Chunk::new(0xff, b"before")).is_err());

    let raw = page.encode();
    assert_eq!(raw.len(), PAGE_SIZE);
    assert_eq!(raw[PAGE_HEADER_SIZE], DATA_CHUNK_USED);
    assert_eq!(raw[PAGE_HEADER_SIZE + 1], DATA_CHUNK_FREE);

    let Page::Data(decoded) = Page::decode(&raw, 1).unwrap() else {
        panic!("expected a data page");
    };
    assert_eq!(decoded.chunk(0x100).unwrap().data[..5], *b"first");
    assert_eq!(decoded.chunk(0x179).unwrap().data[..4], *b"last");
    assert!(decoded.chunk(0x101).is_none());
    assert_eq!(decoded.encode(), raw);
}

#[test]
fn to_be_erased_page_is_kept_verbatim() {
    let mut raw = vec![0u8; PAGE_SIZE];
    raw[100] = 0x42;
    let page = Page::decode(&raw, 9).unwrap();
    assert!(matches!(page, Page::ToBeErased(_)));
    assert_eq!(page.encode(), raw);
}

#[test]
fn bad_page_header() {
    let page = SystemPage {
        index: 0,
        header: test_header(1, 0),
        chunks: vec![],
    };
    let mut raw = page.encode();
    raw[4] ^= 1;
    assert!(matches!(
        Page::decode(&raw, 0),
        Err(MfsError::ChecksumMismatch(Checksum::Page { index: 0, .. }))
    ));
    raw[0] = 0x42;
    assert!(matches!(
        Page::decode(&raw, 0),
        Err(MfsError::InvalidMagic { page: 0, .. })
    ));
}
