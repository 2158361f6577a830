use core::fmt::{self, Display};
use core::mem::size_of;

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use super::{
    MfsError,
    chunk::{CHUNK_SIZE, Chunk},
};

/// Files with integrity protection carry this many trailing bytes
/// (a MAC and security version) that are not part of the content.
pub const INTEGRITY_BLOB_SIZE: usize = 52;

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FileNo {
    #[bits(12)]
    pub id: u16,
    #[bits(20)]
    pub flags: u32,
}

#[bitfield(u16)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct DirMode {
    #[bits(9)]
    pub permissions: u16,
    pub integrity: bool,
    #[bits(4)]
    _0: u8,
    pub directory: bool,
    _1: bool,
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct DirEntry {
    pub fileno: FileNo,
    pub mode: DirMode,
    pub uid: u16,
    pub gid: u16,
    pub salt: u16,
    pub name: [u8; 12],
}

pub const DIR_ENTRY_SIZE: usize = size_of::<DirEntry>();

impl DirEntry {
    pub fn id(&self) -> usize {
        self.fileno.id() as usize
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).to_string()
    }

    pub fn is_directory(&self) -> bool {
        self.mode.directory()
    }

    pub fn has_integrity(&self) -> bool {
        self.mode.integrity()
    }

    /// The `.` and `..` entries point back up the tree.
    pub fn is_relative(&self) -> bool {
        let n = self.name();
        n == "." || n == ".."
    }
}

impl Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id();
        let kind = if self.is_directory() { 'd' } else { '-' };
        let i = if self.has_integrity() { 'I' } else { '-' };
        let (uid, gid) = (self.uid, self.gid);
        let name = self.name();
        write!(f, "{id:4} {kind}{i} {uid:5}:{gid:<5} {name}")
    }
}

/// A file in the system volume: its chunk chain and the bytes it holds.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct MfsFile {
    pub id: usize,
    /// Absolute ids of the data chunks, in chain order
    pub chain: Vec<u16>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl MfsFile {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            chain: Vec::new(),
            data: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk_id: u16, payload: &[u8]) {
        self.chain.push(chunk_id);
        self.data.extend_from_slice(payload);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Chunks to store on data pages, the last one zero-padded.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.chain
            .iter()
            .zip(self.data.chunks(CHUNK_SIZE))
            .map(|(id, piece)| Chunk::new(*id, piece))
            .collect()
    }

    /// The visible content, i.e., without the integrity blob if present.
    pub fn content(&self, integrity: bool) -> &[u8] {
        if integrity {
            let l = self.data.len().saturating_sub(INTEGRITY_BLOB_SIZE);
            &self.data[..l]
        } else {
            &self.data
        }
    }

    /// Decode the content as a directory.
    pub fn dir_entries(&self, integrity: bool) -> Result<Vec<DirEntry>, MfsError> {
        let data = self.content(integrity);
        let size = data.len();
        if size % DIR_ENTRY_SIZE != 0 {
            return Err(MfsError::MalformedDirectory { file: self.id, size });
        }
        // Entries are copied out, the content may be arbitrarily aligned.
        data.chunks_exact(DIR_ENTRY_SIZE)
            .map(|d| {
                DirEntry::read_from_bytes(d)
                    .map_err(|_| MfsError::MalformedDirectory { file: self.id, size })
            })
            .collect()
    }
}

impl Display for MfsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id;
        let l = self.data.len();
        write!(f, "File {id} has {l} bytes (Chain: {:?})", self.chain)
    }
}

#[cfg(test)]
pub(crate) fn test_dir_entry(id: u16, name: &str, directory: bool, integrity: bool) -> Vec<u8> {
    use zerocopy::IntoBytes;

    let mut n = [0u8; 12];
    n[..name.len()].copy_from_slice(name.as_bytes());
    let e = DirEntry {
        fileno: FileNo::new().with_id(id).with_flags(0x12),
        mode: DirMode::new()
            .with_permissions(0o640)
            .with_integrity(integrity)
            .with_directory(directory),
        uid: 0,
        gid: 238,
        salt: 0x1234,
        name: n,
    };
    e.as_bytes().to_vec()
}

#[test]
fn dir_entry_layout() {
    assert_eq!(DIR_ENTRY_SIZE, 24);
    let raw = test_dir_entry(0x123, "mca", true, true);
    // file number, with flags above bit 12
    assert_eq!(&raw[..4], &[0x23, 0x21, 0x01, 0x00]);
    // mode: bit 14 directory, bit 9 integrity, rw-r-----
    assert_eq!(u16::from_le_bytes([raw[4], raw[5]]), 0x4000 | 0x0200 | 0o640);
    assert_eq!(&raw[12..16], b"mca\0");
}

#[test]
fn decode_directory() {
    let mut data = Vec::new();
    data.extend(test_dir_entry(8, ".", true, true));
    data.extend(test_dir_entry(8, "..", true, true));
    data.extend(test_dir_entry(42, "some_file", false, false));
    let mut f = MfsFile::new(8);
    f.push(300, &data[..CHUNK_SIZE]);
    f.push(301, &data[CHUNK_SIZE..]);

    let entries = f.dir_entries(false).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries[0].is_relative() && entries[1].is_relative());
    let e = &entries[2];
    assert_eq!(e.id(), 42);
    assert_eq!(e.name(), "some_file");
    assert!(!e.is_directory());
    assert!(!e.has_integrity());
}

#[test]
fn integrity_blob_is_stripped() {
    let mut data = test_dir_entry(9, "x", false, false);
    data.extend([0xaa; INTEGRITY_BLOB_SIZE]);
    let mut f = MfsFile::new(1);
    f.push(100, &data[..CHUNK_SIZE]);
    f.push(101, &data[CHUNK_SIZE..]);
    assert_eq!(f.content(true).len(), DIR_ENTRY_SIZE);
    assert_eq!(f.content(false).len(), DIR_ENTRY_SIZE + INTEGRITY_BLOB_SIZE);
    assert_eq!(f.dir_entries(true).unwrap().len(), 1);
    assert!(matches!(
        f.dir_entries(false),
        Err(MfsError::MalformedDirectory { file: 1, .. })
    ));
}

#[test]
fn chunks_are_padded() {
    let mut f = MfsFile::new(3);
    f.push(500, &[1; CHUNK_SIZE]);
    f.push(501, &[2; 2]);
    let chunks = f.chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].id, 501);
    assert_eq!(&chunks[1].data[..3], &[2, 2, 0]);
}
