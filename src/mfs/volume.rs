//! The system volume holds the MFS file table and the chunk allocation table.
//!
//! It is spread over the chunks of all system pages; each chunk is placed at
//! its id times 64 in a buffer spanning all ids below the first data chunk.
//!
//! | Offset        | Content                                      |
//! | ------------- | -------------------------------------------- |
//! | 0             | header: signature, version, capacity, files  |
//! | 14            | one 16 bit slot per file                     |
//! | 14 + 2 * n    | one 16 bit slot per data chunk               |
//!
//! A file slot either marks the file as absent, empty or reserved, or links
//! to the first data chunk of the file. A data chunk slot is free, links to
//! the next data chunk, or ends the chain with the byte count of its chunk.
//! Links are data chunk indices offset by the number of files.

use core::fmt::{self, Display};
use core::mem::size_of;
use std::collections::HashSet;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use super::{
    MfsError,
    chunk::{CHUNK_SIZE, Chunk},
    file::MfsFile,
    page::{CHUNKS_PER_DATA_PAGE, DataPage, SystemPage},
};

pub const VOLUME_SIGNATURE: u32 = 0x724f_6201;
pub const VOLUME_VERSION: u32 = 1;

const FILE_UNUSED: u16 = 0;
const FILE_EMPTY: u16 = 0xffff;
const FILE_RESERVED: u16 = 0xfffe;

const CHUNK_FREE: u16 = 0;

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct VolumeHeader {
    pub signature: u32,
    pub version: u32,
    /// Bytes available for file data
    pub capacity: u32,
    pub num_files: u16,
}

const VOLUME_HEADER_SIZE: usize = size_of::<VolumeHeader>();

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SystemVolume {
    pub header: VolumeHeader,
    /// Id of the first data chunk; everything below belongs to the volume.
    pub total_chunks: u16,
    pub file_ids: Vec<u16>,
    pub data_ids: Vec<u16>,
    files: Vec<Option<MfsFile>>,
}

fn read_words(data: &[u8], offset: usize, count: usize) -> Option<Vec<u16>> {
    let d = data.get(offset..offset + count * 2)?;
    Some(
        d.chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect(),
    )
}

impl SystemVolume {
    /// Assemble the volume from system page chunks and read all files from
    /// the data pages. Pages must be sorted, system pages by USN so that the
    /// latest copy of a chunk wins.
    pub fn build(sys_pages: &[SystemPage], data_pages: &[DataPage]) -> Result<Self, MfsError> {
        let Some(first) = data_pages.first() else {
            return Err(MfsError::NoDataPages);
        };
        let total_chunks = first.first_chunk();
        for (i, p) in data_pages.iter().enumerate() {
            let expected = total_chunks as usize + i * CHUNKS_PER_DATA_PAGE;
            let found = p.first_chunk() as usize;
            if found != expected {
                return Err(MfsError::InvalidVolume(format!(
                    "data page {} starts at chunk {found}, expected {expected}",
                    p.index
                )));
            }
        }
        let data_chunks = data_pages.len() * CHUNKS_PER_DATA_PAGE;
        if total_chunks as usize + data_chunks > u16::MAX as usize + 1 {
            return Err(MfsError::InvalidVolume(format!(
                "{data_chunks} data chunks starting at {total_chunks} exceed the chunk id space"
            )));
        }

        let mut data = vec![0u8; total_chunks as usize * CHUNK_SIZE];
        for p in sys_pages {
            for c in &p.chunks {
                if c.id >= total_chunks {
                    return Err(MfsError::InvalidVolume(format!(
                        "system chunk {} on page {} is beyond the volume ({total_chunks} chunks)",
                        c.id, p.index
                    )));
                }
                let o = c.id as usize * CHUNK_SIZE;
                data[o..o + CHUNK_SIZE].copy_from_slice(&c.data);
            }
        }

        let Ok((header, _)) = VolumeHeader::read_from_prefix(&data) else {
            return Err(MfsError::Truncated {
                what: "system volume header",
                size: data.len(),
            });
        };
        let signature = header.signature;
        if signature != VOLUME_SIGNATURE {
            return Err(MfsError::InvalidVolume(format!(
                "signature {signature:08x}, expected {VOLUME_SIGNATURE:08x}"
            )));
        }
        let version = header.version;
        if version != VOLUME_VERSION {
            return Err(MfsError::InvalidVolume(format!(
                "version {version}, expected {VOLUME_VERSION}"
            )));
        }
        // Links must be distinguishable from byte counts.
        let num_files = header.num_files as usize;
        if num_files <= CHUNK_SIZE {
            return Err(MfsError::InvalidVolume(format!(
                "{num_files} files, need more than {CHUNK_SIZE}"
            )));
        }

        let o = VOLUME_HEADER_SIZE;
        let file_ids = read_words(&data, o, num_files).ok_or(MfsError::Truncated {
            what: "file table",
            size: data.len(),
        })?;
        let o = o + num_files * 2;
        let data_ids = read_words(&data, o, data_chunks).ok_or(MfsError::Truncated {
            what: "chunk table",
            size: data.len(),
        })?;

        let mut vol = Self {
            header,
            total_chunks,
            file_ids,
            data_ids,
            files: vec![None; num_files],
        };

        // Each data chunk belongs to at most one file.
        let mut owners: Vec<Option<usize>> = vec![None; data_chunks];
        for id in 0..num_files {
            vol.files[id] = vol.read_file(id, data_pages, &mut owners)?;
        }
        let capacity = vol.header.capacity;
        debug!(
            "system volume: {num_files} file slots, {data_chunks} data chunks, capacity {capacity}"
        );
        Ok(vol)
    }

    fn read_file(
        &self,
        id: usize,
        data_pages: &[DataPage],
        owners: &mut [Option<usize>],
    ) -> Result<Option<MfsFile>, MfsError> {
        let mut link = match self.file_ids[id] {
            FILE_UNUSED | FILE_RESERVED => return Ok(None),
            FILE_EMPTY => return Ok(Some(MfsFile::new(id))),
            l => l,
        };
        let mut file = MfsFile::new(id);
        loop {
            let Some(idx) = self.link_to_index(link) else {
                return Err(MfsError::BrokenChain { file: id, link });
            };
            if owners[idx].is_some() {
                // Either a loop or a chunk shared with another file
                return Err(MfsError::BrokenChain { file: id, link });
            }
            owners[idx] = Some(id);

            let chunk_id = self.chunk_id(idx);
            let Some(chunk) = data_pages[idx / CHUNKS_PER_DATA_PAGE].chunk(chunk_id) else {
                return Err(MfsError::MissingChunk { file: id, chunk: chunk_id });
            };
            let next = self.data_ids[idx];
            if next == CHUNK_FREE {
                return Err(MfsError::BrokenChain { file: id, link });
            }
            if next as usize > CHUNK_SIZE {
                file.push(chunk_id, &chunk.data);
                link = next;
            } else {
                file.push(chunk_id, &chunk.data[..next as usize]);
                return Ok(Some(file));
            }
        }
    }

    pub fn num_files(&self) -> usize {
        self.file_ids.len()
    }

    fn link_to_index(&self, link: u16) -> Option<usize> {
        (link as usize)
            .checked_sub(self.num_files())
            .filter(|i| *i < self.data_ids.len())
    }

    fn index_to_link(&self, idx: usize) -> u16 {
        (idx + self.num_files()) as u16
    }

    /// Absolute chunk id of a data chunk index.
    pub fn chunk_id(&self, idx: usize) -> u16 {
        (self.total_chunks as usize + idx) as u16
    }

    pub fn get_file(&self, id: usize) -> Option<&MfsFile> {
        self.files.get(id).and_then(|f| f.as_ref())
    }

    pub fn files(&self) -> impl Iterator<Item = &MfsFile> {
        self.files.iter().flatten()
    }

    pub fn free_chunks(&self) -> usize {
        self.data_ids.iter().filter(|d| **d == CHUNK_FREE).count()
    }

    fn first_free(&self) -> Option<usize> {
        self.data_ids.iter().position(|d| *d == CHUNK_FREE)
    }

    fn last_free(&self) -> Option<usize> {
        self.data_ids.iter().rposition(|d| *d == CHUNK_FREE)
    }

    /// Remove a file and free all of its chunks.
    /// Returns false if there was no such file.
    pub fn remove_file(&mut self, id: usize) -> bool {
        let Some(slot) = self.files.get_mut(id) else {
            return false;
        };
        if slot.take().is_none() {
            return false;
        }
        let mut link = self.file_ids[id];
        self.file_ids[id] = FILE_UNUSED;
        if link == FILE_EMPTY {
            return true;
        }
        // The chain was checked on load and is maintained by add_file, so
        // it ends within as many steps as there are chunks.
        for _ in 0..self.data_ids.len() {
            if link as usize <= CHUNK_SIZE {
                break;
            }
            let Some(idx) = self.link_to_index(link) else {
                break;
            };
            link = self.data_ids[idx];
            self.data_ids[idx] = CHUNK_FREE;
        }
        info!("removed MFS file {id}");
        true
    }

    /// Add a file, allocating a chunk for every 64 bytes of data.
    ///
    /// With `optimize`, the lowest free chunks are taken, packing files
    /// together. Otherwise, the highest free chunks are taken, spreading a
    /// file across the data pages. If space runs out, the allocation table
    /// is left as it was.
    pub fn add_file(&mut self, id: usize, data: &[u8], optimize: bool) -> Result<(), MfsError> {
        if id >= self.num_files() {
            return Err(MfsError::InvalidFileId(id));
        }
        if self.file_ids[id] != FILE_UNUSED {
            return Err(MfsError::FileExists(id));
        }

        let mut file = MfsFile::new(id);
        let mut claimed: Vec<usize> = Vec::new();
        for piece in data.chunks(CHUNK_SIZE) {
            let free = if optimize {
                self.first_free()
            } else {
                self.last_free()
            };
            let Some(idx) = free else {
                for c in &claimed {
                    self.data_ids[*c] = CHUNK_FREE;
                }
                return Err(MfsError::OutOfSpace {
                    file: id,
                    needed: data.len().div_ceil(CHUNK_SIZE),
                    free: claimed.len(),
                });
            };
            if let Some(prev) = claimed.last() {
                self.data_ids[*prev] = self.index_to_link(idx);
            }
            // Terminal until the next piece links to its chunk
            self.data_ids[idx] = piece.len() as u16;
            claimed.push(idx);
            file.push(self.chunk_id(idx), piece);
        }

        self.file_ids[id] = match claimed.first() {
            Some(first) => self.index_to_link(*first),
            None => FILE_EMPTY,
        };
        let l = data.len();
        let n = claimed.len();
        info!("added MFS file {id}: {l} bytes in {n} chunks");
        self.files[id] = Some(file);
        Ok(())
    }

    /// Serialize header and tables, padded to whole chunks.
    pub fn generate(&self) -> Vec<u8> {
        let mut header = self.header;
        header.num_files = self.num_files() as u16;
        let mut data = header.as_bytes().to_vec();
        for w in self.file_ids.iter().chain(self.data_ids.iter()) {
            data.extend_from_slice(&w.to_le_bytes());
        }
        data.resize(data.len().next_multiple_of(CHUNK_SIZE), 0);
        data
    }

    /// Chunks to store on system pages; all-zero chunks are implied.
    pub fn generate_chunks(&self) -> Vec<Chunk> {
        self.generate()
            .chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(i, d)| Chunk::new(i as u16, d))
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// List a directory file and everything below it as (path, content).
    /// The directory itself comes first, named `prefix`.
    pub fn list_dir(
        &self,
        id: usize,
        integrity: bool,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, MfsError> {
        let Some(file) = self.get_file(id) else {
            return Err(MfsError::FileNotFound(id));
        };
        let mut res = vec![(prefix.to_string(), file.content(integrity).to_vec())];
        let mut visited = HashSet::from([id]);
        self.list_dir_recursive(file, integrity, prefix, &mut visited, &mut res)?;
        Ok(res)
    }

    fn list_dir_recursive(
        &self,
        dir: &MfsFile,
        integrity: bool,
        prefix: &str,
        visited: &mut HashSet<usize>,
        res: &mut Vec<(String, Vec<u8>)>,
    ) -> Result<(), MfsError> {
        for e in dir.dir_entries(integrity)? {
            if e.is_relative() {
                continue;
            }
            let path = format!("{prefix}/{}", e.name());
            let id = e.id();
            let Some(file) = self.get_file(id) else {
                return Err(MfsError::FileNotFound(id));
            };
            res.push((path.clone(), file.content(e.has_integrity()).to_vec()));
            if e.is_directory() {
                if !visited.insert(id) {
                    return Err(MfsError::MalformedDirectory {
                        file: id,
                        size: file.len(),
                    });
                }
                self.list_dir_recursive(file, e.has_integrity(), &path, visited, res)?;
            }
        }
        Ok(())
    }
}

impl Display for SystemVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.num_files();
        let free = self.free_chunks();
        let total = self.data_ids.len();
        writeln!(f, "Total of {n} file entries, {free}/{total} data chunks free")?;
        for file in self.files() {
            writeln!(f, "{}: {file}", file.id)?;
        }
        Ok(())
    }
}

/// An empty volume, as freshly formatted.
#[cfg(test)]
pub(crate) fn test_volume(num_files: usize, data_pages: usize) -> SystemVolume {
    let data_chunks = data_pages * CHUNKS_PER_DATA_PAGE;
    let table_size = VOLUME_HEADER_SIZE + (num_files + data_chunks) * 2;
    SystemVolume {
        header: VolumeHeader {
            signature: VOLUME_SIGNATURE,
            version: VOLUME_VERSION,
            capacity: (data_chunks * CHUNK_SIZE) as u32,
            num_files: num_files as u16,
        },
        total_chunks: table_size.div_ceil(CHUNK_SIZE) as u16,
        file_ids: vec![FILE_UNUSED; num_files],
        data_ids: vec![CHUNK_FREE; data_chunks],
        files: vec![None; num_files],
    }
}

#[cfg(test)]
fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 1) as u8).collect()
}

#[test]
fn add_file_links_chain() {
    let mut vol = test_volume(256, 1);
    let data = test_data(130);
    vol.add_file(6, &data, true).unwrap();

    assert_eq!(vol.file_ids[6], 256);
    assert_eq!(&vol.data_ids[..4], &[257, 258, 2, 0]);
    let f = vol.get_file(6).unwrap();
    let t = vol.total_chunks;
    assert_eq!(f.chain, vec![t, t + 1, t + 2]);
    assert_eq!(f.data, data);
}

#[test]
fn add_file_to_occupied_slot() {
    let mut vol = test_volume(256, 1);
    vol.add_file(6, b"one", true).unwrap();
    assert!(matches!(
        vol.add_file(6, b"two", true),
        Err(MfsError::FileExists(6))
    ));
    assert_eq!(vol.get_file(6).unwrap().data, b"one");
    assert!(matches!(
        vol.add_file(256, b"x", true),
        Err(MfsError::InvalidFileId(256))
    ));
}

#[test]
fn empty_file() {
    let mut vol = test_volume(256, 1);
    vol.add_file(9, &[], true).unwrap();
    assert_eq!(vol.file_ids[9], FILE_EMPTY);
    assert!(vol.get_file(9).unwrap().is_empty());
    assert_eq!(vol.free_chunks(), CHUNKS_PER_DATA_PAGE);
    assert!(vol.remove_file(9));
    assert_eq!(vol.file_ids[9], FILE_UNUSED);
}

#[test]
fn allocation_tie_break() {
    let data = test_data(130);
    let mut packed = test_volume(256, 1);
    let mut spread = test_volume(256, 1);
    packed.add_file(7, &data, true).unwrap();
    spread.add_file(7, &data, false).unwrap();

    let t = packed.total_chunks;
    assert_eq!(packed.get_file(7).unwrap().chain, vec![t, t + 1, t + 2]);
    assert_eq!(
        spread.get_file(7).unwrap().chain,
        vec![t + 121, t + 120, t + 119]
    );
    assert_eq!(spread.file_ids[7], 256 + 121);
    assert_eq!(spread.data_ids[121], 256 + 120);
    assert_eq!(spread.data_ids[120], 256 + 119);
    assert_eq!(spread.data_ids[119], 2);
    assert_eq!(spread.get_file(7).unwrap().data, data);
}

#[test]
fn out_of_space_rolls_back() {
    let mut vol = test_volume(256, 1);
    vol.add_file(1, &test_data(120 * CHUNK_SIZE), true).unwrap();
    vol.add_file(2, b"small", false).unwrap();
    let file_ids = vol.file_ids.clone();
    let data_ids = vol.data_ids.clone();

    let res = vol.add_file(3, &test_data(3 * CHUNK_SIZE), true);
    assert!(matches!(
        res,
        Err(MfsError::OutOfSpace {
            file: 3,
            needed: 3,
            free: 1
        })
    ));
    assert_eq!(vol.file_ids, file_ids);
    assert_eq!(vol.data_ids, data_ids);
    assert!(vol.get_file(3).is_none());
}

#[test]
fn remove_file_frees_chunks() {
    let mut vol = test_volume(256, 1);
    vol.add_file(1, &test_data(100), true).unwrap();
    vol.add_file(2, &test_data(200), true).unwrap();
    assert_eq!(vol.free_chunks(), CHUNKS_PER_DATA_PAGE - 6);

    assert!(vol.remove_file(1));
    assert_eq!(vol.free_chunks(), CHUNKS_PER_DATA_PAGE - 4);
    assert_eq!(&vol.data_ids[..2], &[0, 0]);
    assert!(!vol.remove_file(1));
    assert!(!vol.remove_file(1000));

    // The freed chunks are reused first.
    vol.add_file(1, &test_data(64), true).unwrap();
    assert_eq!(vol.get_file(1).unwrap().chain, vec![vol.total_chunks]);
    assert_eq!(vol.get_file(2).unwrap().data, test_data(200));
}

#[test]
fn generated_tables() {
    let mut vol = test_volume(256, 1);
    vol.add_file(6, &test_data(130), true).unwrap();
    let data = vol.generate();
    assert_eq!(data.len() % CHUNK_SIZE, 0);
    assert_eq!(data.len(), vol.total_chunks as usize * CHUNK_SIZE);
    assert_eq!(&data[..4], &VOLUME_SIGNATURE.to_le_bytes());
    assert_eq!(&data[12..14], &256u16.to_le_bytes());
    let o = VOLUME_HEADER_SIZE + 6 * 2;
    assert_eq!(&data[o..o + 2], &256u16.to_le_bytes());

    let chunks = vol.generate_chunks();
    // Only the header with the file slot and the head of the chunk table
    assert!(chunks.iter().all(|c| !c.is_empty()));
    assert_eq!(chunks[0].id, 0);
    let ids: Vec<u16> = chunks.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![0, 8]);
}

#[test]
fn list_dir_strips_integrity() {
    use super::file::{INTEGRITY_BLOB_SIZE, test_dir_entry};

    let mut vol = test_volume(256, 2);
    let blob = [0x5a; INTEGRITY_BLOB_SIZE];

    let mut root = Vec::new();
    root.extend(test_dir_entry(8, ".", true, true));
    root.extend(test_dir_entry(8, "..", true, true));
    root.extend(test_dir_entry(10, "a", false, true));
    root.extend(test_dir_entry(11, "sub", true, false));
    root.extend(blob);
    vol.add_file(8, &root, true).unwrap();

    let mut a = b"content of a".to_vec();
    a.extend(blob);
    vol.add_file(10, &a, true).unwrap();

    let mut sub = Vec::new();
    sub.extend(test_dir_entry(11, ".", true, false));
    sub.extend(test_dir_entry(8, "..", true, true));
    sub.extend(test_dir_entry(12, "b", false, false));
    vol.add_file(11, &sub, false).unwrap();
    vol.add_file(12, b"b", false).unwrap();

    let list = vol.list_dir(8, true, "/home").unwrap();
    let paths: Vec<&str> = list.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["/home", "/home/a", "/home/sub", "/home/sub/b"]);
    assert_eq!(list[0].1.len(), 4 * 24);
    assert_eq!(list[1].1, b"content of a");
    assert_eq!(list[2].1, sub);
    assert_eq!(list[3].1, b"b");

    assert!(matches!(
        vol.list_dir(99, true, "/x"),
        Err(MfsError::FileNotFound(99))
    ));
}

#[test]
fn list_dir_detects_loops() {
    use super::file::test_dir_entry;

    let mut vol = test_volume(256, 1);
    let mut d = Vec::new();
    d.extend(test_dir_entry(9, "self", true, false));
    vol.add_file(9, &d, true).unwrap();
    assert!(matches!(
        vol.list_dir(9, false, "/loop"),
        Err(MfsError::MalformedDirectory { file: 9, .. })
    ));
}
