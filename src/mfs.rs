//! ME Flash File System (MFS)
//!
//! Knowledge herein is based on MFSUtil by Youness Alaoui and on
//! <https://www.blackhat.com/docs/eu-17/materials/eu-17-Sklyarov-Intel-ME-Flash-File-System-Explained.pdf>.
//!
//! The MFS partition is a sequence of 8K pages, see [page]. System pages hold
//! the [volume::SystemVolume], data pages hold the file contents in 64 byte
//! [chunk::Chunk]s. One page is kept blank for wear leveling.

use core::fmt::{self, Display};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub mod chunk;
pub mod crc;
pub mod file;
pub mod page;
pub mod volume;

use chunk::Chunk;
use page::{CHUNKS_PER_DATA_PAGE, CHUNKS_PER_SYSTEM_PAGE, DataPage, ErasedPage, PAGE_SIZE, Page, SystemPage};
use volume::SystemVolume;

/// Default configuration, `intel.cfg`
pub const INTEL_IDX: usize = 6;
/// Vendor configuration, `fitc.cfg`
pub const FITC_IDX: usize = 7;
/// Runtime data, the `/home` directory
pub const HOME_IDX: usize = 8;

// One in twelve pages is a system page.
const PAGES_PER_SYSTEM_PAGE: usize = 12;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Checksum {
    Page { index: usize, expected: u8, found: u8 },
    Chunk { id: u16, expected: u16, found: u16 },
}

impl Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page {
                index,
                expected,
                found,
            } => write!(
                f,
                "page {index} header CRC: expected {expected:02x}, got {found:02x}"
            ),
            Self::Chunk {
                id,
                expected,
                found,
            } => write!(f, "chunk {id} CRC: expected {expected:04x}, got {found:04x}"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MfsError {
    InvalidSize(usize),
    Truncated { what: &'static str, size: usize },
    InvalidMagic { page: usize, found: u32 },
    InvalidPageHeader { page: usize },
    ChecksumMismatch(Checksum),
    MultipleToBeErased { first: usize, second: usize },
    NoDataPages,
    InvalidVolume(String),
    SystemVolumeTooLarge { chunks: usize, capacity: usize },
    ChunkOutOfPage { id: u16, page: usize },
    BrokenChain { file: usize, link: u16 },
    MissingChunk { file: usize, chunk: u16 },
    FileExists(usize),
    FileNotFound(usize),
    InvalidFileId(usize),
    OutOfSpace { file: usize, needed: usize, free: usize },
    MalformedDirectory { file: usize, size: usize },
}

impl Display for MfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize(s) => {
                write!(f, "MFS size {s:08x} is not a multiple of the page size {PAGE_SIZE:04x}")
            }
            Self::Truncated { what, size } => {
                write!(f, "cannot parse MFS {what}, only got {size:08x} bytes")
            }
            Self::InvalidMagic { page, found } => {
                write!(f, "MFS page {page} has an invalid signature {found:08x}")
            }
            Self::InvalidPageHeader { page } => {
                write!(f, "MFS page {page} header has reserved bits set")
            }
            Self::ChecksumMismatch(c) => write!(f, "MFS checksum mismatch: {c}"),
            Self::MultipleToBeErased { first, second } => {
                write!(f, "MFS pages {first} and {second} are both marked to be erased")
            }
            Self::NoDataPages => write!(f, "MFS has no data pages"),
            Self::InvalidVolume(r) => write!(f, "invalid MFS system volume: {r}"),
            Self::SystemVolumeTooLarge { chunks, capacity } => write!(
                f,
                "MFS system volume needs {chunks} chunks, system pages hold {capacity}"
            ),
            Self::ChunkOutOfPage { id, page } => {
                write!(f, "MFS chunk {id} does not belong to page {page}")
            }
            Self::BrokenChain { file, link } => {
                write!(f, "MFS file {file} has a broken chunk chain at link {link:04x}")
            }
            Self::MissingChunk { file, chunk } => {
                write!(f, "MFS file {file} refers to chunk {chunk}, which is not used")
            }
            Self::FileExists(id) => write!(f, "MFS file {id} already exists"),
            Self::FileNotFound(id) => write!(f, "MFS file {id} not found"),
            Self::InvalidFileId(id) => write!(f, "MFS file id {id} is out of range"),
            Self::OutOfSpace { file, needed, free } => write!(
                f,
                "no space for MFS file {file}: needs {needed} chunks, {free} free"
            ),
            Self::MalformedDirectory { file, size } => {
                write!(f, "MFS file {file} ({size} bytes) is not a valid directory")
            }
        }
    }
}

impl std::error::Error for MfsError {}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Mfs {
    pub sys_pages: Vec<SystemPage>,
    pub data_pages: Vec<DataPage>,
    pub to_be_erased: Option<ErasedPage>,
    pub volume: SystemVolume,
}

impl Mfs {
    pub fn parse(data: &[u8]) -> Result<Self, MfsError> {
        let size = data.len();
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(MfsError::InvalidSize(size));
        }

        let mut sys_pages = Vec::new();
        let mut data_pages = Vec::new();
        let mut to_be_erased: Option<ErasedPage> = None;
        for (i, d) in data.chunks(PAGE_SIZE).enumerate() {
            match Page::decode(d, i)? {
                Page::System(p) => sys_pages.push(p),
                Page::Data(p) => data_pages.push(p),
                Page::ToBeErased(p) => {
                    if let Some(first) = &to_be_erased {
                        return Err(MfsError::MultipleToBeErased {
                            first: first.index,
                            second: i,
                        });
                    }
                    to_be_erased = Some(p);
                }
            }
        }

        let num_pages = size / PAGE_SIZE;
        let expected = num_pages / PAGES_PER_SYSTEM_PAGE;
        if sys_pages.len() != expected {
            warn!(
                "MFS: {} system pages out of {num_pages}, expected {expected}",
                sys_pages.len()
            );
        }
        if to_be_erased.is_none() {
            warn!("MFS: no page marked to be erased");
        }

        // Stable, so that equal keys keep their on-flash order.
        sys_pages.sort_by_key(|p| p.usn());
        data_pages.sort_by_key(|p| p.first_chunk());

        let volume = SystemVolume::build(&sys_pages, &data_pages)?;
        debug!(
            "MFS: {} system pages, {} data pages",
            sys_pages.len(),
            data_pages.len()
        );
        Ok(Self {
            sys_pages,
            data_pages,
            to_be_erased,
            volume,
        })
    }

    pub fn system_volume(&self) -> &SystemVolume {
        &self.volume
    }

    pub fn system_volume_mut(&mut self) -> &mut SystemVolume {
        &mut self.volume
    }

    pub fn size(&self) -> usize {
        let n = self.sys_pages.len() + self.data_pages.len() + self.to_be_erased.iter().count();
        n * PAGE_SIZE
    }

    /// Redistribute the current system volume and files over the pages and
    /// serialize them: system pages, data pages, then the page to be erased.
    pub fn generate(&mut self) -> Result<Vec<u8>, MfsError> {
        let sys_chunks = self.volume.generate_chunks();
        let capacity = self.sys_pages.len() * CHUNKS_PER_SYSTEM_PAGE;
        if sys_chunks.len() > capacity {
            return Err(MfsError::SystemVolumeTooLarge {
                chunks: sys_chunks.len(),
                capacity,
            });
        }
        let mut pieces = sys_chunks.chunks(CHUNKS_PER_SYSTEM_PAGE);
        for p in &mut self.sys_pages {
            p.chunks = pieces.next().map(<[Chunk]>::to_vec).unwrap_or_default();
        }

        for p in &mut self.data_pages {
            p.clear();
        }
        let total = self.volume.total_chunks;
        for f in self.volume.files() {
            for c in f.chunks() {
                let idx = (c.id.wrapping_sub(total)) as usize / CHUNKS_PER_DATA_PAGE;
                let Some(p) = self.data_pages.get_mut(idx) else {
                    return Err(MfsError::ChunkOutOfPage { id: c.id, page: idx });
                };
                p.set_chunk(c)?;
            }
        }

        let mut data = Vec::with_capacity(self.size());
        for p in &self.sys_pages {
            data.extend(p.encode());
        }
        for p in &self.data_pages {
            data.extend(p.encode());
        }
        if let Some(p) = &self.to_be_erased {
            data.extend_from_slice(&p.data);
        }
        Ok(data)
    }
}

impl Display for Mfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.sys_pages.len();
        let d = self.data_pages.len();
        let n = self.size() / PAGE_SIZE;
        writeln!(f, "Pages: {n} ({s} System, {d} Data)")?;
        writeln!(f, "System Pages:")?;
        for (i, p) in self.sys_pages.iter().enumerate() {
            writeln!(f, "  {i}: {p}")?;
        }
        writeln!(f, "Data Pages:")?;
        for (i, p) in self.data_pages.iter().enumerate() {
            writeln!(f, "  {i}: {p}")?;
        }
        if let Some(p) = &self.to_be_erased {
            writeln!(f, "To be erased: page {}", p.index)?;
        }
        writeln!(f)?;
        write!(f, "System Volume:\n{}", self.volume)
    }
}

/// Lay out a volume on the given number of system pages followed by enough
/// data pages, optionally with a blank page at the end.
#[cfg(test)]
fn test_layout(volume: SystemVolume, sys_pages: usize, to_be_erased: bool) -> Mfs {
    use page::test_header;

    let total = volume.total_chunks;
    let data_pages = volume.data_ids.len() / CHUNKS_PER_DATA_PAGE;
    Mfs {
        sys_pages: (0..sys_pages)
            .map(|i| SystemPage {
                index: i,
                header: test_header(i as u32 + 1, 0),
                chunks: vec![],
            })
            .collect(),
        data_pages: (0..data_pages)
            .map(|i| DataPage {
                index: sys_pages + i,
                header: test_header(0, total + (i * CHUNKS_PER_DATA_PAGE) as u16),
                chunks: vec![None; CHUNKS_PER_DATA_PAGE],
            })
            .collect(),
        to_be_erased: to_be_erased.then(|| ErasedPage {
            index: sys_pages + data_pages,
            data: vec![0u8; PAGE_SIZE],
        }),
        volume,
    }
}

/// Encode a volume laid out on a single system page.
#[cfg(test)]
pub(crate) fn test_image(volume: SystemVolume, to_be_erased: bool) -> Vec<u8> {
    test_layout(volume, 1, to_be_erased).generate().unwrap()
}

#[test]
fn three_chunk_file() {
    let mut vol = volume::test_volume(256, 1);
    let data: Vec<u8> = (0..130).map(|i| i as u8).collect();
    vol.add_file(INTEL_IDX, &data, true).unwrap();
    let image = test_image(vol, false);
    assert_eq!(image.len(), 2 * PAGE_SIZE);

    let mut mfs = Mfs::parse(&image).unwrap();
    let f = mfs.system_volume().get_file(INTEL_IDX).unwrap();
    let t = mfs.volume.total_chunks;
    assert_eq!(f.len(), 130);
    assert_eq!(f.chain, vec![t, t + 1, t + 2]);
    assert_eq!(f.data, data);
    assert_eq!(mfs.volume.files().count(), 1);

    assert_eq!(mfs.generate().unwrap(), image);
}

#[test]
fn modify_and_regenerate() {
    let mut vol = volume::test_volume(256, 2);
    vol.add_file(INTEL_IDX, &[0x11; 300], true).unwrap();
    vol.add_file(HOME_IDX, &[0x22; 64], true).unwrap();
    let image = test_image(vol, true);
    assert_eq!(image.len(), 4 * PAGE_SIZE);

    let mut mfs = Mfs::parse(&image).unwrap();
    assert!(mfs.to_be_erased.is_some());
    let sv = mfs.system_volume_mut();
    assert!(sv.remove_file(HOME_IDX));
    sv.add_file(FITC_IDX, &[0x33; 200], false).unwrap();
    let modified = mfs.generate().unwrap();
    assert_eq!(modified.len(), image.len());
    // The blank page stays last.
    assert!(modified[3 * PAGE_SIZE..].iter().all(|b| *b == 0));

    let mfs = Mfs::parse(&modified).unwrap();
    let sv = mfs.system_volume();
    assert!(sv.get_file(HOME_IDX).is_none());
    assert_eq!(sv.get_file(INTEL_IDX).unwrap().data, vec![0x11; 300]);
    let fitc = sv.get_file(FITC_IDX).unwrap();
    assert_eq!(fitc.data, vec![0x33; 200]);
    // Taken from the end of the second data page
    let last = sv.total_chunks + (2 * CHUNKS_PER_DATA_PAGE - 1) as u16;
    assert_eq!(fitc.chain, vec![last, last - 1, last - 2, last - 3]);
}

#[test]
fn latest_system_page_wins() {
    use zerocopy::FromBytes;

    let mut old = volume::test_volume(256, 1);
    old.add_file(INTEL_IDX, b"old", true).unwrap();
    let mut new = old.clone();
    assert!(new.remove_file(INTEL_IDX));
    new.add_file(INTEL_IDX, b"new", true).unwrap();

    let old_image = test_image(old, false);
    let new_image = test_image(new, false);
    // The newer copy of the system page comes first on flash.
    let mut image = new_image[..PAGE_SIZE].to_vec();
    image[4] = 2;
    image[16] = page::PageHeader::read_from_prefix(&image)
        .map(|(h, _)| h.checksum())
        .unwrap();
    image.extend(&old_image[..PAGE_SIZE]);
    image.extend(&new_image[PAGE_SIZE..]);

    let mfs = Mfs::parse(&image).unwrap();
    assert_eq!(mfs.sys_pages[1].usn(), 2);
    assert_eq!(mfs.system_volume().get_file(INTEL_IDX).unwrap().data, b"new");
}

#[test]
fn parse_errors() {
    assert_eq!(Mfs::parse(&[0u8; 100]).unwrap_err(), MfsError::InvalidSize(100));
    let two_blank = vec![0u8; 2 * PAGE_SIZE];
    assert_eq!(
        Mfs::parse(&two_blank).unwrap_err(),
        MfsError::MultipleToBeErased {
            first: 0,
            second: 1
        }
    );

    let mut vol = volume::test_volume(256, 1);
    vol.add_file(INTEL_IDX, &[0x42; 100], true).unwrap();
    let mut image = test_image(vol, false);
    // Flip a bit in the first data chunk
    image[PAGE_SIZE + 18 + 122] ^= 0x80;
    assert!(matches!(
        Mfs::parse(&image),
        Err(MfsError::ChecksumMismatch(Checksum::Chunk { .. }))
    ));
}

#[test]
fn system_volume_spans_pages() {
    let data_pages = 60;
    let mut vol = volume::test_volume(256, data_pages);
    // Every data chunk in use makes nearly every chunk of the table non-zero.
    let size = data_pages * CHUNKS_PER_DATA_PAGE * chunk::CHUNK_SIZE - 10;
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    vol.add_file(INTEL_IDX, &data, false).unwrap();
    assert_eq!(vol.free_chunks(), 0);
    let sys_chunks = vol.generate_chunks().len();
    assert!(sys_chunks > CHUNKS_PER_SYSTEM_PAGE);
    assert!(sys_chunks <= 2 * CHUNKS_PER_SYSTEM_PAGE);

    let mut single = test_layout(vol.clone(), 1, false);
    assert_eq!(
        single.generate().unwrap_err(),
        MfsError::SystemVolumeTooLarge {
            chunks: sys_chunks,
            capacity: CHUNKS_PER_SYSTEM_PAGE
        }
    );

    let image = test_layout(vol, 3, true).generate().unwrap();
    assert_eq!(image.len(), (3 + data_pages + 1) * PAGE_SIZE);

    let mut mfs = Mfs::parse(&image).unwrap();
    let counts: Vec<usize> = mfs.sys_pages.iter().map(|p| p.chunks.len()).collect();
    assert_eq!(
        counts,
        vec![CHUNKS_PER_SYSTEM_PAGE, sys_chunks - CHUNKS_PER_SYSTEM_PAGE, 0]
    );
    let f = mfs.system_volume().get_file(INTEL_IDX).unwrap();
    assert_eq!(f.data, data);
    assert_eq!(mfs.generate().unwrap(), image);
}
