//! Flash Partition Table (FPT)
//!
//! Knowledge herein is solely based on independent analysis efforts.
//! For references regarding data structures and logic,
//! see <https://github.com/peterbjornx/meimagetool> `...intelme/model/fpt/` (Java)
//! and <https://github.com/linuxboot/fiano/blob/main/pkg/intel/me/structures.go>
//! and <https://github.com/platomav/MEAnalyzer>.
//!
//! The table names the partitions within the ME region. Each entry carries an
//! offset relative to the start of the ME region, a length and flags. Entries
//! with any bit set in the top flags byte are not backed by flash and must not
//! be read or written.

use core::{
    fmt::{self, Display},
    mem::size_of,
    ops::Range,
};

use phf::phf_map;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Ref};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

const FPT_MAGIC: &str = "$FPT";
const FPT_MAGIC_BYTES: &[u8] = FPT_MAGIC.as_bytes();

pub const MFS_NAME: &str = "MFS";

const INVALID_FLAGS_MASK: u32 = 0xff00_0000;

/// Version of Flash Image Tool used to create the image
/// It is abbreviated FIT(C), though not clear what the C is for.
/// Note: This is NOT related to the Firmware Interface Table.
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct FitcVersion {
    pub major: u16,
    pub minor: u16,
    pub hotfix: u16,
    pub build: u16,
}

impl Display for FitcVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let FitcVersion {
            major,
            minor,
            hotfix,
            build,
        } = self;
        write!(f, "{major}.{minor}.{hotfix}.{build}")
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct FPTHeader {
    pub signature: [u8; 4],
    pub entries: u32,
    pub header_ver: u8,
    pub entry_ver: u8,
    pub header_len: u8,
    pub checksum: u8,
    pub ticks_to_add: u16,
    pub tokens_to_add: u16,
    pub uma_size_or_reserved: u32,
    pub flash_layout_or_flags: u32,
    pub fitc_ver: FitcVersion,
}

const FPT_HEADER_SIZE: usize = size_of::<FPTHeader>();

impl Display for FPTHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hv = format!("  Header version: {}", self.header_ver);
        let ev = format!("  Entry version:  {}", self.entry_ver);
        let en = format!("  Entries:        {}", self.entries);
        let cs = format!("  Checksum:       {:02x}", self.checksum);
        let fv = format!("  FITC version:   {}", self.fitc_ver);
        write!(f, "{hv}\n{ev}\n{en}\n{cs}\n{fv}")
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct FPTEntry {
    pub name: [u8; 4],
    pub owner: [u8; 4],
    pub offset: u32,
    pub size: u32,
    pub start_tokens: u32,
    pub max_tokens: u32,
    pub scratch_sectors: u32,
    pub flags: u32,
}

const FPT_ENTRY_SIZE: usize = size_of::<FPTEntry>();

impl FPTEntry {
    pub fn name(&self) -> String {
        match std::str::from_utf8(&self.name) {
            // some names are shorter than 4 bytes and padded with 0x0
            Ok(n) => n.trim_end_matches('\0').to_string(),
            Err(_) => format!("{:02x?}", &self.name),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags & INVALID_FLAGS_MASK == 0
    }

    pub fn range(&self) -> Range<usize> {
        let o = self.offset as usize;
        o..o + self.size as usize
    }
}

impl Display for FPTEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.offset as usize;
        let s = self.size as usize;
        let end = o + s;
        let fl = self.flags;
        let name = self.name();
        let (part_type, full_name) = get_part_info(&name);
        let part_info = format!("{part_type:?}: {full_name}");
        let name_offset_end_size = format!("{name:>4} @ 0x{o:08x}:0x{end:08x} (0x{s:08x})");
        let valid = if self.is_valid() { "" } else { " (invalid)" };

        write!(f, "{name_offset_end_size} {fl:08x}{valid}  {part_info}")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FptError {
    InvalidMagic,
    Truncated { what: &'static str, size: usize },
    ChecksumMismatch { sum: u8, found: u8 },
    UnknownPartition(String),
    InvalidPartitionFlags { name: String, flags: u32 },
    PartitionOutOfBounds { name: String, end: usize, size: usize },
    SizeMismatch { name: String, expected: usize, found: usize },
}

impl Display for FptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "no {FPT_MAGIC} magic found"),
            Self::Truncated { what, size } => {
                write!(f, "cannot parse {FPT_MAGIC} {what}, only got {size:08x} bytes")
            }
            Self::ChecksumMismatch { sum, found } => write!(
                f,
                "{FPT_MAGIC} header checksum mismatch: bytes sum up to {sum:02x} with checksum {found:02x}"
            ),
            Self::UnknownPartition(n) => write!(f, "unknown {FPT_MAGIC} entry {n}"),
            Self::InvalidPartitionFlags { name, flags } => {
                write!(f, "invalid {FPT_MAGIC} entry {name}, flags {flags:08x}")
            }
            Self::PartitionOutOfBounds { name, end, size } => {
                write!(f, "{FPT_MAGIC} entry {name} ends @ {end:08x}, only got {size:08x}")
            }
            Self::SizeMismatch {
                name,
                expected,
                found,
            } => write!(
                f,
                "wrong data length for {FPT_MAGIC} entry {name}: expected {expected:08x}, got {found:08x}"
            ),
        }
    }
}

impl std::error::Error for FptError {}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FPT {
    /// Offset of the `$FPT` magic within the ME region.
    pub offset: usize,
    #[serde(with = "serde_bytes")]
    pub pre_header: Vec<u8>,
    pub header: FPTHeader,
    pub entries: Vec<FPTEntry>,
}

const POSSIBLE_OFFSET: usize = 16;

// The FPT magic is either at the start or at a 16 bytes offset.
fn determine_offset(data: &[u8]) -> Option<usize> {
    let l = FPT_MAGIC_BYTES.len();
    [0, POSSIBLE_OFFSET]
        .into_iter()
        .find(|o| data.get(*o..*o + l) == Some(FPT_MAGIC_BYTES))
}

/// Sum of the bytes, modulo 256
fn byte_sum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl FPT {
    pub fn parse(data: &[u8]) -> Result<Self, FptError> {
        let size = data.len();
        let Some(offset) = determine_offset(data) else {
            return Err(FptError::InvalidMagic);
        };
        // Save for checksum recalculation
        let pre_header = &data[..offset];
        let d = &data[offset..];
        let Ok((header, slice)) = FPTHeader::read_from_prefix(d) else {
            return Err(FptError::Truncated {
                what: "header",
                size,
            });
        };

        // The declared header length spans everything before the entries,
        // including the pre-header if present, and must sum up to 0.
        let header_len = header.header_len as usize;
        let Some(checked) = data.get(..header_len) else {
            return Err(FptError::Truncated {
                what: "header",
                size,
            });
        };
        let sum = byte_sum(checked);
        if sum != 0 {
            return Err(FptError::ChecksumMismatch {
                sum,
                found: header.checksum,
            });
        }

        let count = header.entries as usize;
        let Ok((entries, _)) = Ref::<_, [FPTEntry]>::from_prefix_with_elems(slice, count) else {
            return Err(FptError::Truncated {
                what: "entries",
                size,
            });
        };

        Ok(Self {
            offset,
            pre_header: pre_header.to_vec(),
            header,
            entries: entries.to_vec(),
        })
    }

    /// Size of the table itself, from the start of the ME region.
    pub fn size(&self) -> usize {
        self.offset + FPT_HEADER_SIZE + self.entries.len() * FPT_ENTRY_SIZE
    }

    pub fn find(&self, name: &str) -> Option<&FPTEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// Look up an entry that is valid for reading and writing, and get its
    /// byte range, checked against the size of the ME region.
    pub fn entry_range(&self, name: &str, size: usize) -> Result<Range<usize>, FptError> {
        let Some(e) = self.find(name) else {
            return Err(FptError::UnknownPartition(name.to_string()));
        };
        if !e.is_valid() {
            return Err(FptError::InvalidPartitionFlags {
                name: name.to_string(),
                flags: e.flags,
            });
        }
        let r = e.range();
        if r.end > size {
            return Err(FptError::PartitionOutOfBounds {
                name: name.to_string(),
                end: r.end,
                size,
            });
        }
        Ok(r)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub enum PartitionType {
    Code,
    Data,
    None,
}

// see https://troopers.de/downloads/troopers17/TR17_ME11_Static.pdf
static PART_INFO: phf::Map<&'static str, (PartitionType, &'static str)> = phf_map! {
    "FTPR" => (PartitionType::Code, "Main code partition"),
    "FTUP" => (PartitionType::Code, "[NFTP]+[WCOD]+[LOCL]"),
    "DLMP" => (PartitionType::Code, "IDLM partition"),
    "MDMV" => (PartitionType::Code, "Media protection (PAVP, JOM)"),
    "PSVN" => (PartitionType::Data, "Secure Version Number"),
    "IVBP" => (PartitionType::Data, "IV + Bring Up cache"),
    "MFS" => (PartitionType::Data, "ME Flash File System"),
    "NFTP" => (PartitionType::Code, "Additional code"),
    "ROMB" => (PartitionType::Code, "ROM Bypass"),
    "WCOD" => (PartitionType::Code, "WLAN uCode"),
    "LOCL" => (PartitionType::Code, "AMT Localization"),
    "FLOG" => (PartitionType::Data, "Flash Log"),
    "UTOK" => (PartitionType::Data, "Debug Unlock Token"),
    "ISHC" => (PartitionType::Code, "Integrated Sensors Hub"),
    "AFSP" => (PartitionType::None, "8778 55aa signature like MFS"),
    "GLUT" => (PartitionType::Data, "Huffman Look-Up Table"),
    "EFFS" => (PartitionType::Data, "EFFS File System"),
};

pub fn get_part_info(n: &str) -> (PartitionType, &'static str) {
    match PART_INFO.get(n) {
        Some(info) => *info,
        None => (PartitionType::None, "[> UNKNOWN <]"),
    }
}

/// Build an ME region with a 16 byte pre-header and the given entries.
/// Each entry is (name, offset, size, flags).
#[cfg(test)]
pub(crate) fn test_region(size: usize, entries: &[(&str, u32, u32, u32)]) -> Vec<u8> {
    use zerocopy::IntoBytes;

    let mut d = vec![crate::EMPTY; size];
    d[..POSSIBLE_OFFSET].fill(0);
    let mut header = FPTHeader::read_from_bytes(&[0u8; FPT_HEADER_SIZE]).unwrap();
    header.signature.copy_from_slice(FPT_MAGIC_BYTES);
    header.entries = entries.len() as u32;
    header.header_ver = 0x20;
    header.entry_ver = 0x10;
    header.header_len = (POSSIBLE_OFFSET + FPT_HEADER_SIZE) as u8;
    let o = POSSIBLE_OFFSET;
    d[o..o + FPT_HEADER_SIZE].copy_from_slice(header.as_bytes());
    let checksum = 0u8.wrapping_sub(byte_sum(&d[..o + FPT_HEADER_SIZE]));
    d[o + 11] = checksum;

    for (i, (name, offset, size, flags)) in entries.iter().enumerate() {
        let mut e = FPTEntry::read_from_bytes(&[0u8; FPT_ENTRY_SIZE]).unwrap();
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        e.offset = *offset;
        e.size = *size;
        e.flags = *flags;
        let eo = o + FPT_HEADER_SIZE + i * FPT_ENTRY_SIZE;
        d[eo..eo + FPT_ENTRY_SIZE].copy_from_slice(e.as_bytes());
    }
    d
}

#[test]
fn parse_okay_fpt() {
    let data = test_region(0x2000, &[("FTPR", 0x1000, 0x800, 0), ("MFS", 0x1800, 0x800, 0)]);
    let fpt = FPT::parse(&data).unwrap();
    assert_eq!(fpt.offset, POSSIBLE_OFFSET);
    assert_eq!(fpt.header.entries as usize, fpt.entries.len());
    assert_eq!(fpt.entries[1].name(), MFS_NAME);
    assert_eq!(fpt.entry_range(MFS_NAME, data.len()).unwrap(), 0x1800..0x2000);
}

#[test]
fn parse_bad_magic() {
    let data = vec![0u8; 0x100];
    assert_eq!(FPT::parse(&data).unwrap_err(), FptError::InvalidMagic);
}

#[test]
fn parse_bad_checksum() {
    let mut data = test_region(0x1000, &[("MFS", 0x100, 0x100, 0)]);
    data[POSSIBLE_OFFSET + 11] ^= 0x01;
    assert!(matches!(
        FPT::parse(&data),
        Err(FptError::ChecksumMismatch { .. })
    ));
}

#[test]
fn parse_size_error() {
    let data = test_region(0x1000, &[("MFS", 0x100, 0x100, 0)]);
    let end = POSSIBLE_OFFSET + FPT_HEADER_SIZE + 4;
    assert!(matches!(
        FPT::parse(&data[..end]),
        Err(FptError::Truncated { what: "entries", .. })
    ));
}

#[test]
fn entry_lookup_errors() {
    let data = test_region(0x1000, &[("MFS", 0x100, 0x100, 0xff00_0000), ("FLOG", 0x800, 0x1000, 0)]);
    let fpt = FPT::parse(&data).unwrap();
    let size = data.len();
    assert!(matches!(
        fpt.entry_range(MFS_NAME, size),
        Err(FptError::InvalidPartitionFlags { .. })
    ));
    assert_eq!(
        fpt.entry_range("FTPR", size),
        Err(FptError::UnknownPartition("FTPR".to_string()))
    );
    assert!(matches!(
        fpt.entry_range("FLOG", size),
        Err(FptError::PartitionOutOfBounds { .. })
    ));
}
