//! Intel Flash Descriptor (IFD)
//!
//! For reference, see the ICH8 and 100/600 series PCH datasheets
//! and coreboot `util/ifdtool/`.
//!
//! Only the parts needed to locate a region are decoded here: the signature,
//! the first descriptor map word (FLMAP0) carrying the region base address
//! (FRBA), and the flash region registers (FLREGn) that FRBA points to.
//! NOTE: FRBA is a compact value and really means bits 4..11 of the address.
//!
//! | FLREG | Region                          |
//! | ----- | ------------------------------- |
//! | 0     | Flash descriptor (IFD)          |
//! | 1     | BIOS (host) firmware            |
//! | 2     | (CS)ME firmware                 |
//! | 3     | Gigabit ethernet data           |
//! | 4     | Platform data                   |
//! | 8     | Embedded controller (EC)        |

// We retain the all-uppercase acronyms in the struct definitions.
#![allow(non_snake_case)]

use core::fmt::{self, Display};
use core::ops::Range;

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use strum::{Display as StrDisplay, EnumIter, IntoEnumIterator};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

// NOTE: This is the LE representation.
const MAGIC: u32 = 0x0ff0_a55a;
const OFFSET: usize = 16;

// Registers 0..=9; EC is the highest one we care about.
const REGION_COUNT: usize = 10;

// Region base and limit are in 4K units.
const REGION_SHIFT: usize = 12;
const UNUSED_BASE: u16 = 0x7fff;
const UNUSED_LIMIT: u16 = 0;

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FLMAP0 {
    FCBA: u8,
    #[bits(2)]
    NC: u8,
    #[bits(6)]
    _0: u8,
    FRBA: u8,
    #[bits(3)]
    NR: u8,
    #[bits(5)]
    _1: u8,
}

impl FLMAP0 {
    fn frba(self) -> usize {
        (self.FRBA() as usize) << 4
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct Header {
    magic: u32,
    flmap0: FLMAP0,
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FlashRegion {
    #[bits(15)]
    base: u16,
    #[bits(1)]
    _0: u8,
    #[bits(15)]
    limit: u16,
    #[bits(1)]
    _1: u8,
}

impl FlashRegion {
    pub fn is_unused(self) -> bool {
        self.base() == UNUSED_BASE && self.limit() == UNUSED_LIMIT
    }

    fn ba(self) -> usize {
        (self.base() as usize) << REGION_SHIFT
    }

    fn la(self) -> usize {
        ((self.limit() as usize) << REGION_SHIFT) | 0xfff
    }

    /// Byte range covered by the region; the limit is inclusive on flash.
    pub fn range(self) -> Range<usize> {
        self.ba()..self.la() + 1
    }
}

impl Display for FlashRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unused() {
            return write!(f, "(unused)");
        }
        let b = self.ba();
        let l = self.la();
        write!(f, "{b:08x} - {l:08x}")
    }
}

#[derive(StrDisplay, EnumIter, Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum Region {
    #[strum(serialize = "IFD")]
    Descriptor,
    #[strum(serialize = "BIOS")]
    Bios,
    #[strum(serialize = "ME")]
    Me,
    #[strum(serialize = "GbE")]
    Gbe,
    #[strum(serialize = "PD")]
    PlatformData,
    #[strum(serialize = "EC")]
    EmbeddedController,
}

impl Region {
    /// Index of the FLREG register describing this region.
    pub const fn register(self) -> usize {
        match self {
            Self::Descriptor => 0,
            Self::Bios => 1,
            Self::Me => 2,
            Self::Gbe => 3,
            Self::PlatformData => 4,
            Self::EmbeddedController => 8,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum IfdError {
    InvalidMagic { found: u32 },
    Truncated { offset: usize, size: usize },
    RegionMissing(Region),
    RegionOutOfBounds { region: Region, end: usize, size: usize },
}

impl Display for IfdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic { found } => {
                write!(f, "IFD magic not as expected, got: {found:08x}, wanted: {MAGIC:08x}")
            }
            Self::Truncated { offset, size } => {
                write!(f, "IFD truncated: cannot read @ {offset:08x}, only got {size:08x}")
            }
            Self::RegionMissing(r) => write!(f, "IFD region {r} not present"),
            Self::RegionOutOfBounds { region, end, size } => {
                write!(f, "IFD region {region} ends @ {end:08x}, only got {size:08x}")
            }
        }
    }
}

impl IfdError {
    /// The data does not start with a descriptor at all, as opposed to
    /// carrying a broken one.
    pub fn is_no_descriptor(&self) -> bool {
        match self {
            Self::InvalidMagic { .. } => true,
            Self::Truncated { offset, .. } => *offset == OFFSET,
            _ => false,
        }
    }
}

impl std::error::Error for IfdError {}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IFD {
    pub header: Header,
    pub regions: [FlashRegion; REGION_COUNT],
}

impl Display for IFD {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== Regions ==")?;
        for r in Region::iter() {
            let reg = self.regions[r.register()];
            writeln!(f, "  {:<4}  {reg}", r.to_string())?;
        }
        write!(f, "")
    }
}

impl IFD {
    pub fn parse(data: &[u8]) -> Result<Self, IfdError> {
        let size = data.len();
        let Some(d) = data.get(OFFSET..) else {
            return Err(IfdError::Truncated {
                offset: OFFSET,
                size,
            });
        };
        let Ok((header, _)) = Header::read_from_prefix(d) else {
            return Err(IfdError::Truncated {
                offset: OFFSET,
                size,
            });
        };
        if header.magic != MAGIC {
            return Err(IfdError::InvalidMagic {
                found: header.magic,
            });
        }

        let frba = header.flmap0.frba();
        let regions = data
            .get(frba..)
            .and_then(|d| <[FlashRegion; REGION_COUNT]>::read_from_prefix(d).ok())
            .map(|(r, _)| r)
            .ok_or(IfdError::Truncated { offset: frba, size })?;

        Ok(Self { header, regions })
    }

    /// Get the flash region register for a region, unless marked unused.
    pub fn region(&self, region: Region) -> Option<FlashRegion> {
        let r = self.regions[region.register()];
        if r.is_unused() { None } else { Some(r) }
    }

    /// Get the byte range of a region, checked against the image size.
    pub fn region_range(&self, region: Region, size: usize) -> Result<Range<usize>, IfdError> {
        let Some(r) = self.region(region) else {
            return Err(IfdError::RegionMissing(region));
        };
        let range = r.range();
        if range.start >= range.end || range.end > size {
            return Err(IfdError::RegionOutOfBounds {
                region,
                end: range.end,
                size,
            });
        }
        Ok(range)
    }

    pub fn me_range(&self, size: usize) -> Result<Range<usize>, IfdError> {
        self.region_range(Region::Me, size)
    }
}

/// Build a minimal descriptor with the given (base, limit) register values.
#[cfg(test)]
pub(crate) fn test_descriptor(size: usize, regions: &[(Region, u16, u16)]) -> Vec<u8> {
    const FRBA: usize = 0x40;
    let mut d = vec![crate::EMPTY; size];
    d[OFFSET..OFFSET + 4].copy_from_slice(&MAGIC.to_le_bytes());
    let flmap0 = FLMAP0::new().with_FRBA((FRBA >> 4) as u8);
    d[OFFSET + 4..OFFSET + 8].copy_from_slice(&flmap0.into_bits().to_le_bytes());
    for i in 0..REGION_COUNT {
        let r = FlashRegion::new()
            .with_base(UNUSED_BASE)
            .with_limit(UNUSED_LIMIT);
        let o = FRBA + i * 4;
        d[o..o + 4].copy_from_slice(&r.into_bits().to_le_bytes());
    }
    for (region, base, limit) in regions {
        let r = FlashRegion::new().with_base(*base).with_limit(*limit);
        let o = FRBA + region.register() * 4;
        d[o..o + 4].copy_from_slice(&r.into_bits().to_le_bytes());
    }
    d
}

#[test]
fn parse_regions() {
    let data = test_descriptor(0x4000, &[(Region::Descriptor, 0, 0), (Region::Me, 1, 2)]);
    let ifd = IFD::parse(&data).unwrap();
    assert_eq!(ifd.me_range(data.len()).unwrap(), 0x1000..0x3000);
    assert_eq!(ifd.region(Region::Descriptor).unwrap().range(), 0..0x1000);
    assert!(ifd.region(Region::Bios).is_none());
    assert!(ifd.region(Region::EmbeddedController).is_none());
}

#[test]
fn missing_region() {
    let data = test_descriptor(0x2000, &[(Region::Descriptor, 0, 0)]);
    let ifd = IFD::parse(&data).unwrap();
    assert_eq!(
        ifd.me_range(data.len()),
        Err(IfdError::RegionMissing(Region::Me))
    );
}

#[test]
fn region_out_of_bounds() {
    let data = test_descriptor(0x2000, &[(Region::Me, 1, 4)]);
    let ifd = IFD::parse(&data).unwrap();
    assert!(matches!(
        ifd.me_range(data.len()),
        Err(IfdError::RegionOutOfBounds { .. })
    ));
}

#[test]
fn bad_magic() {
    let data = vec![0u8; 0x100];
    assert!(matches!(
        IFD::parse(&data),
        Err(IfdError::InvalidMagic { found: 0 })
    ));
}
