//! The (CS)ME region and its partitions
//!
//! The ME region starts with a partition table (`$FPT`), possibly after a
//! 16 byte pre-header. Partitions have fixed sizes; replacing the content of
//! one never moves anything else in the region.

use core::fmt::{self, Display};
use core::ops::Range;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    fpt::{FPT, FptError},
    ifd::{IFD, IfdError},
};

/// Find the ME region in a full flash image. Data without a flash
/// descriptor is taken as a bare ME region as a whole.
pub fn locate_me(data: &[u8]) -> Result<Range<usize>, IfdError> {
    match IFD::parse(data) {
        Ok(ifd) => {
            let r = ifd.me_range(data.len())?;
            info!("ME region @ {:08x}:{:08x}", r.start, r.end);
            Ok(r)
        }
        Err(e) if e.is_no_descriptor() => {
            info!("no flash descriptor ({e}), assuming a bare ME region");
            Ok(0..data.len())
        }
        Err(e) => Err(e),
    }
}

/// Get the data of a partition within an ME region.
pub fn partition<'a>(me: &'a [u8], name: &str) -> Result<&'a [u8], FptError> {
    let fpt = FPT::parse(me)?;
    let r = fpt.entry_range(name, me.len())?;
    Ok(&me[r])
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MeImage {
    /// Offset of the region within the flash image
    pub base: usize,
    pub fpt: FPT,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl MeImage {
    pub fn parse(data: &[u8], base: usize) -> Result<Self, FptError> {
        let fpt = FPT::parse(data)?;
        debug!("{} FPT entries @ {:08x}", fpt.entries.len(), base + fpt.offset);
        Ok(Self {
            base,
            fpt,
            data: data.to_vec(),
        })
    }

    pub fn entry_data(&self, name: &str) -> Result<&[u8], FptError> {
        let r = self.fpt.entry_range(name, self.data.len())?;
        Ok(&self.data[r])
    }

    /// Replace the content of a partition; the size must stay the same.
    pub fn write_entry_data(&mut self, name: &str, data: &[u8]) -> Result<(), FptError> {
        let r = self.fpt.entry_range(name, self.data.len())?;
        if r.len() != data.len() {
            return Err(FptError::SizeMismatch {
                name: name.to_string(),
                expected: r.len(),
                found: data.len(),
            });
        }
        self.data[r.clone()].copy_from_slice(data);
        info!("wrote {} bytes to {name} @ {:08x}", data.len(), self.base + r.start);
        Ok(())
    }
}

impl Display for MeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.base + self.fpt.offset;
        writeln!(f, "FPT @ {o:08x}:\n{}", self.fpt.header)?;
        writeln!(f, "Entries:")?;
        let mut entries = self.fpt.entries.clone();
        entries.sort_by_key(|e| e.offset);
        for e in entries {
            writeln!(f, "- {e}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
use crate::{fpt::test_region, ifd::test_descriptor, ifd::Region};

#[cfg(test)]
fn test_flash() -> Vec<u8> {
    let mut data = test_descriptor(
        0x8000,
        &[(Region::Descriptor, 0, 0), (Region::Me, 1, 7)],
    );
    let me = test_region(0x7000, &[("MFS", 0x1000, 0x2000, 0), ("FLOG", 0x3000, 0x1000, 0)]);
    data[0x1000..].copy_from_slice(&me);
    data
}

#[test]
fn locate_in_flash() {
    let data = test_flash();
    let r = locate_me(&data).unwrap();
    assert_eq!(r, 0x1000..0x8000);
    let mfs = partition(&data[r], "MFS").unwrap();
    assert_eq!(mfs.len(), 0x2000);
    assert!(mfs.iter().all(|b| *b == crate::EMPTY));
}

#[test]
fn locate_bare_region() {
    let me = test_region(0x4000, &[("MFS", 0x1000, 0x2000, 0)]);
    assert_eq!(locate_me(&me).unwrap(), 0..0x4000);
    assert_eq!(locate_me(&me[..8]).unwrap(), 0..8);

    let data = test_descriptor(0x2000, &[(Region::Descriptor, 0, 0)]);
    assert_eq!(
        locate_me(&data),
        Err(IfdError::RegionMissing(Region::Me))
    );
}

#[test]
fn partition_errors() {
    let me = test_region(0x4000, &[("MFS", 0x1000, 0x2000, 0xff00_0000)]);
    assert!(matches!(
        partition(&me, "MFS"),
        Err(FptError::InvalidPartitionFlags { .. })
    ));
    assert_eq!(
        partition(&me, "NOPE"),
        Err(FptError::UnknownPartition("NOPE".to_string()))
    );
    assert_eq!(partition(&[0u8; 64], "MFS"), Err(FptError::InvalidMagic));
}

#[test]
fn write_entry_data() {
    let data = test_flash();
    let mut me = MeImage::parse(&data[0x1000..], 0x1000).unwrap();
    me.write_entry_data("FLOG", &[0x42; 0x1000]).unwrap();
    assert_eq!(me.entry_data("FLOG").unwrap(), &[0x42; 0x1000]);
    assert!(me.entry_data("MFS").unwrap().iter().all(|b| *b == crate::EMPTY));

    assert_eq!(
        me.write_entry_data("MFS", &[0; 0x100]),
        Err(FptError::SizeMismatch {
            name: "MFS".to_string(),
            expected: 0x2000,
            found: 0x100
        })
    );
    assert_eq!(me.data.len(), 0x7000);
}
