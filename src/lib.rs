#![doc = include_str!("../README.md")]

use core::fmt::{self, Display};
use core::ops::Range;

use log::info;
use serde::{Deserialize, Serialize};

pub mod cfg;
pub mod delta;
pub mod fpt;
pub mod ifd;
pub mod me;
pub mod mfs;

use cfg::CfgError;
use delta::DeltaError;
use fpt::{FptError, MFS_NAME};
use ifd::{IFD, IfdError};
use me::{MeImage, locate_me};
use mfs::{Mfs, MfsError};

// An empty byte in a NOR flash is all-1's.
pub const EMPTY: u8 = 0xff;

#[derive(Debug)]
pub enum Error {
    Ifd(IfdError),
    Fpt(FptError),
    Mfs(MfsError),
    Cfg(CfgError),
    Delta(DeltaError),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ifd(e) => write!(f, "{e}"),
            Self::Fpt(e) => write!(f, "{e}"),
            Self::Mfs(e) => write!(f, "{e}"),
            Self::Cfg(e) => write!(f, "{e}"),
            Self::Delta(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<IfdError> for Error {
    fn from(e: IfdError) -> Self {
        Self::Ifd(e)
    }
}

impl From<FptError> for Error {
    fn from(e: FptError) -> Self {
        Self::Fpt(e)
    }
}

impl From<MfsError> for Error {
    fn from(e: MfsError) -> Self {
        Self::Mfs(e)
    }
}

impl From<CfgError> for Error {
    fn from(e: CfgError) -> Self {
        Self::Cfg(e)
    }
}

impl From<DeltaError> for Error {
    fn from(e: DeltaError) -> Self {
        Self::Delta(e)
    }
}

/// A full flash image or a bare ME region
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Firmware {
    pub ifd: Option<IFD>,
    pub me_range: Range<usize>,
    pub me: MeImage,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl Firmware {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let me_range = locate_me(data)?;
        let ifd = IFD::parse(data).ok();
        let me = MeImage::parse(&data[me_range.clone()], me_range.start)?;
        Ok(Self {
            ifd,
            me_range,
            me,
            data: data.to_vec(),
        })
    }

    pub fn mfs_data(&self) -> Result<&[u8], Error> {
        Ok(self.me.entry_data(MFS_NAME)?)
    }

    pub fn mfs(&self) -> Result<Mfs, Error> {
        Ok(Mfs::parse(self.mfs_data()?)?)
    }

    /// Serialize the MFS into its partition.
    pub fn write_mfs(&mut self, mfs: &mut Mfs) -> Result<(), Error> {
        let data = mfs.generate()?;
        self.me.write_entry_data(MFS_NAME, &data)?;
        Ok(())
    }

    /// The whole image with the current ME region in place
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        data[self.me_range.clone()].copy_from_slice(&self.me.data);
        info!(
            "ME region @ {:08x}:{:08x} written back",
            self.me_range.start, self.me_range.end
        );
        data
    }
}

#[cfg(test)]
fn test_firmware() -> Vec<u8> {
    use ifd::Region;

    let mut vol = mfs::volume::test_volume(256, 1);
    vol.add_file(mfs::INTEL_IDX, b"defaults", true).unwrap();
    let image = mfs::test_image(vol, false);

    let mut data = ifd::test_descriptor(0x8000, &[(Region::Descriptor, 0, 0), (Region::Me, 1, 7)]);
    let size = image.len() as u32;
    let mut me = fpt::test_region(0x7000, &[("FTPR", 0x1000, 0x1000, 0), (MFS_NAME, 0x2000, size, 0)]);
    me[0x2000..0x2000 + image.len()].copy_from_slice(&image);
    data[0x1000..].copy_from_slice(&me);
    data
}

#[test]
fn full_image_round_trip() {
    let data = test_firmware();
    let mut fw = Firmware::parse(&data).unwrap();
    assert!(fw.ifd.is_some());
    assert_eq!(fw.me_range, 0x1000..0x8000);
    assert_eq!(fw.to_vec(), data);

    let mut mfs = fw.mfs().unwrap();
    let f = mfs.system_volume().get_file(mfs::INTEL_IDX).unwrap();
    assert_eq!(f.data, b"defaults");
    mfs.system_volume_mut()
        .add_file(mfs::FITC_IDX, b"vendor", false)
        .unwrap();
    fw.write_mfs(&mut mfs).unwrap();

    let out = fw.to_vec();
    assert_eq!(out.len(), data.len());
    assert_eq!(&out[..0x3000], &data[..0x3000]);
    let fw = Firmware::parse(&out).unwrap();
    let mfs = fw.mfs().unwrap();
    assert_eq!(
        mfs.system_volume().get_file(mfs::FITC_IDX).unwrap().data,
        b"vendor"
    );
}

#[test]
fn bare_me_region() {
    let data = test_firmware();
    let fw = Firmware::parse(&data[0x1000..]).unwrap();
    assert!(fw.ifd.is_none());
    assert_eq!(fw.me_range, 0..0x7000);
    assert_eq!(fw.me.base, 0);
    assert!(fw.mfs().is_ok());
}
