use core::fmt::{self, Display};
use core::mem::size_of;
use core::str::FromStr;

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use super::CfgError;

pub const NAME_SIZE: usize = 12;
pub const DOTDOT: &str = "..";

const MODE_CHARS: &str = "dAEIrwxrwxrwx";
const OPT_CHARS: &str = "?!MF";

/// Render the lowest `chars.len()` bits, most significant first.
fn bits_to_str(bits: u16, chars: &str) -> String {
    let n = chars.len();
    chars
        .chars()
        .enumerate()
        .map(|(i, c)| if bits & (1 << (n - 1 - i)) != 0 { c } else { '-' })
        .collect()
}

/// Parse a string as produced by [bits_to_str], accepting `-` or a space
/// for an unset bit.
fn str_to_bits(s: &str, chars: &str) -> Option<u16> {
    let n = chars.len();
    if s.chars().count() != n {
        return None;
    }
    let mut bits = 0;
    for (i, (c, want)) in s.chars().zip(chars.chars()).enumerate() {
        if c == want {
            bits |= 1 << (n - 1 - i);
        } else if c != '-' && c != ' ' {
            return None;
        }
    }
    Some(bits)
}

#[bitfield(u16)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mode {
    /// rwxrwxrwx
    #[bits(9)]
    pub permissions: u16,
    pub integrity: bool,
    pub encryption: bool,
    pub anti_replay: bool,
    pub directory: bool,
    #[bits(3)]
    _0: u8,
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bits_to_str(self.into_bits(), MODE_CHARS))
    }
}

impl FromStr for Mode {
    type Err = CfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match str_to_bits(s, MODE_CHARS) {
            Some(b) => Ok(Self::from_bits(b)),
            None => Err(CfgError::InvalidMode(s.to_string())),
        }
    }
}

#[bitfield(u16)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, PartialEq, Eq)]
pub struct Opt {
    /// May be overridden by the vendor configuration (`F`)
    pub overridable: bool,
    /// The `M`, `!` and `?` flags
    #[bits(3)]
    pub flags: u8,
    #[bits(12)]
    _0: u16,
}

impl Display for Opt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bits_to_str(self.into_bits(), OPT_CHARS))
    }
}

impl FromStr for Opt {
    type Err = CfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match str_to_bits(s, OPT_CHARS) {
            Some(b) => Ok(Self::from_bits(b)),
            None => Err(CfgError::InvalidMode(s.to_string())),
        }
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct Record {
    pub name: [u8; NAME_SIZE],
    pub zero: u16,
    pub mode: Mode,
    pub opt: Opt,
    pub size: u16,
    pub uid: u16,
    pub gid: u16,
    /// Offset of the data from the start of the archive
    pub offset: u32,
}

pub const RECORD_SIZE: usize = size_of::<Record>();

impl Record {
    pub fn new(name: &str, mode: Mode, opt: Opt, uid: u16, gid: u16) -> Result<Self, CfgError> {
        let b = name.as_bytes();
        if b.len() > NAME_SIZE {
            return Err(CfgError::NameTooLong(name.to_string()));
        }
        let mut n = [0u8; NAME_SIZE];
        n[..b.len()].copy_from_slice(b);
        Ok(Self {
            name: n,
            zero: 0,
            mode,
            opt,
            size: 0,
            uid,
            gid,
            offset: 0,
        })
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name)
            .trim_end_matches('\0')
            .to_string()
    }

    pub fn is_directory(&self) -> bool {
        self.mode.directory()
    }

    pub fn is_dotdot(&self) -> bool {
        self.name() == DOTDOT
    }

    /// The record closing a directory
    pub fn dotdot(&self) -> Self {
        let mut n = [0u8; NAME_SIZE];
        n[..DOTDOT.len()].copy_from_slice(DOTDOT.as_bytes());
        Self {
            name: n,
            opt: Opt::new(),
            ..*self
        }
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        let (uid, gid) = (self.uid, self.gid);
        let (size, offset) = (self.size, self.offset);
        let (mode, opt) = (self.mode, self.opt);
        write!(
            f,
            "{name:<12} ({uid:04X}:{gid:04X}) [{size:4} bytes @ {offset:8X}] {mode} _ {opt}"
        )
    }
}

#[test]
fn record_layout() {
    use zerocopy::IntoBytes;

    assert_eq!(RECORD_SIZE, 28);
    let mode = " --Irw-r-----".parse().unwrap();
    let opt = "?!-F".parse().unwrap();
    let mut r = Record::new("eom", mode, opt, 0, 238).unwrap();
    r.size = 1;
    r.offset = 0x1234;
    let raw = r.as_bytes();
    assert_eq!(&raw[..4], b"eom\0");
    // zero, mode, opt, size, uid, gid
    assert_eq!(&raw[12..24], &[0, 0, 0xa0, 0x03, 0x0d, 0, 1, 0, 0, 0, 238, 0]);
    assert_eq!(&raw[24..], &[0x34, 0x12, 0, 0]);
}

#[test]
fn mode_text() {
    let m: Mode = "dAEIrwxrwxrwx".parse().unwrap();
    assert_eq!(m.into_bits(), 0x1fff);
    assert!(m.directory() && m.integrity());
    assert_eq!(m.to_string(), "dAEIrwxrwxrwx");

    let m: Mode = " ---rwxr-----".parse().unwrap();
    assert_eq!(m.into_bits(), 0o740);
    assert!(!m.directory());
    assert_eq!(m.to_string(), "----rwxr-----");

    assert!("rwx".parse::<Mode>().is_err());
    assert!("xAEIrwxrwxrwx".parse::<Mode>().is_err());
}

#[test]
fn opt_text() {
    let o: Opt = "?!-F".parse().unwrap();
    assert_eq!(o.into_bits(), 0b1101);
    assert!(o.overridable());
    assert_eq!(o.to_string(), "?!-F");
    let o: Opt = "?-- ".parse().unwrap();
    assert!(!o.overridable());
    assert_eq!(o.to_string(), "?---");
    assert!("?!MFX".parse::<Opt>().is_err());
}

#[test]
fn names() {
    let r = Record::new("twelve_chars", Mode::new(), Opt::new(), 0, 0).unwrap();
    assert_eq!(r.name(), "twelve_chars");
    assert!(matches!(
        Record::new("thirteen_chrs", Mode::new(), Opt::new(), 0, 0),
        Err(CfgError::NameTooLong(_))
    ));
    let d = Record::new("home", Mode::new().with_directory(true), Opt::from_bits(1), 0, 0)
        .unwrap()
        .dotdot();
    assert!(d.is_dotdot() && d.is_directory());
    assert_eq!(d.opt.into_bits(), 0);
}
