//! CFG archives
//!
//! Some MFS files, namely the default and the vendor configuration, are
//! archives of a whole directory tree. An archive is a record count, the
//! records and the data of all files. The records describe the tree in
//! pre-order; every directory is closed by a `..` record.

use core::fmt::{self, Display};

pub mod archive;
pub mod record;

pub use archive::{Alignment, Cfg, Node, NodeId};
pub use record::{Mode, Opt, Record};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CfgError {
    Truncated { what: &'static str, size: usize },
    MalformedDirectory { record: usize, reason: &'static str },
    InvalidRecord { name: String, reason: &'static str },
    InvalidPath(String),
    PathAlreadyExists(String),
    ParentMissing(String),
    NotADirectory(String),
    NotFound(String),
    NonEmptyDirectory(String),
    NameTooLong(String),
    FileTooLarge { path: String, size: usize },
    InvalidMode(String),
}

impl Display for CfgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { what, size } => {
                write!(f, "cannot parse CFG {what}, only got {size:08x} bytes")
            }
            Self::MalformedDirectory { record, reason } => {
                write!(f, "CFG record {record}: {reason}")
            }
            Self::InvalidRecord { name, reason } => write!(f, "CFG record {name}: {reason}"),
            Self::InvalidPath(p) => write!(f, "CFG path '{p}' is not absolute"),
            Self::PathAlreadyExists(p) => write!(f, "CFG path '{p}' already exists"),
            Self::ParentMissing(p) => write!(f, "parent of CFG path '{p}' does not exist"),
            Self::NotADirectory(p) => write!(f, "parent of CFG path '{p}' is not a directory"),
            Self::NotFound(p) => write!(f, "CFG path '{p}' does not exist"),
            Self::NonEmptyDirectory(p) => write!(
                f,
                "CFG path '{p}' is a non-empty directory, remove it recursively"
            ),
            Self::NameTooLong(n) => write!(f, "CFG name '{n}' exceeds {} bytes", record::NAME_SIZE),
            Self::FileTooLarge { path, size } => {
                write!(f, "CFG file '{path}' is too large: {size} bytes")
            }
            Self::InvalidMode(m) => write!(f, "invalid CFG mode or option string '{m}'"),
        }
    }
}

impl std::error::Error for CfgError {}
