use core::cmp::Ordering;
use core::fmt::{self, Display};
use core::mem::size_of;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum::Display as StrDisplay;
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use super::{
    CfgError,
    record::{DOTDOT, Mode, Opt, RECORD_SIZE, Record},
};

pub type NodeId = usize;

const ROOT: NodeId = 0;
const ROOT_PATH: &str = "/";

const COUNT_SIZE: usize = size_of::<u32>();
// MFS chunk size
const ALIGN: usize = 0x40;

/// Placement of file data when generating an archive
#[derive(StrDisplay, Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Alignment {
    /// All data packed back to back
    #[default]
    None,
    /// Every file starts on a 64 byte boundary.
    Start,
    /// Every non-empty file ends on a 64 byte boundary.
    End,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Node {
    pub path: String,
    pub record: Record,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub parent: Option<NodeId>,
    /// Directories first, then ordered by path
    pub children: Vec<NodeId>,
}

impl Node {
    pub fn is_directory(&self) -> bool {
        self.record.is_directory()
    }

    fn order(&self, other: &Self) -> Ordering {
        other
            .is_directory()
            .cmp(&self.is_directory())
            .then_with(|| self.path.cmp(&other.path))
    }
}

/// An archive as a tree of nodes, rooted in a node for `/` that has no
/// record of its own.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Cfg {
    nodes: Vec<Option<Node>>,
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split an absolute path into its parent and its name.
fn split(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if !path.starts_with('/') || name.is_empty() || name == "." || name == DOTDOT {
        return None;
    }
    let parent = if parent.is_empty() { ROOT_PATH } else { parent };
    Some((parent, name))
}

impl Default for Cfg {
    fn default() -> Self {
        Self::new()
    }
}

impl Cfg {
    pub fn new() -> Self {
        let mut record = Record::new_zeroed();
        record.mode = Mode::new().with_directory(true);
        let root = Node {
            path: ROOT_PATH.to_string(),
            record,
            data: Vec::new(),
            parent: None,
            children: Vec::new(),
        };
        Self {
            nodes: vec![Some(root)],
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, CfgError> {
        let size = data.len();
        let Ok((count, _)) = u32::read_from_prefix(data) else {
            return Err(CfgError::Truncated {
                what: "record count",
                size,
            });
        };
        let count = count as usize;
        let Some(table) = count
            .checked_mul(RECORD_SIZE)
            .and_then(|l| data.get(COUNT_SIZE..COUNT_SIZE + l))
        else {
            return Err(CfgError::Truncated {
                what: "records",
                size,
            });
        };

        let mut cfg = Self::new();
        // Directories entered so far; the root is never left.
        let mut stack = vec![ROOT];
        for (i, raw) in table.chunks_exact(RECORD_SIZE).enumerate() {
            let Ok(record) = Record::read_from_bytes(raw) else {
                return Err(CfgError::Truncated {
                    what: "record",
                    size,
                });
            };
            if record.is_dotdot() {
                if !record.is_directory() || record.opt.into_bits() != 0 {
                    return Err(CfgError::MalformedDirectory {
                        record: i,
                        reason: "'..' must be a directory without options",
                    });
                }
                let dir = match stack.pop() {
                    Some(d) if d != ROOT => d,
                    _ => {
                        return Err(CfgError::MalformedDirectory {
                            record: i,
                            reason: "'..' without an open directory",
                        });
                    }
                };
                if cfg.node(dir).map(|n| n.record.mode) != Some(record.mode) {
                    return Err(CfgError::MalformedDirectory {
                        record: i,
                        reason: "mode of '..' does not match its directory",
                    });
                }
                continue;
            }

            let name = record.name();
            if name.is_empty() || name == "." || name.contains('/') {
                return Err(CfgError::InvalidRecord {
                    name,
                    reason: "invalid name",
                });
            }
            let file_data = if record.is_directory() {
                if record.size != 0 {
                    return Err(CfgError::InvalidRecord {
                        name,
                        reason: "directory with data",
                    });
                }
                Vec::new()
            } else {
                let o = record.offset as usize;
                let l = record.size as usize;
                let Some(d) = data.get(o..o + l) else {
                    return Err(CfgError::Truncated {
                        what: "file data",
                        size,
                    });
                };
                d.to_vec()
            };

            let parent = stack.last().copied().unwrap_or(ROOT);
            let path = match cfg.node(parent) {
                Some(p) => join(&p.path, &name),
                None => join(ROOT_PATH, &name),
            };
            if cfg.find(&path).is_some() {
                return Err(CfgError::PathAlreadyExists(path));
            }
            let id = cfg.insert(parent, path, record, file_data);
            if record.is_directory() {
                stack.push(id);
            }
        }
        if stack.len() > 1 {
            warn!("CFG: {} directories are not closed", stack.len() - 1);
        }
        debug!("CFG: {count} records, {} files", cfg.files().count());
        Ok(cfg)
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    fn find(&self, path: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.as_ref().is_some_and(|n| n.path == path))
    }

    fn insert(&mut self, parent: NodeId, path: String, record: Record, data: Vec<u8>) -> NodeId {
        let id = self.nodes.len();
        let node = Node {
            path,
            record,
            data,
            parent: Some(parent),
            children: Vec::new(),
        };
        let pos = match self.node(parent) {
            Some(p) => p
                .children
                .iter()
                .position(|c| {
                    self.node(*c)
                        .is_some_and(|c| node.order(c) == Ordering::Less)
                })
                .unwrap_or(p.children.len()),
            None => 0,
        };
        self.nodes.push(Some(node));
        if let Some(Some(p)) = self.nodes.get_mut(parent) {
            p.children.insert(pos, id);
        }
        id
    }

    /// All files and directories, in the order they were added
    pub fn files(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().skip(1).flatten()
    }

    pub fn get_file(&self, path: &str) -> Option<&Node> {
        self.files().find(|n| n.path == path)
    }

    pub fn children<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Node> {
        node.children.iter().filter_map(|c| self.node(*c))
    }

    /// Add a file or, if the mode says so, a directory. A trailing `/` on
    /// the path is ignored.
    pub fn add_file(
        &mut self,
        path: &str,
        data: &[u8],
        mode: Mode,
        opt: Opt,
        uid: u16,
        gid: u16,
    ) -> Result<NodeId, CfgError> {
        let path = path.strip_suffix('/').unwrap_or(path);
        let Some((parent_path, name)) = split(path) else {
            return Err(CfgError::InvalidPath(path.to_string()));
        };
        if self.find(path).is_some() {
            return Err(CfgError::PathAlreadyExists(path.to_string()));
        }
        let Some(parent) = self.find(parent_path) else {
            return Err(CfgError::ParentMissing(path.to_string()));
        };
        if !self.node(parent).is_some_and(Node::is_directory) {
            return Err(CfgError::NotADirectory(path.to_string()));
        }

        let mut record = Record::new(name, mode, opt, uid, gid)?;
        if record.is_directory() {
            if !data.is_empty() {
                return Err(CfgError::InvalidRecord {
                    name: name.to_string(),
                    reason: "directory with data",
                });
            }
        } else {
            let Ok(size) = u16::try_from(data.len()) else {
                return Err(CfgError::FileTooLarge {
                    path: path.to_string(),
                    size: data.len(),
                });
            };
            record.size = size;
        }
        debug!("CFG: adding {path} ({} bytes)", data.len());
        Ok(self.insert(parent, path.to_string(), record, data.to_vec()))
    }

    /// Remove a file, or a directory with everything in it if `recursive`.
    pub fn remove_file(&mut self, path: &str, recursive: bool) -> Result<(), CfgError> {
        let path = path.strip_suffix('/').unwrap_or(path);
        let Some(id) = self.find(path).filter(|id| *id != ROOT) else {
            return Err(CfgError::NotFound(path.to_string()));
        };
        let parent = match self.node(id) {
            Some(n) if !n.children.is_empty() && !recursive => {
                return Err(CfgError::NonEmptyDirectory(path.to_string()));
            }
            Some(n) => n.parent,
            None => None,
        };
        if let Some(Some(p)) = parent.and_then(|p| self.nodes.get_mut(p)) {
            p.children.retain(|c| *c != id);
        }
        let mut todo = vec![id];
        while let Some(i) = todo.pop() {
            if let Some(n) = self.nodes.get_mut(i).and_then(Option::take) {
                debug!("CFG: removing {}", n.path);
                todo.extend(n.children);
            }
        }
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.files()
            .map(|n| if n.is_directory() { 2 } else { 1 })
            .sum()
    }

    fn generate_records(
        &self,
        id: NodeId,
        alignment: Alignment,
        records: &mut Vec<Record>,
        blob: &mut Vec<u8>,
    ) {
        let Some(node) = self.node(id) else {
            return;
        };
        let mut r = node.record;
        r.zero = 0;
        if node.is_directory() {
            r.size = 0;
            r.offset = 0;
            records.push(r);
            for c in &node.children {
                self.generate_records(*c, alignment, records, blob);
            }
            records.push(r.dotdot());
            return;
        }

        let size = node.data.len();
        let offset = blob.len();
        let extra = match alignment {
            Alignment::Start => offset % ALIGN,
            Alignment::End if size != 0 => (offset + size) % ALIGN,
            _ => 0,
        };
        if extra > 0 {
            blob.resize(offset + ALIGN - extra, 0);
        }
        // Relative to the data for now
        r.offset = blob.len() as u32;
        r.size = size as u16;
        records.push(r);
        blob.extend_from_slice(&node.data);
    }

    /// Serialize the tree: record count, records in pre-order, then the
    /// data of all files.
    pub fn generate(&self, alignment: Alignment) -> Vec<u8> {
        let mut records = Vec::new();
        let mut blob = Vec::new();
        if let Some(root) = self.node(ROOT) {
            for c in &root.children {
                self.generate_records(*c, alignment, &mut records, &mut blob);
            }
        }

        let count = records.len();
        let table_end = COUNT_SIZE + count * RECORD_SIZE;
        let data_offset = match alignment {
            Alignment::None => table_end,
            _ => table_end.next_multiple_of(ALIGN),
        };

        let mut data = Vec::with_capacity(data_offset + blob.len());
        data.extend_from_slice(&(count as u32).to_le_bytes());
        for mut r in records {
            r.offset += data_offset as u32;
            data.extend_from_slice(r.as_bytes());
        }
        data.resize(data_offset, 0);
        data.extend_from_slice(&blob);
        data
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, node: &Node) -> fmt::Result {
        writeln!(f, "{} {}", node.record, node.path)?;
        if node.is_directory() {
            for c in self.children(node) {
                self.fmt_node(f, c)?;
            }
            writeln!(f, "{} {}", node.record.dotdot(), node.path)?;
        }
        Ok(())
    }
}

impl Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Number of records: {}", self.record_count())?;
        if let Some(root) = self.node(ROOT) {
            for c in self.children(root) {
                self.fmt_node(f, c)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
fn test_tree() -> Cfg {
    let dir: Mode = "d---rwxr-xr-x".parse().unwrap();
    let file: Mode = "----rw-r--r--".parse().unwrap();
    let mut cfg = Cfg::new();
    cfg.add_file("/docs/", &[], dir, Opt::new(), 0, 0).unwrap();
    cfg.add_file("/docs/a.txt", b"abc", file, "---F".parse().unwrap(), 1, 2)
        .unwrap();
    cfg.add_file("/b.bin", &[], file, Opt::new(), 0, 0).unwrap();
    cfg
}

#[cfg(test)]
fn record_at(data: &[u8], i: usize) -> Record {
    let o = COUNT_SIZE + i * RECORD_SIZE;
    Record::read_from_bytes(&data[o..o + RECORD_SIZE]).unwrap()
}

#[cfg(test)]
fn paths(cfg: &Cfg) -> Vec<&str> {
    cfg.files().map(|n| n.path.as_str()).collect()
}

#[test]
fn generate_and_parse_packed() {
    let cfg = test_tree();
    let data = cfg.generate(Alignment::None);
    assert_eq!(&data[..4], &[4, 0, 0, 0]);
    assert_eq!(data.len(), 4 + 4 * 28 + 3);
    let names: Vec<String> = (0..4).map(|i| record_at(&data, i).name()).collect();
    assert_eq!(names, vec!["docs", "a.txt", "..", "b.bin"]);
    let a = record_at(&data, 1);
    assert_eq!((a.offset, a.size), (116, 3));
    // Directories point at the start of the data too.
    assert_eq!(record_at(&data, 0).offset, 116);
    assert_eq!(record_at(&data, 2).opt.into_bits(), 0);

    let parsed = Cfg::parse(&data).unwrap();
    assert_eq!(paths(&parsed), vec!["/docs", "/docs/a.txt", "/b.bin"]);
    let a = parsed.get_file("/docs/a.txt").unwrap();
    assert_eq!(a.data, b"abc");
    assert!(a.record.opt.overridable());
    assert_eq!((a.record.uid, a.record.gid), (1, 2));
    let docs = parsed.get_file("/docs").unwrap();
    let children: Vec<&str> = parsed.children(docs).map(|n| n.path.as_str()).collect();
    assert_eq!(children, vec!["/docs/a.txt"]);
    assert!(parsed.get_file("/b.bin").unwrap().data.is_empty());
    assert!(parsed.get_file("/").is_none());

    assert_eq!(parsed.generate(Alignment::None), data);
}

#[test]
fn generate_aligned_start() {
    let data = test_tree().generate(Alignment::Start);
    assert_eq!(data.len(), 192);
    for i in [1, 3] {
        assert_eq!(record_at(&data, i).offset % ALIGN as u32, 0);
    }
    assert_eq!(record_at(&data, 1).offset, 128);
    assert_eq!(record_at(&data, 3).offset, 192);
    // Padding between records and data
    assert!(data[116..128].iter().all(|b| *b == 0));

    let parsed = Cfg::parse(&data).unwrap();
    assert_eq!(parsed.get_file("/docs/a.txt").unwrap().data, b"abc");
    assert_eq!(parsed.generate(Alignment::Start), data);
}

#[test]
fn generate_aligned_end() {
    let data = test_tree().generate(Alignment::End);
    let a = record_at(&data, 1);
    assert_eq!(a.offset, 189);
    assert_eq!((a.offset + a.size as u32) % ALIGN as u32, 0);
    // Empty files are left alone.
    assert_eq!(record_at(&data, 3).offset, 192);
    assert_eq!(&data[189..], b"abc");
}

#[test]
fn children_are_ordered() {
    let file: Mode = "----rw-------".parse().unwrap();
    let dir: Mode = "d---rwx------".parse().unwrap();
    let mut cfg = test_tree();
    cfg.add_file("/a.bin", b"1", file, Opt::new(), 0, 0).unwrap();
    cfg.add_file("/zz/", &[], dir, Opt::new(), 0, 0).unwrap();
    let data = cfg.generate(Alignment::None);
    let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    assert_eq!(count, cfg.record_count());
    let names: Vec<String> = (0..count).map(|i| record_at(&data, i).name()).collect();
    assert_eq!(names, vec!["docs", "a.txt", "..", "zz", "..", "a.bin", "b.bin"]);
}

#[test]
fn mutation_errors() {
    let file: Mode = "----rw-------".parse().unwrap();
    let dir: Mode = "d---rwx------".parse().unwrap();
    let o = Opt::new();
    let mut cfg = test_tree();
    assert_eq!(
        cfg.add_file("/docs/a.txt", b"x", file, o, 0, 0),
        Err(CfgError::PathAlreadyExists("/docs/a.txt".into()))
    );
    assert_eq!(
        cfg.add_file("/nope/x", b"x", file, o, 0, 0),
        Err(CfgError::ParentMissing("/nope/x".into()))
    );
    assert_eq!(
        cfg.add_file("/b.bin/x", b"x", file, o, 0, 0),
        Err(CfgError::NotADirectory("/b.bin/x".into()))
    );
    assert_eq!(
        cfg.add_file("relative", b"x", file, o, 0, 0),
        Err(CfgError::InvalidPath("relative".into()))
    );
    assert!(matches!(
        cfg.add_file("/dir", b"x", dir, o, 0, 0),
        Err(CfgError::InvalidRecord { .. })
    ));
    assert!(matches!(
        cfg.add_file("/big", &vec![0; 0x10000], file, o, 0, 0),
        Err(CfgError::FileTooLarge { .. })
    ));

    assert_eq!(
        cfg.remove_file("/docs", false),
        Err(CfgError::NonEmptyDirectory("/docs".into()))
    );
    assert_eq!(
        cfg.remove_file("/missing", true),
        Err(CfgError::NotFound("/missing".into()))
    );
    assert_eq!(cfg.remove_file("/", true), Err(CfgError::NotFound("".into())));
    assert_eq!(paths(&cfg), vec!["/docs", "/docs/a.txt", "/b.bin"]);

    cfg.remove_file("/docs/", true).unwrap();
    assert_eq!(paths(&cfg), vec!["/b.bin"]);
    assert_eq!(cfg.generate(Alignment::None).len(), 4 + 28);
    cfg.add_file("/docs/", &[], dir, o, 0, 0).unwrap();
    cfg.remove_file("/docs", false).unwrap();
}

#[cfg(test)]
fn raw_cfg(records: &[Record]) -> Vec<u8> {
    let mut d = (records.len() as u32).to_le_bytes().to_vec();
    for r in records {
        d.extend_from_slice(r.as_bytes());
    }
    d
}

#[test]
fn malformed_directories() {
    let dir: Mode = "d---rwx------".parse().unwrap();
    let other: Mode = "d---rwxrwx---".parse().unwrap();
    let d = Record::new("d", dir, Opt::new(), 0, 0).unwrap();

    let data = raw_cfg(&[d.dotdot()]);
    assert!(matches!(
        Cfg::parse(&data),
        Err(CfgError::MalformedDirectory { record: 0, .. })
    ));

    let mut mismatch = d.dotdot();
    mismatch.mode = other;
    let data = raw_cfg(&[d, mismatch]);
    assert!(matches!(
        Cfg::parse(&data),
        Err(CfgError::MalformedDirectory { record: 1, .. })
    ));

    let mut with_opt = d.dotdot();
    with_opt.opt = Opt::new().with_overridable(true);
    let data = raw_cfg(&[d, with_opt]);
    assert!(matches!(
        Cfg::parse(&data),
        Err(CfgError::MalformedDirectory { record: 1, .. })
    ));

    let data = raw_cfg(&[d, d.dotdot()]);
    let cfg = Cfg::parse(&data).unwrap();
    assert_eq!(paths(&cfg), vec!["/d"]);
}

#[test]
fn truncated_archives() {
    assert!(matches!(
        Cfg::parse(&[1, 0]),
        Err(CfgError::Truncated { what: "record count", .. })
    ));
    let file: Mode = "----rw-------".parse().unwrap();
    let mut f = Record::new("f", file, Opt::new(), 0, 0).unwrap();
    let mut data = raw_cfg(&[f]);
    data[0] = 2;
    assert!(matches!(
        Cfg::parse(&data),
        Err(CfgError::Truncated { what: "records", .. })
    ));
    f.size = 10;
    f.offset = 1000;
    assert!(matches!(
        Cfg::parse(&raw_cfg(&[f])),
        Err(CfgError::Truncated { what: "file data", .. })
    ));
}
