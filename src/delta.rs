//! Vendor configuration deltas
//!
//! The default configuration (`intel.cfg`) marks some of its files as
//! overridable. A vendor image overrides them either in the vendor
//! configuration (`fitc.cfg`) or, once the ME has been running, in its
//! `/home` directory. A delta is the set of overridable files whose content
//! differs from the defaults.
//!
//! Applying a delta to another image builds a new vendor configuration from
//! that image's defaults, adds the given payload, and replaces both the old
//! vendor configuration and `/home` with it.

use core::fmt::{self, Display};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::cfg::{Alignment, Cfg, CfgError, Mode, Node, Opt};
use crate::mfs::{FITC_IDX, HOME_IDX, INTEL_IDX, Mfs, MfsError, volume::SystemVolume};

const HOME_PREFIX: &str = "/home";

/// End-of-manufacturing flag
const EOM_PATH: &str = "/home/mca/eom";
// --Irw-r-----, ?!-F
const EOM_MODE: Mode = Mode::from_bits(0x03a0);
const EOM_OPT: Opt = Opt::from_bits(0b1101);
const EOM_UID: u16 = 0;
const EOM_GID: u16 = 238;

/// Trace hub configuration, carrying the payload
const CT_PATH: &str = "/home/bup/ct";
// ---rwxr-----, ?--F
const CT_MODE: Mode = Mode::from_bits(0x01e0);
const CT_OPT: Opt = Opt::from_bits(0b1001);
const CT_UID: u16 = 3;
const CT_GID: u16 = 351;

#[derive(Debug)]
pub enum DeltaError {
    UnexpectedContent(Vec<String>),
    MissingFile(&'static str),
    Mfs(MfsError),
    Cfg(CfgError),
    Io { path: PathBuf, source: io::Error },
}

impl Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedContent(paths) => write!(
                f,
                "fitc.cfg contains files that are not overridable: {}",
                paths.join(", ")
            ),
            Self::MissingFile(what) => write!(f, "MFS has no {what}"),
            Self::Mfs(e) => write!(f, "{e}"),
            Self::Cfg(e) => write!(f, "{e}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl std::error::Error for DeltaError {}

impl From<MfsError> for DeltaError {
    fn from(e: MfsError) -> Self {
        Self::Mfs(e)
    }
}

impl From<CfgError> for DeltaError {
    fn from(e: CfgError) -> Self {
        Self::Cfg(e)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DeltaError + '_ {
    move |source| DeltaError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Files by their absolute CFG path
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Delta {
    files: BTreeMap<String, Vec<u8>>,
}

impl Delta {
    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, d)| (p.as_str(), d.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Read a delta from a directory tree mirroring the CFG paths.
    pub fn load(dir: &Path) -> Result<Self, DeltaError> {
        let mut delta = Self::default();
        let mut todo = vec![dir.to_path_buf()];
        while let Some(d) = todo.pop() {
            for e in fs::read_dir(&d).map_err(io_error(&d))? {
                let e = e.map_err(io_error(&d))?;
                let p = e.path();
                if p.is_dir() {
                    todo.push(p);
                    continue;
                }
                let Ok(rel) = p.strip_prefix(dir) else {
                    continue;
                };
                let path: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                let data = fs::read(&p).map_err(io_error(&p))?;
                delta.insert(&format!("/{}", path.join("/")), data);
            }
        }
        debug!("loaded {} delta files from {}", delta.len(), dir.display());
        Ok(delta)
    }

    /// Write the delta as a directory tree mirroring the CFG paths.
    pub fn store(&self, dir: &Path) -> Result<(), DeltaError> {
        for (path, data) in self.files() {
            let p = dir.join(path.trim_start_matches('/'));
            if let Some(parent) = p.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            fs::write(&p, data).map_err(io_error(&p))?;
        }
        Ok(())
    }
}

/// Directories and overridable files of the default configuration
pub fn overridable(intel: &Cfg) -> BTreeMap<&str, &Node> {
    intel
        .files()
        .filter(|n| n.is_directory() || n.record.opt.overridable())
        .map(|n| (n.path.as_str(), n))
        .collect()
}

fn read_cfg(sysvol: &SystemVolume, id: usize) -> Result<Option<Cfg>, DeltaError> {
    match sysvol.get_file(id) {
        Some(f) => Ok(Some(Cfg::parse(&f.data)?)),
        None => Ok(None),
    }
}

/// Collect the overridable files whose vendor content differs from the
/// defaults, taken from `fitc.cfg` if present, otherwise from `/home`.
pub fn generate_delta(sysvol: &SystemVolume) -> Result<Delta, DeltaError> {
    let Some(intel) = read_cfg(sysvol, INTEL_IDX)? else {
        return Err(DeltaError::MissingFile("intel.cfg"));
    };
    let allowed = overridable(&intel);

    let vendor: BTreeMap<String, Vec<u8>> = if let Some(fitc) = read_cfg(sysvol, FITC_IDX)? {
        let unexpected: Vec<String> = fitc
            .files()
            .filter(|n| !allowed.contains_key(n.path.as_str()))
            .map(|n| n.path.clone())
            .collect();
        if !unexpected.is_empty() {
            return Err(DeltaError::UnexpectedContent(unexpected));
        }
        info!("generating delta from fitc.cfg");
        fitc.files().map(|n| (n.path.clone(), n.data.clone())).collect()
    } else if sysvol.get_file(HOME_IDX).is_some() {
        info!("generating delta from {HOME_PREFIX}");
        sysvol
            .list_dir(HOME_IDX, true, HOME_PREFIX)?
            .into_iter()
            .collect()
    } else {
        return Err(DeltaError::MissingFile("fitc.cfg or home directory"));
    };

    let mut delta = Delta::default();
    for (path, node) in allowed {
        if node.is_directory() {
            continue;
        }
        match vendor.get(path) {
            Some(data) if *data != node.data => {
                debug!("{path} differs ({} bytes)", data.len());
                delta.insert(path, data.clone());
            }
            _ => {}
        }
    }
    info!("{} files differ from the defaults", delta.len());
    Ok(delta)
}

/// Build a vendor configuration from the defaults: all directories and all
/// overridable files, with content from the delta where present.
pub fn fitc_from_intel_and_delta(intel: &Cfg, delta: &Delta) -> Result<Cfg, DeltaError> {
    let mut fitc = Cfg::new();
    // Parents come before their children.
    for n in intel.files() {
        let r = &n.record;
        if !n.is_directory() && !r.opt.overridable() {
            continue;
        }
        let data = delta.get(&n.path).unwrap_or(n.data.as_slice());
        fitc.add_file(&n.path, data, r.mode, r.opt, r.uid, r.gid)?;
    }
    for (path, _) in delta.files() {
        if fitc.get_file(path).is_none() {
            warn!("delta file {path} is not overridable, ignoring");
        }
    }
    Ok(fitc)
}

fn replace_file(
    cfg: &mut Cfg,
    path: &str,
    data: &[u8],
    mode: Mode,
    opt: Opt,
    uid: u16,
    gid: u16,
) -> Result<(), CfgError> {
    match cfg.remove_file(path, false) {
        Ok(()) | Err(CfgError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    cfg.add_file(path, data, mode, opt, uid, gid)?;
    Ok(())
}

/// Clear the end-of-manufacturing flag and store the payload as the trace
/// hub configuration.
pub fn apply_payload(fitc: &mut Cfg, payload: &[u8]) -> Result<(), DeltaError> {
    replace_file(fitc, EOM_PATH, &[0], EOM_MODE, EOM_OPT, EOM_UID, EOM_GID)?;
    replace_file(fitc, CT_PATH, payload, CT_MODE, CT_OPT, CT_UID, CT_GID)?;
    info!("added {} bytes of payload as {CT_PATH}", payload.len());
    Ok(())
}

/// Replace the vendor configuration and drop `/home`, so that all runtime
/// data is recreated from the new vendor configuration.
pub fn install_fitc(sysvol: &mut SystemVolume, fitc: &[u8]) -> Result<(), DeltaError> {
    sysvol.remove_file(FITC_IDX);
    sysvol.remove_file(HOME_IDX);
    // The file must be spread over non-contiguous chunks.
    sysvol.add_file(FITC_IDX, fitc, false)?;
    Ok(())
}

/// Apply a delta and payload to an MFS and serialize it.
pub fn apply_delta(mfs: &mut Mfs, delta: &Delta, payload: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let sysvol = mfs.system_volume_mut();
    let Some(intel) = read_cfg(sysvol, INTEL_IDX)? else {
        return Err(DeltaError::MissingFile("intel.cfg"));
    };
    let mut fitc = fitc_from_intel_and_delta(&intel, delta)?;
    apply_payload(&mut fitc, payload)?;
    install_fitc(sysvol, &fitc.generate(Alignment::End))?;
    Ok(mfs.generate()?)
}

#[cfg(test)]
fn test_intel() -> Cfg {
    let dir: Mode = "d---rwxr-x---".parse().unwrap();
    let file: Mode = "----rw-r-----".parse().unwrap();
    let f: Opt = "---F".parse().unwrap();
    let none = Opt::new();
    let mut cfg = Cfg::new();
    cfg.add_file("/home/", &[], dir, none, 0, 0).unwrap();
    cfg.add_file("/home/mca/", &[], dir, none, 0, 0).unwrap();
    cfg.add_file("/home/mca/eom", &[1], EOM_MODE, EOM_OPT, 0, 238).unwrap();
    cfg.add_file("/home/bup/", &[], dir, none, 3, 351).unwrap();
    cfg.add_file("/home/bup/ct", b"default", file, f, 3, 351).unwrap();
    cfg.add_file("/home/policy", b"fixed", file, none, 0, 0).unwrap();
    cfg
}

#[cfg(test)]
fn test_sysvol(intel: &Cfg, fitc: Option<&Cfg>) -> SystemVolume {
    let mut sv = crate::mfs::volume::test_volume(256, 2);
    sv.add_file(INTEL_IDX, &intel.generate(Alignment::None), true)
        .unwrap();
    if let Some(fitc) = fitc {
        sv.add_file(FITC_IDX, &fitc.generate(Alignment::End), true)
            .unwrap();
    }
    sv
}

#[test]
fn payload_modes() {
    assert_eq!(EOM_MODE, " --Irw-r-----".parse::<Mode>().unwrap());
    assert_eq!(EOM_OPT, "?!-F".parse::<Opt>().unwrap());
    assert_eq!(CT_MODE, " ---rwxr-----".parse::<Mode>().unwrap());
    assert_eq!(CT_OPT, "?--F".parse::<Opt>().unwrap());
}

#[test]
fn delta_from_fitc() {
    let intel = test_intel();
    let mut delta = Delta::default();
    delta.insert("/home/bup/ct", b"vendor".to_vec());
    let fitc = fitc_from_intel_and_delta(&intel, &delta).unwrap();
    let paths: Vec<&str> = fitc.files().map(|n| n.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["/home", "/home/mca", "/home/mca/eom", "/home/bup", "/home/bup/ct"]
    );
    assert_eq!(fitc.get_file("/home/bup/ct").unwrap().data, b"vendor");
    assert_eq!(fitc.get_file("/home/mca/eom").unwrap().data, &[1]);

    let sv = test_sysvol(&intel, Some(&fitc));
    assert_eq!(generate_delta(&sv).unwrap(), delta);
}

#[test]
fn unexpected_fitc_content() {
    let intel = test_intel();
    let mut fitc = fitc_from_intel_and_delta(&intel, &Delta::default()).unwrap();
    let file: Mode = "----rw-r-----".parse().unwrap();
    fitc.add_file("/home/policy", b"changed", file, Opt::new(), 0, 0)
        .unwrap();
    let sv = test_sysvol(&intel, Some(&fitc));
    match generate_delta(&sv) {
        Err(DeltaError::UnexpectedContent(p)) => assert_eq!(p, vec!["/home/policy"]),
        r => panic!("unexpected result {r:?}"),
    }
}

#[test]
fn delta_from_home() {
    use crate::mfs::file::{INTEGRITY_BLOB_SIZE, test_dir_entry};

    let intel = test_intel();
    let mut sv = test_sysvol(&intel, None);
    assert!(matches!(
        generate_delta(&sv),
        Err(DeltaError::MissingFile(_))
    ));

    let mut home = Vec::new();
    home.extend(test_dir_entry(8, ".", true, true));
    home.extend(test_dir_entry(20, "bup", true, false));
    home.extend(test_dir_entry(22, "policy", false, false));
    home.extend([0; INTEGRITY_BLOB_SIZE]);
    sv.add_file(HOME_IDX, &home, true).unwrap();
    let bup = test_dir_entry(21, "ct", false, false);
    sv.add_file(20, &bup, true).unwrap();
    sv.add_file(21, b"from home", true).unwrap();
    sv.add_file(22, b"ignored", true).unwrap();

    let delta = generate_delta(&sv).unwrap();
    let files: Vec<(&str, &[u8])> = delta.files().collect();
    assert_eq!(files, vec![("/home/bup/ct", &b"from home"[..])]);
}

#[test]
fn apply_to_mfs() {
    let intel = test_intel();
    let mut sv = test_sysvol(&intel, None);
    sv.add_file(HOME_IDX, &[0; 24], true).unwrap();
    let image = crate::mfs::test_image(sv, true);
    let mut mfs = Mfs::parse(&image).unwrap();

    let mut delta = Delta::default();
    delta.insert("/home/bup/ct", b"vendor".to_vec());
    delta.insert("/home/policy", b"not overridable".to_vec());
    let payload = [0xcc; 100];
    let out = apply_delta(&mut mfs, &delta, &payload).unwrap();
    assert_eq!(out.len(), image.len());

    let mfs = Mfs::parse(&out).unwrap();
    let sv = mfs.system_volume();
    assert!(sv.get_file(HOME_IDX).is_none());
    let f = sv.get_file(FITC_IDX).unwrap();
    // Allocated from the end
    assert_eq!(*f.chain.first().unwrap(), sv.chunk_id(sv.data_ids.len() - 1));

    let fitc = Cfg::parse(&f.data).unwrap();
    let ct = fitc.get_file(CT_PATH).unwrap();
    assert_eq!(ct.data, payload);
    assert_eq!((ct.record.uid, ct.record.gid), (CT_UID, CT_GID));
    assert_eq!(ct.record.mode, CT_MODE);
    assert_eq!((ct.record.offset + ct.record.size as u32) % 0x40, 0);
    let eom = fitc.get_file(EOM_PATH).unwrap();
    assert_eq!(eom.data, &[0]);
    assert_eq!(eom.record.opt, EOM_OPT);
    assert!(fitc.get_file("/home/policy").is_none());
}

#[test]
fn store_and_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut delta = Delta::default();
    delta.insert("/home/bup/ct", b"one".to_vec());
    delta.insert("/home/mca/eom", vec![0]);
    delta.insert("/home/x", vec![]);
    delta.store(dir.path()).unwrap();
    assert!(dir.path().join("home/bup/ct").is_file());
    assert_eq!(Delta::load(dir.path()).unwrap(), delta);
}
