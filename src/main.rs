//! Tool to inspect and edit the Intel ME flash file system
//!
//! The MFS holds the runtime data and configuration of the (CS)ME. Some of
//! its files are CFG archives, in particular the default configuration
//! (`intel.cfg`) and the vendor configuration (`fitc.cfg`). A vendor image
//! is described by a delta of the overridable files against the defaults,
//! which can be applied to another image together with a custom payload.

use std::error::Error;
use std::fs;
use std::path::Path;

use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, error, info};

mod show;

use intel_mfs::{
    Firmware,
    cfg::{Alignment, Cfg, CfgError, Mode, Opt},
    delta::{self, Delta},
    mfs::{Mfs, MfsError},
};

type Res = Result<(), Box<dyn Error>>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Align {
    None,
    Start,
    End,
}

impl From<Align> for Alignment {
    fn from(a: Align) -> Self {
        match a {
            Align::None => Alignment::None,
            Align::Start => Alignment::Start,
            Align::End => Alignment::End,
        }
    }
}

#[derive(Subcommand, Debug)]
enum MeCommand {
    /// Display the flash regions and the ME partition table
    Show {
        /// File to read (full image or ME region)
        file_name: String,
    },
}

#[derive(Subcommand, Debug)]
enum MfsCommand {
    /// Display pages and files
    Dump {
        /// Print as JSON
        #[clap(long, short)]
        json: bool,
        /// Treat the file as a full image or ME region, not a bare MFS
        #[clap(long, short)]
        image: bool,
        /// File to read
        file_name: String,
    },
    /// Write every file to a directory, named `file_<id>.bin`
    Export {
        #[clap(long, short)]
        image: bool,
        /// Directory to write to
        #[clap(long, short = 'O')]
        output: String,
        file_name: String,
    },
    /// Write a single file
    Extract {
        #[clap(long, short)]
        image: bool,
        /// File id
        #[clap(long, short = 'n')]
        id: usize,
        #[clap(long, short = 'O')]
        output: String,
        file_name: String,
    },
    /// Add a file, replacing one with the same id (written back in place)
    Add {
        #[clap(long, short)]
        image: bool,
        #[clap(long, short = 'n')]
        id: usize,
        /// File with the content to add
        #[clap(long, short = 'I')]
        input: String,
        /// Pack into the lowest free chunks instead of the highest
        #[clap(long, short)]
        optimize: bool,
        file_name: String,
    },
    /// Remove a file (written back in place)
    Remove {
        #[clap(long, short)]
        image: bool,
        #[clap(long, short = 'n')]
        id: usize,
        file_name: String,
    },
}

#[derive(Subcommand, Debug)]
enum CfgCommand {
    /// Display all records
    Dump {
        #[clap(long, short)]
        json: bool,
        /// CFG file to read
        file_name: String,
    },
    /// Write the tree to a directory
    Export {
        #[clap(long, short = 'O')]
        output: String,
        file_name: String,
    },
    /// Write a single file
    Extract {
        /// Absolute path within the archive
        #[clap(long, short)]
        path: String,
        #[clap(long, short = 'O')]
        output: String,
        file_name: String,
    },
    /// Add a file or, with a trailing `/` on the path, a directory
    Add {
        #[clap(long, short)]
        path: String,
        /// File with the content to add
        #[clap(long, short = 'I')]
        input: Option<String>,
        #[clap(long, short, default_value = "----rwxrwxrwx")]
        mode: Mode,
        #[clap(long, default_value = "----")]
        opt: Opt,
        #[clap(long, short, default_value_t = 0)]
        uid: u16,
        #[clap(long, short, default_value_t = 0)]
        gid: u16,
        #[clap(long, short, value_enum, default_value_t = Align::None)]
        alignment: Align,
        file_name: String,
    },
    /// Remove a file or directory
    Remove {
        #[clap(long, short)]
        path: String,
        /// Remove a directory with everything in it
        #[clap(long, short)]
        recursive: bool,
        #[clap(long, short, value_enum, default_value_t = Align::None)]
        alignment: Align,
        file_name: String,
    },
}

#[derive(Subcommand, Debug)]
enum DeltaCommand {
    /// Extract the vendor configuration delta of an image
    Generate {
        /// Full image or ME region
        #[clap(long, short = 'I')]
        input: String,
        /// Directory to write the delta to
        #[clap(long, short = 'O')]
        output: String,
    },
    /// Build a new vendor configuration from a delta and a payload
    Apply {
        #[clap(long, short = 'I')]
        input: String,
        /// Directory holding the delta
        #[clap(long, short)]
        delta: String,
        /// Payload to store as the trace hub configuration
        #[clap(long, short)]
        payload: String,
        #[clap(long, short = 'O')]
        output: String,
    },
}

#[derive(Parser)]
enum Command {
    /// Analyze the ME region
    #[command(subcommand)]
    Me(MeCommand),
    /// Inspect and edit the ME flash file system
    #[command(subcommand)]
    Mfs(MfsCommand),
    /// Inspect and edit CFG archives
    #[command(subcommand)]
    Cfg(CfgCommand),
    /// Vendor configuration deltas
    #[command(subcommand)]
    Delta(DeltaCommand),
}

/// Inspect and modify the Intel ME flash file system
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Command to run
    #[command(subcommand)]
    cmd: Command,
    #[clap(long, short, action)]
    debug: bool,
    #[clap(long, short, action)]
    verbose: bool,
}

/// An MFS read from a bare partition dump or from within an image.
struct Source {
    file_name: String,
    fw: Option<Firmware>,
    mfs: Mfs,
}

impl Source {
    fn load(file_name: &str, image: bool) -> Result<Self, Box<dyn Error>> {
        info!("Reading {file_name}...");
        let data = fs::read(file_name)?;
        let (fw, mfs) = if image {
            let fw = Firmware::parse(&data)?;
            let mfs = fw.mfs()?;
            (Some(fw), mfs)
        } else {
            (None, Mfs::parse(&data)?)
        };
        Ok(Self {
            file_name: file_name.to_string(),
            fw,
            mfs,
        })
    }

    fn store(mut self) -> Res {
        let data = match &mut self.fw {
            Some(fw) => {
                fw.write_mfs(&mut self.mfs)?;
                fw.to_vec()
            }
            None => self.mfs.generate()?,
        };
        fs::write(&self.file_name, data)?;
        info!("Written to {}", self.file_name);
        Ok(())
    }
}

fn export_mfs(mfs: &Mfs, dir: &Path) -> Res {
    fs::create_dir_all(dir)?;
    for f in mfs.system_volume().files() {
        let p = dir.join(format!("file_{}.bin", f.id));
        debug!("{}: {} bytes", p.display(), f.len());
        fs::write(p, &f.data)?;
    }
    Ok(())
}

fn export_cfg(cfg: &Cfg, dir: &Path) -> Res {
    for n in cfg.files() {
        let p = dir.join(n.path.trim_start_matches('/'));
        if n.is_directory() {
            fs::create_dir_all(&p)?;
        } else {
            if let Some(parent) = p.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&p, &n.data)?;
        }
    }
    Ok(())
}

fn read_cfg(file_name: &str) -> Result<Cfg, Box<dyn Error>> {
    info!("Reading {file_name}...");
    Ok(Cfg::parse(&fs::read(file_name)?)?)
}

fn run_me(cmd: MeCommand, verbose: bool) -> Res {
    match cmd {
        MeCommand::Show { file_name } => {
            let data = fs::read(file_name)?;
            let fw = Firmware::parse(&data)?;
            show::show(&fw, verbose);
        }
    }
    Ok(())
}

fn run_mfs(cmd: MfsCommand) -> Res {
    match cmd {
        MfsCommand::Dump {
            json,
            image,
            file_name,
        } => {
            let src = Source::load(&file_name, image)?;
            show::show_mfs(&src.mfs, json);
        }
        MfsCommand::Export {
            image,
            output,
            file_name,
        } => {
            let src = Source::load(&file_name, image)?;
            export_mfs(&src.mfs, Path::new(&output))?;
            info!("Exported to {output}");
        }
        MfsCommand::Extract {
            image,
            id,
            output,
            file_name,
        } => {
            let src = Source::load(&file_name, image)?;
            let Some(f) = src.mfs.system_volume().get_file(id) else {
                return Err(MfsError::FileNotFound(id).into());
            };
            fs::write(&output, &f.data)?;
            info!("Written {} bytes to {output}", f.len());
        }
        MfsCommand::Add {
            image,
            id,
            input,
            optimize,
            file_name,
        } => {
            let data = fs::read(input)?;
            let mut src = Source::load(&file_name, image)?;
            let sv = src.mfs.system_volume_mut();
            if sv.remove_file(id) {
                info!("Replacing file {id}");
            }
            sv.add_file(id, &data, optimize)?;
            src.store()?;
        }
        MfsCommand::Remove {
            image,
            id,
            file_name,
        } => {
            let mut src = Source::load(&file_name, image)?;
            if !src.mfs.system_volume_mut().remove_file(id) {
                return Err(MfsError::FileNotFound(id).into());
            }
            src.store()?;
        }
    }
    Ok(())
}

fn run_cfg(cmd: CfgCommand) -> Res {
    match cmd {
        CfgCommand::Dump { json, file_name } => {
            let cfg = read_cfg(&file_name)?;
            show::show_cfg(&cfg, json);
        }
        CfgCommand::Export { output, file_name } => {
            let cfg = read_cfg(&file_name)?;
            export_cfg(&cfg, Path::new(&output))?;
            info!("Exported to {output}");
        }
        CfgCommand::Extract {
            path,
            output,
            file_name,
        } => {
            let cfg = read_cfg(&file_name)?;
            let Some(n) = cfg.get_file(&path) else {
                return Err(CfgError::NotFound(path).into());
            };
            fs::write(&output, &n.data)?;
        }
        CfgCommand::Add {
            path,
            input,
            mode,
            opt,
            uid,
            gid,
            alignment,
            file_name,
        } => {
            let mut cfg = read_cfg(&file_name)?;
            let data = match input {
                Some(i) => fs::read(i)?,
                None => Vec::new(),
            };
            let mode = if path.ends_with('/') {
                mode.with_directory(true)
            } else {
                mode
            };
            cfg.add_file(&path, &data, mode, opt, uid, gid)?;
            fs::write(&file_name, cfg.generate(alignment.into()))?;
        }
        CfgCommand::Remove {
            path,
            recursive,
            alignment,
            file_name,
        } => {
            let mut cfg = read_cfg(&file_name)?;
            cfg.remove_file(&path, recursive)?;
            fs::write(&file_name, cfg.generate(alignment.into()))?;
        }
    }
    Ok(())
}

fn run_delta(cmd: DeltaCommand) -> Res {
    match cmd {
        DeltaCommand::Generate { input, output } => {
            let src = Source::load(&input, true)?;
            let d = delta::generate_delta(src.mfs.system_volume())?;
            for (path, data) in d.files() {
                info!("  {path}: {} bytes", data.len());
            }
            d.store(Path::new(&output))?;
            info!("Delta written to {output}");
        }
        DeltaCommand::Apply {
            input,
            delta: delta_dir,
            payload,
            output,
        } => {
            let d = Delta::load(Path::new(&delta_dir))?;
            let payload = fs::read(payload)?;
            let mut src = Source::load(&input, true)?;
            delta::apply_delta(&mut src.mfs, &d, &payload)?;
            src.file_name = output;
            src.store()?;
        }
    }
    Ok(())
}

fn main() {
    let Cli {
        cmd,
        debug,
        verbose,
    } = Cli::parse();
    // Default to log level "info". Otherwise, you get no "regular" logs.
    let level = if debug { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::Builder::from_env(env).init();

    let res = match cmd {
        Command::Me(cmd) => run_me(cmd, verbose),
        Command::Mfs(cmd) => run_mfs(cmd),
        Command::Cfg(cmd) => run_cfg(cmd),
        Command::Delta(cmd) => run_delta(cmd),
    };
    if let Err(e) = res {
        error!("{e}");
        std::process::exit(1);
    }
}
