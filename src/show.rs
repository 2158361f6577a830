use log::{error, info};
use serde::Serialize;

use intel_mfs::{Firmware, cfg::Cfg, mfs::Mfs};

fn print_json<T: Serialize>(v: &T) {
    match serde_json::to_string_pretty(v) {
        Ok(s) => println!("{s}"),
        Err(e) => error!("Could not serialize: {e}"),
    }
}

pub fn show(fw: &Firmware, verbose: bool) {
    if verbose {
        println!("{fw:#02x?}");
    }
    println!();
    match &fw.ifd {
        Some(ifd) => println!("{ifd}"),
        None => info!("No flash descriptor, showing a bare ME region"),
    }
    println!("{}", fw.me);
}

pub fn show_mfs(mfs: &Mfs, json: bool) {
    if json {
        print_json(mfs);
    } else {
        println!("{mfs}");
    }
}

pub fn show_cfg(cfg: &Cfg, json: bool) {
    if json {
        print_json(cfg);
    } else {
        print!("{cfg}");
    }
}
