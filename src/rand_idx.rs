// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! rand_idx — shuffles a group index file in place, de-biasing the scan
//! order of the group.

use adiskd::store::group::{self, GroupId};
use adiskd::store::DEFAULT_OBJ_DIR;
use clap::Parser;
use std::path::PathBuf;

/// Shuffle the on-disk object order of a group.
#[derive(Parser)]
#[command(name = "rand_idx", version)]
struct Args {
    /// Gid of the group to modify (e.g. 01:23:45:67:89:AB:CD:EF)
    #[arg(short = 'g')]
    gid: String,

    /// Object directory holding the index
    #[arg(long, default_value = DEFAULT_OBJ_DIR)]
    dir: PathBuf,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(0);
        }
    };

    let gid = match args.gid.parse::<GroupId>() {
        Ok(gid) => gid,
        Err(_) => {
            eprintln!("bad gid {:?}, expected AA:BB:CC:DD:EE:FF:00:11 form", args.gid);
            std::process::exit(1);
        }
    };

    let path = gid.idx_path(&args.dir);

    let mut entries = match group::read_index(&path) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("unable to read index {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    group::shuffle_index(&mut entries);

    if let Err(e) = group::write_index(&path, &entries) {
        eprintln!("unable to rewrite index {}: {e}", path.display());
        std::process::exit(1);
    }

    println!("shuffled {} entries in {}", entries.len(), path.display());
}
