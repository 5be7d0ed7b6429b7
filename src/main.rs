use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use btrfs_kit::{Btrfs, ReadSeek};

/// Inspect an unmounted btrfs filesystem.
///
/// Each available block device or image file belonging to the filesystem
/// should be specified on the command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    #[clap(required = true)]
    paths: Vec<PathBuf>,

    /// List this directory instead of the filesystem root
    #[arg(long)]
    list: Option<String>,

    /// Write a file's contents to stdout
    #[arg(long)]
    cat: Option<String>,

    /// Enumerate subvolumes
    #[arg(long)]
    subvolumes: bool,

    /// Walk a tree by objectid and print every item key
    #[arg(long)]
    dump_tree: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Params::parse();

    let mut streams: Vec<Box<dyn ReadSeek>> = Vec::new();
    for path in &args.paths {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        streams.push(Box::new(file));
    }
    let fs = Btrfs::open(streams)?;

    if let Some(path) = &args.cat {
        let mut stream = fs.get(path)?.open()?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        io::stdout().write_all(&buf)?;
        return Ok(());
    }

    if args.subvolumes {
        for subvolume in fs.subvolumes() {
            let subvolume = subvolume?;
            println!("{}\t{}", subvolume.objectid(), subvolume.path()?);
        }
        return Ok(());
    }

    if let Some(objectid) = args.dump_tree {
        let tree = fs.open_tree(objectid)?;
        for entry in tree.cursor().walk(None, None, None) {
            let (item, data) = entry?;
            println!("{:?} size {}", item.key, data.len());
        }
        return Ok(());
    }

    println!("label: {}", fs.label());
    println!("uuid: {}", fs.uuid());
    println!("metadata uuid: {}", fs.metadata_uuid());
    println!("generation: {}", fs.generation());
    println!("sector size: {}", fs.sector_size());
    println!("node size: {}", fs.node_size());
    println!("stripe size: {}", fs.stripe_size());
    println!("devices: {}", fs.num_devices());

    let dir = match &args.list {
        Some(path) => fs.get(path)?,
        None => fs.root()?,
    };
    for entry in dir.iterdir()? {
        let (name, inode) = entry?;
        println!("{:o}\t{}\t{}", inode.mode()?, inode.size()?, name);
    }
    Ok(())
}
