use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;

use ngaro::config::{IMAGE_CACHE_SIZE, IMAGE_SIZE};
use ngaro::{
    assemble, encode_cells, Devices, FilePersistence, FileStorage, RomImage, SectorImage,
    StdConsole, Vm, VmConfig,
};

/// Run an Ngaro image from a file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Image file, used as the block device
    #[arg(default_value = "retroImage16")]
    image: PathBuf,

    /// Assemble this source file into the image before running
    #[arg(short, long)]
    assemble: Option<PathBuf>,

    /// Only assemble, do not run
    #[arg(long, requires = "assemble")]
    no_run: bool,

    /// Run from memory; stores never reach the file
    #[arg(short, long)]
    read_only: bool,

    /// Entries in the cell cache
    #[arg(short, long, default_value_t = IMAGE_CACHE_SIZE)]
    cache_size: usize,

    /// Addressable cells
    #[arg(long, default_value_t = IMAGE_SIZE)]
    image_size: i16,

    /// File used by the image save and load commands
    #[arg(short, long)]
    save_file: Option<PathBuf>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    if let Some(source) = &args.assemble {
        let program = fs::read_to_string(source)
            .with_context(|| format!("failed to read {}", source.display()))?;
        let cells = assemble(&program)
            .with_context(|| format!("failed to assemble {}", source.display()))?;
        let mut bytes = Vec::with_capacity(cells.len() * 2);
        encode_cells(&cells, &mut bytes)?;
        fs::write(&args.image, bytes)
            .with_context(|| format!("failed to write {}", args.image.display()))?;
        if args.no_run {
            return Ok(());
        }
    }

    let config = VmConfig {
        image_size: args.image_size,
        cache_size: args.cache_size,
        ..VmConfig::default()
    };

    let mut devices = Devices::new(StdConsole);
    if let Some(path) = &args.save_file {
        devices = devices.with_persistence(FilePersistence::new(path));
    }

    if args.read_only {
        let bytes = fs::read(&args.image)
            .with_context(|| format!("failed to read {}", args.image.display()))?;
        Vm::new(config, RomImage::from_bytes(&bytes), devices)?.run()
    } else {
        let store = SectorImage::open(FileStorage::new(&args.image), config.retry_delay)
            .with_context(|| format!("failed to open {}", args.image.display()))?;
        Vm::new(config, store, devices)?.run()
    }
}
