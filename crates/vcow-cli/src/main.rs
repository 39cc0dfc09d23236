#![forbid(unsafe_code)]
//! Operator tooling for vcow targets.
//!
//! Cow images must be zeroed before their first activation; `vcow init`
//! performs the zeroing. The `read`/`write`/`status` commands activate a
//! target over two image files and drive it the way a host framework
//! would, splitting I/O at chunk boundaries.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use vcow_block::{Bio, FileSectorDevice, SectorDevice, WriteMode};
use vcow_target::{CowTarget, TargetConfig};
use vcow_types::{METADATA_SECTORS, SECTOR_SIZE, Sector};

#[derive(Parser)]
#[command(name = "vcow", about = "Copy-on-write virtual block device toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Zero a cow image's reserved metadata region, making it safe to
    /// activate against any origin.
    Init {
        /// Path to the cow image.
        cow: PathBuf,
    },
    /// Activate a target and print its redirection state.
    Status {
        /// Path to the origin image.
        origin: PathBuf,
        /// Path to the cow image.
        cow: PathBuf,
    },
    /// Read sectors from the virtual device and hex-dump them.
    Read {
        /// Path to the origin image.
        origin: PathBuf,
        /// Path to the cow image.
        cow: PathBuf,
        /// First sector to read.
        #[arg(long)]
        sector: u64,
        /// Number of sectors.
        #[arg(long, default_value_t = 1)]
        sectors: u64,
    },
    /// Fill sectors of the virtual device with a byte value.
    Write {
        /// Path to the origin image.
        origin: PathBuf,
        /// Path to the cow image.
        cow: PathBuf,
        /// First sector to write.
        #[arg(long)]
        sector: u64,
        /// Number of sectors.
        #[arg(long, default_value_t = 1)]
        sectors: u64,
        /// Fill byte (decimal or 0x-prefixed hex).
        #[arg(long, value_parser = parse_byte)]
        fill: u8,
    },
}

fn parse_byte(s: &str) -> std::result::Result<u8, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("not a byte value: {s}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init { cow } => init(&cow),
        Command::Status { origin, cow } => {
            let target = activate(&origin, &cow)?;
            let status = target.status();
            println!("length:        {} sectors", status.len_sectors);
            println!("chunks:        {}", status.nr_chunks);
            println!("chunks on cow: {}", status.chunks_on_cow);
            println!("free job slots: {}", status.free_job_records);
            target.shutdown();
            Ok(())
        }
        Command::Read {
            origin,
            cow,
            sector,
            sectors,
        } => {
            let target = activate(&origin, &cow)?;
            let data = read(&target, sector, sectors)?;
            hex_dump(sector, &data);
            target.shutdown();
            Ok(())
        }
        Command::Write {
            origin,
            cow,
            sector,
            sectors,
            fill,
        } => {
            let target = activate(&origin, &cow)?;
            write(&target, sector, sectors, fill)?;
            println!("wrote {sectors} sector(s) of {fill:#04x} at sector {sector}");
            target.shutdown();
            Ok(())
        }
    }
}

fn init(cow: &Path) -> Result<()> {
    let dev = FileSectorDevice::open(cow)
        .with_context(|| format!("opening cow image {}", cow.display()))?;
    if dev.len_sectors() < METADATA_SECTORS {
        bail!(
            "cow image too small: {} sectors, need at least {METADATA_SECTORS}",
            dev.len_sectors()
        );
    }
    let zeroes = vec![0_u8; METADATA_SECTORS as usize * SECTOR_SIZE];
    dev.write_sectors(Sector(0), &zeroes, WriteMode::Fua)
        .context("zeroing metadata region")?;
    println!("initialized {}", cow.display());
    Ok(())
}

fn activate(origin: &Path, cow: &Path) -> Result<CowTarget> {
    let origin = origin.to_str().context("origin path is not UTF-8")?;
    let cow = cow.to_str().context("cow path is not UTF-8")?;
    CowTarget::activate(&[origin, cow], TargetConfig::default()).context("activating target")
}

fn read(target: &CowTarget, start: u64, sectors: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((sectors as usize) * SECTOR_SIZE);
    for (piece_start, piece_sectors) in chunk_pieces(start, sectors) {
        let (bio, rx) = Bio::read(Sector(piece_start), piece_sectors as usize * SECTOR_SIZE);
        target.handle(bio);
        let done = rx.recv().context("target dropped the request")?;
        done.result.context("read failed")?;
        out.extend_from_slice(&done.data);
    }
    Ok(out)
}

fn write(target: &CowTarget, start: u64, sectors: u64, fill: u8) -> Result<()> {
    for (piece_start, piece_sectors) in chunk_pieces(start, sectors) {
        let payload = vec![fill; piece_sectors as usize * SECTOR_SIZE];
        let (bio, rx) = Bio::write(Sector(piece_start), payload);
        target.handle(bio);
        let done = rx.recv().context("target dropped the request")?;
        done.result.context("write failed")?;
    }
    Ok(())
}

/// Split `[start, start + sectors)` at chunk boundaries, honoring the
/// target's declared maximum I/O size.
fn chunk_pieces(start: u64, sectors: u64) -> Vec<(u64, u64)> {
    let mut pieces = Vec::new();
    let mut cursor = start;
    let end = start + sectors;
    while cursor < end {
        let chunk_end = (Sector(cursor).chunk().0 + 1) * CowTarget::MAX_IO_SECTORS;
        let piece_end = chunk_end.min(end);
        pieces.push((cursor, piece_end - cursor));
        cursor = piece_end;
    }
    pieces
}

fn hex_dump(start_sector: u64, data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        let offset = start_sector * SECTOR_SIZE as u64 + (i as u64) * 16;
        let bytes: Vec<String> = row.iter().map(|b| format!("{b:02x}")).collect();
        println!("{offset:08x}  {}", bytes.join(" "));
    }
}
