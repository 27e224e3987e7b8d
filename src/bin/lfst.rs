//! lfst: tar-style manipulation of littlefs filesystem images

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use lfstool::ImageEngine;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "lfst",
    about = "Manipulate littlefs filesystem images",
    disable_version_flag = true,
    arg_required_else_help = false
)]
struct Cli {
    /// Create (format) an image and add files
    #[arg(short = 'c', long)]
    create: bool,

    /// Append (add) files to an existing image
    #[arg(short = 'r', long)]
    append: bool,

    /// Remove files from an image
    #[arg(short = 'd', long)]
    delete: bool,

    /// List image contents
    #[arg(short = 't', long)]
    list: bool,

    /// Extract files from an image
    #[arg(short = 'x', long)]
    extract: bool,

    /// Image file
    #[arg(short = 'f', long = "file", value_name = "IMAGE")]
    file: Option<PathBuf>,

    /// Block size (K/M suffixes accepted)
    #[arg(short = 'b', long = "block-size", value_name = "SIZE", value_parser = parse_size)]
    block_size: Option<u64>,

    /// Image size for --create (K/M/G suffixes accepted)
    #[arg(short = 's', long = "size", value_name = "SIZE", value_parser = parse_size)]
    size: Option<u64>,

    /// Byte offset of the image inside the backing store
    #[arg(short = 'o', long = "offset", value_name = "BYTES", value_parser = parse_size)]
    offset: Option<u64>,

    /// Change to this directory before resolving relative paths
    #[arg(short = 'C', long = "directory", value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Overwrite existing files when extracting
    #[arg(short = 'O', long)]
    overwrite: bool,

    /// Verbose output
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Print version information and exit
    #[arg(short = 'V', long)]
    version: bool,

    /// Entry names the command applies to
    #[arg(value_name = "NAME")]
    names: Vec<String>,
}

/// Parse "4096", "64K", "256M", "1G".
fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 10),
        Some('m') | Some('M') => (&s[..s.len() - 1], 20),
        Some('g') | Some('G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size: {}", s))?;
    value
        .checked_shl(shift)
        .filter(|v| shift == 0 || *v >> shift == value)
        .ok_or_else(|| format!("size overflows: {}", s))
}

fn print_version() {
    println!("lfst v{}  littlefs image tool", lfstool::VERSION);
    println!("License: MIT OR Apache-2.0.");
    println!("This program comes with absolutely no warranty.");
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.version {
        print_version();
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("lfst: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let commands = [cli.create, cli.append, cli.delete, cli.list, cli.extract];
    match commands.iter().filter(|&&c| c).count() {
        0 => bail!("no command specified (one of -c, -r, -d, -t, -x)"),
        1 => {}
        _ => bail!("commands are mutually exclusive, give exactly one"),
    }

    let image = cli
        .file
        .clone()
        .context("no image file specified (-f <imagefile>)")?;
    let block_size = cli
        .block_size
        .map(|b| u32::try_from(b).context("block size too large"))
        .transpose()?;
    let base = cli.directory.clone().unwrap_or_else(|| PathBuf::from("."));

    if cli.list {
        let mut engine = ImageEngine::open(&image, block_size, cli.offset)
            .with_context(|| format!("cannot open {}", image.display()))?;
        let sb = engine.superblock().clone();
        if cli.verbose > 0 {
            println!("blocksize is {} ({} blocks)", sb.block_size, sb.block_count);
        }
        for entry in engine.list()? {
            if cli.verbose > 0 {
                let kind = if entry.is_dir { 'd' } else { '-' };
                println!("{} {:>10} ./{}", kind, entry.size, entry.path);
            } else {
                println!("./{}", entry.path);
            }
        }
        return Ok(true);
    }

    if cli.extract {
        let mut engine = ImageEngine::open(&image, block_size, cli.offset)
            .with_context(|| format!("cannot open {}", image.display()))?;
        let report = engine.extract(&cli.names, &base, cli.overwrite)?;
        for path in &report.affected {
            println!("./{}", path);
        }
        for path in &report.skipped {
            eprintln!("lfst: {}: exists, not overwriting (use -O)", path);
        }
        for path in &report.missing {
            eprintln!("lfst: {}: not found in image", path);
        }
        return Ok(report.ok());
    }

    if cli.delete {
        let mut engine = ImageEngine::open(&image, block_size, cli.offset)
            .with_context(|| format!("cannot open {}", image.display()))?;
        let report = engine.delete(&cli.names)?;
        for path in &report.affected {
            println!("./{}", path);
        }
        for path in &report.missing {
            eprintln!("lfst: {}: not found in image", path);
        }
        return Ok(report.ok());
    }

    // create / append
    let mut engine = if cli.create {
        let size = cli.size.context("no image size specified (-s <size>)")?;
        let block_size = block_size.unwrap_or(4096);
        ImageEngine::create(&image, size, block_size, cli.offset.unwrap_or(0))
            .with_context(|| format!("cannot create {}", image.display()))?
    } else {
        ImageEngine::open(&image, block_size, cli.offset)
            .with_context(|| format!("cannot open {}", image.display()))?
    };

    let sources: Vec<(PathBuf, String)> = cli
        .names
        .iter()
        .map(|name| (base.join(name), name.clone()))
        .collect();
    // Appending replaces entries that already exist; creating must not
    // see the same target path twice.
    let added = engine.insert(&sources, cli.append)?;
    for path in &added {
        println!("./{}", path);
    }
    Ok(true)
}
