//! farc - create, inspect and stream FARC archives.
//!
//! `create` builds an archive from files and directories, `list` prints its
//! table of contents and `hash` streams a file through the request queue,
//! either from an archive or straight from disk.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use streamer::{
    archive::{ArchiveEngine, ArchiveWriter},
    codec::Compression,
    fileio::FileIo,
    queue::STREAMER_BUFFER_SIZE,
    OpenMode, Streamer, StreamerConfig,
};

/// farc
#[derive(Debug, Parser)]
#[clap(name = "farc", version)]
struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default)]
enum Codec {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl From<Codec> for Compression {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::None => Compression::None,
            Codec::Lz4 => Compression::Lz4,
            Codec::Zstd => Compression::Zstd,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build an archive from files and directories
    Create {
        /// Block codec used for file data and the TOC
        #[clap(short = 'z', long, value_enum, default_value_t = Codec::Lz4)]
        compression: Codec,
        /// Start every file on a 2048-byte boundary
        #[clap(short = 's', long)]
        sector_align: bool,
        /// Print every file as it is added
        #[clap(short, long)]
        verbose: bool,
        /// The archive to write
        archive: PathBuf,
        /// Files and directories to add, stored under their base names
        #[clap(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print the table of contents of an archive
    List { archive: PathBuf },
    /// Stream a file and print its SHA-256, as `ARCHIVE:FILE` or a plain path
    Hash { file: String },
}

/// Splits a path into the directory a [`FileIo`] is rooted at and the name
/// opened below it.
fn split_path(path: &Path) -> Result<(PathBuf, String)> {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("Not a file name: {path:?}");
    };
    let root = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((root, name.to_string()))
}

fn create(
    archive: &Path,
    paths: &[PathBuf],
    compression: Compression,
    aligned: bool,
    verbose: bool,
) -> Result<()> {
    let mut writer = ArchiveWriter::new(compression).aligned(aligned);
    for path in paths {
        writer
            .add_path(path)
            .with_context(|| format!("Failed to add {path:?}"))?;
    }

    let (dir, _) = split_path(archive)?;
    let mut output = NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temporary file in {dir:?}"))?;
    let written = writer
        .write(output.as_file_mut())
        .with_context(|| format!("Failed to write {archive:?}"))?;
    output
        .persist(archive)
        .with_context(|| format!("Failed to create {archive:?}"))?;

    if verbose {
        let mut stdout = io::stdout().lock();
        for entry in &written {
            writeln!(
                stdout,
                "{} ({} -> {} bytes)",
                entry.path, entry.original, entry.compressed
            )?;
        }
    }
    debug!("wrote {} files to {archive:?}", written.len());
    Ok(())
}

fn list(archive: &Path) -> Result<()> {
    let (root, name) = split_path(archive)?;
    let engine = ArchiveEngine::new(FileIo::new(root), &name)
        .with_context(|| format!("Failed to read archive {archive:?}"))?;

    let layout = engine.layout();
    let mut stdout = io::stdout().lock();
    engine.toc().list(&mut stdout)?;
    writeln!(
        stdout,
        "TOC: {} bytes, {} stored ({}); data starts at {}, footer at {}",
        layout.toc_original, layout.toc_stored, layout.toc_compression, layout.base, layout.footer
    )?;
    Ok(())
}

/// Streams `target` through a [`Streamer`] and returns the digest and length.
fn hash(target: &str) -> Result<([u8; 32], u64)> {
    let (config, file) = match target.split_once(':') {
        Some((archive, file)) => {
            let (root, name) = split_path(Path::new(archive))?;
            (StreamerConfig::archive(root, name), file.to_string())
        }
        None => {
            let (root, name) = split_path(Path::new(target))?;
            (StreamerConfig::direct(root), name)
        }
    };

    let streamer = Streamer::initialize(&config)
        .with_context(|| format!("Failed to initialize streamer for {target}"))?;
    let handle = streamer.open(&file, OpenMode::Read)?;
    streamer
        .wait(handle)
        .with_context(|| format!("Failed to open {file}"))?;

    let mut hasher = Sha256::new();
    let mut total = 0;
    loop {
        streamer.read(handle, STREAMER_BUFFER_SIZE)?;
        let n = streamer
            .wait(handle)
            .with_context(|| format!("Failed to read {file}"))?;
        if n == 0 {
            break;
        }
        hasher.update(streamer.take_data(handle)?);
        total += n;
    }

    streamer.close(handle)?;
    streamer.wait(handle)?;
    streamer.shutdown();
    Ok((hasher.finalize().into(), total))
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Create {
            compression,
            sector_align,
            verbose,
            archive,
            paths,
        } => create(&archive, &paths, compression.into(), sector_align, verbose)?,
        Command::List { archive } => list(&archive)?,
        Command::Hash { file } => {
            let (digest, length) = hash(&file)?;
            debug!("{file}: {length} bytes");
            println!("{}  {file}", hex::encode(digest));
        }
    }
    Ok(())
}
