//! Archive creation.
//!
//! [`ArchiveWriter`] collects files into a directory tree, then streams the
//! payloads, the table of contents and the footer to any [`Write`] in one
//! pass.  Nothing is seeked, so the output can be a pipe.

use std::{
    collections::VecDeque,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::debug;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zerocopy::{little_endian::U32, IntoBytes};

use crate::{
    codec::Compression,
    format::{
        BlockHeader, ContainerRecord, EntryRecord, Footer, TocHeader, ALIGNMENT, BLOCK_SIZE,
        BLOCK_SIZE_MASK, FLAG_ALIGNED, HASH_SIZE, INVALID_OFFSET, MAGIC_COOKIE, TOC_VERSION,
    },
};

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Failed to read {path:?}: {source}")]
    Source { path: PathBuf, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Duplicate archive path {0:?}")]
    Duplicate(String),
    #[error("Invalid archive path {0:?}")]
    InvalidPath(String),
    #[error("No files to archive")]
    Empty,
    #[error("Archive exceeds the 4 GiB format limit")]
    TooLarge,
}

type WriteResult<T> = Result<T, WriteError>;

#[derive(Debug)]
enum Source {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
struct FileNode {
    name: String,
    source: Source,
}

#[derive(Debug, Default)]
struct DirNode {
    name: String,
    dirs: Vec<DirNode>,
    files: Vec<FileNode>,
}

impl DirNode {
    fn dir(&mut self, name: &str) -> &mut DirNode {
        let index = match self
            .dirs
            .iter()
            .position(|d| d.name.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                self.dirs.push(DirNode {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.dirs.len() - 1
            }
        };
        &mut self.dirs[index]
    }
}

/// One file as it was written, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenEntry {
    pub path: String,
    pub original: u64,
    pub compressed: u64,
    pub hash: [u8; HASH_SIZE],
}

#[derive(Debug, Default)]
pub struct ArchiveWriter {
    compression: Compression,
    aligned: bool,
    count: usize,
    root: DirNode,
}

struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    position: u64,
}

impl<W: Write> CountingWriter<'_, W> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn pad_to(&mut self, alignment: u64) -> io::Result<()> {
        let padding = self.position.next_multiple_of(alignment) - self.position;
        self.write(&vec![0; padding as usize])
    }
}

fn split_path(path: &str) -> WriteResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let invalid = |s: &&str| *s == "." || *s == ".." || s.contains('\0') || s.contains('\\');
    if segments.is_empty() || segments.iter().any(invalid) {
        return Err(WriteError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn to_u32(value: u64) -> WriteResult<u32> {
    u32::try_from(value).map_err(|_| WriteError::TooLarge)
}

/// Writes `data` as a block stream, returning the stream length and the
/// largest block body.
fn write_blocks(
    codec: Compression,
    data: &[u8],
    output: &mut CountingWriter<'_, impl Write>,
) -> io::Result<(u64, u16)> {
    let start = output.position;
    let mut largest = 0;
    for chunk in data.chunks(BLOCK_SIZE) {
        let packed = codec.compress(chunk)?;
        let stored = packed.len() >= chunk.len() || packed.len() > BLOCK_SIZE_MASK as usize;
        let body = if stored { chunk } else { &packed[..] };
        output.write(BlockHeader::new(chunk.len(), body.len(), stored).as_bytes())?;
        output.write(body)?;
        largest = largest.max(body.len() as u16);
    }
    Ok((output.position - start, largest))
}

impl ArchiveWriter {
    pub fn new(compression: Compression) -> Self {
        ArchiveWriter {
            compression,
            ..Default::default()
        }
    }

    /// Start every payload on a 2048-byte boundary.
    pub fn aligned(mut self, aligned: bool) -> Self {
        self.aligned = aligned;
        self
    }

    fn insert(&mut self, path: &str, source: Source) -> WriteResult<()> {
        let mut segments = split_path(path)?;
        let name = segments.pop().unwrap_or_default();
        let dir = segments.into_iter().fold(&mut self.root, |dir, seg| dir.dir(seg));
        if dir.files.iter().any(|f| f.name.eq_ignore_ascii_case(name)) {
            return Err(WriteError::Duplicate(path.to_string()));
        }
        dir.files.push(FileNode {
            name: name.to_string(),
            source,
        });
        self.count += 1;
        Ok(())
    }

    pub fn add_bytes(&mut self, path: &str, data: impl Into<Vec<u8>>) -> WriteResult<()> {
        self.insert(path, Source::Bytes(data.into()))
    }

    pub fn add_file(&mut self, path: &str, source: impl Into<PathBuf>) -> WriteResult<()> {
        self.insert(path, Source::Path(source.into()))
    }

    /// Creates an (initially empty) container.
    pub fn add_dir(&mut self, path: &str) -> WriteResult<()> {
        split_path(path)?
            .into_iter()
            .fold(&mut self.root, |dir, seg| dir.dir(seg));
        Ok(())
    }

    /// Adds a host file or directory under its base name, recursing into
    /// directories.
    pub fn add_path(&mut self, source: &Path) -> WriteResult<()> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WriteError::InvalidPath(source.display().to_string()))?;
        self.add_tree(source, name)
    }

    fn add_tree(&mut self, source: &Path, path: &str) -> WriteResult<()> {
        let source_err = |source_path: &Path| {
            let path = source_path.to_path_buf();
            move |source| WriteError::Source { path, source }
        };
        let metadata = fs::metadata(source).map_err(source_err(source))?;
        if !metadata.is_dir() {
            return self.add_file(path, source);
        }

        self.add_dir(path)?;
        let mut children = fs::read_dir(source)
            .and_then(|dir| dir.collect::<io::Result<Vec<_>>>())
            .map_err(source_err(source))?;
        children.sort_by_key(|child| child.file_name());
        for child in children {
            let name = child.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| WriteError::InvalidPath(child.path().display().to_string()))?;
            self.add_tree(&child.path(), &format!("{path}/{name}"))?;
        }
        Ok(())
    }

    /// Writes the archive, returning every entry in TOC order.
    pub fn write(self, output: &mut impl Write) -> WriteResult<Vec<WrittenEntry>> {
        if self.count == 0 {
            return Err(WriteError::Empty);
        }

        // Containers are numbered breadth-first; index 0 is the root.
        let mut nodes: Vec<(&DirNode, Option<usize>, String)> = vec![];
        let mut queue = VecDeque::from([(&self.root, None, String::new())]);
        while let Some((node, parent, path)) = queue.pop_front() {
            let index = nodes.len();
            for dir in &node.dirs {
                queue.push_back((dir, Some(index), format!("{path}{}/", dir.name)));
            }
            nodes.push((node, parent, path));
        }

        let containers_at = size_of::<TocHeader>();
        let files_at = containers_at + nodes.len() * size_of::<ContainerRecord>();
        let hashes_at = files_at + self.count * size_of::<EntryRecord>();
        let names_at = hashes_at + self.count * HASH_SIZE;
        let mut names = vec![];
        let mut intern = |name: &str| -> WriteResult<U32> {
            let offset = to_u32((names_at + names.len()) as u64)?;
            names.extend_from_slice(name.as_bytes());
            names.push(0);
            Ok(U32::new(offset))
        };
        let container_link = |index: Option<usize>| match index {
            Some(index) => U32::new((containers_at + index * size_of::<ContainerRecord>()) as u32),
            None => U32::new(INVALID_OFFSET),
        };

        let mut containers = vec![ContainerRecord::default(); nodes.len()];
        let mut last_child: Vec<Option<usize>> = vec![None; nodes.len()];
        let mut first_file = 0;
        for (index, (node, parent, _)) in nodes.iter().enumerate() {
            if let Some(parent) = *parent {
                match last_child[parent] {
                    Some(sibling) => containers[sibling].next = container_link(Some(index)),
                    None => containers[parent].children = container_link(Some(index)),
                }
                last_child[parent] = Some(index);
            }
            // Links to children and siblings are filled in as those are numbered.
            let record = &mut containers[index];
            record.parent = container_link(*parent);
            record.children = container_link(None);
            record.next = container_link(None);
            record.files = match node.files.len() {
                0 => U32::new(INVALID_OFFSET),
                _ => U32::new((files_at + first_file * size_of::<EntryRecord>()) as u32),
            };
            record.count = U32::new(node.files.len() as u32);
            record.name = intern(&node.name)?;
            first_file += node.files.len();
        }

        let mut output = CountingWriter {
            inner: output,
            position: 0,
        };
        let mut entries = vec![];
        let mut written = vec![];
        let mut hashes = vec![];
        for (node, _, dir_path) in &nodes {
            for file in &node.files {
                if self.aligned {
                    output.pad_to(ALIGNMENT)?;
                }
                let data = match &file.source {
                    Source::Bytes(data) => data.clone(),
                    Source::Path(path) => fs::read(path).map_err(|source| WriteError::Source {
                        path: path.clone(),
                        source,
                    })?,
                };
                let hash: [u8; HASH_SIZE] = Sha256::digest(&data).into();
                let offset = output.position;
                let (compressed, largest) = match self.compression {
                    Compression::None => {
                        output.write(&data)?;
                        (data.len() as u64, 0)
                    }
                    codec => write_blocks(codec, &data, &mut output)?,
                };

                entries.push(EntryRecord {
                    data: to_u32(offset)?.into(),
                    name: intern(&file.name)?,
                    compression: self.compression.tag().into(),
                    original: to_u32(data.len() as u64)?.into(),
                    compressed: to_u32(compressed)?.into(),
                    block_size: (match self.compression {
                        Compression::None => 0,
                        _ => BLOCK_SIZE as u16,
                    })
                    .into(),
                    largest_block: largest.into(),
                });
                hashes.extend_from_slice(&hash);

                let path = format!("{dir_path}{}", file.name);
                debug!("added {path}: {} -> {compressed} bytes", data.len());
                written.push(WrittenEntry {
                    path,
                    original: data.len() as u64,
                    compressed,
                    hash,
                });
            }
        }

        let header = TocHeader {
            cookie: MAGIC_COOKIE.into(),
            version: TOC_VERSION.into(),
            size: to_u32((names_at + names.len()) as u64)?.into(),
            flags: (if self.aligned { FLAG_ALIGNED } else { 0 }).into(),
            containers: (containers_at as u32).into(),
            container_count: (nodes.len() as u32).into(),
            files: (files_at as u32).into(),
            file_count: (self.count as u32).into(),
            hashes: (hashes_at as u32).into(),
        };
        let mut blob = header.as_bytes().to_vec();
        blob.extend_from_slice(containers.as_slice().as_bytes());
        blob.extend_from_slice(entries.as_slice().as_bytes());
        blob.extend_from_slice(&hashes);
        blob.extend_from_slice(&names);

        let toc_start = output.position;
        match self.compression {
            Compression::None => output.write(&blob)?,
            codec => {
                write_blocks(codec, &blob, &mut output)?;
            }
        }
        let toc_len = output.position - toc_start;

        let footer = Footer {
            cookie: MAGIC_COOKIE.into(),
            toc: to_u32(toc_len)?.into(),
            data: to_u32(output.position)?.into(),
            compression: self.compression.tag().into(),
            original: to_u32(blob.len() as u64)?.into(),
            compressed: to_u32(toc_len)?.into(),
        };
        output.write(footer.as_bytes())?;
        output.inner.flush()?;

        debug!(
            "wrote archive: {} containers, {} files, {} bytes",
            nodes.len(),
            self.count,
            output.position
        );
        Ok(written)
    }
}
