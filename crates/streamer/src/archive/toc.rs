//! Table of contents decoding and name resolution.
//!
//! The on-disk TOC links containers and entries with byte offsets into one
//! blob.  [`Toc::decode`] validates every link once and turns the blob into
//! owned vectors connected by indices, so nothing past this module ever does
//! offset arithmetic.

use std::{io::Write, ops::Range};

use zerocopy::FromBytes;

use crate::{
    codec::Compression,
    driver::{DriverError, DriverResult},
    format::{
        ContainerRecord, EntryRecord, TocHeader, HASH_SIZE, INVALID_OFFSET, MAGIC_COOKIE,
        TOC_VERSION,
    },
};

/// A directory node.  Index 0 of [`Toc::containers`] is the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub parent: Option<usize>,
    pub first_child: Option<usize>,
    pub next: Option<usize>,
    /// Indices into [`Toc::entries`] of the files directly in this container.
    pub files: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub container: usize,
    /// Payload offset relative to the archive's data base.
    pub data: u64,
    pub compression: Compression,
    pub original: u64,
    pub compressed: u64,
    pub block_size: u16,
    pub largest_block: u16,
    pub hash: Option<[u8; HASH_SIZE]>,
}

#[derive(Debug, Clone)]
pub struct Toc {
    pub version: u32,
    pub flags: u32,
    pub containers: Vec<Container>,
    pub entries: Vec<Entry>,
}

fn corrupt(what: impl Into<String>) -> DriverError {
    DriverError::Corrupt(what.into())
}

fn record<T: FromBytes>(blob: &[u8], offset: usize) -> DriverResult<T> {
    blob.get(offset..)
        .and_then(|rest| T::read_from_prefix(rest).ok())
        .map(|(record, _)| record)
        .ok_or_else(|| corrupt(format!("record at {offset} out of bounds")))
}

fn name_at(blob: &[u8], offset: u32) -> DriverResult<String> {
    let rest = blob
        .get(offset as usize..)
        .ok_or_else(|| corrupt(format!("name offset {offset} out of bounds")))?;
    let len = rest
        .iter()
        .position(|&c| c == 0)
        .ok_or_else(|| corrupt("unterminated name"))?;
    String::from_utf8(rest[..len].to_vec()).map_err(|_| corrupt("name is not UTF-8"))
}

/// Converts a link offset into an index into an array of `count` records of
/// `size` bytes starting at `base`.
fn link(offset: u32, base: u32, size: usize, count: usize) -> DriverResult<Option<usize>> {
    if offset == INVALID_OFFSET {
        return Ok(None);
    }
    let rel = offset
        .checked_sub(base)
        .ok_or_else(|| corrupt(format!("link {offset} before table")))? as usize;
    if rel % size != 0 || rel / size >= count {
        return Err(corrupt(format!("link {offset} does not address a record")));
    }
    Ok(Some(rel / size))
}

impl Toc {
    /// Decodes and validates a decompressed TOC blob.
    pub fn decode(blob: &[u8]) -> DriverResult<Toc> {
        let header: TocHeader = record(blob, 0)?;
        if header.cookie.get() != MAGIC_COOKIE {
            return Err(corrupt("TOC header cookie mismatch"));
        }
        if header.version.get() != TOC_VERSION {
            return Err(corrupt(format!(
                "unsupported TOC version {} (maximum supported: {TOC_VERSION})",
                header.version.get()
            )));
        }
        if header.size.get() as usize != blob.len() {
            return Err(corrupt(format!(
                "TOC size mismatch ({} != {})",
                header.size.get(),
                blob.len()
            )));
        }

        let container_base = header.containers.get();
        let container_count = header.container_count.get() as usize;
        let file_base = header.files.get();
        let file_count = header.file_count.get() as usize;
        if container_count == 0 {
            return Err(corrupt("TOC has no root container"));
        }

        let mut containers = Vec::with_capacity(container_count);
        let mut owners = vec![None; file_count];
        for index in 0..container_count {
            let offset = container_base as usize + index * size_of::<ContainerRecord>();
            let rec: ContainerRecord = record(blob, offset)?;
            let size = size_of::<ContainerRecord>();

            let count = rec.count.get() as usize;
            let first = link(rec.files.get(), file_base, size_of::<EntryRecord>(), file_count)?;
            let files = match first {
                Some(first) if first + count <= file_count => first..first + count,
                None if count == 0 => 0..0,
                _ => return Err(corrupt(format!("container {index} file range out of bounds"))),
            };
            for owner in &mut owners[files.clone()] {
                if owner.replace(index).is_some() {
                    return Err(corrupt("entry claimed by two containers"));
                }
            }

            containers.push(Container {
                name: name_at(blob, rec.name.get())?,
                parent: link(rec.parent.get(), container_base, size, container_count)?,
                first_child: link(rec.children.get(), container_base, size, container_count)?,
                next: link(rec.next.get(), container_base, size, container_count)?,
                files,
            });
        }
        if containers[0].parent.is_some() {
            return Err(corrupt("root container has a parent"));
        }
        // Containers are numbered breadth-first, which also rules out cycles.
        for (index, container) in containers.iter().enumerate() {
            let forward = |link: Option<usize>| link.map_or(true, |link| link > index);
            if container.parent.is_some_and(|parent| parent >= index)
                || !forward(container.first_child)
                || !forward(container.next)
            {
                return Err(corrupt(format!("container {index} links out of order")));
            }
        }

        let hashes = header.hashes.get();
        let mut entries = Vec::with_capacity(file_count);
        for (index, owner) in owners.into_iter().enumerate() {
            let offset = file_base as usize + index * size_of::<EntryRecord>();
            let rec: EntryRecord = record(blob, offset)?;
            let compression = Compression::from_tag(rec.compression.get()).ok_or_else(|| {
                corrupt(format!("unknown compression {:#x}", rec.compression.get()))
            })?;
            let hash = match hashes {
                INVALID_OFFSET => None,
                base => Some(record::<[u8; HASH_SIZE]>(blob, base as usize + index * HASH_SIZE)?),
            };

            entries.push(Entry {
                name: name_at(blob, rec.name.get())?,
                container: owner.ok_or_else(|| corrupt(format!("entry {index} has no container")))?,
                data: rec.data.get().into(),
                compression,
                original: rec.original.get().into(),
                compressed: rec.compressed.get().into(),
                block_size: rec.block_size.get(),
                largest_block: rec.largest_block.get(),
                hash,
            });
        }

        Ok(Toc {
            version: header.version.get(),
            flags: header.flags.get(),
            containers,
            entries,
        })
    }

    pub fn children(&self, container: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.containers[container].first_child, |&child| {
            self.containers[child].next
        })
    }

    /// Resolves a `/`-separated path, comparing names case-insensitively.
    pub fn find_by_name(&self, path: &str) -> Option<usize> {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let file = segments.pop()?;

        let mut current = 0;
        for segment in segments {
            current = self
                .children(current)
                .find(|&child| self.containers[child].name.eq_ignore_ascii_case(segment))?;
        }

        self.containers[current]
            .files
            .clone()
            .find(|&index| self.entries[index].name.eq_ignore_ascii_case(file))
    }

    pub fn find_by_hash(&self, hash: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.hash.as_ref().is_some_and(|h| h.as_slice() == hash))
    }

    /// Resolves either a path or, with a leading `@`, a hex-encoded content hash.
    pub fn lookup(&self, name: &str) -> DriverResult<usize> {
        let found = match name.strip_prefix('@') {
            Some(hex) => match hex::decode(hex) {
                Ok(hash) if hash.len() == HASH_SIZE => self.find_by_hash(&hash),
                _ => None,
            },
            None => self.find_by_name(name),
        };
        found.ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    /// The full path of a container, `/` for the root and `a/b/` otherwise.
    pub fn container_path(&self, container: usize) -> String {
        let mut names = vec![];
        let mut current = Some(container);
        while let Some(index) = current {
            let node = &self.containers[index];
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            current = node.parent;
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.iter().rev().fold(String::new(), |path, name| path + *name + "/")
    }

    pub fn entry_path(&self, entry: usize) -> String {
        let entry = &self.entries[entry];
        match self.container_path(entry.container).as_str() {
            "/" => entry.name.clone(),
            dir => format!("{dir}{}", entry.name),
        }
    }

    /// Writes a human-readable listing of every container and entry.
    pub fn list(&self, output: &mut impl Write) -> std::io::Result<()> {
        writeln!(
            output,
            "File archive version {}, {} containers and {} files in TOC",
            self.version,
            self.containers.len(),
            self.entries.len()
        )?;
        for (index, container) in self.containers.iter().enumerate() {
            writeln!(
                output,
                "{}: ({} files)",
                self.container_path(index),
                container.files.len()
            )?;
            for entry in &self.entries[container.files.clone()] {
                let ratio = match entry.original {
                    0 => 0.0,
                    n => (1.0 - entry.compressed as f64 / n as f64) * 100.0,
                };
                writeln!(
                    output,
                    "   {} ({} bytes, {ratio:.2}% ratio, {})",
                    entry.name, entry.original, entry.compression
                )?;
            }
        }
        Ok(())
    }
}
