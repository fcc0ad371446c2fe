//! The archive engine: an [`IoDriver`] serving files out of a FARC archive
//! stored on another driver.
//!
//! Uncompressed entries are read straight from the backing file.  Compressed
//! entries go through one engine-wide read-ahead cache that belongs to a single
//! handle at a time; whenever a different handle reads, the cache is dropped
//! and refilled for it.  Every handle decodes into its own block buffer, so
//! switching owners never loses decoded data.

use std::cmp::min;

use log::{debug, trace, warn};
use zerocopy::FromBytes;

use crate::{
    archive::toc::{Entry, Toc},
    codec::Compression,
    driver::{read_full, DriverError, DriverResult, Fd, IoDriver, OpenMode, Whence},
    format::{BlockHeader, Footer, BLOCK_SIZE, CACHE_SIZE, MAGIC_COOKIE},
};

/// Number of files an engine can have open at once.
pub const MAX_HANDLES: usize = 8;

fn corrupt(what: impl Into<String>) -> DriverError {
    DriverError::Corrupt(what.into())
}

#[derive(Debug)]
struct Cache {
    data: Box<[u8]>,
    offset: usize,
    fill: usize,
    owner: Option<Fd>,
}

impl Cache {
    fn reset(&mut self, owner: Option<Fd>) {
        self.offset = 0;
        self.fill = 0;
        self.owner = owner;
    }

    fn available(&self) -> usize {
        self.fill - self.offset
    }
}

/// A handle's position and decoded data, kept while a seek is attempted.
struct SavedCursor {
    offset: u64,
    compressed: u64,
    buffer_offset: usize,
    pending: Vec<u8>,
}

#[derive(Debug)]
struct ArchiveHandle {
    entry: usize,
    /// Logical position in the decompressed file.
    offset: u64,
    /// Bytes of the compressed stream consumed so far.
    compressed: u64,
    buffer: Box<[u8]>,
    buffer_offset: usize,
    buffer_fill: usize,
}

impl ArchiveHandle {
    fn rewind(&mut self, offset: u64, compressed: u64) {
        self.offset = offset;
        self.compressed = compressed;
        self.buffer_offset = 0;
        self.buffer_fill = 0;
    }
}

/// Where the payload region and table of contents of an archive live.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLayout {
    pub footer: u64,
    pub base: u64,
    pub toc_compression: Compression,
    pub toc_original: u64,
    pub toc_stored: u64,
}

#[derive(Debug)]
pub struct ArchiveEngine<D: IoDriver> {
    driver: D,
    native: Fd,
    layout: ArchiveLayout,
    toc: Toc,
    handles: Vec<Option<ArchiveHandle>>,
    cache: Cache,
}

/// Finds the footer by scanning the tail of the file backwards for the cookie.
fn locate_footer(driver: &mut impl IoDriver, native: Fd) -> DriverResult<(u64, Footer)> {
    let eof = driver.lseek(native, 0, Whence::End)?;
    let start = eof.saturating_sub(CACHE_SIZE as u64);
    driver.lseek(native, start as i64, Whence::Set)?;

    let mut window = vec![0u8; (eof - start) as usize];
    let got = read_full(driver, native, &mut window)?;
    if got != window.len() {
        return Err(DriverError::ShortRead {
            wanted: window.len(),
            got,
        });
    }

    let cookie = MAGIC_COOKIE.to_le_bytes();
    let last = window.len().checked_sub(size_of::<Footer>());
    last.into_iter()
        .flat_map(|last| (0..=last).rev())
        .find(|&offset| window[offset..offset + 4] == cookie)
        .and_then(|offset| {
            let (footer, _) = Footer::read_from_prefix(&window[offset..]).ok()?;
            Some((start + offset as u64, footer))
        })
        .ok_or_else(|| corrupt("footer not found"))
}

/// Decodes a whole block stream held in memory into a buffer of `original` bytes.
fn decode_blocks(codec: Compression, stream: &[u8], original: usize) -> DriverResult<Vec<u8>> {
    let mut output = vec![0u8; original];
    let mut consumed = 0;
    let mut produced = 0;
    while consumed < stream.len() {
        let (header, _) = BlockHeader::read_from_prefix(&stream[consumed..])
            .map_err(|_| corrupt("truncated block header"))?;
        let size = header.original.get() as usize;
        let body = stream
            .get(consumed + 4..consumed + header.usage())
            .ok_or_else(|| corrupt("truncated block"))?;
        let dst = output
            .get_mut(produced..produced + size)
            .ok_or_else(|| corrupt("block stream longer than declared"))?;
        decode_block(codec, &header, body, dst)?;
        consumed += header.usage();
        produced += size;
    }
    if produced != original {
        return Err(corrupt(format!(
            "block stream decoded to {produced} bytes, expected {original}"
        )));
    }
    Ok(output)
}

/// Decodes one block body into `dst`, which is exactly the block's original size.
fn decode_block(
    codec: Compression,
    header: &BlockHeader,
    body: &[u8],
    dst: &mut [u8],
) -> DriverResult<()> {
    if header.stored() {
        if body.len() != dst.len() {
            return Err(corrupt("stored block size mismatch"));
        }
        dst.copy_from_slice(body);
        return Ok(());
    }
    let n = codec
        .decompress(dst, body)
        .map_err(|err| corrupt(format!("block failed to decompress: {err}")))?;
    if n != dst.len() {
        return Err(corrupt(format!(
            "block decompressed to {n} bytes, expected {}",
            dst.len()
        )));
    }
    Ok(())
}

fn load_toc(driver: &mut impl IoDriver, native: Fd) -> DriverResult<(ArchiveLayout, Toc)> {
    let (position, footer) = locate_footer(driver, native)?;

    let toc_compression = Compression::from_tag(footer.compression.get())
        .ok_or_else(|| corrupt("unknown TOC compression"))?;
    let toc_original = footer.original.get() as u64;
    let toc_stored = match toc_compression {
        Compression::None => toc_original,
        _ => footer.compressed.get() as u64,
    };
    // Every block header yields at most one full block.
    let toc_limit = match toc_compression {
        Compression::None => toc_stored,
        _ => toc_stored / size_of::<BlockHeader>() as u64 * BLOCK_SIZE as u64,
    };
    if toc_original > toc_limit {
        return Err(corrupt(format!(
            "TOC of {toc_original} bytes cannot come from {toc_stored} stored bytes"
        )));
    }
    let toc_offset = footer.toc.get() as u64;
    let data_offset = footer.data.get() as u64;
    if toc_offset > position || data_offset > position || toc_stored > toc_offset {
        return Err(corrupt("footer offsets out of range"));
    }

    driver.lseek(native, (position - toc_offset) as i64, Whence::Set)?;
    let mut stream = vec![0u8; toc_stored as usize];
    let got = read_full(driver, native, &mut stream)?;
    if got != stream.len() {
        return Err(DriverError::ShortRead {
            wanted: stream.len(),
            got,
        });
    }
    let blob = match toc_compression {
        Compression::None => stream,
        codec => decode_blocks(codec, &stream, toc_original as usize)?,
    };

    let layout = ArchiveLayout {
        footer: position,
        base: position - data_offset,
        toc_compression,
        toc_original,
        toc_stored,
    };
    Ok((layout, Toc::decode(&blob)?))
}

impl<D: IoDriver> ArchiveEngine<D> {
    /// Opens `file` on `driver` and loads its table of contents.
    ///
    /// The backing file is closed again if the archive turns out to be
    /// unusable.
    pub fn new(mut driver: D, file: &str) -> DriverResult<Self> {
        let align = driver.align();
        if align > 0 {
            return Err(DriverError::Unaligned(align));
        }

        let native = driver.open(file, OpenMode::Read)?;
        let (layout, toc) = match load_toc(&mut driver, native) {
            Ok(loaded) => loaded,
            Err(err) => {
                let _ = driver.close(native);
                return Err(err);
            }
        };
        debug!(
            "mounted archive {file}: {} containers, {} files",
            toc.containers.len(),
            toc.entries.len()
        );

        Ok(ArchiveEngine {
            driver,
            native,
            layout,
            toc,
            handles: (0..MAX_HANDLES).map(|_| None).collect(),
            cache: Cache {
                data: vec![0; CACHE_SIZE].into_boxed_slice(),
                offset: 0,
                fill: 0,
                owner: None,
            },
        })
    }

    pub fn toc(&self) -> &Toc {
        &self.toc
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// The entry an open descriptor refers to.
    pub fn entry(&self, fd: Fd) -> DriverResult<&Entry> {
        let handle = self.handle(fd)?;
        Ok(&self.toc.entries[handle.entry])
    }

    fn handle(&self, fd: Fd) -> DriverResult<&ArchiveHandle> {
        match self.handles.get(fd) {
            Some(Some(handle)) => Ok(handle),
            _ => Err(DriverError::BadDescriptor(fd)),
        }
    }

    fn handle_mut(&mut self, fd: Fd) -> DriverResult<&mut ArchiveHandle> {
        match self.handles.get_mut(fd) {
            Some(Some(handle)) => Ok(handle),
            _ => Err(DriverError::BadDescriptor(fd)),
        }
    }

    /// Ensures the cache holds at least `min_fill` unconsumed bytes of the
    /// compressed stream of `fd`, which must own the cache.
    fn fill_cache(&mut self, fd: Fd, min_fill: usize) -> DriverResult<()> {
        let available = self.cache.available();
        if available >= min_fill {
            return Ok(());
        }

        let handle = self.handle(fd)?;
        let entry = &self.toc.entries[handle.entry];
        let position = handle.compressed + available as u64;
        let remaining = entry.compressed.saturating_sub(position);
        let read_max = min((CACHE_SIZE - available) as u64, remaining) as usize;
        let seek = self.layout.base + entry.data + position;

        let cache = &mut self.cache;
        cache.data.copy_within(cache.offset..cache.fill, 0);
        cache.offset = 0;
        cache.fill = available;

        trace!("archive: refill cache for {fd} at {seek} ({read_max} bytes)");
        self.driver.lseek(self.native, seek as i64, Whence::Set)?;
        let got = read_full(
            &mut self.driver,
            self.native,
            &mut cache.data[available..available + read_max],
        )?;
        if got != read_max {
            return Err(DriverError::ShortRead {
                wanted: read_max,
                got,
            });
        }
        cache.fill += got;
        if cache.fill < min_fill {
            return Err(corrupt("compressed stream ends inside a block"));
        }
        Ok(())
    }

    /// Decodes the next block of `fd`'s stream into its private buffer.
    fn next_block(&mut self, fd: Fd) -> DriverResult<()> {
        let (compression, compressed) = {
            let entry = self.entry(fd)?;
            (entry.compression, entry.compressed)
        };
        if self.handle(fd)?.compressed >= compressed {
            return Err(corrupt("compressed stream ended early"));
        }

        self.fill_cache(fd, size_of::<BlockHeader>())?;
        let (header, _) = BlockHeader::read_from_prefix(&self.cache.data[self.cache.offset..])
            .map_err(|_| corrupt("truncated block header"))?;
        let original = header.original.get() as usize;
        if original > BLOCK_SIZE {
            return Err(corrupt(format!("block of {original} bytes exceeds buffer")));
        }
        self.fill_cache(fd, header.usage())?;

        let start = self.cache.offset + size_of::<BlockHeader>();
        let body = &self.cache.data[start..self.cache.offset + header.usage()];
        let handle = match self.handles.get_mut(fd) {
            Some(Some(handle)) => handle,
            _ => return Err(DriverError::BadDescriptor(fd)),
        };
        decode_block(compression, &header, body, &mut handle.buffer[..original])?;

        handle.compressed += header.usage() as u64;
        handle.buffer_offset = 0;
        handle.buffer_fill = original;
        self.cache.offset += header.usage();
        trace!("archive: decoded block of {original} bytes for {fd}");
        Ok(())
    }

    fn read_stored(&mut self, fd: Fd, buf: &mut [u8]) -> DriverResult<usize> {
        let handle = self.handle(fd)?;
        let entry = &self.toc.entries[handle.entry];
        let len = min(buf.len() as u64, entry.original - handle.offset) as usize;
        if len == 0 {
            return Ok(0);
        }

        let seek = self.layout.base + entry.data + handle.offset;
        self.driver.lseek(self.native, seek as i64, Whence::Set)?;
        let got = read_full(&mut self.driver, self.native, &mut buf[..len])?;
        if got != len {
            return Err(DriverError::ShortRead { wanted: len, got });
        }
        self.handle_mut(fd)?.offset += got as u64;
        Ok(got)
    }

    fn read_compressed(&mut self, fd: Fd, buf: &mut [u8]) -> DriverResult<usize> {
        if self.cache.owner != Some(fd) {
            self.cache.reset(Some(fd));
        }

        let handle = self.handle(fd)?;
        let original = self.toc.entries[handle.entry].original;
        let wanted = min(buf.len() as u64, original - handle.offset) as usize;

        let mut done = 0;
        while done < wanted {
            let handle = self.handle(fd)?;
            if handle.buffer_offset == handle.buffer_fill {
                self.next_block(fd)?;
            }

            let handle = self.handle_mut(fd)?;
            let n = min(wanted - done, handle.buffer_fill - handle.buffer_offset);
            if n == 0 {
                break;
            }
            let from = handle.buffer_offset;
            buf[done..done + n].copy_from_slice(&handle.buffer[from..from + n]);
            handle.buffer_offset += n;
            handle.offset += n as u64;
            done += n;
        }
        Ok(done)
    }

    /// Positions a compressed handle at `target`.  On failure the handle is
    /// left where it was.
    fn seek_compressed(&mut self, fd: Fd, target: u64) -> DriverResult<()> {
        let saved = {
            let handle = self.handle(fd)?;
            SavedCursor {
                offset: handle.offset,
                compressed: handle.compressed,
                buffer_offset: handle.buffer_offset,
                pending: handle.buffer[..handle.buffer_fill].to_vec(),
            }
        };

        let result = self.walk_to(fd, target);
        if let Err(err) = &result {
            warn!("archive: seek of {fd} to {target} failed: {err}");
            if self.cache.owner == Some(fd) {
                self.cache.reset(None);
            }
            let handle = self.handle_mut(fd)?;
            handle.offset = saved.offset;
            handle.compressed = saved.compressed;
            handle.buffer[..saved.pending.len()].copy_from_slice(&saved.pending);
            handle.buffer_offset = saved.buffer_offset;
            handle.buffer_fill = saved.pending.len();
        }
        result
    }

    /// Skips whole blocks by their headers and decodes only the block
    /// containing `target`.
    fn walk_to(&mut self, fd: Fd, target: u64) -> DriverResult<()> {
        let (original, compressed) = {
            let entry = self.entry(fd)?;
            (entry.original, entry.compressed)
        };

        if self.cache.owner == Some(fd) {
            self.cache.reset(None);
        }
        if target == original {
            self.handle_mut(fd)?.rewind(original, compressed);
            return Ok(());
        }
        self.handle_mut(fd)?.rewind(0, 0);
        if target == 0 {
            return Ok(());
        }

        self.cache.reset(Some(fd));
        loop {
            let handle = self.handle(fd)?;
            let position = handle.offset;
            if handle.compressed >= compressed {
                return Err(corrupt("compressed stream ended early"));
            }

            self.fill_cache(fd, size_of::<BlockHeader>())?;
            let (header, _) = BlockHeader::read_from_prefix(&self.cache.data[self.cache.offset..])
                .map_err(|_| corrupt("truncated block header"))?;
            let size = header.original.get() as u64;

            if position + size > target {
                self.next_block(fd)?;
                let handle = self.handle_mut(fd)?;
                handle.buffer_offset = (target - position) as usize;
                handle.offset = target;
                return Ok(());
            }

            // Skip the block without decoding it.
            let usage = header.usage();
            if usage <= self.cache.available() {
                self.cache.offset += usage;
            } else {
                self.cache.reset(Some(fd));
            }
            let handle = self.handle_mut(fd)?;
            handle.compressed += usage as u64;
            handle.offset += size;
        }
    }
}

impl<D: IoDriver> IoDriver for ArchiveEngine<D> {
    fn open(&mut self, path: &str, mode: OpenMode) -> DriverResult<Fd> {
        if mode != OpenMode::Read {
            return Err(DriverError::ReadOnly);
        }
        let entry = self.toc.lookup(path)?;
        let fd = self
            .handles
            .iter()
            .position(Option::is_none)
            .ok_or(DriverError::NoFreeHandle)?;

        self.handles[fd] = Some(ArchiveHandle {
            entry,
            offset: 0,
            compressed: 0,
            buffer: vec![0; BLOCK_SIZE].into_boxed_slice(),
            buffer_offset: 0,
            buffer_fill: 0,
        });
        trace!("archive: open {path} -> {fd} (entry {entry})");
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> DriverResult<()> {
        self.handle(fd)?;
        if self.cache.owner == Some(fd) {
            self.cache.reset(None);
        }
        self.handles[fd] = None;
        Ok(())
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> DriverResult<usize> {
        let compression = self.entry(fd)?.compression;
        match compression {
            Compression::None => self.read_stored(fd, buf),
            _ => self.read_compressed(fd, buf),
        }
    }

    fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> DriverResult<u64> {
        let current = self.handle(fd)?.offset;
        let Entry {
            original,
            compression,
            ..
        } = *self.entry(fd)?;
        let origin = match whence {
            Whence::Set => 0,
            Whence::Current => current,
            Whence::End => original,
        };
        let target = origin
            .checked_add_signed(offset)
            .filter(|&target| target <= original)
            .ok_or(DriverError::InvalidSeek)?;

        match compression {
            Compression::None => self.handle_mut(fd)?.offset = target,
            _ => self.seek_compressed(fd, target)?,
        }
        Ok(target)
    }
}

impl<D: IoDriver> Drop for ArchiveEngine<D> {
    fn drop(&mut self) {
        let _ = self.driver.close(self.native);
    }
}
