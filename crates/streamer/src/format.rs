//! FARC on-disk format definitions.
//!
//! An archive is laid out as
//!
//! ```text
//! [ entry payloads ][ table of contents ][ footer ]
//! ```
//!
//! The footer is found by scanning the tail of the file for
//! [`MAGIC_COOKIE`].  Its `toc` and `data` fields count bytes backwards from
//! the footer's own position, so the payload region need not start at offset
//! zero of the host file.
//!
//! The table of contents is one blob: a [`TocHeader`], an array of
//! [`ContainerRecord`]s (index 0 is the root), an array of [`EntryRecord`]s
//! grouped by container, an optional table of SHA-256 digests parallel to the
//! entries, and NUL-terminated names.  All links inside the blob are byte
//! offsets from the blob start, with [`INVALID_OFFSET`] meaning "no link".
//!
//! Compressed streams (entry payloads and, optionally, the table of contents)
//! are sequences of blocks, each preceded by a [`BlockHeader`].

// All integers are little-endian regardless of host.

use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

pub const MAGIC_COOKIE: u32 = u32::from_le_bytes(*b"FARC");
pub const TOC_VERSION: u32 = 1;

pub const COMPRESSION_NONE: u32 = 0;
pub const COMPRESSION_LZ4: u32 = u32::from_le_bytes(*b"LZ4B");
pub const COMPRESSION_ZSTD: u32 = u32::from_le_bytes(*b"ZSTD");

/// Entry payloads start on [`ALIGNMENT`] boundaries.
pub const FLAG_ALIGNED: u32 = 1;

/// Sector size used for optical-media friendly archives.
pub const ALIGNMENT: u64 = 2048;

pub const INVALID_OFFSET: u32 = u32::MAX;

/// Largest decompressed block, and the size of each handle's output buffer.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Size of the shared read-ahead cache, and of the window scanned for the footer.
pub const CACHE_SIZE: usize = 128 * 1024;

pub const HASH_SIZE: usize = 32;

pub const BLOCK_STORED: u16 = 0x8000;
pub const BLOCK_SIZE_MASK: u16 = 0x7fff;

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Footer {
    pub cookie: U32,
    pub toc: U32,
    pub data: U32,
    pub compression: U32,
    pub original: U32,
    pub compressed: U32,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct TocHeader {
    pub cookie: U32,
    pub version: U32,
    pub size: U32,
    pub flags: U32,

    pub containers: U32,
    pub container_count: U32,
    pub files: U32,
    pub file_count: U32,

    pub hashes: U32,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ContainerRecord {
    pub parent: U32,
    pub children: U32,
    pub next: U32,
    pub files: U32,
    pub count: U32,
    pub name: U32,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct EntryRecord {
    pub data: U32,
    pub name: U32,
    pub compression: U32,
    pub original: U32,
    pub compressed: U32,
    pub block_size: U16,
    pub largest_block: U16,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct BlockHeader {
    pub original: U16,
    pub compressed: U16,
}

impl BlockHeader {
    pub fn new(original: usize, compressed: usize, stored: bool) -> Self {
        let flag = if stored { BLOCK_STORED } else { 0 };
        BlockHeader {
            original: U16::new(original as u16),
            compressed: U16::new(compressed as u16 | flag),
        }
    }

    pub fn stored(&self) -> bool {
        self.compressed.get() & BLOCK_STORED != 0
    }

    /// Length of the block body following the header.
    pub fn body_len(&self) -> usize {
        (self.compressed.get() & BLOCK_SIZE_MASK) as usize
    }

    /// Bytes the whole block occupies in the stream, header included.
    pub fn usage(&self) -> usize {
        size_of::<BlockHeader>() + self.body_len()
    }
}
