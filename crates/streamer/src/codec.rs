//! Block codecs.
//!
//! Compressed archive streams are split into blocks of at most
//! [`crate::format::BLOCK_SIZE`] bytes which are compressed independently.
//! Each codec is identified on disk by a 32-bit tag.

use std::{fmt, io};

use crate::format::{COMPRESSION_LZ4, COMPRESSION_NONE, COMPRESSION_ZSTD};

const ZSTD_LEVEL: i32 = 19;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            COMPRESSION_NONE => Some(Compression::None),
            COMPRESSION_LZ4 => Some(Compression::Lz4),
            COMPRESSION_ZSTD => Some(Compression::Zstd),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Compression::None => COMPRESSION_NONE,
            Compression::Lz4 => COMPRESSION_LZ4,
            Compression::Zstd => COMPRESSION_ZSTD,
        }
    }

    /// Compresses one block.  The result may be larger than the input; the
    /// caller decides whether to store the block verbatim instead.
    pub fn compress(self, src: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(src.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::block::compress(src)),
            Compression::Zstd => zstd::bulk::compress(src, ZSTD_LEVEL),
        }
    }

    /// Decompresses one block into `dst`, returning the decompressed length.
    ///
    /// `dst` must be large enough for the whole block.
    pub fn decompress(self, dst: &mut [u8], src: &[u8]) -> io::Result<usize> {
        match self {
            Compression::None => {
                let dst = dst
                    .get_mut(..src.len())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "block too large"))?;
                dst.copy_from_slice(src);
                Ok(src.len())
            }
            Compression::Lz4 => lz4_flex::block::decompress_into(src, dst)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
            Compression::Zstd => zstd::bulk::decompress_to_buffer(src, dst),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        })
    }
}
