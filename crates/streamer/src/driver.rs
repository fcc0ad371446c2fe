//! The storage driver contract.
//!
//! Every backend the request queue can drive implements [`IoDriver`]: the raw
//! file transport in [`crate::fileio`], and the archive engine in
//! [`crate::archive`], which itself wraps another driver.  Drivers are plain
//! synchronous objects; all asynchrony lives in the queue above them.

use std::io;

use thiserror::Error;

/// A driver-local file descriptor.
///
/// Descriptors are only meaningful to the driver that returned them.
pub type Fd = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Origin for [`IoDriver::lseek`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("No such file: {0}")]
    NotFound(String),
    #[error("Invalid file descriptor {0}")]
    BadDescriptor(Fd),
    #[error("No free file handles")]
    NoFreeHandle,
    #[error("Driver is read-only")]
    ReadOnly,
    #[error("Operation not supported by this driver")]
    Unsupported,
    #[error("Seek target out of range")]
    InvalidSeek,
    #[error("Short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
    #[error("Corrupt archive: {0}")]
    Corrupt(String),
    #[error("Driver requires {0}-byte alignment")]
    Unaligned(usize),
}

impl From<rustix::io::Errno> for DriverError {
    fn from(errno: rustix::io::Errno) -> Self {
        DriverError::Io(errno.into())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// The capability set shared by all storage backends.
///
/// The directory operations are optional and default to
/// [`DriverError::Unsupported`].
pub trait IoDriver: Send {
    fn open(&mut self, path: &str, mode: OpenMode) -> DriverResult<Fd>;
    fn close(&mut self, fd: Fd) -> DriverResult<()>;

    /// Reads up to `buf.len()` bytes, returning the number actually read.
    /// Zero means end of file.
    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> DriverResult<usize>;

    /// Repositions the descriptor and returns the new absolute offset.
    fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> DriverResult<u64>;

    /// Required buffer and offset alignment in bytes, 0 when unconstrained.
    fn align(&self) -> usize {
        0
    }

    fn dopen(&mut self, _path: &str) -> DriverResult<Fd> {
        Err(DriverError::Unsupported)
    }

    /// Returns the next name in an open directory, or `None` when exhausted.
    fn dread(&mut self, _fd: Fd) -> DriverResult<Option<String>> {
        Err(DriverError::Unsupported)
    }

    fn dclose(&mut self, _fd: Fd) -> DriverResult<()> {
        Err(DriverError::Unsupported)
    }
}

impl<D: IoDriver + ?Sized> IoDriver for Box<D> {
    fn open(&mut self, path: &str, mode: OpenMode) -> DriverResult<Fd> {
        (**self).open(path, mode)
    }

    fn close(&mut self, fd: Fd) -> DriverResult<()> {
        (**self).close(fd)
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> DriverResult<usize> {
        (**self).read(fd, buf)
    }

    fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> DriverResult<u64> {
        (**self).lseek(fd, offset, whence)
    }

    fn align(&self) -> usize {
        (**self).align()
    }

    fn dopen(&mut self, path: &str) -> DriverResult<Fd> {
        (**self).dopen(path)
    }

    fn dread(&mut self, fd: Fd) -> DriverResult<Option<String>> {
        (**self).dread(fd)
    }

    fn dclose(&mut self, fd: Fd) -> DriverResult<()> {
        (**self).dclose(fd)
    }
}

/// Reads until `buf` is full or the driver reports end of file.
///
/// Returns the number of bytes read, which is only less than `buf.len()` at
/// end of file.
pub fn read_full<D: IoDriver + ?Sized>(driver: &mut D, fd: Fd, buf: &mut [u8]) -> DriverResult<usize> {
    let mut done = 0;
    while done < buf.len() {
        match driver.read(fd, &mut buf[done..])? {
            0 => break,
            n => done += n,
        }
    }
    Ok(done)
}
