//! Test utilities for the streamer.
//!
//! This module provides temporary directory allocation and an in-memory
//! driver whose read calls can be observed.

use std::{
    collections::HashMap,
    ffi::OsString,
    sync::{Arc, Mutex},
};

use once_cell::sync::Lazy;
use tempfile::TempDir;

use crate::driver::{DriverError, DriverResult, Fd, IoDriver, OpenMode, Whence};

static TMPDIR: Lazy<OsString> = Lazy::new(|| {
    std::env::var_os("STREAMER_TEST_TMPDIR").unwrap_or_else(|| std::env::temp_dir().into())
});

/// Allocate a temporary directory, under `$STREAMER_TEST_TMPDIR` if set.
pub fn tempdir() -> TempDir {
    tempfile::Builder::new()
        .prefix("streamer-test-")
        .tempdir_in(TMPDIR.as_os_str())
        .expect("can't create temporary directory")
}

/// A read-only driver over in-memory files.
///
/// Descriptors are allocated sequentially and never reused.  Every read call
/// appends its descriptor to the read log.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    files: HashMap<String, Arc<[u8]>>,
    open: HashMap<Fd, (Arc<[u8]>, u64)>,
    next_fd: Fd,
    reads: Arc<Mutex<Vec<Fd>>>,
}

impl MemoryDriver {
    pub fn new(files: &[(&str, Vec<u8>)]) -> Self {
        MemoryDriver {
            files: files
                .iter()
                .map(|(name, data)| (name.to_string(), Arc::from(data.as_slice())))
                .collect(),
            ..Default::default()
        }
    }

    /// The descriptors of all read calls so far, in call order.
    pub fn read_log(&self) -> Arc<Mutex<Vec<Fd>>> {
        Arc::clone(&self.reads)
    }
}

impl IoDriver for MemoryDriver {
    fn open(&mut self, path: &str, mode: OpenMode) -> DriverResult<Fd> {
        if mode != OpenMode::Read {
            return Err(DriverError::ReadOnly);
        }
        let data = self
            .files
            .get(path)
            .ok_or_else(|| DriverError::NotFound(path.to_string()))?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(fd, (Arc::clone(data), 0));
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> DriverResult<()> {
        self.open
            .remove(&fd)
            .map(|_| ())
            .ok_or(DriverError::BadDescriptor(fd))
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> DriverResult<usize> {
        let (data, pos) = self.open.get_mut(&fd).ok_or(DriverError::BadDescriptor(fd))?;
        self.reads.lock().unwrap().push(fd);
        let start = (*pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        *pos += n as u64;
        Ok(n)
    }

    fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> DriverResult<u64> {
        let (data, pos) = self.open.get_mut(&fd).ok_or(DriverError::BadDescriptor(fd))?;
        let origin = match whence {
            Whence::Set => 0,
            Whence::Current => *pos,
            Whence::End => data.len() as u64,
        };
        *pos = origin
            .checked_add_signed(offset)
            .ok_or(DriverError::InvalidSeek)?;
        Ok(*pos)
    }
}
