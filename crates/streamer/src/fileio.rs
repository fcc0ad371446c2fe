//! Raw file transport.
//!
//! [`FileIo`] is a thin pass-through over the host filesystem: every path is
//! resolved relative to a root directory and served read-only.

use std::{
    fs::ReadDir,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};

use log::trace;
use rustix::{
    fs::{open, Mode, OFlags, SeekFrom},
    io::Errno,
};

use crate::driver::{DriverError, DriverResult, Fd, IoDriver, OpenMode, Whence};

#[derive(Debug)]
enum Descriptor {
    File(OwnedFd),
    Directory(ReadDir),
}

/// Host filesystem driver rooted at a directory.
#[derive(Debug)]
pub struct FileIo {
    root: PathBuf,
    descriptors: Vec<Option<Descriptor>>,
}

impl FileIo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptors: vec![],
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn insert(&mut self, descriptor: Descriptor) -> Fd {
        match self.descriptors.iter().position(Option::is_none) {
            Some(fd) => {
                self.descriptors[fd] = Some(descriptor);
                fd
            }
            None => {
                self.descriptors.push(Some(descriptor));
                self.descriptors.len() - 1
            }
        }
    }

    fn file(&self, fd: Fd) -> DriverResult<&OwnedFd> {
        match self.descriptors.get(fd) {
            Some(Some(Descriptor::File(file))) => Ok(file),
            _ => Err(DriverError::BadDescriptor(fd)),
        }
    }
}

impl IoDriver for FileIo {
    fn open(&mut self, path: &str, mode: OpenMode) -> DriverResult<Fd> {
        if mode != OpenMode::Read {
            return Err(DriverError::ReadOnly);
        }
        let full = self.resolve(path);
        let file = match open(full.as_path(), OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()) {
            Ok(file) => file,
            Err(Errno::NOENT) => return Err(DriverError::NotFound(path.to_string())),
            Err(err) => return Err(err.into()),
        };
        let fd = self.insert(Descriptor::File(file));
        trace!("fileio: open {full:?} -> {fd}");
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> DriverResult<()> {
        self.file(fd)?;
        self.descriptors[fd] = None;
        Ok(())
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> DriverResult<usize> {
        let file = self.file(fd)?;
        loop {
            match rustix::io::read(file, &mut *buf) {
                Ok(n) => return Ok(n),
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> DriverResult<u64> {
        let file = self.file(fd)?;
        let pos = match whence {
            Whence::Set => {
                SeekFrom::Start(u64::try_from(offset).map_err(|_| DriverError::InvalidSeek)?)
            }
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        match rustix::fs::seek(file, pos) {
            Ok(pos) => Ok(pos),
            Err(Errno::INVAL) => Err(DriverError::InvalidSeek),
            Err(err) => Err(err.into()),
        }
    }

    fn dopen(&mut self, path: &str) -> DriverResult<Fd> {
        let dir = std::fs::read_dir(self.resolve(path))?;
        Ok(self.insert(Descriptor::Directory(dir)))
    }

    fn dread(&mut self, fd: Fd) -> DriverResult<Option<String>> {
        let Some(Some(Descriptor::Directory(dir))) = self.descriptors.get_mut(fd) else {
            return Err(DriverError::BadDescriptor(fd));
        };
        match dir.next() {
            Some(entry) => Ok(Some(entry?.file_name().to_string_lossy().into_owned())),
            None => Ok(None),
        }
    }

    fn dclose(&mut self, fd: Fd) -> DriverResult<()> {
        match self.descriptors.get(fd) {
            Some(Some(Descriptor::Directory(_))) => {
                self.descriptors[fd] = None;
                Ok(())
            }
            _ => Err(DriverError::BadDescriptor(fd)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{driver::read_full, test::tempdir};

    #[test]
    fn test_read_and_seek() {
        let tmp = tempdir();
        fs::write(tmp.path().join("hello.txt"), b"hello, world").unwrap();

        let mut io = FileIo::new(tmp.path());
        let fd = io.open("/hello.txt", OpenMode::Read).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(read_full(&mut io, fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        assert_eq!(io.lseek(fd, -5, Whence::End).unwrap(), 7);
        let mut rest = vec![0u8; 16];
        let n = read_full(&mut io, fd, &mut rest).unwrap();
        assert_eq!(&rest[..n], b"world");

        assert_eq!(io.lseek(fd, 0, Whence::Current).unwrap(), 12);
        io.close(fd).unwrap();
        assert!(matches!(io.read(fd, &mut buf), Err(DriverError::BadDescriptor(_))));
    }

    #[test]
    fn test_open_errors() {
        let tmp = tempdir();
        let mut io = FileIo::new(tmp.path());
        assert!(matches!(
            io.open("missing", OpenMode::Read),
            Err(DriverError::NotFound(_))
        ));
        assert!(matches!(
            io.open("missing", OpenMode::Write),
            Err(DriverError::ReadOnly)
        ));
        assert!(matches!(io.close(3), Err(DriverError::BadDescriptor(3))));
    }

    #[test]
    fn test_descriptor_reuse() {
        let tmp = tempdir();
        fs::write(tmp.path().join("a"), b"a").unwrap();
        let mut io = FileIo::new(tmp.path());
        let a = io.open("a", OpenMode::Read).unwrap();
        let b = io.open("a", OpenMode::Read).unwrap();
        assert_eq!((a, b), (0, 1));
        io.close(a).unwrap();
        assert_eq!(io.open("a", OpenMode::Read).unwrap(), 0);
    }

    #[test]
    fn test_directory_listing() {
        let tmp = tempdir();
        fs::create_dir(tmp.path().join("dir")).unwrap();
        fs::write(tmp.path().join("dir/one"), b"1").unwrap();
        fs::write(tmp.path().join("dir/two"), b"2").unwrap();

        let mut io = FileIo::new(tmp.path());
        let fd = io.dopen("dir").unwrap();
        let mut names = vec![];
        while let Some(name) = io.dread(fd).unwrap() {
            names.push(name);
        }
        names.sort();
        assert_eq!(names, ["one", "two"]);
        io.dclose(fd).unwrap();
        assert!(io.dclose(fd).is_err());
    }
}
