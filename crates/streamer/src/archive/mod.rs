//! FARC archives: reading ([`ArchiveEngine`]) and writing ([`ArchiveWriter`]).

pub mod engine;
pub mod toc;
pub mod writer;

pub use engine::{ArchiveEngine, MAX_HANDLES};
pub use toc::{Container, Entry, Toc};
pub use writer::{ArchiveWriter, WriteError, WrittenEntry};
