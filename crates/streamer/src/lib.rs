//! Asynchronous file streaming.
//!
//! Requests are submitted to a [`queue::RequestQueue`] and serviced in small
//! chunks by a background worker ([`frontend::Streamer`]), over a pluggable
//! [`driver::IoDriver`]: host files ([`fileio::FileIo`]) or files inside a
//! FARC archive ([`archive::ArchiveEngine`]).  Callers never block on I/O;
//! they poll for results.  [`remote`] forwards the same calls over a message
//! channel.

pub mod archive;
pub mod codec;
pub mod driver;
pub mod fileio;
pub mod format;
pub mod frontend;
pub mod queue;
pub mod remote;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use driver::{OpenMode, Whence};
pub use frontend::{Container, Streamer, StreamerConfig, Transport};
pub use queue::{Handle, Status, StreamError, StreamResult};
