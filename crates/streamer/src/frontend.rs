//! The local frontend.
//!
//! [`Streamer`] owns a [`RequestQueue`] and the worker thread servicing it.
//! The worker ticks the queue, yields between ticks while requests are in
//! progress, and sleeps on the queue's condition variable when idle.  Every
//! call on a `Streamer` returns without waiting for I/O except
//! [`Streamer::initialize`], [`Streamer::shutdown`] and [`Streamer::wait`].

use std::{
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use log::debug;

use crate::{
    archive::ArchiveEngine,
    driver::{DriverResult, IoDriver, OpenMode, Whence},
    fileio::FileIo,
    queue::{
        Completion, Handle, RequestQueue, Status, StreamError, StreamResult, STREAMER_BUFFER_SIZE,
    },
};

/// Where files physically come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    FileIo { root: PathBuf },
}

/// How files are laid out on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
    /// Plain files.
    Direct,
    /// Files inside a FARC archive, itself a file on the transport.
    Archive { file: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerConfig {
    pub transport: Transport,
    pub container: Container,
    /// Largest transfer a single worker tick performs.
    pub chunk_size: usize,
}

impl StreamerConfig {
    pub fn direct(root: impl Into<PathBuf>) -> Self {
        StreamerConfig {
            transport: Transport::FileIo { root: root.into() },
            container: Container::Direct,
            chunk_size: STREAMER_BUFFER_SIZE,
        }
    }

    pub fn archive(root: impl Into<PathBuf>, file: impl Into<String>) -> Self {
        StreamerConfig {
            container: Container::Archive { file: file.into() },
            ..Self::direct(root)
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    fn driver(&self) -> DriverResult<Box<dyn IoDriver>> {
        let transport = match &self.transport {
            Transport::FileIo { root } => FileIo::new(root),
        };
        let driver: Box<dyn IoDriver> = match &self.container {
            Container::Direct => Box::new(transport),
            Container::Archive { file } => Box::new(ArchiveEngine::new(transport, file)?),
        };
        Ok(driver)
    }
}

/// A running request queue with its worker thread.
#[derive(Debug)]
pub struct Streamer {
    queue: Arc<RequestQueue>,
    worker: Option<JoinHandle<()>>,
}

fn worker(queue: Arc<RequestQueue>) {
    debug!("streamer worker started");
    loop {
        match queue.tick() {
            Status::Pending => thread::yield_now(),
            _ => {
                if !queue.wait_for_work() {
                    break;
                }
            }
        }
    }
    debug!("streamer worker stopped");
}

impl Streamer {
    /// Builds the driver stack described by `config` and starts the worker.
    pub fn initialize(config: &StreamerConfig) -> DriverResult<Self> {
        Self::initialize_with(config, None)
    }

    pub(crate) fn initialize_with(
        config: &StreamerConfig,
        completion: Option<Arc<dyn Completion>>,
    ) -> DriverResult<Self> {
        let mut queue = RequestQueue::new(config.driver()?).with_chunk_size(config.chunk_size);
        if let Some(completion) = completion {
            queue = queue.with_completion(completion);
        }
        let queue = Arc::new(queue);

        let worker = thread::Builder::new().name("streamer".into()).spawn({
            let queue = Arc::clone(&queue);
            move || worker(queue)
        })?;
        debug!("streamer initialized: {config:?}");

        Ok(Streamer {
            queue,
            worker: Some(worker),
        })
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn open(&self, name: &str, mode: OpenMode) -> StreamResult<Handle> {
        self.queue.open(name, mode)
    }

    pub fn close(&self, handle: Handle) -> StreamResult<()> {
        self.queue.close(handle)
    }

    pub fn read(&self, handle: Handle, length: usize) -> StreamResult<()> {
        self.queue.read(handle, length)
    }

    pub fn lseek(&self, handle: Handle, offset: i64, whence: Whence) -> StreamResult<()> {
        self.queue.lseek(handle, offset, whence)
    }

    pub fn poll(&self, handle: Handle) -> StreamResult<u64> {
        self.queue.poll(handle)
    }

    pub fn take_data(&self, handle: Handle) -> StreamResult<Vec<u8>> {
        self.queue.take_data(handle)
    }

    /// Polls `handle` with a short sleep between attempts until its result
    /// is available.
    pub fn wait(&self, handle: Handle) -> StreamResult<u64> {
        loop {
            match self.poll(handle) {
                Err(StreamError::Pending) => thread::sleep(Duration::from_micros(100)),
                result => return result,
            }
        }
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.queue.shutdown();
        if worker.join().is_err() {
            log::error!("streamer worker panicked");
        }
        self.queue.close_all();
    }

    /// Stops the worker once in-flight requests have finished and closes
    /// every handle still open.
    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop();
    }
}
