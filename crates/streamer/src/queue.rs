//! The request queue.
//!
//! A fixed table of [`STREAMER_MAX_FILEHANDLES`] slots, each of which is at
//! any time on at most one of two rings: `pending` (submitted, not yet seen by
//! the worker) and `active` (being serviced).  Submissions only stage
//! parameters and return; the worker calls [`RequestQueue::tick`] repeatedly,
//! and every tick advances the oldest active request by one bounded unit of
//! I/O.  Reads longer than one chunk go to the back of `active` after each
//! chunk, so concurrent reads interleave.
//!
//! One mutex guards the slot table and both rings.  The driver call of a tick
//! happens outside of it, so submitting and polling never wait for I/O.

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::driver::{DriverError, Fd, IoDriver, OpenMode, Whence};

pub type Handle = usize;

pub const STREAMER_MAX_FILEHANDLES: usize = 8;

/// Largest unit of transfer a single tick performs for a read.
pub const STREAMER_BUFFER_SIZE: usize = 128 * 1024;

pub const STREAMER_MAX_FILENAME: usize = 256;

const NONE: usize = usize::MAX;

/// The four outcomes every queue call reduces to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Busy,
    Pending,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Invalid file handle {0}")]
    BadHandle(Handle),
    #[error("No free file handles")]
    NoFreeHandle,
    #[error("File name longer than {STREAMER_MAX_FILENAME} bytes")]
    NameTooLong,
    #[error("Handle {0} already has an operation in flight")]
    Busy(Handle),
    #[error("Result not available yet")]
    Pending,
    #[error("{0}")]
    Failed(String),
    #[error("Streamer is shut down")]
    ShutDown,
}

impl StreamError {
    pub fn status(&self) -> Status {
        match self {
            StreamError::Busy(_) => Status::Busy,
            StreamError::Pending => Status::Pending,
            _ => Status::Error,
        }
    }
}

impl From<DriverError> for StreamError {
    fn from(err: DriverError) -> Self {
        StreamError::Failed(err.to_string())
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

pub fn status_of<T>(result: &StreamResult<T>) -> Status {
    match result {
        Ok(_) => Status::Ok,
        Err(err) => err.status(),
    }
}

/// How a request reached the queue, which decides how its completion is
/// delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// The caller polls the slot itself.
    Normal,
    /// Forwarded by [`crate::remote`]; completions go to the registered
    /// [`Completion`].
    Remote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Open,
    Close,
    Read,
    LSeek,
}

/// Receives the outcome of every finished remote request.
///
/// Called by the worker outside of the queue lock.  `data` carries the bytes
/// of a successful read.
pub trait Completion: Send + Sync {
    fn complete(
        &self,
        handle: Handle,
        operation: Operation,
        result: &StreamResult<u64>,
        data: Option<Vec<u8>>,
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Free,
    File,
    #[allow(dead_code)] // reserved for directory handles
    Directory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ring {
    Pending,
    Active,
}

#[derive(Debug)]
struct Slot {
    mode: Mode,
    busy: bool,
    operation: Operation,
    method: Method,
    target: Option<Fd>,
    result: StreamResult<u64>,

    open_mode: OpenMode,
    buffer: Vec<u8>,
    length: usize,
    transferred: usize,
    seek: (i64, Whence),
    filename: String,

    ring: Option<Ring>,
    prev: usize,
    next: usize,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            mode: Mode::Free,
            busy: false,
            operation: Operation::Open,
            method: Method::Normal,
            target: None,
            result: Err(StreamError::Pending),
            open_mode: OpenMode::Read,
            buffer: vec![],
            length: 0,
            transferred: 0,
            seek: (0, Whence::Set),
            filename: String::new(),
            ring: None,
            prev: NONE,
            next: NONE,
        }
    }
}

impl Slot {
    /// The settled result of the last request, or `BadHandle` for a slot
    /// that never held an open file.
    fn outcome(&self, handle: Handle) -> StreamResult<u64> {
        if self.busy {
            return Err(StreamError::Pending);
        }
        match (self.target, &self.result) {
            (None, Ok(_) | Err(StreamError::Pending)) => Err(StreamError::BadHandle(handle)),
            (_, result) => result.clone(),
        }
    }
}

#[derive(Debug)]
struct List {
    head: usize,
    tail: usize,
}

impl List {
    const EMPTY: List = List {
        head: NONE,
        tail: NONE,
    };
}

#[derive(Debug)]
struct QueueState {
    slots: Vec<Slot>,
    pending: List,
    active: List,
    shutdown: bool,
}

/// One tick's unit of work, copied out of its slot so the driver can run
/// without the lock.
#[derive(Debug)]
enum Job {
    Open {
        filename: String,
        mode: OpenMode,
    },
    Close {
        target: Option<Fd>,
    },
    Read {
        target: Option<Fd>,
        buffer: Vec<u8>,
        from: usize,
        packet: usize,
    },
    LSeek {
        target: Option<Fd>,
        offset: i64,
        whence: Whence,
    },
}

/// A request that just finished and whose completion must be delivered.
struct Finished {
    handle: Handle,
    method: Method,
    operation: Operation,
    result: StreamResult<u64>,
    data: Option<Vec<u8>>,
}

impl QueueState {
    fn list(&mut self, ring: Ring) -> &mut List {
        match ring {
            Ring::Pending => &mut self.pending,
            Ring::Active => &mut self.active,
        }
    }

    /// Appends a detached slot to the tail of `ring`.
    fn attach(&mut self, ring: Ring, index: usize) {
        debug_assert!(self.slots[index].ring.is_none());
        let tail = self.list(ring).tail;
        match tail {
            NONE => self.list(ring).head = index,
            tail => self.slots[tail].next = index,
        }
        self.list(ring).tail = index;

        let slot = &mut self.slots[index];
        slot.ring = Some(ring);
        slot.prev = tail;
        slot.next = NONE;
    }

    fn detach(&mut self, index: usize) {
        let Some(ring) = self.slots[index].ring else {
            return;
        };
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        match prev {
            NONE => self.list(ring).head = next,
            prev => self.slots[prev].next = next,
        }
        match next {
            NONE => self.list(ring).tail = prev,
            next => self.slots[next].prev = prev,
        }

        let slot = &mut self.slots[index];
        slot.ring = None;
        slot.prev = NONE;
        slot.next = NONE;
    }

    fn drain_pending(&mut self) {
        while self.pending.head != NONE {
            let index = self.pending.head;
            self.detach(index);
            self.attach(Ring::Active, index);
        }
    }

    #[cfg(test)]
    fn members(&self, ring: Ring) -> Vec<usize> {
        let head = match ring {
            Ring::Pending => self.pending.head,
            Ring::Active => self.active.head,
        };
        std::iter::successors(Some(head), |&index| Some(self.slots[index].next))
            .take_while(|&index| index != NONE)
            .collect()
    }

    /// Checks that `handle` is an open file that can take a new operation.
    fn ready_slot(&mut self, handle: Handle) -> StreamResult<&mut Slot> {
        let slot = self
            .slots
            .get_mut(handle)
            .ok_or(StreamError::BadHandle(handle))?;
        if slot.mode != Mode::File {
            return Err(StreamError::BadHandle(handle));
        }
        if slot.busy {
            return Err(StreamError::Busy(handle));
        }
        if slot.target.is_none() {
            return Err(StreamError::BadHandle(handle));
        }
        Ok(slot)
    }

    fn take_job(&mut self, index: usize, chunk_size: usize) -> Job {
        let slot = &mut self.slots[index];
        match slot.operation {
            Operation::Open => Job::Open {
                filename: slot.filename.clone(),
                mode: slot.open_mode,
            },
            Operation::Close => Job::Close {
                target: slot.target,
            },
            Operation::Read => {
                // The buffer grows one packet at a time up to what was read.
                let packet = (slot.length - slot.transferred).min(chunk_size);
                let mut buffer = std::mem::take(&mut slot.buffer);
                buffer.resize(slot.transferred + packet, 0);
                Job::Read {
                    target: slot.target,
                    buffer,
                    from: slot.transferred,
                    packet,
                }
            }
            Operation::LSeek => Job::LSeek {
                target: slot.target,
                offset: slot.seek.0,
                whence: slot.seek.1,
            },
        }
    }

    /// Applies a job's outcome to its slot.  Returns the finished request,
    /// or `None` when a read was rescheduled for another chunk.
    fn finish(
        &mut self,
        index: usize,
        job: Job,
        outcome: Result<u64, DriverError>,
    ) -> Option<Finished> {
        let slot = &mut self.slots[index];
        let operation = slot.operation;
        let result = match job {
            Job::Open { .. } => match outcome {
                Ok(fd) => {
                    slot.mode = Mode::File;
                    slot.target = Some(fd as Fd);
                    Ok(0)
                }
                Err(err) => {
                    warn!("open {:?} failed: {err}", slot.filename);
                    slot.mode = Mode::Free;
                    Err(err.into())
                }
            },
            Job::Close { .. } => {
                if let Err(err) = outcome {
                    warn!("close of handle {index} failed: {err}");
                }
                slot.mode = Mode::Free;
                Ok(0)
            }
            Job::Read {
                buffer,
                from,
                packet,
                ..
            } => {
                slot.buffer = buffer;
                match outcome {
                    Err(err) => {
                        warn!("read on handle {index} failed: {err}");
                        Err(err.into())
                    }
                    Ok(n) => {
                        slot.transferred = from + n as usize;
                        if (n as usize) == packet && slot.transferred < slot.length {
                            trace!("handle {index}: {} of {} bytes", slot.transferred, slot.length);
                            self.detach(index);
                            self.attach(Ring::Active, index);
                            return None;
                        }
                        slot.buffer.truncate(slot.transferred);
                        Ok(slot.transferred as u64)
                    }
                }
            }
            Job::LSeek { .. } => outcome.map_err(|err| {
                warn!("seek on handle {index} failed: {err}");
                err.into()
            }),
        };

        let slot = &mut self.slots[index];
        slot.busy = false;
        slot.result = result.clone();
        let data = match (slot.method, operation, &result) {
            (Method::Remote, Operation::Read, Ok(_)) => Some(std::mem::take(&mut slot.buffer)),
            _ => None,
        };
        let finished = Finished {
            handle: index,
            method: slot.method,
            operation,
            result,
            data,
        };
        self.detach(index);
        Some(finished)
    }
}

/// The asynchronous request queue driving one [`IoDriver`].
pub struct RequestQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
    driver: Mutex<Box<dyn IoDriver>>,
    completion: Option<Arc<dyn Completion>>,
    chunk_size: usize,
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("state", &self.state)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl RequestQueue {
    pub fn new(driver: Box<dyn IoDriver>) -> Self {
        RequestQueue {
            state: Mutex::new(QueueState {
                slots: (0..STREAMER_MAX_FILEHANDLES)
                    .map(|_| Slot::default())
                    .collect(),
                pending: List::EMPTY,
                active: List::EMPTY,
                shutdown: false,
            }),
            wake: Condvar::new(),
            driver: Mutex::new(driver),
            completion: None,
            chunk_size: STREAMER_BUFFER_SIZE,
        }
    }

    /// Sets the largest transfer per tick.  Zero is treated as one byte.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_completion(mut self, completion: Arc<dyn Completion>) -> Self {
        self.completion = Some(completion);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submitted(&self) {
        self.wake.notify_one();
    }

    pub fn open(&self, filename: &str, mode: OpenMode) -> StreamResult<Handle> {
        self.open_with(filename, mode, Method::Normal)
    }

    pub fn open_with(&self, filename: &str, mode: OpenMode, method: Method) -> StreamResult<Handle> {
        if filename.len() >= STREAMER_MAX_FILENAME {
            return Err(StreamError::NameTooLong);
        }
        let mut state = self.lock();
        if state.shutdown {
            return Err(StreamError::ShutDown);
        }
        let handle = state
            .slots
            .iter()
            .position(|slot| slot.mode == Mode::Free && !slot.busy)
            .ok_or(StreamError::NoFreeHandle)?;

        let slot = &mut state.slots[handle];
        slot.busy = true;
        slot.operation = Operation::Open;
        slot.method = method;
        slot.target = None;
        slot.result = Err(StreamError::Pending);
        slot.open_mode = mode;
        slot.filename = filename.to_string();
        slot.buffer = Vec::new();
        state.attach(Ring::Pending, handle);
        drop(state);

        debug!("open {filename:?} queued on handle {handle}");
        self.submitted();
        Ok(handle)
    }

    /// Stages an operation on an open, idle handle.
    fn submit(
        &self,
        handle: Handle,
        operation: Operation,
        method: Method,
        stage: impl FnOnce(&mut Slot),
    ) -> StreamResult<()> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(StreamError::ShutDown);
        }
        let slot = state.ready_slot(handle)?;
        slot.buffer = Vec::new();
        stage(slot);
        slot.busy = true;
        slot.operation = operation;
        slot.method = method;
        slot.result = Err(StreamError::Pending);
        state.attach(Ring::Pending, handle);
        drop(state);

        trace!("{operation:?} queued on handle {handle}");
        self.submitted();
        Ok(())
    }

    pub fn close(&self, handle: Handle) -> StreamResult<()> {
        self.close_with(handle, Method::Normal)
    }

    pub fn close_with(&self, handle: Handle, method: Method) -> StreamResult<()> {
        self.submit(handle, Operation::Close, method, |_| ())
    }

    /// Queues a read of up to `length` bytes.  Once [`Self::poll`] reports the
    /// byte count, the data is collected with [`Self::take_data`].
    pub fn read(&self, handle: Handle, length: usize) -> StreamResult<()> {
        self.read_with(handle, length, Method::Normal)
    }

    pub fn read_with(&self, handle: Handle, length: usize, method: Method) -> StreamResult<()> {
        self.submit(handle, Operation::Read, method, |slot| {
            slot.length = length;
            slot.transferred = 0;
        })
    }

    pub fn lseek(&self, handle: Handle, offset: i64, whence: Whence) -> StreamResult<()> {
        self.lseek_with(handle, offset, whence, Method::Normal)
    }

    pub fn lseek_with(
        &self,
        handle: Handle,
        offset: i64,
        whence: Whence,
        method: Method,
    ) -> StreamResult<()> {
        self.submit(handle, Operation::LSeek, method, |slot| {
            slot.seek = (offset, whence);
        })
    }

    /// Returns the outcome of the last operation on `handle` without
    /// blocking: [`StreamError::Pending`] while it is in flight, otherwise
    /// the byte count, new offset, or 0.
    pub fn poll(&self, handle: Handle) -> StreamResult<u64> {
        let state = self.lock();
        let slot = state
            .slots
            .get(handle)
            .ok_or(StreamError::BadHandle(handle))?;
        slot.outcome(handle)
    }

    /// Hands over the bytes of the last completed read on `handle`.
    pub fn take_data(&self, handle: Handle) -> StreamResult<Vec<u8>> {
        let mut state = self.lock();
        let slot = state
            .slots
            .get_mut(handle)
            .ok_or(StreamError::BadHandle(handle))?;
        slot.outcome(handle)?;
        Ok(std::mem::take(&mut slot.buffer))
    }

    /// Performs one unit of work.  Returns [`Status::Ok`] when there was
    /// nothing to do and [`Status::Pending`] otherwise.
    pub fn tick(&self) -> Status {
        let (index, mut job) = {
            let mut state = self.lock();
            state.drain_pending();
            let index = state.active.head;
            if index == NONE {
                return Status::Ok;
            }
            (index, state.take_job(index, self.chunk_size))
        };

        let outcome = self.perform(&mut job);

        let finished = self.lock().finish(index, job, outcome);
        if let Some(finished) = finished {
            trace!(
                "handle {}: {:?} finished with {:?}",
                finished.handle,
                finished.operation,
                finished.result
            );
            if let (Method::Remote, Some(completion)) = (finished.method, &self.completion) {
                completion.complete(
                    finished.handle,
                    finished.operation,
                    &finished.result,
                    finished.data,
                );
            }
        }
        Status::Pending
    }

    fn perform(&self, job: &mut Job) -> Result<u64, DriverError> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        match job {
            Job::Open { filename, mode } => driver.open(filename, *mode).map(|fd| fd as u64),
            Job::Close { target: None } => Ok(0),
            Job::Close { target: Some(fd) } => driver.close(*fd).map(|()| 0),
            Job::Read {
                target: Some(fd),
                buffer,
                from,
                packet,
            } => driver
                .read(*fd, &mut buffer[*from..*from + *packet])
                .map(|n| n as u64),
            Job::LSeek {
                target: Some(fd),
                offset,
                whence,
            } => driver.lseek(*fd, *offset, *whence),
            Job::Read { target: None, .. } | Job::LSeek { target: None, .. } => {
                Err(DriverError::BadDescriptor(usize::MAX))
            }
        }
    }

    /// Blocks until work is queued or the queue is shut down.  Returns
    /// `false` once shut down.
    pub fn wait_for_work(&self) -> bool {
        let state = self.lock();
        let state = self
            .wake
            .wait_while(state, |state| {
                !state.shutdown && state.pending.head == NONE && state.active.head == NONE
            })
            .unwrap_or_else(PoisonError::into_inner);
        !state.shutdown
    }

    /// Rejects further submissions and wakes any waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.wake.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    /// Runs the driver to idle on the calling thread.
    pub fn run_until_idle(&self) {
        while self.tick() == Status::Pending {}
    }

    /// Closes every open handle directly on the driver.
    pub(crate) fn close_all(&self) {
        let targets: Vec<Fd> = {
            let mut state = self.lock();
            state
                .slots
                .iter_mut()
                .filter(|slot| slot.mode == Mode::File)
                .filter_map(|slot| {
                    slot.mode = Mode::Free;
                    slot.target.take()
                })
                .collect()
        };
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        for fd in targets {
            let _ = driver.close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::MemoryDriver;

    fn queue_with(files: &[(&str, Vec<u8>)]) -> (RequestQueue, Arc<StdMutex<Vec<Fd>>>) {
        let driver = MemoryDriver::new(files);
        let log = driver.read_log();
        (RequestQueue::new(Box::new(driver)), log)
    }

    fn open_now(queue: &RequestQueue, name: &str) -> Handle {
        let handle = queue.open(name, OpenMode::Read).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(0));
        handle
    }

    #[test]
    fn test_ring_order() {
        let (queue, _) = queue_with(&[]);
        let mut state = queue.lock();
        for index in [3, 1, 5] {
            state.attach(Ring::Pending, index);
        }
        state.attach(Ring::Active, 7);
        assert_eq!(state.members(Ring::Pending), [3, 1, 5]);

        state.drain_pending();
        assert_eq!(state.members(Ring::Pending), Vec::<usize>::new());
        assert_eq!(state.members(Ring::Active), [7, 3, 1, 5]);

        state.detach(1);
        assert_eq!(state.members(Ring::Active), [7, 3, 5]);
        state.detach(7);
        state.attach(Ring::Active, 7);
        assert_eq!(state.members(Ring::Active), [3, 5, 7]);
        state.detach(5);
        state.detach(3);
        state.detach(7);
        assert_eq!((state.active.head, state.active.tail), (NONE, NONE));
        assert!(state.slots.iter().all(|s| s.prev == NONE && s.next == NONE));
    }

    #[test]
    fn test_open_read_close() {
        let (queue, _) = queue_with(&[("a.txt", b"hello world".to_vec())]);
        let handle = queue.open("a.txt", OpenMode::Read).unwrap();
        assert_eq!(queue.poll(handle), Err(StreamError::Pending));
        assert_eq!(queue.tick(), Status::Pending);
        assert_eq!(queue.tick(), Status::Ok);
        assert_eq!(queue.poll(handle), Ok(0));

        queue.read(handle, 5).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(5));
        assert_eq!(queue.take_data(handle).unwrap(), b"hello");

        queue.lseek(handle, -5, Whence::End).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(6));

        queue.read(handle, 100).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(5));
        assert_eq!(queue.take_data(handle).unwrap(), b"world");

        queue.close(handle).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(0));
        assert_eq!(queue.read(handle, 1), Err(StreamError::BadHandle(handle)));
    }

    #[test]
    fn test_failed_open_frees_slot() {
        let (queue, _) = queue_with(&[]);
        let handle = queue.open("missing", OpenMode::Read).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle).unwrap_err().status(), Status::Error);
        assert_eq!(queue.open("missing", OpenMode::Read), Ok(handle));
    }

    #[test]
    fn test_poll_unused_slot() {
        let (queue, _) = queue_with(&[]);
        for handle in 0..STREAMER_MAX_FILEHANDLES {
            assert_eq!(queue.poll(handle), Err(StreamError::BadHandle(handle)));
            assert_eq!(queue.poll(handle).unwrap_err().status(), Status::Error);
            assert_eq!(queue.take_data(handle), Err(StreamError::BadHandle(handle)));
        }
    }

    #[test]
    fn test_unbounded_read_length() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let (queue, _) = queue_with(&[("big", data.clone())]);
        let handle = open_now(&queue, "big");

        queue.read(handle, usize::MAX).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(data.len() as u64));
        assert_eq!(queue.take_data(handle).unwrap(), data);

        queue.read(handle, usize::MAX).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(0));
        assert_eq!(queue.take_data(handle).unwrap(), b"");
    }

    #[test]
    fn test_new_request_drops_unread_data() {
        let (queue, _) = queue_with(&[("a.txt", b"hello world".to_vec())]);
        let handle = open_now(&queue, "a.txt");

        queue.read(handle, 5).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(5));

        queue.lseek(handle, 0, Whence::Set).unwrap();
        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(0));
        assert_eq!(queue.take_data(handle).unwrap(), b"");
    }

    #[test]
    fn test_validation() {
        let (queue, _) = queue_with(&[("a", vec![1, 2, 3])]);
        assert_eq!(queue.read(99, 1), Err(StreamError::BadHandle(99)));
        assert_eq!(queue.close(0), Err(StreamError::BadHandle(0)));
        assert_eq!(queue.poll(99), Err(StreamError::BadHandle(99)));
        let long = "x".repeat(STREAMER_MAX_FILENAME);
        assert_eq!(queue.open(&long, OpenMode::Read), Err(StreamError::NameTooLong));

        // The slot of an open in flight is not a file yet.
        let handle = queue.open("a", OpenMode::Read).unwrap();
        assert_eq!(queue.read(handle, 1), Err(StreamError::BadHandle(handle)));
    }

    #[test]
    fn test_busy_rejection() {
        let (queue, _) = queue_with(&[("a", vec![7; 10])]);
        let handle = open_now(&queue, "a");

        queue.read(handle, 4).unwrap();
        assert_eq!(queue.read(handle, 8), Err(StreamError::Busy(handle)));
        assert_eq!(queue.lseek(handle, 0, Whence::Set).unwrap_err().status(), Status::Busy);
        assert_eq!(queue.close(handle), Err(StreamError::Busy(handle)));

        queue.run_until_idle();
        assert_eq!(queue.poll(handle), Ok(4));
        assert_eq!(queue.take_data(handle).unwrap(), vec![7; 4]);
    }

    #[test]
    fn test_handle_exhaustion() {
        let (queue, _) = queue_with(&[("a", vec![])]);
        let handles: Vec<Handle> = (0..STREAMER_MAX_FILEHANDLES)
            .map(|_| queue.open("a", OpenMode::Read).unwrap())
            .collect();
        assert_eq!(queue.open("a", OpenMode::Read), Err(StreamError::NoFreeHandle));
        queue.run_until_idle();
        assert_eq!(queue.open("a", OpenMode::Read), Err(StreamError::NoFreeHandle));

        queue.close(handles[3]).unwrap();
        assert_eq!(queue.open("a", OpenMode::Read), Err(StreamError::NoFreeHandle));
        queue.run_until_idle();
        assert_eq!(queue.poll(handles[3]), Ok(0));
        assert_eq!(queue.open("a", OpenMode::Read), Ok(handles[3]));
        assert_eq!(queue.open("a", OpenMode::Read), Err(StreamError::NoFreeHandle));
    }

    #[test]
    fn test_round_robin() {
        let (queue, log) = queue_with(&[("a", vec![1; 1000]), ("b", vec![2; 1000])]);
        let queue = queue.with_chunk_size(256);
        let a = open_now(&queue, "a");
        let b = open_now(&queue, "b");

        queue.read(a, 1000).unwrap();
        queue.read(b, 1000).unwrap();
        queue.run_until_idle();

        // Driver descriptors are handed out in open order.
        assert_eq!(*log.lock().unwrap(), [0, 1, 0, 1, 0, 1, 0, 1]);
        assert_eq!(queue.take_data(a).unwrap(), vec![1; 1000]);
        assert_eq!(queue.take_data(b).unwrap(), vec![2; 1000]);
    }

    #[test]
    fn test_late_submission_waits_for_next_tick() {
        let (queue, log) = queue_with(&[("a", vec![1; 600]), ("b", vec![2; 600])]);
        let queue = queue.with_chunk_size(200);
        let a = open_now(&queue, "a");
        let b = open_now(&queue, "b");

        queue.read(a, 600).unwrap();
        assert_eq!(queue.tick(), Status::Pending);
        queue.read(b, 600).unwrap();
        queue.run_until_idle();

        // b joins behind the rescheduled a
        assert_eq!(*log.lock().unwrap(), [0, 0, 1, 0, 1, 1]);
    }

    struct Recorder(StdMutex<Vec<(Handle, Operation, StreamResult<u64>, Option<Vec<u8>>)>>);

    impl Completion for Recorder {
        fn complete(
            &self,
            handle: Handle,
            operation: Operation,
            result: &StreamResult<u64>,
            data: Option<Vec<u8>>,
        ) {
            self.0
                .lock()
                .unwrap()
                .push((handle, operation, result.clone(), data));
        }
    }

    #[test]
    fn test_remote_completion() {
        let recorder = Arc::new(Recorder(StdMutex::new(vec![])));
        let queue = RequestQueue::new(Box::new(MemoryDriver::new(&[("a", b"abc".to_vec())])))
            .with_completion(recorder.clone());

        let local = open_now(&queue, "a");
        let remote = queue.open_with("a", OpenMode::Read, Method::Remote).unwrap();
        queue.run_until_idle();
        queue.read_with(remote, 2, Method::Remote).unwrap();
        queue.read(local, 2).unwrap();
        queue.run_until_idle();

        let calls = recorder.0.lock().unwrap();
        assert_eq!(
            *calls,
            [
                (remote, Operation::Open, Ok(0), None),
                (remote, Operation::Read, Ok(2), Some(b"ab".to_vec())),
            ]
        );
    }

    #[test]
    fn test_shutdown_wakes_and_rejects() {
        let (queue, _) = queue_with(&[("a", vec![])]);
        queue.shutdown();
        assert!(!queue.wait_for_work());
        assert_eq!(queue.open("a", OpenMode::Read), Err(StreamError::ShutDown));
    }
}
