//! Request forwarding over a message channel.
//!
//! [`serve`] starts a dispatcher thread that owns a [`Streamer`] and accepts
//! calls from a [`RemoteClient`].  Submissions are answered synchronously with
//! their validation outcome.  Completions are not sent back as messages:
//! the worker writes each result into a fixed-size reply block on a shared
//! [`ReplyBoard`], which the client reads when it polls.
//!
//! Before submitting, the dispatcher posts `Pending` to the handle's reply
//! block, and posts `Error` if the submission is rejected.  An accepted
//! submission drops any read data the client never collected.  The board stays
//! locked across the submission so a fast completion cannot be overwritten
//! by the `Pending` marker.

use std::{
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, trace};
use zerocopy::{little_endian::I64, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    driver::{DriverResult, OpenMode, Whence},
    frontend::{Streamer, StreamerConfig},
    queue::{
        Completion, Handle, Method, Operation, StreamError, StreamResult, STREAMER_MAX_FILEHANDLES,
    },
};

/// Procedure numbers of the remote interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Procedure {
    Initialize = 1,
    Open = 2,
    Close = 3,
    Read = 4,
    LSeek = 6,
}

const RESULT_ERROR: i64 = -1;
const RESULT_BUSY: i64 = -2;
const RESULT_PENDING: i64 = -3;

/// The reply for one handle as it lands in client memory.
///
/// The value is repeated to fill a fixed 32-byte transfer.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ReplyBlock {
    pub result: [I64; 4],
}

impl ReplyBlock {
    fn new(result: &StreamResult<u64>) -> Self {
        let code = match result {
            Ok(value) => i64::try_from(*value).unwrap_or(i64::MAX),
            Err(StreamError::Busy(_)) => RESULT_BUSY,
            Err(StreamError::Pending) => RESULT_PENDING,
            Err(_) => RESULT_ERROR,
        };
        ReplyBlock {
            result: [I64::new(code); 4],
        }
    }

    fn decode(&self, handle: Handle) -> StreamResult<u64> {
        match self.result[0].get() {
            RESULT_PENDING => Err(StreamError::Pending),
            RESULT_BUSY => Err(StreamError::Busy(handle)),
            code if code < 0 => Err(StreamError::Failed(format!(
                "remote request on handle {handle} failed"
            ))),
            code => Ok(code as u64),
        }
    }
}

#[derive(Debug)]
struct Reply {
    block: [u8; size_of::<ReplyBlock>()],
    data: Vec<u8>,
}

/// Reply blocks for every handle, written by the server and read by the client.
#[derive(Debug)]
pub struct ReplyBoard {
    replies: Mutex<Vec<Reply>>,
}

impl ReplyBoard {
    fn new() -> Self {
        let mut replies: Vec<Reply> = (0..STREAMER_MAX_FILEHANDLES)
            .map(|_| Reply {
                block: [0; size_of::<ReplyBlock>()],
                data: vec![],
            })
            .collect();
        // Nothing has been submitted on any handle yet.
        for handle in 0..STREAMER_MAX_FILEHANDLES {
            ReplyBoard::post(&mut replies, handle, &Err(StreamError::BadHandle(handle)));
        }
        ReplyBoard {
            replies: Mutex::new(replies),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Reply>> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(replies: &mut [Reply], handle: Handle, result: &StreamResult<u64>) {
        if let Some(reply) = replies.get_mut(handle) {
            reply
                .block
                .copy_from_slice(ReplyBlock::new(result).as_bytes());
        }
    }

    fn read(&self, handle: Handle) -> StreamResult<u64> {
        let replies = self.lock();
        let reply = replies.get(handle).ok_or(StreamError::BadHandle(handle))?;
        let block = ReplyBlock::read_from_bytes(&reply.block)
            .map_err(|_| StreamError::BadHandle(handle))?;
        block.decode(handle)
    }
}

impl Completion for ReplyBoard {
    fn complete(
        &self,
        handle: Handle,
        operation: Operation,
        result: &StreamResult<u64>,
        data: Option<Vec<u8>>,
    ) {
        trace!("remote completion: handle {handle} {operation:?} -> {result:?}");
        let mut replies = self.lock();
        if let (Some(reply), Some(data)) = (replies.get_mut(handle), data) {
            reply.data = data;
        }
        ReplyBoard::post(&mut replies, handle, result);
    }
}

#[derive(Debug)]
enum Call {
    Open { name: String, mode: OpenMode },
    Close { handle: Handle },
    Read { handle: Handle, length: usize },
    LSeek { handle: Handle, offset: i64, whence: Whence },
}

impl Call {
    fn procedure(&self) -> Procedure {
        match self {
            Call::Open { .. } => Procedure::Open,
            Call::Close { .. } => Procedure::Close,
            Call::Read { .. } => Procedure::Read,
            Call::LSeek { .. } => Procedure::LSeek,
        }
    }
}

#[derive(Debug)]
struct Request {
    call: Call,
    reply: mpsc::SyncSender<StreamResult<Handle>>,
}

fn dispatch(streamer: &Streamer, board: &ReplyBoard, call: Call) -> StreamResult<Handle> {
    let queue = streamer.queue();
    let mut replies = board.lock();

    let (handle, result) = match call {
        Call::Open { name, mode } => match queue.open_with(&name, mode, Method::Remote) {
            Ok(handle) => (handle, Ok(handle)),
            Err(err) => return Err(err),
        },
        Call::Close { handle } => (
            handle,
            queue.close_with(handle, Method::Remote).map(|()| handle),
        ),
        Call::Read { handle, length } => (
            handle,
            queue
                .read_with(handle, length, Method::Remote)
                .map(|()| handle),
        ),
        Call::LSeek {
            handle,
            offset,
            whence,
        } => (
            handle,
            queue
                .lseek_with(handle, offset, whence, Method::Remote)
                .map(|()| handle),
        ),
    };

    // The worker cannot deliver the completion until `replies` is released.
    // A busy handle keeps the reply of the request it is still working on.
    match &result {
        Ok(_) => {
            if let Some(reply) = replies.get_mut(handle) {
                reply.data.clear();
            }
            ReplyBoard::post(&mut replies, handle, &Err(StreamError::Pending));
        }
        Err(StreamError::Busy(_)) => {}
        Err(err) => ReplyBoard::post(&mut replies, handle, &Err(err.clone())),
    }
    result
}

/// The client end of a remote streamer.
#[derive(Debug)]
pub struct RemoteClient {
    requests: Option<mpsc::Sender<Request>>,
    board: Arc<ReplyBoard>,
    dispatcher: Option<JoinHandle<()>>,
}

/// Starts a streamer behind a dispatcher thread and returns its client.
pub fn serve(config: &StreamerConfig) -> DriverResult<RemoteClient> {
    let board = Arc::new(ReplyBoard::new());
    let completion: Arc<dyn Completion> = board.clone();
    let streamer = Streamer::initialize_with(config, Some(completion))?;
    let (requests, incoming) = mpsc::channel::<Request>();

    let dispatcher = thread::Builder::new().name("streamer-rpc".into()).spawn({
        let board = Arc::clone(&board);
        move || {
            debug!("rpc: {:?} complete", Procedure::Initialize);
            for Request { call, reply } in incoming {
                trace!("rpc: {:?} {call:?}", call.procedure());
                let _ = reply.send(dispatch(&streamer, &board, call));
            }
            streamer.shutdown();
            debug!("rpc: dispatcher stopped");
        }
    })?;

    Ok(RemoteClient {
        requests: Some(requests),
        board,
        dispatcher: Some(dispatcher),
    })
}

impl RemoteClient {
    fn call(&self, call: Call) -> StreamResult<Handle> {
        let requests = self.requests.as_ref().ok_or(StreamError::ShutDown)?;
        let (reply, response) = mpsc::sync_channel(1);
        requests
            .send(Request { call, reply })
            .map_err(|_| StreamError::ShutDown)?;
        response.recv().map_err(|_| StreamError::ShutDown)?
    }

    pub fn open(&self, name: &str, mode: OpenMode) -> StreamResult<Handle> {
        self.call(Call::Open {
            name: name.to_string(),
            mode,
        })
    }

    pub fn close(&self, handle: Handle) -> StreamResult<()> {
        self.call(Call::Close { handle }).map(|_| ())
    }

    pub fn read(&self, handle: Handle, length: usize) -> StreamResult<()> {
        self.call(Call::Read { handle, length }).map(|_| ())
    }

    pub fn lseek(&self, handle: Handle, offset: i64, whence: Whence) -> StreamResult<()> {
        self.call(Call::LSeek {
            handle,
            offset,
            whence,
        })
        .map(|_| ())
    }

    /// Reads the handle's reply block.  No message is exchanged.
    pub fn poll(&self, handle: Handle) -> StreamResult<u64> {
        self.board.read(handle)
    }

    pub fn take_data(&self, handle: Handle) -> StreamResult<Vec<u8>> {
        self.poll(handle)?;
        let mut replies = self.board.lock();
        let reply = replies
            .get_mut(handle)
            .ok_or(StreamError::BadHandle(handle))?;
        Ok(std::mem::take(&mut reply.data))
    }

    pub fn wait(&self, handle: Handle) -> StreamResult<u64> {
        loop {
            match self.poll(handle) {
                Err(StreamError::Pending) => thread::sleep(Duration::from_micros(100)),
                result => return result,
            }
        }
    }

    /// Disconnects and waits for the server side to shut down.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.requests = None;
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                log::error!("rpc dispatcher panicked");
            }
        }
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.stop();
    }
}
