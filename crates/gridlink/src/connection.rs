//! One framed connection: the socket, its buffered streams, the dedicated
//! reader thread and the send path shared by concurrent writers.

use std::{
    io::{self, Write},
    net::SocketAddr,
    sync::{
        Arc, Weak, mpsc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

use gridlink_net::{
    SocketReader, SocketWriter, TcpSocket,
    buffer::{BufferedInput, BufferedOutput},
    task::{self, InterruptHandle},
    wire,
};
use parking_lot::Mutex;
use tracing::{Level, debug, span};

use crate::{
    Error, Result,
    channel::{Channel, OpenOutcome},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Default)]
struct ConnectionStats {
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
}

/// Owner notified when a connection leaves the open state for good.
pub(crate) trait ConnectionOwner: Send + Sync {
    fn connection_ended(&self, id: u64, cause: Option<Arc<Error>>);
}

struct ReaderHandle {
    join: JoinHandle<()>,
    interrupt: InterruptHandle,
    thread_id: ThreadId,
}

struct Shared {
    id: u64,
    name: String,
    socket: Arc<TcpSocket>,
    /// The output monitor: all senders funnel through it.
    output: Mutex<BufferedOutput<SocketWriter>>,
    /// Senders inside or entering the monitor; the last one out flushes.
    concurrent_writers: AtomicUsize,
    stats: ConnectionStats,
    channel: Arc<dyn Channel>,
    owner: Weak<dyn ConnectionOwner>,
    max_incoming: i64,
    state: Mutex<ConnectionState>,
    /// Close-once latch.
    closing: AtomicBool,
    /// Reached the open state; gates owner notification.
    opened: AtomicBool,
    /// Reader stop request.
    exiting: AtomicBool,
    reader: Mutex<Option<ReaderHandle>>,
}

/// Handle to one framed connection. Clones share the connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(
        name: &str,
        socket: TcpSocket,
        channel: Arc<dyn Channel>,
        owner: Weak<dyn ConnectionOwner>,
        max_incoming: i64,
    ) -> Self {
        let socket = Arc::new(socket);
        let output = Mutex::new(BufferedOutput::new(SocketWriter::new(socket.clone())));
        Self {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                socket,
                output,
                concurrent_writers: AtomicUsize::new(0),
                stats: ConnectionStats::default(),
                channel,
                owner,
                max_incoming,
                state: Mutex::new(ConnectionState::Created),
                closing: AtomicBool::new(false),
                opened: AtomicBool::new(false),
                exiting: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.peer_addr()?)
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        let stats = &self.shared.stats;
        ConnectionStatsSnapshot {
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            messages_sent: stats.messages_sent.load(Ordering::Relaxed),
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Starts the reader and runs the channel-open negotiation. A redirect
    /// outcome leaves the connection for the caller to close.
    pub(crate) fn open(&self) -> Result<OpenOutcome> {
        {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Created {
                return Err(Error::illegal_state(format!(
                    "connection cannot be opened while {:?}",
                    *state
                )));
            }
            *state = ConnectionState::Opening;
        }

        self.spawn_reader()?;

        match self.shared.channel.open(self) {
            Ok(OpenOutcome::Accepted) => {
                *self.shared.state.lock() = ConnectionState::Open;
                self.shared.opened.store(true, Ordering::Release);
                Ok(OpenOutcome::Accepted)
            }
            Ok(OpenOutcome::Redirect(list)) => Ok(OpenOutcome::Redirect(list)),
            Err(err) => {
                self.close(false, None, true);
                Err(err)
            }
        }
    }

    /// Emits one frame: packed length, then the payload. Concurrent senders
    /// are serialised by the output monitor; only the last one out flushes.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        {
            let state = self.state();
            if !matches!(state, ConnectionState::Opening | ConnectionState::Open) {
                return Err(Error::connection(
                    format!("connection is {state:?}"),
                    None,
                ));
            }
        }

        let shared = &self.shared;
        shared.concurrent_writers.fetch_add(1, Ordering::AcqRel);
        let mut output = shared.output.lock();
        let written = write_frame(&mut output, payload);
        let last_writer = shared.concurrent_writers.fetch_sub(1, Ordering::AcqRel) == 1;

        let result = match written {
            Ok(()) if last_writer => output.flush(),
            Ok(()) => Ok(()),
            Err(err) => {
                if last_writer {
                    let _ = output.flush();
                }
                Err(err)
            }
        };
        drop(output);

        match result {
            Ok(()) => {
                shared.stats.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
                shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                let typed = Error::Net(gridlink_net::Error::from_io(err));
                let rendered = typed.to_string();
                self.close(false, Some(Arc::new(Error::connection(rendered.clone(), None))), false);
                Err(Error::connection(
                    format!("error sending a message: {rendered}"),
                    Some(typed),
                ))
            }
        }
    }

    /// Close-once: stops the reader (unless the reader itself is closing),
    /// releases the streams and the socket, then notifies the channel layer
    /// when asked and the owner always.
    pub(crate) fn close(&self, notify: bool, cause: Option<Arc<Error>>, wait: bool) -> bool {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(conn = shared.id, cause = ?cause, "closing connection");

        *shared.state.lock() = ConnectionState::Closing;
        shared.exiting.store(true, Ordering::Release);

        let handle = shared.reader.lock().take();
        if let Some(handle) = handle
            && handle.thread_id != thread::current().id()
        {
            handle.interrupt.interrupt();
            // unblocks a reader parked in a timed read
            shared.socket.close();
            if wait {
                let _ = handle.join.join();
            }
        }

        // push out whatever was buffered, then release the socket
        {
            let mut output = shared.output.lock();
            let _ = output.flush();
        }
        shared.socket.close();
        *shared.state.lock() = ConnectionState::Closed;

        if notify {
            match &cause {
                None => shared.channel.connection_closed(),
                Some(cause) => shared.channel.connection_error(cause),
            }
        }

        if shared.opened.load(Ordering::Acquire)
            && let Some(owner) = shared.owner.upgrade()
        {
            owner.connection_ended(shared.id, cause);
        }
        true
    }

    fn spawn_reader(&self) -> Result<()> {
        let shared = &self.shared;
        let input = BufferedInput::new(SocketReader::new(shared.socket.clone()));
        let weak = Arc::downgrade(shared);
        let (handle_tx, handle_rx) = mpsc::channel();

        let join = thread::Builder::new()
            .name(format!("{}:TcpReader", shared.name))
            .spawn(move || {
                let _ = handle_tx.send(task::interrupt_handle());
                let _span = span!(Level::INFO, "", thread = "TcpReader").entered();
                run_reader(&weak, input);
            })
            .map_err(|err| Error::Net(gridlink_net::Error::Io(err)))?;

        let interrupt = handle_rx
            .recv()
            .map_err(|_| Error::illegal_state("reader thread exited before handshake"))?;
        let thread_id = join.thread().id();
        *shared.reader.lock() = Some(ReaderHandle { join, interrupt, thread_id });
        Ok(())
    }
}

fn write_frame(output: &mut BufferedOutput<SocketWriter>, payload: &[u8]) -> io::Result<()> {
    wire::write_packed_i32(output, payload.len() as i32)?;
    output.write_all(payload)
}

/// Reader loop: length, validation, payload, hand-off. Any failure closes
/// the connection without notifying and without waiting on itself.
fn run_reader(weak: &Weak<Shared>, mut input: BufferedInput<SocketReader>) {
    loop {
        let Some(shared) = weak.upgrade() else { return };
        if shared.exiting.load(Ordering::Acquire) {
            return;
        }

        match read_frame(&mut input, shared.max_incoming) {
            Ok(frame) => {
                shared.stats.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);
                shared.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                shared.channel.on_frame(frame);
            }
            Err(err) => {
                if !shared.exiting.load(Ordering::Acquire) {
                    debug!(conn = shared.id, err = %err, "reader terminating connection");
                    Connection { shared: shared.clone() }.close(false, Some(Arc::new(err)), false);
                }
                return;
            }
        }
    }
}

fn read_frame(input: &mut BufferedInput<SocketReader>, max_incoming: i64) -> Result<Vec<u8>> {
    let length = wire::read_packed_i32(input)
        .map_err(|err| Error::Net(gridlink_net::Error::from_io(err)))?;

    if length < 0 {
        return Err(Error::protocol("received a message with a negative length"));
    }
    if length == 0 {
        return Err(Error::protocol("received a message with a length of zero"));
    }
    if max_incoming > 0 && i64::from(length) > max_incoming {
        // reject before allocating anything of that size
        return Err(Error::protocol(format!(
            "message length {length} exceeds the maximum incoming message size {max_incoming}"
        )));
    }

    let mut frame = vec![0u8; length as usize];
    input
        .read_fully(&mut frame)
        .map_err(|err| Error::Net(gridlink_net::Error::from_io(err)))?;
    Ok(frame)
}
