//! Stream socket with timed, interrupt-aware blocking operations.
//!
//! Every blocking call composes three limits: the explicit per-call timeout
//! (or the socket's configured operation timeout), the calling thread's
//! cooperative budget ([`task::remaining_budget`]) and the interrupt
//! resolution. Waits are sliced so interrupts are observed within
//! [`task::INTERRUPT_RESOLUTION`] regardless of how the OS blocks.
//!
//! How a wait blocks is decided once, at construction: if the kernel
//! accepts `SO_RCVTIMEO`/`SO_SNDTIMEO` the socket stays blocking and each
//! slice becomes a kernel timeout; otherwise the socket is switched to
//! non-blocking and slices become `poll(2)` readiness waits. The mode never
//! changes mid-stream.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::{Error, Result, task};

/// Throwaway value for the construction-time kernel-timeout probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1);

/// Sentinel for "no kernel timeout applied yet".
const TIMEOUT_UNSET: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitMode {
    /// Blocking socket, per-slice `SO_RCVTIMEO`/`SO_SNDTIMEO`.
    KernelTimeout,
    /// Non-blocking socket, per-slice `poll(2)`.
    Readiness,
}

#[derive(Clone, Copy)]
enum Channel {
    Rx,
    Tx,
}

pub struct TcpSocket {
    sock: Socket,
    mode: WaitMode,
    /// Configured receive timeout in millis; 0 = unbounded.
    so_timeout_ms: AtomicU64,
    /// Configured send timeout in millis; 0 = unbounded.
    send_timeout_ms: AtomicU64,
    /// Kernel timeout currently applied per channel, to skip redundant
    /// setsockopt calls. Only meaningful in `KernelTimeout` mode.
    applied_rx_ms: AtomicU64,
    applied_tx_ms: AtomicU64,
    bound: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl TcpSocket {
    /// Fresh unconnected socket for `addr`'s address family.
    pub fn new(addr: &SocketAddr) -> Result<Self> {
        let sock = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
        let mode = probe_wait_mode(&sock);
        Ok(Self {
            sock,
            mode,
            so_timeout_ms: AtomicU64::new(0),
            send_timeout_ms: AtomicU64::new(0),
            applied_rx_ms: AtomicU64::new(TIMEOUT_UNSET),
            applied_tx_ms: AtomicU64::new(TIMEOUT_UNSET),
            bound: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    // ----- lifecycle ------------------------------------------------------

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.ensure_open()?;
        if self.is_bound() {
            return Err(Error::Io(io::Error::other("socket is already bound")));
        }
        self.sock.bind(&addr.into())?;
        self.bound.store(true, Ordering::Release);
        Ok(())
    }

    /// Connects within `timeout`, composed with the thread's remaining
    /// budget. A zero `timeout` means "budget only"; with no budget
    /// installed the wait is bounded by the OS alone.
    pub fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        if self.is_connected() {
            return Err(Error::Io(io::Error::other("socket is already connected")));
        }

        let deadline = compose_deadline((!timeout.is_zero()).then_some(timeout));

        // connect is driven non-blocking in both wait modes; a blocking
        // socket is restored once the handshake completes
        if self.mode == WaitMode::KernelTimeout {
            self.sock.set_nonblocking(true)?;
        }

        match self.sock.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if connect_pending(&err) => loop {
                if task::interrupted() {
                    return Err(Error::SocketTimeout { reason: "socket connect interrupt" });
                }
                let slice = wait_slice(deadline, "socket connect timeout")?;
                if self.poll_ready(Channel::Tx, slice)? {
                    if let Some(err) = self.sock.take_error()? {
                        return Err(Error::Io(err));
                    }
                    break;
                }
            },
            Err(err) => return Err(Error::Io(err)),
        }

        if self.mode == WaitMode::KernelTimeout {
            self.sock.set_nonblocking(false)?;
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Logical close: the peer observes the shutdown immediately, while the
    /// descriptor is released only when the last clone of this socket
    /// drops, so a thread still blocked on it cannot race FD reuse.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sock.shutdown(Shutdown::Both);
    }

    pub fn shutdown(&self, read: bool, write: bool) -> Result<()> {
        let how = match (read, write) {
            (true, true) => Shutdown::Both,
            (true, false) => Shutdown::Read,
            (false, true) => Shutdown::Write,
            (false, false) => return Ok(()),
        };
        self.sock.shutdown(how)?;
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self.sock.local_addr()?;
        addr.as_socket().ok_or_else(|| Error::Io(io::Error::other("socket has no inet address")))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let addr = self.sock.peer_addr()?;
        addr.as_socket().ok_or_else(|| Error::Io(io::Error::other("socket has no inet address")))
    }

    // ----- transfer -------------------------------------------------------

    /// Reads at least one octet, honouring the configured operation
    /// timeout. Zero octets after the OS reported readiness is peer EOF.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_timeout(buf, None)
    }

    pub fn read_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.ensure_stream()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.op_deadline(timeout, &self.so_timeout_ms);
        loop {
            if task::interrupted() {
                return Err(Error::InterruptedIo { reason: "socket read interrupt", bytes: 0 });
            }
            let slice = wait_slice(deadline, "socket read timeout")?;
            match self.transfer_once(Channel::Rx, slice, |sock| (&*sock).read(buf))? {
                Some(0) => return Err(Error::Eof),
                Some(read) => return Ok(read),
                None => {} // slice elapsed; go around for interrupt/deadline
            }
        }
    }

    /// Writes the whole buffer, honouring the configured operation timeout.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        self.write_timeout(buf, None)
    }

    pub fn write_timeout(&self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.ensure_stream()?;
        let deadline = self.op_deadline(timeout, &self.send_timeout_ms);
        let mut written = 0;
        while written < buf.len() {
            if task::interrupted() {
                return Err(Error::InterruptedIo { reason: "socket write interrupt", bytes: written });
            }
            let slice = wait_slice(deadline, "socket write timeout")?;
            let offset = written;
            match self.transfer_once(Channel::Tx, slice, move |sock| (&*sock).write(&buf[offset..]))? {
                Some(0) => return Err(Error::Eof),
                Some(sent) => written += sent,
                None => {}
            }
        }
        Ok(())
    }

    /// Octets readable without blocking.
    pub fn available(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int
        let rc = unsafe { libc::ioctl(self.sock.as_raw_fd(), libc::FIONREAD, &raw mut pending) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(pending.max(0) as usize)
    }

    /// One timed attempt. `Ok(None)` means the slice elapsed with no
    /// progress; `Ok(Some(0))` means the peer is gone.
    fn transfer_once(
        &self,
        chan: Channel,
        slice: Duration,
        mut op: impl FnMut(&Socket) -> io::Result<usize>,
    ) -> Result<Option<usize>> {
        if self.mode == WaitMode::KernelTimeout {
            self.apply_kernel_timeout(chan, slice)?;
            return match op(&self.sock) {
                Ok(moved) => Ok(Some(moved)),
                Err(err) => soft_error(err),
            };
        }

        // optimistic syscall first to skip the poll cost
        match op(&self.sock) {
            Ok(moved) => Ok(Some(moved)),
            Err(err) => match soft_error(err)? {
                Some(moved) => Ok(Some(moved)),
                None => {
                    if self.poll_ready(chan, slice)? {
                        match op(&self.sock) {
                            Ok(moved) => Ok(Some(moved)),
                            Err(err) => soft_error(err),
                        }
                    } else {
                        Ok(None)
                    }
                }
            },
        }
    }

    fn apply_kernel_timeout(&self, chan: Channel, slice: Duration) -> Result<()> {
        let ms = slice.as_millis().max(1) as u64;
        let applied = match chan {
            Channel::Rx => &self.applied_rx_ms,
            Channel::Tx => &self.applied_tx_ms,
        };
        if applied.load(Ordering::Relaxed) != ms {
            let timeout = Some(Duration::from_millis(ms));
            match chan {
                Channel::Rx => self.sock.set_read_timeout(timeout)?,
                Channel::Tx => self.sock.set_write_timeout(timeout)?,
            }
            applied.store(ms, Ordering::Relaxed);
        }
        Ok(())
    }

    fn poll_ready(&self, chan: Channel, slice: Duration) -> Result<bool> {
        let events = match chan {
            Channel::Rx => libc::POLLIN,
            Channel::Tx => libc::POLLOUT,
        };
        let mut pfd = libc::pollfd { fd: self.sock.as_raw_fd(), events, revents: 0 };
        let millis = slice.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: pfd is a single valid pollfd for the duration of the call
        let rc = unsafe { libc::poll(&raw mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        // POLLERR/POLLHUP count as ready; the following syscall reports it
        Ok(rc > 0)
    }

    /// Effective deadline for one operation: the explicit timeout (falling
    /// back to the configured one) capped by the thread's budget.
    fn op_deadline(&self, explicit: Option<Duration>, configured_ms: &AtomicU64) -> Option<Instant> {
        let configured = explicit.filter(|t| !t.is_zero()).or_else(|| {
            let ms = configured_ms.load(Ordering::Relaxed);
            (ms > 0).then(|| Duration::from_millis(ms))
        });
        compose_deadline(configured)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Io(io::Error::other("socket is closed")));
        }
        Ok(())
    }

    fn ensure_stream(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::Io(io::Error::other("socket is not connected")));
        }
        Ok(())
    }

    // ----- options --------------------------------------------------------

    /// Default timeout applied to reads; zero disables.
    pub fn set_so_timeout(&self, timeout: Duration) {
        self.so_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn so_timeout(&self) -> Option<Duration> {
        let ms = self.so_timeout_ms.load(Ordering::Relaxed);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// Default timeout applied to writes; zero disables.
    pub fn set_send_timeout(&self, timeout: Duration) {
        self.send_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        let ms = self.send_timeout_ms.load(Ordering::Relaxed);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub fn set_keep_alive(&self, enabled: bool) -> Result<()> {
        if self.sock.keepalive()? != enabled {
            self.sock.set_keepalive(enabled)?;
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Result<bool> {
        Ok(self.sock.keepalive()?)
    }

    pub fn reuse_address(&self) -> Result<bool> {
        Ok(self.sock.reuse_address()?)
    }

    pub fn tcp_no_delay(&self) -> Result<bool> {
        Ok(self.sock.nodelay()?)
    }

    /// Linger in whole seconds; `None` when disabled.
    pub fn linger(&self) -> Result<Option<u64>> {
        Ok(self.sock.linger()?.map(|linger| linger.as_secs()))
    }

    pub fn receive_buffer_size(&self) -> Result<usize> {
        Ok(self.sock.recv_buffer_size()?)
    }

    pub fn send_buffer_size(&self) -> Result<usize> {
        Ok(self.sock.send_buffer_size()?)
    }

    pub fn set_reuse_address(&self, reuse: bool) -> Result<()> {
        if !self.is_bound() && self.sock.reuse_address()? != reuse {
            self.sock.set_reuse_address(reuse)?;
        }
        Ok(())
    }

    pub fn set_tcp_no_delay(&self, no_delay: bool) -> Result<()> {
        if self.sock.nodelay()? != no_delay {
            self.sock.set_nodelay(no_delay)?;
        }
        Ok(())
    }

    /// Best-effort `SO_LINGER` from a millisecond configuration value:
    /// negative disables, zero leaves the OS default untouched. A value the
    /// OS refuses to reflect back is logged, not raised.
    pub fn set_linger(&self, millis: i64) -> Result<()> {
        let secs = if millis >= 0 { millis / 1000 } else { -1 };
        if secs == 0 {
            return Ok(());
        }
        let target = (secs > 0).then(|| Duration::from_secs(secs as u64));
        if self.sock.linger()? != target {
            self.sock.set_linger(target)?;
            let actual = self.sock.linger()?;
            if actual != target {
                warn!(requested_secs = secs, ?actual, "socket linger time not honoured");
            }
        }
        Ok(())
    }

    /// Zero leaves the OS default; a smaller-than-requested result is
    /// accepted and logged.
    pub fn set_receive_buffer_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.sock.set_recv_buffer_size(size)?;
        let actual = self.sock.recv_buffer_size()?;
        if actual < size {
            warn!(requested = size, actual, "receive buffer size not honoured");
        }
        Ok(())
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.sock.set_send_buffer_size(size)?;
        let actual = self.sock.send_buffer_size()?;
        if actual < size {
            warn!(requested = size, actual, "send buffer size not honoured");
        }
        Ok(())
    }
}

fn probe_wait_mode(sock: &Socket) -> WaitMode {
    // attempt SO_RCVTIMEO/SO_SNDTIMEO up front; switching modes mid-stream
    // is not safe when rx and tx run on different threads
    let probed = sock
        .set_read_timeout(Some(PROBE_TIMEOUT))
        .and_then(|()| sock.set_write_timeout(Some(PROBE_TIMEOUT)));
    match probed {
        Ok(()) => WaitMode::KernelTimeout,
        Err(err) => {
            let _ = sock.set_read_timeout(None);
            let _ = sock.set_write_timeout(None);
            debug!(?err, "kernel socket timeouts unavailable, using readiness polling");
            if let Err(err) = sock.set_nonblocking(true) {
                warn!(?err, "could not switch socket to non-blocking mode");
            }
            WaitMode::Readiness
        }
    }
}

fn connect_pending(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Maps syscall errors: would-block family to "no progress", peer-gone
/// family to EOF, the rest to hard I/O errors.
fn soft_error(err: io::Error) -> Result<Option<usize>> {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => Ok(None),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Err(Error::Eof),
        _ => Err(Error::Io(err)),
    }
}

fn wait_slice(deadline: Option<Instant>, reason: &'static str) -> Result<Duration> {
    match deadline {
        None => Ok(task::INTERRUPT_RESOLUTION),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::SocketTimeout { reason });
            }
            Ok(remaining.min(task::INTERRUPT_RESOLUTION))
        }
    }
}

fn compose_deadline(explicit: Option<Duration>) -> Option<Instant> {
    let now = Instant::now();
    match (explicit, task::remaining_budget()) {
        (None, None) => None,
        (Some(t), None) => Some(now + t),
        (None, Some(b)) => Some(now + b),
        (Some(t), Some(b)) => Some(now + t.min(b)),
    }
}

/// `io::Read` view of a shared socket, for layering buffered streams.
pub struct SocketReader {
    socket: Arc<TcpSocket>,
}

impl SocketReader {
    pub fn new(socket: Arc<TcpSocket>) -> Self {
        Self { socket }
    }
}

impl Read for SocketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf).map_err(io::Error::from)
    }
}

/// `io::Write` view of a shared socket.
pub struct SocketWriter {
    socket: Arc<TcpSocket>,
}

impl SocketWriter {
    pub fn new(socket: Arc<TcpSocket>) -> Self {
        Self { socket }
    }
}

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf).map(|()| buf.len()).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        // sockets have no user-space flush; buffering happens above
        Ok(())
    }
}
