//! Shared harness: loopback peers speaking the frame protocol, scriptable
//! channels and counting listeners.

use std::{
    collections::VecDeque,
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use gridlink::{
    Connection, Error, ServiceKind,
    channel::{Channel, ChannelFactory, OpenOutcome},
    event::{ConnectionEvent, ConnectionListener, MemberEvent, MemberListener},
    net::wire,
};

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Reads and checks the 8-octet subport prelude.
pub fn expect_prelude(stream: &mut TcpStream, subport: i32) {
    let mut prelude = [0u8; 8];
    stream.read_exact(&mut prelude).unwrap();
    assert_eq!(prelude, wire::subport_prelude(subport), "unexpected subport prelude");
}

/// Echoes whole frames until the peer goes away.
fn echo_frames(stream: &mut TcpStream) {
    loop {
        let Ok(length) = wire::read_packed_i32(stream) else { return };
        let mut payload = vec![0u8; length as usize];
        if stream.read_exact(&mut payload).is_err() {
            return;
        }
        let mut frame = Vec::with_capacity(payload.len() + 5);
        wire::write_packed_i32(&mut frame, length).unwrap();
        frame.extend_from_slice(&payload);
        if stream.write_all(&frame).is_err() {
            return;
        }
    }
}

/// One-connection echo peer; checks the subport prelude when given.
pub fn spawn_echo_peer(subport: Option<i32>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        if let Some(subport) = subport {
            expect_prelude(&mut stream, subport);
        }
        echo_frames(&mut stream);
    });
    (addr, handle)
}

/// Accepts one connection and holds it open until dropped from the test.
pub fn spawn_idle_peer(subport: Option<i32>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        if let Some(subport) = subport {
            expect_prelude(&mut stream, subport);
        }
        // park until the client goes away
        let mut buf = [0u8; 256];
        while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
    });
    (addr, handle)
}

pub enum PeerCommand {
    DropConnection,
    Shutdown,
}

/// Peer that accepts connections one after another; the test decides when
/// each one is severed.
pub fn spawn_resettable_peer() -> (SocketAddr, mpsc::Sender<PeerCommand>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        loop {
            let Ok((stream, _)) = listener.accept() else { return };
            match rx.recv() {
                Ok(PeerCommand::DropConnection) => drop(stream),
                Ok(PeerCommand::Shutdown) | Err(_) => return,
            }
        }
    });
    (addr, tx, handle)
}

/// Channel whose open outcomes are scripted and which records everything
/// that happens to it.
#[derive(Default)]
pub struct TestChannel {
    pub open_script: Mutex<VecDeque<OpenOutcome>>,
    pub opens: AtomicUsize,
    pub frames: Mutex<Vec<Vec<u8>>>,
    pub closed: AtomicUsize,
    pub errors: AtomicUsize,
    pub lookups: Mutex<Vec<String>>,
    pub lookup_answer: Mutex<Option<Option<(String, i32)>>>,
}

impl TestChannel {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl Channel for TestChannel {
    fn open(&self, _connection: &Connection) -> gridlink::Result<OpenOutcome> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let scripted = self.open_script.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(OpenOutcome::Accepted))
    }

    fn on_frame(&self, frame: Vec<u8>) {
        self.frames.lock().unwrap().push(frame);
    }

    fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_error(&self, _cause: &Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn lookup(&self, name: &str) -> gridlink::Result<Option<(String, i32)>> {
        self.lookups.lock().unwrap().push(name.to_string());
        match self.lookup_answer.lock().unwrap().clone() {
            Some(answer) => Ok(answer),
            None => Err(Error::illegal_state("no lookup answer scripted")),
        }
    }
}

/// Factory handing out [`TestChannel`]s and remembering each one.
#[derive(Default)]
pub struct TestChannelFactory {
    pub created: Mutex<Vec<(ServiceKind, String, Arc<TestChannel>)>>,
    /// Script installed on the next data channel.
    pub open_script: Mutex<VecDeque<OpenOutcome>>,
    /// Answer every name-service channel gives.
    pub lookup_answer: Mutex<Option<Option<(String, i32)>>>,
}

impl TestChannelFactory {
    pub fn channel_for(&self, kind: ServiceKind) -> Option<Arc<TestChannel>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _, _)| *k == kind)
            .map(|(_, _, channel)| channel.clone())
    }
}

impl ChannelFactory for TestChannelFactory {
    fn create_channel(&self, kind: ServiceKind, service_name: &str) -> Arc<dyn Channel> {
        let channel = Arc::new(TestChannel::default());
        if kind == ServiceKind::RemoteNameService {
            *channel.lookup_answer.lock().unwrap() = self.lookup_answer.lock().unwrap().clone();
        } else {
            *channel.open_script.lock().unwrap() =
                std::mem::take(&mut *self.open_script.lock().unwrap());
        }
        self.created.lock().unwrap().push((kind, service_name.to_string(), channel.clone()));
        channel
    }
}

#[derive(Default)]
pub struct CountingMemberListener {
    pub joined: AtomicUsize,
    pub leaving: AtomicUsize,
    pub left: AtomicUsize,
    pub sources: Mutex<Vec<u64>>,
}

impl MemberListener for CountingMemberListener {
    fn member_joined(&self, event: &MemberEvent) {
        self.joined.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().unwrap().push(event.source.instance());
    }

    fn member_leaving(&self, event: &MemberEvent) {
        self.leaving.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().unwrap().push(event.source.instance());
    }

    fn member_left(&self, event: &MemberEvent) {
        self.left.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().unwrap().push(event.source.instance());
    }
}

#[derive(Default)]
pub struct CountingConnectionListener {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub errors: AtomicUsize,
}

impl ConnectionListener for CountingConnectionListener {
    fn connection_opened(&self, _event: &ConnectionEvent) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_closed(&self, _event: &ConnectionEvent) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_error(&self, _event: &ConnectionEvent) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn socket_address_xml(addr: SocketAddr) -> String {
    format!(
        "<socket-address><address>{}</address><port>{}</port></socket-address>",
        addr.ip(),
        addr.port()
    )
}
