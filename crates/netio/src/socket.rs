//! Socket objects shared between a reactor callback and owner threads.
//!
//! [`SocketCore`] holds everything mutable behind one mutex. Event handlers
//! compute state transitions under that lock and hand back [`Action`]s; the
//! caller executes them through [`run_actions`] after the lock is gone, so
//! no reactor primitive ever runs while a socket lock is held.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use reactor::{MsgKind, NetEvent, Reactor, Readiness, SlotId, SocketUid};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::error::{ProxyError, SocketError};
use crate::resolver;
use crate::secure::SecureChannel;
use crate::tunnel;

/// Message kind reserved for resolver completion. Owners embedding a
/// [`SocketCore`] must number their own kinds from [`OWNER_MSG_BASE`] up.
pub const MSG_HOST_RESOLVED: MsgKind = MsgKind(1);

/// First message kind value free for owner use.
pub const OWNER_MSG_BASE: u32 = 16;

/// Read chunk used when slurping a closing stream.
const CLOSE_DRAIN_CHUNK: usize = 8 * 1024;

/// Buffer offset at which consumed bytes are compacted away.
const COMPACT_AT: usize = 16 * 1024;

/// Which tunnel protocol a proxied connection negotiates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProxyKind {
    /// SOCKS4, target given as a resolved IPv4 address.
    Socks4,
    /// SOCKS4A, target given as a hostname resolved by the proxy.
    Socks4A,
    /// SOCKS5 with optional username/password authentication.
    Socks5,
    /// HTTP CONNECT, optionally with Basic authentication.
    HttpConnect,
}

/// Proxy endpoint plus credentials.
#[derive(Clone)]
pub struct ProxySetup {
    /// Tunnel protocol to speak.
    pub kind: ProxyKind,
    /// Address of the proxy itself.
    pub addr: SocketAddrV4,
    /// Username, where the protocol carries one.
    pub user: Option<String>,
    /// Password; wiped from memory when the setup is dropped.
    pub password: Option<Zeroizing<String>>,
}

impl ProxySetup {
    /// Setup without credentials.
    pub fn anonymous(kind: ProxyKind, addr: SocketAddrV4) -> Self {
        Self {
            kind,
            addr,
            user: None,
            password: None,
        }
    }

    /// Setup with username/password credentials.
    pub fn with_login(kind: ProxyKind, addr: SocketAddrV4, user: &str, password: &str) -> Self {
        Self {
            kind,
            addr,
            user: Some(user.to_owned()),
            password: Some(Zeroizing::new(password.to_owned())),
        }
    }

    pub(crate) fn has_credentials(&self) -> bool {
        self.user.is_some()
    }
}

impl std::fmt::Debug for ProxySetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySetup")
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where a tunnel should end up.
#[derive(Clone, Debug)]
pub(crate) struct TargetEndpoint {
    pub host: String,
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
}

/// Lifecycle phase of a socket object.
///
/// One flat machine covers plain sockets and every tunnel flavor; the
/// `Socks*`/`Http*` values exist only between TCP connect and negotiation
/// completion.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Phase {
    NotOpened,
    /// Resolver thread runs before any handle exists.
    ResolveForConnect,
    Connecting,
    Ready,
    Listening,
    /// TCP connect toward the proxy is in flight.
    ProxyTcpConnect,
    /// SOCKS4 waits for the resolver before it can frame its request.
    ResolveTarget,
    Socks4AwaitReply,
    Socks5AwaitMethod,
    Socks5AwaitAuth,
    Socks5AwaitReply,
    HttpAwaitStatus,
    Socks4AwaitBindReply,
    Socks5AwaitBindReply,
    /// First BIND reply consumed; waiting for the peer to connect in.
    AwaitBoundPeer,
    /// Negotiation failed; the error is stored for pickup.
    ProxyFailed,
    Closed,
}

/// Socket-level meaning of a reactor event, handed to the embedding object.
#[derive(Debug)]
pub enum OwnerEvent {
    /// Outbound connection (and any tunnel) is established.
    Connected,
    /// Outbound connection failed; the socket is closed.
    ConnectFailed(SocketError),
    /// A proxied listen is armed; `ip:port` is what the peer must dial.
    ListenReady {
        /// Address the remote peer should connect to.
        ip: Ipv4Addr,
        /// Port the remote peer should connect to.
        port: u16,
    },
    /// The listen could not be armed.
    ListenFailed(SocketError),
    /// An inbound peer was accepted (or the accept failed).
    Accepted(Result<(), SocketError>),
    /// Bytes are waiting; pull them with [`SocketCore::fill`].
    Readable,
    /// The stream can take more bytes and no queue is pending.
    Writable,
    /// A previously queued write has been flushed out completely.
    WriteDrained,
    /// The peer closed; buffered bytes remain readable.
    Closed {
        /// OS error that tore the connection down, when there was one.
        error: Option<io::ErrorKind>,
    },
}

/// Deferred reactor work handed out by an event handler.
///
/// Executed by [`run_actions`] strictly after the socket lock is released.
#[derive(Debug)]
pub enum Action {
    /// Feed a synthetic event back through the reactor queue.
    Repost(NetEvent),
    /// Post a message to the owning slot.
    Post {
        /// Message kind.
        kind: MsgKind,
        /// Message payload.
        payload: u64,
    },
    /// Start a resolver thread for `host`.
    Resolve {
        /// Hostname to resolve.
        host: String,
    },
}

/// Outcome of [`SocketCore::close`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CloseOutcome {
    /// The handle was open and is now released.
    Closed,
    /// There was nothing left to close.
    AlreadyClosed,
}

/// Outcome of one [`SocketCore::fill`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fill {
    /// Bytes were appended to the internal buffer. `maybe_more` is set when
    /// the read filled the whole chunk, so another readable edge may never
    /// come and the owner should repost one itself.
    Bytes {
        /// Number of bytes appended.
        count: usize,
        /// Whether the kernel buffer may still hold more.
        maybe_more: bool,
    },
    /// Nothing available right now.
    WouldBlock,
    /// Remote side has finished sending.
    Eof,
}

/// FIFO of unsent bytes, drained on writable edges.
#[derive(Default)]
pub(crate) struct SendQueue {
    buf: Vec<u8>,
    off: usize,
}

impl SendQueue {
    pub(crate) fn is_empty(&self) -> bool {
        self.off >= self.buf.len()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.off = 0;
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        if self.is_empty() {
            self.clear();
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Writes as much queued data as the sink takes. `Ok(true)` when the
    /// queue is now empty; `WouldBlock` is not an error here.
    pub(crate) fn drain_into(&mut self, sink: &mut dyn Write) -> io::Result<bool> {
        while self.off < self.buf.len() {
            match sink.write(&self.buf[self.off..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.clear();
        Ok(true)
    }
}

/// Inbound bytes not yet handed to the owner. A start cursor avoids
/// shifting on every consume; the buffer compacts once the cursor drifts.
#[derive(Default)]
pub(crate) struct ReadBuffer {
    data: Vec<u8>,
    start: usize,
}

impl ReadBuffer {
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.data.len());
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        } else if self.start > COMPACT_AT {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    /// Reads at most `max` bytes from `src` onto the tail of the buffer.
    pub(crate) fn fill_from(&mut self, src: &mut dyn Read, max: usize) -> io::Result<Fill> {
        let old = self.data.len();
        self.data.resize(old + max, 0);
        loop {
            match src.read(&mut self.data[old..]) {
                Ok(0) => {
                    self.data.truncate(old);
                    return Ok(Fill::Eof);
                }
                Ok(n) => {
                    self.data.truncate(old + n);
                    return Ok(Fill::Bytes {
                        count: n,
                        maybe_more: n == max,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.data.truncate(old);
                    return Ok(Fill::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.data.truncate(old);
                    return Err(e);
                }
            }
        }
    }
}

/// Routes writes through the secure channel when one is attached.
struct RawWriter<'a> {
    stream: &'a mut TcpStream,
    secure: Option<&'a mut Box<dyn SecureChannel>>,
}

impl Write for RawWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.secure.as_mut() {
            Some(ch) => ch.write(self.stream, buf),
            None => self.stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Routes reads through the secure channel when one is attached.
struct RawReader<'a> {
    stream: &'a mut TcpStream,
    secure: Option<&'a mut Box<dyn SecureChannel>>,
}

impl Read for RawReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.secure.as_mut() {
            Some(ch) => ch.read(self.stream, buf),
            None => self.stream.read(buf),
        }
    }
}

/// Everything mutable about one socket, guarded by the core mutex.
pub(crate) struct SocketState {
    pub(crate) phase: Phase,
    pub(crate) stream: Option<TcpStream>,
    pub(crate) listener: Option<TcpListener>,
    pub(crate) read_buf: ReadBuffer,
    pub(crate) send_queue: SendQueue,
    pub(crate) secure: Option<Box<dyn SecureChannel>>,
    pub(crate) setup: Option<ProxySetup>,
    pub(crate) target: Option<TargetEndpoint>,
    /// Listen-through-proxy rather than connect-through-proxy.
    pub(crate) bind_mode: bool,
    /// A writable edge arrived mid-negotiation and must be replayed.
    pub(crate) replay_writable: bool,
    pub(crate) resolve_result: Option<Result<Ipv4Addr, io::ErrorKind>>,
    pub(crate) proxy_error: Option<ProxyError>,
    /// HTTP reply parsing: the status line has been consumed already.
    pub(crate) http_status_seen: bool,
    pub(crate) last_activity: Option<Instant>,
    pub(crate) shutdown_sent: bool,
}

impl SocketState {
    /// Returns a fully closed socket to `NotOpened` so the owner can dial
    /// again with the same core. In-flight phases are left untouched.
    fn reset_for_reuse(&mut self) {
        if matches!(self.phase, Phase::Closed | Phase::ProxyFailed) {
            *self = SocketState::new();
        }
    }

    fn new() -> Self {
        Self {
            phase: Phase::NotOpened,
            stream: None,
            listener: None,
            read_buf: ReadBuffer::default(),
            send_queue: SendQueue::default(),
            secure: None,
            setup: None,
            target: None,
            bind_mode: false,
            replay_writable: false,
            resolve_result: None,
            proxy_error: None,
            http_status_seen: false,
            last_activity: None,
            shutdown_sent: false,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// Queues `bytes` and pushes the queue as far as the stream takes it.
    /// `Ok(true)` means nothing is left queued.
    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<bool> {
        self.send_queue.push(bytes);
        self.drain_queue()
    }

    pub(crate) fn drain_queue(&mut self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let mut sink = RawWriter {
            stream,
            secure: self.secure.as_mut(),
        };
        let drained = self.send_queue.drain_into(&mut sink)?;
        self.last_activity = Some(Instant::now());
        Ok(drained)
    }

    /// One bounded read into the internal buffer.
    pub(crate) fn fill_buffered(&mut self, max: usize) -> io::Result<Fill> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Fill::Eof);
        };
        let mut src = RawReader {
            stream,
            secure: self.secure.as_mut(),
        };
        let outcome = self.read_buf.fill_from(&mut src, max)?;
        if matches!(outcome, Fill::Bytes { .. }) {
            self.last_activity = Some(Instant::now());
        }
        Ok(outcome)
    }

    /// Reads everything still pending on a closing stream into the buffer.
    pub(crate) fn slurp_remaining(&mut self) {
        loop {
            match self.fill_buffered(CLOSE_DRAIN_CHUNK) {
                Ok(Fill::Bytes { .. }) => {}
                Ok(_) | Err(_) => return,
            }
        }
    }

    /// Sends a tunnel handshake frame, queueing any unsent tail.
    pub(crate) fn send_frame(&mut self, frame: &[u8]) -> Result<(), ProxyError> {
        match self.write_bytes(frame) {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(error = %e, "proxy handshake send failed");
                self.send_queue.clear();
                Err(ProxyError::SendFailed)
            }
        }
    }

    /// Pending connect error on the underlying stream, if the OS reports one.
    pub(crate) fn pending_error(&self) -> Option<io::ErrorKind> {
        let stream = self.stream.as_ref()?;
        match stream.take_error() {
            Ok(Some(e)) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Reactor attachment of a socket object.
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) reactor: Reactor,
    pub(crate) slot: SlotId,
}

/// Shared socket object. Owners embed an `Arc<SocketCore>` and forward
/// reactor callbacks into [`SocketCore::handle_event`] /
/// [`SocketCore::handle_message`].
pub struct SocketCore {
    uid: SocketUid,
    binding: Mutex<Option<Binding>>,
    state: Mutex<SocketState>,
}

impl SocketCore {
    /// Fresh socket object with a unique identity and no handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uid: SocketUid::fresh(),
            binding: Mutex::new(None),
            state: Mutex::new(SocketState::new()),
        })
    }

    /// Identity used for reactor validation.
    pub fn uid(&self) -> SocketUid {
        self.uid
    }

    /// Records the reactor slot this object was registered under. Must be
    /// called before any open call.
    pub fn bind(&self, reactor: &Reactor, slot: SlotId) {
        let mut b = self.binding.lock().unwrap_or_else(PoisonError::into_inner);
        *b = Some(Binding {
            reactor: reactor.clone(),
            slot,
        });
    }

    pub(crate) fn binding(&self) -> Option<Binding> {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_binding(&self) -> Result<Binding, SocketError> {
        self.binding().ok_or(SocketError::NotRegistered)
    }

    fn lock_state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a plain non-blocking connect to `addr`.
    pub fn connect(&self, addr: SocketAddrV4) -> Result<(), SocketError> {
        let binding = self.require_binding()?;
        let mut st = self.lock_state();
        st.reset_for_reuse();
        if st.phase != Phase::NotOpened {
            return Err(SocketError::AlreadyOpen);
        }
        let mut stream = TcpStream::connect(SocketAddr::V4(addr))?;
        binding.reactor.attach(binding.slot, &mut stream)?;
        st.stream = Some(stream);
        st.phase = Phase::Connecting;
        st.touch();
        trace!(uid = %self.uid, %addr, "connect started");
        Ok(())
    }

    /// Connects to `host:port`, resolving the hostname on a helper thread
    /// first when it is not an IPv4 literal.
    pub fn connect_to_host(self: &Arc<Self>, host: &str, port: u16) -> Result<(), SocketError> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return self.connect(SocketAddrV4::new(ip, port));
        }
        self.require_binding()?;
        {
            let mut st = self.lock_state();
            st.reset_for_reuse();
            if st.phase != Phase::NotOpened {
                return Err(SocketError::AlreadyOpen);
            }
            st.target = Some(TargetEndpoint {
                host: host.to_owned(),
                ip: None,
                port,
            });
            st.phase = Phase::ResolveForConnect;
        }
        resolver::spawn(Arc::clone(self), host.to_owned());
        Ok(())
    }

    /// Connects to `host:port` through a proxy. `ip` short-circuits the
    /// resolver for proxy types that need a numeric target.
    pub fn connect_via_proxy(
        &self,
        setup: ProxySetup,
        host: &str,
        ip: Option<Ipv4Addr>,
        port: u16,
    ) -> Result<(), SocketError> {
        if host.len() > 255 {
            return Err(SocketError::InvalidEndpoint(
                "hostname longer than 255 bytes".to_owned(),
            ));
        }
        let binding = self.require_binding()?;
        let mut st = self.lock_state();
        st.reset_for_reuse();
        if st.phase != Phase::NotOpened {
            return Err(SocketError::AlreadyOpen);
        }
        let mut stream = TcpStream::connect(SocketAddr::V4(setup.addr))?;
        binding.reactor.attach(binding.slot, &mut stream)?;
        trace!(uid = %self.uid, proxy = %setup.addr, kind = ?setup.kind, host, port, "proxied connect started");
        st.stream = Some(stream);
        st.setup = Some(setup);
        st.target = Some(TargetEndpoint {
            host: host.to_owned(),
            ip,
            port,
        });
        st.bind_mode = false;
        st.phase = Phase::ProxyTcpConnect;
        st.touch();
        Ok(())
    }

    /// Opens a local listener and reports the bound address.
    pub fn listen(&self, addr: SocketAddrV4) -> Result<(Ipv4Addr, u16), SocketError> {
        let binding = self.require_binding()?;
        let mut st = self.lock_state();
        st.reset_for_reuse();
        if st.phase != Phase::NotOpened {
            return Err(SocketError::AlreadyOpen);
        }
        let mut listener = TcpListener::bind(SocketAddr::V4(addr))?;
        binding.reactor.attach(binding.slot, &mut listener)?;
        let local = listener.local_addr()?;
        st.listener = Some(listener);
        st.phase = Phase::Listening;
        st.touch();
        match local {
            SocketAddr::V4(v4) => Ok((*v4.ip(), v4.port())),
            SocketAddr::V6(v6) => Err(SocketError::InvalidEndpoint(format!(
                "listener bound to IPv6 address {v6}"
            ))),
        }
    }

    /// Asks a SOCKS proxy to listen on our behalf (BIND). The address the
    /// peer must dial arrives later as [`OwnerEvent::ListenReady`].
    ///
    /// `target` is the peer expected to connect in; SOCKS servers use it to
    /// filter the inbound connection.
    pub fn listen_via_proxy(
        &self,
        setup: ProxySetup,
        target: SocketAddrV4,
    ) -> Result<(), SocketError> {
        if setup.kind == ProxyKind::HttpConnect {
            return Err(ProxyError::ListenUnsupported.into());
        }
        let binding = self.require_binding()?;
        let mut st = self.lock_state();
        st.reset_for_reuse();
        if st.phase != Phase::NotOpened {
            return Err(SocketError::AlreadyOpen);
        }
        let mut stream = TcpStream::connect(SocketAddr::V4(setup.addr))?;
        binding.reactor.attach(binding.slot, &mut stream)?;
        trace!(uid = %self.uid, proxy = %setup.addr, kind = ?setup.kind, %target, "proxied listen started");
        st.stream = Some(stream);
        st.setup = Some(setup);
        st.target = Some(TargetEndpoint {
            host: target.ip().to_string(),
            ip: Some(*target.ip()),
            port: target.port(),
        });
        st.bind_mode = true;
        st.phase = Phase::ProxyTcpConnect;
        st.touch();
        Ok(())
    }

    /// Sends `bytes`, queueing whatever the stream does not take.
    ///
    /// `Ok(true)` means everything left the process; `Ok(false)` means a
    /// tail is queued and will drain on writable edges, reported through
    /// [`OwnerEvent::WriteDrained`].
    ///
    /// # Errors
    ///
    /// Hard send failures clear the queue and surface the OS error.
    pub fn write(&self, bytes: &[u8]) -> Result<bool, SocketError> {
        let mut st = self.lock_state();
        if st.phase != Phase::Ready {
            return Err(SocketError::NotConnected);
        }
        match st.write_bytes(bytes) {
            Ok(drained) => Ok(drained),
            Err(e) => {
                st.send_queue.clear();
                Err(SocketError::Io(e))
            }
        }
    }

    /// Reads at most `max` fresh bytes into the internal buffer.
    pub fn fill(&self, max: usize) -> Result<Fill, SocketError> {
        let mut st = self.lock_state();
        if st.phase != Phase::Ready {
            return Err(SocketError::NotConnected);
        }
        Ok(st.fill_buffered(max)?)
    }

    /// Runs `f` over the buffered bytes without copying them out.
    ///
    /// `f` must not call back into this socket; the internal lock is held
    /// while it runs.
    pub fn with_buffered<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let st = self.lock_state();
        f(st.read_buf.as_slice())
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.lock_state().read_buf.len()
    }

    /// Drops `n` buffered bytes from the front.
    pub fn consume(&self, n: usize) {
        self.lock_state().read_buf.consume(n);
    }

    /// Moves up to `max` buffered bytes onto the end of `dst`.
    pub fn pull_into(&self, dst: &mut Vec<u8>, max: usize) -> usize {
        let mut st = self.lock_state();
        let n = st.read_buf.len().min(max);
        dst.extend_from_slice(&st.read_buf.as_slice()[..n]);
        st.read_buf.consume(n);
        n
    }

    /// Half-closes the send direction so the peer sees EOF.
    pub fn shutdown_send(&self) -> Result<(), SocketError> {
        let mut st = self.lock_state();
        let stream = st.stream.as_ref().ok_or(SocketError::NotOpen)?;
        stream.shutdown(Shutdown::Write)?;
        st.shutdown_sent = true;
        Ok(())
    }

    /// Releases the OS handle. Safe to call any number of times; only the
    /// first call does work. Slot deregistration stays with the owner.
    pub fn close(&self) -> CloseOutcome {
        let binding = self.binding();
        let mut st = self.lock_state();
        if st.phase == Phase::Closed {
            return CloseOutcome::AlreadyClosed;
        }
        if let Some(mut stream) = st.stream.take() {
            if let Some(b) = &binding {
                let _ = b.reactor.detach(&mut stream);
            }
        }
        if let Some(mut listener) = st.listener.take() {
            if let Some(b) = &binding {
                let _ = b.reactor.detach(&mut listener);
            }
        }
        st.send_queue.clear();
        st.read_buf.clear();
        st.secure = None;
        st.setup = None;
        st.target = None;
        st.phase = Phase::Closed;
        trace!(uid = %self.uid, "socket closed");
        CloseOutcome::Closed
    }

    /// Whether the socket holds any handle at all.
    pub fn is_open(&self) -> bool {
        !matches!(
            self.lock_state().phase,
            Phase::NotOpened | Phase::Closed | Phase::ProxyFailed
        )
    }

    /// Whether the byte stream is usable by the owner.
    pub fn is_ready(&self) -> bool {
        let st = self.lock_state();
        st.phase == Phase::Ready && st.stream.is_some()
    }

    /// Whether the peer is gone but buffered bytes may remain.
    pub fn remote_closed(&self) -> bool {
        let st = self.lock_state();
        st.phase == Phase::Ready && st.stream.is_none()
    }

    /// Local IPv4 address of the held stream. What an active-mode peer
    /// advertises as its dial-back endpoint.
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        let st = self.lock_state();
        match st.stream.as_ref()?.local_addr() {
            Ok(SocketAddr::V4(addr)) => Some(addr),
            _ => None,
        }
    }

    /// Wraps the established stream in a secure channel. All further reads
    /// and writes go through it.
    pub fn set_secure_channel(&self, channel: Box<dyn SecureChannel>) -> Result<(), SocketError> {
        let mut st = self.lock_state();
        if st.phase != Phase::Ready {
            return Err(SocketError::NotConnected);
        }
        st.secure = Some(channel);
        Ok(())
    }

    /// Takes the recorded proxy failure, if negotiation failed.
    pub fn take_proxy_error(&self) -> Option<ProxyError> {
        self.lock_state().proxy_error.take()
    }

    /// Instant of the last successful read or write.
    pub fn last_activity(&self) -> Option<Instant> {
        self.lock_state().last_activity
    }

    /// Translates a readiness event into an owner event plus deferred
    /// actions. The internal lock is held for the duration of the call and
    /// released before the caller runs the actions.
    pub fn handle_event(&self, ev: NetEvent) -> (Option<OwnerEvent>, Vec<Action>) {
        let mut st = self.lock_state();
        match st.phase {
            Phase::NotOpened | Phase::Closed | Phase::ProxyFailed | Phase::ResolveForConnect => {
                trace!(uid = %self.uid, ?ev, phase = ?st.phase, "event ignored");
                (None, Vec::new())
            }
            Phase::Connecting => self.on_plain_connecting(&mut st, ev),
            Phase::Ready => self.on_ready_phase(&mut st, ev),
            Phase::Listening => self.on_listening(&mut st, ev),
            _ => tunnel::on_event(&mut st, ev),
        }
    }

    /// Claims resolver messages; other kinds return `None` and belong to
    /// the owner.
    pub fn handle_message(
        &self,
        kind: MsgKind,
        _payload: u64,
    ) -> Option<(Option<OwnerEvent>, Vec<Action>)> {
        if kind != MSG_HOST_RESOLVED {
            return None;
        }
        let mut st = self.lock_state();
        let out = match st.phase {
            Phase::ResolveForConnect => self.finish_plain_resolve(&mut st),
            Phase::ResolveTarget => tunnel::on_resolved(&mut st),
            _ => {
                trace!(uid = %self.uid, "stale resolver result dropped");
                (None, Vec::new())
            }
        };
        Some(out)
    }

    /// Stores the resolver outcome and pings the reactor. Runs on the
    /// resolver thread.
    pub(crate) fn complete_resolution(&self, outcome: io::Result<Ipv4Addr>) {
        {
            let mut st = self.lock_state();
            match st.phase {
                Phase::ResolveForConnect | Phase::ResolveTarget => {
                    st.resolve_result = Some(outcome.map_err(|e| e.kind()));
                }
                _ => {
                    trace!(uid = %self.uid, "resolution finished after socket moved on");
                    return;
                }
            }
        }
        let Some(b) = self.binding() else {
            return;
        };
        b.reactor.post(b.slot, self.uid, MSG_HOST_RESOLVED, 0);
    }

    /// Exchanges the live connection with `other`: handles, buffers and
    /// tunnel state move across while each object keeps its identity and
    /// reactor slot.
    ///
    /// Must be called on the reactor thread so no readiness is dispatched
    /// between the swap and the re-registrations.
    pub fn swap_with(&self, other: &SocketCore) -> Result<(), SocketError> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        {
            // Cross-object lock order is fixed by uid to rule out deadlock.
            let (first, second) = if self.uid.value() <= other.uid.value() {
                (self, other)
            } else {
                (other, self)
            };
            let mut a = first.lock_state();
            let mut b = second.lock_state();
            std::mem::swap(&mut *a, &mut *b);
        }
        self.rebind_sources()?;
        other.rebind_sources()?;
        Ok(())
    }

    fn rebind_sources(&self) -> Result<(), SocketError> {
        let binding = self.require_binding()?;
        let mut st = self.lock_state();
        if let Some(stream) = st.stream.as_mut() {
            binding.reactor.reattach(binding.slot, stream)?;
        }
        if let Some(listener) = st.listener.as_mut() {
            binding.reactor.reattach(binding.slot, listener)?;
        }
        Ok(())
    }

    fn on_plain_connecting(
        &self,
        st: &mut SocketState,
        ev: NetEvent,
    ) -> (Option<OwnerEvent>, Vec<Action>) {
        match ev.readiness {
            Readiness::Writable => match st.pending_error() {
                None => {
                    st.phase = Phase::Ready;
                    st.touch();
                    trace!(uid = %self.uid, "connected");
                    (Some(OwnerEvent::Connected), Vec::new())
                }
                Some(kind) => self.fail_connect(st, kind),
            },
            Readiness::Closed => {
                let kind = ev
                    .error
                    .or_else(|| st.pending_error())
                    .unwrap_or(io::ErrorKind::ConnectionRefused);
                self.fail_connect(st, kind)
            }
            _ => (None, Vec::new()),
        }
    }

    fn fail_connect(
        &self,
        st: &mut SocketState,
        kind: io::ErrorKind,
    ) -> (Option<OwnerEvent>, Vec<Action>) {
        debug!(uid = %self.uid, error = ?kind, "connect failed");
        self.drop_stream(st);
        st.phase = Phase::Closed;
        (
            Some(OwnerEvent::ConnectFailed(SocketError::Io(io::Error::from(
                kind,
            )))),
            Vec::new(),
        )
    }

    fn on_ready_phase(
        &self,
        st: &mut SocketState,
        ev: NetEvent,
    ) -> (Option<OwnerEvent>, Vec<Action>) {
        match ev.readiness {
            Readiness::Readable | Readiness::AcceptReady => {
                (Some(OwnerEvent::Readable), Vec::new())
            }
            Readiness::Writable => {
                if st.send_queue.is_empty() {
                    return (Some(OwnerEvent::Writable), Vec::new());
                }
                match st.drain_queue() {
                    Ok(true) => (Some(OwnerEvent::WriteDrained), Vec::new()),
                    Ok(false) => (None, Vec::new()),
                    Err(e) => {
                        warn!(uid = %self.uid, error = %e, "queued send failed");
                        st.send_queue.clear();
                        (
                            Some(OwnerEvent::Closed {
                                error: Some(e.kind()),
                            }),
                            Vec::new(),
                        )
                    }
                }
            }
            Readiness::Closed => {
                let error = ev.error.or_else(|| st.pending_error());
                st.slurp_remaining();
                self.drop_stream(st);
                trace!(uid = %self.uid, buffered = st.read_buf.len(), "peer closed");
                (Some(OwnerEvent::Closed { error }), Vec::new())
            }
        }
    }

    fn on_listening(&self, st: &mut SocketState, ev: NetEvent) -> (Option<OwnerEvent>, Vec<Action>) {
        match ev.readiness {
            Readiness::Readable | Readiness::AcceptReady => {
                let Some(listener) = st.listener.as_ref() else {
                    return (None, Vec::new());
                };
                match listener.accept() {
                    Ok((mut stream, peer)) => {
                        trace!(uid = %self.uid, %peer, "accepted inbound connection");
                        if let Some(mut old) = st.listener.take() {
                            if let Some(b) = self.binding() {
                                let _ = b.reactor.detach(&mut old);
                            }
                        }
                        let attach = match self.binding() {
                            Some(b) => b.reactor.attach(b.slot, &mut stream),
                            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
                        };
                        if let Err(e) = attach {
                            st.phase = Phase::Closed;
                            return (Some(OwnerEvent::Accepted(Err(e.into()))), Vec::new());
                        }
                        st.stream = Some(stream);
                        st.phase = Phase::Ready;
                        st.touch();
                        (Some(OwnerEvent::Accepted(Ok(()))), Vec::new())
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => (None, Vec::new()),
                    Err(e) => (Some(OwnerEvent::Accepted(Err(e.into()))), Vec::new()),
                }
            }
            Readiness::Closed => {
                self.drop_listener(st);
                st.phase = Phase::Closed;
                (
                    Some(OwnerEvent::ListenFailed(SocketError::Io(io::Error::from(
                        ev.error.unwrap_or(io::ErrorKind::ConnectionAborted),
                    )))),
                    Vec::new(),
                )
            }
            Readiness::Writable => (None, Vec::new()),
        }
    }

    fn finish_plain_resolve(&self, st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
        let port = st.target.as_ref().map_or(0, |t| t.port);
        match st.resolve_result.take() {
            Some(Ok(ip)) => {
                let open = self.require_binding().and_then(|b| {
                    let mut stream = TcpStream::connect(SocketAddr::V4(SocketAddrV4::new(
                        ip, port,
                    )))?;
                    b.reactor.attach(b.slot, &mut stream)?;
                    Ok(stream)
                });
                match open {
                    Ok(stream) => {
                        st.stream = Some(stream);
                        st.phase = Phase::Connecting;
                        st.touch();
                        (None, Vec::new())
                    }
                    Err(e) => {
                        st.phase = Phase::Closed;
                        (Some(OwnerEvent::ConnectFailed(e)), Vec::new())
                    }
                }
            }
            _ => {
                st.phase = Phase::Closed;
                (
                    Some(OwnerEvent::ConnectFailed(SocketError::ResolveFailed)),
                    Vec::new(),
                )
            }
        }
    }

    fn drop_stream(&self, st: &mut SocketState) {
        if let Some(mut stream) = st.stream.take() {
            if let Some(b) = self.binding() {
                let _ = b.reactor.detach(&mut stream);
            }
        }
    }

    fn drop_listener(&self, st: &mut SocketState) {
        if let Some(mut listener) = st.listener.take() {
            if let Some(b) = self.binding() {
                let _ = b.reactor.detach(&mut listener);
            }
        }
    }
}

/// Executes deferred actions for `core`. Call with no socket lock held.
pub fn run_actions(core: &Arc<SocketCore>, actions: Vec<Action>) {
    if actions.is_empty() {
        return;
    }
    let Some(binding) = core.binding() else {
        trace!(uid = %core.uid(), "actions dropped, socket not registered");
        return;
    };
    for action in actions {
        match action {
            Action::Repost(ev) => {
                binding.reactor.repost(binding.slot, core.uid(), ev);
            }
            Action::Post { kind, payload } => {
                binding.reactor.post(binding.slot, core.uid(), kind, payload);
            }
            Action::Resolve { host } => {
                resolver::spawn(Arc::clone(core), host);
            }
        }
    }
}
