//! TCP transport and the task that drives a session over it.
//!
//! Every device talks TCP: the Muovi and Sessantaquattro families dial in to a
//! socket we listen on, the Quattrocento is dialed. [`DeviceHandle`] runs one
//! [`DeviceSession`] on a dedicated thread with a single-threaded tokio runtime
//! and exposes blocking calls for collaborators that are not async.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::devices::{DeviceKind, ParameterMap};
use crate::errors::{DeviceError, Result};
use crate::frame::SampleMatrix;
use crate::logging::WarningLog;
use crate::profile::DeviceInformation;
use crate::session::{
    ConnectionSettings, DeviceEvent, DeviceSession, Link, SessionOptions, SessionState,
};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// Longest wait for a fresh socket to report write readiness before a command.
const WRITE_READY_TIMEOUT: Duration = Duration::from_millis(500);

/// Stand-in deadline while no connection timer is armed.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct NetOptions {
    pub session: SessionOptions,
    /// Largest chunk read from the socket per wakeup.
    pub read_buffer: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }
}

// ============================================================================
// TCP Link
// ============================================================================

/// [`Link`] over tokio sockets. Must be used inside a tokio runtime.
#[derive(Debug, Default)]
pub struct TcpLink {
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next peer on the listening socket; pending forever while not listening.
    pub async fn accept(&self) -> io::Result<TcpStream> {
        match &self.listener {
            Some(listener) => listener.accept().await.map(|(stream, peer)| {
                debug!("accepted peer {}", peer);
                stream
            }),
            None => std::future::pending().await,
        }
    }

    /// Make `stream` the current peer, replacing any previous one.
    pub fn adopt(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {}", e);
        }
        self.stream = Some(stream);
    }

    /// Resolves once the peer has bytes (or EOF); pending forever without a peer.
    pub async fn readable(&self) -> io::Result<()> {
        match &self.stream {
            Some(stream) => stream.readable().await,
            None => std::future::pending().await,
        }
    }

    /// Resolves once the peer accepts writes; immediately without a peer.
    ///
    /// tokio only reports write readiness after its reactor has seen the
    /// socket, so `try_write` on a just-adopted stream fails with `WouldBlock`
    /// until this has been awaited.
    pub async fn writable(&self) -> io::Result<()> {
        match &self.stream {
            Some(stream) => stream.writable().await,
            None => Ok(()),
        }
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.stream {
            Some(stream) => stream.try_read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Forget the current peer but keep listening.
    pub fn drop_peer(&mut self) {
        self.stream = None;
    }

    pub fn has_peer(&self) -> bool {
        self.stream.is_some()
    }
}

impl Link for TcpLink {
    fn listen(&mut self, addr: SocketAddrV4) -> io::Result<()> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        self.listener = Some(TcpListener::from_std(listener)?);
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddrV4, timeout: Duration) -> io::Result<()> {
        // Bounded by `timeout`; the driver does nothing else until connected.
        let stream = std::net::TcpStream::connect_timeout(&SocketAddr::V4(addr), timeout)?;
        stream.set_nonblocking(true)?;
        self.adopt(TcpStream::from_std(stream)?);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let mut written = 0;
        while written < bytes.len() {
            match stream.try_write(&bytes[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // a full send buffer mid-command is treated as a dead peer
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn discard_pending(&mut self) {
        let Some(stream) = &self.stream else {
            return;
        };
        let mut scratch = [0u8; 4096];
        let mut discarded = 0usize;
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        if discarded > 0 {
            debug!("discarded {} pending bytes", discarded);
        }
    }

    fn close(&mut self) {
        self.stream = None;
        self.listener = None;
    }
}

// ============================================================================
// Driver
// ============================================================================

enum Request {
    ToggleConnection {
        settings: ConnectionSettings,
        reply: oneshot::Sender<Result<bool>>,
    },
    Configure {
        params: ParameterMap,
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleStreaming {
        reply: oneshot::Sender<Result<bool>>,
    },
    Information {
        reply: oneshot::Sender<DeviceInformation>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
    ExtractBiosignal {
        matrix: SampleMatrix,
        to_mv: bool,
        reply: oneshot::Sender<Result<SampleMatrix>>,
    },
    ExtractAuxiliary {
        matrix: SampleMatrix,
        to_mv: bool,
        reply: oneshot::Sender<Result<SampleMatrix>>,
    },
    Shutdown,
}

/// Owns a session and its link; all session mutation happens in [`run`](Self::run).
struct DeviceDriver {
    session: DeviceSession,
    link: TcpLink,
    requests: UnboundedReceiver<Request>,
    buffer: Vec<u8>,
}

impl DeviceDriver {
    async fn run(mut self) {
        loop {
            let wake_at = self.session.connection_deadline();
            let sleep_until = wake_at
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_WAKEUP);

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle(request).await,
                },
                accepted = self.link.accept() => match accepted {
                    Ok(stream) => {
                        self.link.adopt(stream);
                        self.session.on_peer_accepted(&mut self.link);
                    }
                    Err(e) => warn!("{}: accept failed: {}", self.session.kind(), e),
                },
                ready = self.link.readable() => match ready {
                    Ok(()) => self.read_available(),
                    Err(e) => self.peer_lost(e),
                },
                _ = tokio::time::sleep_until(sleep_until), if wake_at.is_some() => {
                    self.session.on_connection_timeout(&mut self.link);
                }
            }
        }

        if self.session.is_streaming() {
            self.ready_to_write().await;
            if let Err(e) = self.session.stop_streaming(&mut self.link) {
                debug!("stop on shutdown failed: {}", e);
            }
        }
        self.session.disconnect(&mut self.link);
        debug!("{}: driver stopped", self.session.kind());
    }

    /// Wait until a command can go out. On timeout the write itself reports
    /// the failure.
    async fn ready_to_write(&self) {
        if !self.link.has_peer() {
            return;
        }
        match tokio::time::timeout(WRITE_READY_TIMEOUT, self.link.writable()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: writability check failed: {}", self.session.kind(), e),
            Err(_) => debug!(
                "{}: socket not writable after {} ms",
                self.session.kind(),
                WRITE_READY_TIMEOUT.as_millis()
            ),
        }
    }

    async fn handle(&mut self, request: Request) {
        if matches!(
            request,
            Request::ToggleConnection { .. }
                | Request::Configure { .. }
                | Request::ToggleStreaming { .. }
        ) {
            self.ready_to_write().await;
        }
        let link = &mut self.link;
        let session = &mut self.session;
        // a caller that stopped waiting for its reply is not an error
        match request {
            Request::ToggleConnection { settings, reply } => {
                let _ = reply.send(session.toggle_connection(link, &settings));
            }
            Request::Configure { params, reply } => {
                let _ = reply.send(session.configure(link, &params));
            }
            Request::ToggleStreaming { reply } => {
                let _ = reply.send(session.toggle_streaming(link));
            }
            Request::Information { reply } => {
                let _ = reply.send(session.get_device_information());
            }
            Request::State { reply } => {
                let _ = reply.send(session.state());
            }
            Request::ExtractBiosignal {
                matrix,
                to_mv,
                reply,
            } => {
                let _ = reply.send(session.extract_biosignal_data(&matrix, to_mv));
            }
            Request::ExtractAuxiliary {
                matrix,
                to_mv,
                reply,
            } => {
                let _ = reply.send(session.extract_auxiliary_data(&matrix, to_mv));
            }
            Request::Shutdown => {}
        }
    }

    fn read_available(&mut self) {
        match self.link.try_read(&mut self.buffer) {
            Ok(0) => self.peer_lost(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                if let Err(e) = self.session.on_bytes(&mut self.link, &self.buffer[..n]) {
                    warn!("{}: dropping undecodable data: {}", self.session.kind(), e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.peer_lost(e),
        }
    }

    fn peer_lost(&mut self, reason: io::Error) {
        debug!("{}: peer gone: {}", self.session.kind(), reason);
        self.link.drop_peer();
        self.session.on_peer_closed(&mut self.link);
    }
}

// ============================================================================
// Blocking Handle
// ============================================================================

/// Runs a device session on its own thread.
///
/// The request methods block until the driver answers, so they must not be
/// called from inside an async runtime. Dropping the handle stops streaming,
/// disconnects and joins the driver thread.
pub struct DeviceHandle {
    kind: DeviceKind,
    requests: UnboundedSender<Request>,
    events: UnboundedReceiver<DeviceEvent>,
    /// Timer runtime for `next_event_timeout`, separate from the driver's.
    waiter: Runtime,
    worker: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn spawn(kind: DeviceKind) -> Result<Self> {
        Self::spawn_with(kind, NetOptions::default(), WarningLog::new())
    }

    pub fn spawn_with(kind: DeviceKind, options: NetOptions, warnings: WarningLog) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = DeviceDriver {
            session: DeviceSession::with_options(kind, options.session, event_tx, warnings),
            link: TcpLink::new(),
            requests: request_rx,
            buffer: vec![0u8; options.read_buffer.max(1)],
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let waiter = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let worker = thread::Builder::new()
            .name(format!("{}-driver", kind.slug()))
            .spawn(move || runtime.block_on(driver.run()))?;

        Ok(Self {
            kind,
            requests: request_tx,
            events: event_rx,
            waiter,
            worker: Some(worker),
        })
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(build(reply_tx))
            .map_err(|_| DeviceError::DriverStopped)?;
        reply_rx.blocking_recv().map_err(|_| DeviceError::DriverStopped)
    }

    pub fn toggle_connection(&self, settings: ConnectionSettings) -> Result<bool> {
        self.call(|reply| Request::ToggleConnection { settings, reply })?
    }

    pub fn configure_device(&self, params: ParameterMap) -> Result<()> {
        self.call(|reply| Request::Configure { params, reply })?
    }

    pub fn toggle_streaming(&self) -> Result<bool> {
        self.call(|reply| Request::ToggleStreaming { reply })?
    }

    pub fn device_information(&self) -> Result<DeviceInformation> {
        self.call(|reply| Request::Information { reply })
    }

    pub fn state(&self) -> Result<SessionState> {
        self.call(|reply| Request::State { reply })
    }

    pub fn extract_biosignal_data(&self, matrix: SampleMatrix, to_mv: bool) -> Result<SampleMatrix> {
        self.call(|reply| Request::ExtractBiosignal {
            matrix,
            to_mv,
            reply,
        })?
    }

    pub fn extract_auxiliary_data(&self, matrix: SampleMatrix, to_mv: bool) -> Result<SampleMatrix> {
        self.call(|reply| Request::ExtractAuxiliary {
            matrix,
            to_mv,
            reply,
        })?
    }

    /// Next queued event, if any.
    pub fn try_next_event(&mut self) -> Option<DeviceEvent> {
        self.events.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event. `None` on timeout or once the
    /// driver has stopped and its queue is drained.
    pub fn next_event_timeout(&mut self, timeout: Duration) -> Option<DeviceEvent> {
        let events = &mut self.events;
        self.waiter
            .block_on(async { tokio::time::timeout(timeout, events.recv()).await })
            .ok()
            .flatten()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("{} driver thread panicked", self.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Instant;

    fn local_listener() -> (std::net::TcpListener, SocketAddrV4) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => (listener, addr),
            SocketAddr::V6(addr) => panic!("expected an IPv4 address, got {addr}"),
        }
    }

    #[tokio::test]
    async fn dialed_link_writes_once_ready() {
        let (listener, addr) = local_listener();
        let mut link = TcpLink::new();
        link.connect(addr, Duration::from_secs(1)).unwrap();
        assert!(link.has_peer());

        link.writable().await.unwrap();
        link.write(&[0x80; 40]).unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut received = [0u8; 40];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(received, [0x80; 40]);
    }

    #[tokio::test]
    async fn writable_without_peer_is_immediate() {
        let mut link = TcpLink::new();
        link.writable().await.unwrap();
        assert!(link.write(&[1]).is_err());
    }

    #[test]
    fn event_wait_times_out_when_idle() {
        let mut handle = DeviceHandle::spawn(DeviceKind::Muovi).unwrap();
        let started = Instant::now();
        assert!(handle.next_event_timeout(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert!(handle.try_next_event().is_none());
    }
}
