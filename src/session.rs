//! Connection, configuration and streaming lifecycle of one device.
//!
//! A `DeviceSession` owns everything about a device except the transport, which
//! is passed in as a [`Link`] on every call. All methods run on the thread (or
//! task) that owns the link; nothing here blocks beyond the link itself.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::devices::{Configuration, ControlCommand, DeviceKind, ParameterMap, TransportRole};
use crate::errors::{DeviceError, Result};
use crate::frame::{self, FrameBuffer, SampleMatrix};
use crate::logging::WarningLog;
use crate::profile::{DeviceInformation, DeviceProfile};

// ============================================================================
// Constants
// ============================================================================

/// How long a listener waits for the device to dial in, or a dialer waits
/// for the device to answer.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Transport primitives a session needs. Implemented over TCP by
/// [`crate::net::TcpLink`].
pub trait Link {
    /// Open a listening endpoint. Peers are reported via
    /// [`DeviceSession::on_peer_accepted`].
    fn listen(&mut self, addr: SocketAddrV4) -> io::Result<()>;

    /// Connect to a device, giving up after `timeout`.
    fn connect(&mut self, addr: SocketAddrV4, timeout: Duration) -> io::Result<()>;

    /// Write the whole buffer to the current peer.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Drop whatever the peer sent that has not been read yet.
    fn discard_pending(&mut self);

    /// Close the peer and the listening endpoint, if any.
    fn close(&mut self);
}

// ============================================================================
// Data Types
// ============================================================================

/// Validated endpoint. For listeners it is the local address to bind, for
/// dialers the device's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl ConnectionSettings {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// Parse a dotted-quad IPv4 address and a decimal port.
    pub fn parse(host: &str, port: &str) -> Result<Self> {
        let address = host
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| DeviceError::InvalidAddress(format!("{host:?} is not an IPv4 address")))?;
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| DeviceError::InvalidAddress(format!("{port:?} is not a port number")))?;
        Ok(Self { address, port })
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Listening, waiting for the device to dial in.
    Connecting,
    Connected,
    /// Configuration sent, waiting for the device to dial back in.
    Configuring,
    Configured,
    Streaming,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Connecting)
    }

    pub fn is_configured(self) -> bool {
        matches!(self, SessionState::Configured | SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Configuring => "configuring",
            SessionState::Configured => "configured",
            SessionState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Notifications published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    ConnectionToggled(bool),
    ConfigurationToggled(bool),
    StreamingToggled(bool),
    /// Every channel, raw integer values.
    DataAvailable(SampleMatrix),
    /// Biosignal rows in millivolts.
    BiosignalDataAvailable(SampleMatrix),
    /// Auxiliary rows scaled by the auxiliary factor.
    AuxiliaryDataAvailable(SampleMatrix),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// ============================================================================
// Device Session
// ============================================================================

pub struct DeviceSession {
    kind: DeviceKind,
    options: SessionOptions,
    state: SessionState,
    configuration: Configuration,
    profile: Option<DeviceProfile>,
    command: Option<ControlCommand>,
    frames: FrameBuffer,
    /// Configuration echo collected while idle.
    reply: Vec<u8>,
    deadline: Option<Instant>,
    events: UnboundedSender<DeviceEvent>,
    warnings: WarningLog,
}

impl DeviceSession {
    pub fn new(kind: DeviceKind, events: UnboundedSender<DeviceEvent>) -> Self {
        Self::with_options(kind, SessionOptions::default(), events, WarningLog::new())
    }

    pub fn with_options(
        kind: DeviceKind,
        options: SessionOptions,
        events: UnboundedSender<DeviceEvent>,
        warnings: WarningLog,
    ) -> Self {
        Self {
            kind,
            options,
            state: SessionState::Disconnected,
            configuration: Configuration::for_kind(kind),
            profile: None,
            command: None,
            frames: FrameBuffer::default(),
            reply: Vec::new(),
            deadline: None,
            events,
            warnings,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.as_ref()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// When an unanswered listen gives up, if it is pending.
    pub fn connection_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn get_device_information(&self) -> DeviceInformation {
        DeviceInformation::new(self.kind.name(), self.profile.as_ref())
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Disconnect if connected (stopping a stream first), otherwise connect.
    /// Returns whether the session is connected or waiting for the device.
    pub fn toggle_connection(
        &mut self,
        link: &mut impl Link,
        settings: &ConnectionSettings,
    ) -> Result<bool> {
        if self.state == SessionState::Disconnected {
            self.connect(link, settings)?;
        } else {
            if self.is_streaming() {
                if let Err(e) = self.stop_streaming(link) {
                    warn!("stop before disconnect failed: {}", e);
                }
            }
            self.disconnect(link);
        }
        Ok(self.state != SessionState::Disconnected)
    }

    pub fn connect(&mut self, link: &mut impl Link, settings: &ConnectionSettings) -> Result<()> {
        self.require(&[SessionState::Disconnected], "connect")?;
        let addr = settings.socket_addr();
        let timeout = self.options.connect_timeout;

        match self.kind.role() {
            TransportRole::Listener => {
                link.listen(addr)
                    .map_err(|source| DeviceError::ListenFailed { addr, source })?;
                info!("{}: listening on {}", self.kind, addr);
                self.state = SessionState::Connecting;
                // a timeout past the clock's range waits forever
                self.deadline = Instant::now().checked_add(timeout);
            }
            TransportRole::Dialer => {
                if let Err(e) = link.connect(addr, timeout) {
                    link.close();
                    self.emit(DeviceEvent::ConnectionToggled(false));
                    return Err(match e.kind() {
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                            DeviceError::ConnectTimeout {
                                addr,
                                timeout_ms: timeout.as_millis() as u64,
                            }
                        }
                        _ => DeviceError::ConnectRefused { addr, source: e },
                    });
                }
                info!("{}: connected to {}", self.kind, addr);
                self.state = SessionState::Connected;
                self.emit(DeviceEvent::ConnectionToggled(true));
            }
        }
        Ok(())
    }

    /// Close the transport and reset to `Disconnected`. Idempotent.
    pub fn disconnect(&mut self, link: &mut impl Link) {
        if self.state == SessionState::Disconnected {
            return;
        }
        let was_streaming = self.is_streaming();
        link.close();
        self.deadline = None;
        self.frames.clear();
        self.reply.clear();
        self.state = SessionState::Disconnected;
        info!("{}: disconnected", self.kind);

        if was_streaming {
            self.emit(DeviceEvent::StreamingToggled(false));
        }
        self.emit(DeviceEvent::ConnectionToggled(false));
        self.emit(DeviceEvent::ConfigurationToggled(false));
    }

    /// A device dialed in to our listening endpoint.
    pub fn on_peer_accepted(&mut self, _link: &mut impl Link) {
        self.reply.clear();
        self.frames.clear();
        match self.state {
            SessionState::Connecting => {
                self.deadline = None;
                self.state = SessionState::Connected;
                info!("{}: device connected", self.kind);
                self.emit(DeviceEvent::ConnectionToggled(true));
            }
            SessionState::Configuring => {
                self.state = SessionState::Configured;
                info!("{}: device reconnected with new configuration", self.kind);
                self.emit(DeviceEvent::ConfigurationToggled(true));
            }
            SessionState::Disconnected => {
                warn!("{}: peer accepted while disconnected, ignoring", self.kind);
            }
            state => debug!("{}: peer replaced while {}", self.kind, state),
        }
    }

    /// The current peer closed its side.
    pub fn on_peer_closed(&mut self, link: &mut impl Link) {
        // a partial frame from the old connection never completes
        self.frames.clear();
        match self.kind.role() {
            // listener devices hang up and dial back in after a configuration
            TransportRole::Listener => debug!("{}: peer closed while {}", self.kind, self.state),
            TransportRole::Dialer => {
                warn!("{}: device closed the connection", self.kind);
                self.disconnect(link);
            }
        }
    }

    /// Give up on a device that never dialed in. Returns whether it fired.
    pub fn on_connection_timeout(&mut self, link: &mut impl Link) -> bool {
        self.poll_timeout(link, Instant::now())
    }

    pub fn poll_timeout(&mut self, link: &mut impl Link, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if self.state == SessionState::Connecting && now >= deadline => {
                warn!(
                    "{}: no device connected within {} ms",
                    self.kind,
                    self.options.connect_timeout.as_millis()
                );
                self.disconnect(link);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Apply `params`, recompute the profile and send the command.
    ///
    /// Nothing changes unless every step succeeds. Unknown parameter names are
    /// reported once and skipped.
    pub fn configure(&mut self, link: &mut impl Link, params: &ParameterMap) -> Result<()> {
        self.require(
            &[
                SessionState::Connected,
                SessionState::Configuring,
                SessionState::Configured,
            ],
            "configure",
        )?;

        let mut candidate = self.configuration.clone();
        for (key, value) in params {
            match candidate.settings_mut().apply(key, value) {
                Ok(()) => {}
                Err(DeviceError::UnknownParameter(name)) => {
                    self.warnings
                        .warn_once(format!("{}: ignoring unknown parameter {:?}", self.kind, name));
                }
                Err(e) => return Err(e),
            }
        }

        let settings = candidate.settings();
        settings.validate()?;
        let profile = settings.profile(self.kind)?;
        let command = settings.encode(self.kind)?;

        self.send(link, command.as_bytes())?;

        debug!(
            "{}: configured {} Hz, {} channels, {} samples/frame, command {:02X?}",
            self.kind,
            profile.sampling_frequency,
            profile.channels.total,
            profile.samples_per_frame,
            command.as_bytes()
        );
        self.frames.reset(profile.buffer_size());
        self.reply.clear();
        self.configuration = candidate;
        self.profile = Some(profile);
        self.command = Some(command);

        match (self.kind.role(), self.state) {
            (TransportRole::Listener, SessionState::Connected) => {
                self.state = SessionState::Configuring;
            }
            (TransportRole::Listener, SessionState::Configuring) => {}
            _ => {
                self.state = SessionState::Configured;
                self.emit(DeviceEvent::ConfigurationToggled(true));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    pub fn start_streaming(&mut self, link: &mut impl Link) -> Result<()> {
        self.require(&[SessionState::Configured], "start streaming")?;
        let command = self.streaming_command(true)?;
        self.frames.clear();
        self.send(link, command.as_bytes())?;
        self.state = SessionState::Streaming;
        info!("{}: streaming started", self.kind);
        self.emit(DeviceEvent::StreamingToggled(true));
        Ok(())
    }

    pub fn stop_streaming(&mut self, link: &mut impl Link) -> Result<()> {
        self.require(&[SessionState::Streaming], "stop streaming")?;
        let command = self.streaming_command(false)?;
        self.send(link, command.as_bytes())?;
        self.state = SessionState::Configured;
        self.frames.clear();
        link.discard_pending();
        info!("{}: streaming stopped", self.kind);
        self.emit(DeviceEvent::StreamingToggled(false));
        Ok(())
    }

    /// Start or stop streaming, then drop unread bytes. Returns whether the
    /// session is streaming afterwards.
    pub fn toggle_streaming(&mut self, link: &mut impl Link) -> Result<bool> {
        if self.is_streaming() {
            self.stop_streaming(link)?;
        } else {
            self.start_streaming(link)?;
        }
        link.discard_pending();
        Ok(self.is_streaming())
    }

    fn streaming_command(&self, on: bool) -> Result<ControlCommand> {
        self.command
            .as_ref()
            .map(|command| command.streaming(on))
            .ok_or(DeviceError::NotConfigured)
    }

    // ------------------------------------------------------------------------
    // Data Path
    // ------------------------------------------------------------------------

    /// Feed bytes that arrived from the peer. Returns the number of frames
    /// decoded.
    pub fn on_bytes(&mut self, _link: &mut impl Link, chunk: &[u8]) -> Result<usize> {
        if !self.is_streaming() {
            self.collect_reply(chunk);
            return Ok(0);
        }

        let Some(profile) = self.profile.as_ref() else {
            return Ok(0);
        };
        let frames = self.frames.push(chunk);
        let mut outgoing = Vec::with_capacity(frames.len() * 3);
        for bytes in &frames {
            let matrix = frame::decode_frame(bytes, profile)?;
            let biosignal = frame::extract_biosignal(&matrix, profile, true)?;
            let auxiliary = frame::extract_auxiliary(&matrix, profile, true)?;
            outgoing.push(DeviceEvent::DataAvailable(matrix));
            outgoing.push(DeviceEvent::BiosignalDataAvailable(biosignal));
            outgoing.push(DeviceEvent::AuxiliaryDataAvailable(auxiliary));
        }
        for event in outgoing {
            self.emit(event);
        }
        Ok(frames.len())
    }

    fn collect_reply(&mut self, chunk: &[u8]) {
        let expected = self.kind.handshake_reply_len();
        if expected == 0 || self.reply.len() >= expected {
            return;
        }
        let take = chunk.len().min(expected - self.reply.len());
        self.reply.extend_from_slice(&chunk[..take]);
        if self.reply.len() == expected {
            debug!("{}: configuration reply {:02X?}", self.kind, self.reply);
        }
    }

    /// Biosignal rows of a full matrix, in millivolts when `to_mv` is set.
    pub fn extract_biosignal_data(&self, matrix: &SampleMatrix, to_mv: bool) -> Result<SampleMatrix> {
        let profile = self.profile.as_ref().ok_or(DeviceError::NotConfigured)?;
        frame::extract_biosignal(matrix, profile, to_mv)
    }

    pub fn extract_auxiliary_data(&self, matrix: &SampleMatrix, to_mv: bool) -> Result<SampleMatrix> {
        let profile = self.profile.as_ref().ok_or(DeviceError::NotConfigured)?;
        frame::extract_auxiliary(matrix, profile, to_mv)
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn require(&self, allowed: &[SessionState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DeviceError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Write to the peer. A failed write ends the session.
    fn send(&mut self, link: &mut impl Link, bytes: &[u8]) -> Result<()> {
        if let Err(e) = link.write(bytes) {
            warn!("{}: write failed, disconnecting: {}", self.kind, e);
            self.disconnect(link);
            return Err(DeviceError::WriteFailure(e));
        }
        Ok(())
    }

    fn emit(&self, event: DeviceEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}
