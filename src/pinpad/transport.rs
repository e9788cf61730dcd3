//! Transport layer for PIN-pad communication.
//!
//! Defines the `PinPadTransport` trait and the TCP implementation used to
//! reach a PIN pad on the local network. The transport moves bytes only;
//! deciding when a frame is complete is the codec's job.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::pinpad::config::PinPadConfig;
use crate::pinpad::error::TransportError;

const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// Transport state
// ---------------------------------------------------------------------------

/// Connection state for transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstract byte-level transport to a PIN pad.
pub trait PinPadTransport: Send {
    /// Establish the connection, giving up at `deadline` or after the
    /// transport's own connect timeout, whichever comes first.
    fn open(&mut self, deadline: Instant) -> Result<(), TransportError>;

    /// Write the whole buffer before `deadline`.
    fn send(&mut self, data: &[u8], deadline: Instant) -> Result<(), TransportError>;

    /// Block until some bytes arrive, the deadline passes
    /// ([`TransportError::Timeout`]) or the peer closes
    /// ([`TransportError::Closed`]). Never returns an empty buffer.
    fn receive(&mut self, deadline: Instant) -> Result<Vec<u8>, TransportError>;

    /// Release the connection. Safe to call repeatedly.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn state(&self) -> TransportState;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Network (TCP) transport
// ---------------------------------------------------------------------------

/// TCP transport for PIN pads reachable over the LAN.
pub struct NetworkTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    state: TransportState,
}

impl NetworkTransport {
    /// `timeout` caps the connect (across all resolved addresses) and every
    /// write; a tighter per-call deadline wins.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
            stream: None,
            state: TransportState::Disconnected,
        }
    }

    pub fn from_config(config: &PinPadConfig) -> Self {
        Self::new(config.host(), config.port(), config.timeout())
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect_error(&mut self, source: std::io::Error) -> TransportError {
        self.state = TransportState::Error;
        TransportError::Connect {
            target: self.target(),
            source,
        }
    }
}

impl PinPadTransport for NetworkTransport {
    fn open(&mut self, deadline: Instant) -> Result<(), TransportError> {
        if self.is_open() {
            return Ok(());
        }
        self.state = TransportState::Connecting;
        info!("Connecting TCP to {}", self.target());

        // One budget shared by every resolved address.
        let deadline = deadline.min(Instant::now() + self.timeout);
        let addrs: Vec<_> = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => return Err(self.connect_error(e)),
        };
        if addrs.is_empty() {
            return Err(self.connect_error(std::io::Error::new(
                ErrorKind::AddrNotAvailable,
                "host resolved to no addresses",
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("TCP_NODELAY not set on {addr}: {e}");
                    }
                    self.stream = Some(stream);
                    self.state = TransportState::Connected;
                    info!("TCP connected to {addr}");
                    return Ok(());
                }
                Err(e) => {
                    debug!("TCP connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::TimedOut, "connect deadline passed")
        });
        Err(self.connect_error(err))
    }

    fn send(&mut self, data: &[u8], deadline: Instant) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(self.timeout);
        if wait.is_zero() {
            return Err(TransportError::Timeout { waited_ms: 0 });
        }
        debug!("TCP TX ({} bytes): {:02X?}", data.len(), data);
        let written = stream
            .set_write_timeout(Some(wait))
            .and_then(|_| stream.write_all(data))
            .and_then(|_| stream.flush());
        match written {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                self.state = TransportState::Error;
                Err(TransportError::Timeout {
                    waited_ms: wait.as_millis() as u64,
                })
            }
            Err(e) => {
                self.state = TransportState::Error;
                Err(TransportError::Io(e))
            }
        }
    }

    fn receive(&mut self, deadline: Instant) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;

        let mut buf = Zeroizing::new(vec![0u8; READ_CHUNK]);
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return Err(TransportError::Timeout { waited_ms: 0 });
            }
            stream.set_read_timeout(Some(wait))?;

            match stream.read(&mut buf) {
                Ok(0) => {
                    warn!("TCP connection closed by peer");
                    self.state = TransportState::Error;
                    return Err(TransportError::Closed);
                }
                Ok(n) => {
                    // Frames carry cardholder data, so only the length is logged.
                    debug!("TCP RX ({n} bytes)");
                    return Ok(buf[..n].to_vec());
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock =>
                {
                    debug!("TCP RX timeout after {}ms", wait.as_millis());
                    return Err(TransportError::Timeout {
                        waited_ms: wait.as_millis() as u64,
                    });
                }
                Err(e) => {
                    self.state = TransportState::Error;
                    return Err(TransportError::Io(e));
                }
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            info!("TCP disconnected from {}", self.target());
        }
        self.state = TransportState::Disconnected;
    }

    fn is_open(&self) -> bool {
        self.state == TransportState::Connected && self.stream.is_some()
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn description(&self) -> String {
        format!("TCP({})", self.target())
    }
}

impl Drop for NetworkTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
