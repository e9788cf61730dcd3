//! A fake PIN pad on a TCP socket.
//!
//! The simulator speaks the same `PP`/`RP` framing as a real device so the
//! client can be exercised end to end without hardware. Each accepted
//! connection carries one request, answered according to a
//! [`DeviceBehavior`]:
//!
//! | Behavior           | Device side                                       |
//! |--------------------|---------------------------------------------------|
//! | `Approve`          | ACK, then an approval echoing total/TID/MID       |
//! | `Decline`          | ACK, then the given response code and message     |
//! | `Cancel`           | ACK, then `TC` (customer cancelled on the pad)    |
//! | `Silent`           | Reads the request and never answers               |
//! | `HangUp`           | ACK, then closes the connection                   |
//! | `Nak`              | NAK, nothing else                                 |
//! | `StaleThenApprove` | A frame for the previous sequence, then approval  |
//! | `ApproveAfter(d)`  | ACK, waits `d`, then approves                     |

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::pinpad::codec::{self, DecodedRequest, FrameAssembler, Unit, ACK, MAX_SEQUENCE, NAK};
use crate::pinpad::error::PinPadError;
use crate::pinpad::protocol::{PaymentResponse, PaymentResponseFields, APPROVED_CODE, CANCELLED_CODE};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceBehavior {
    Approve,
    Decline { code: String, message: String },
    Cancel,
    Silent,
    HangUp,
    Nak,
    StaleThenApprove,
    ApproveAfter(Duration),
}

/// Response to `request` with the given code. Non-approvals carry no
/// authorization or card data.
pub fn response_for(request: &DecodedRequest, code: &str, message: &str) -> PaymentResponse {
    let approved = code == APPROVED_CODE;
    let card = |value: &str| if approved { value.to_string() } else { String::new() };
    PaymentResponse::from(PaymentResponseFields {
        response_code: code.to_string(),
        response_message: message.to_string(),
        batch_number: "000001".into(),
        reference_number: format!("{:06}", request.sequence),
        authorization_code: if approved {
            format!("A{:05}", request.sequence % 100_000)
        } else {
            String::new()
        },
        acquirer_code: format!("{:02}", request.request.acquirer_network().code()),
        acquirer_response_code: code.to_string(),
        card_group_name: card("VISA"),
        cardholder_name: card("CLIENTE/PRUEBA"),
        masked_card_number: card("411111******1111"),
        entry_mode: "CH".into(),
        pin_verified: approved,
        total_amount: request.request.total_amount(),
        terminal_id: request.terminal_id.clone(),
        merchant_id: request.merchant_id.clone(),
    })
}

pub fn approval_for(request: &DecodedRequest) -> PaymentResponse {
    response_for(request, APPROVED_CODE, "APROBADA TRANS.")
}

pub struct DeviceSimulator {
    listener: TcpListener,
    behavior: DeviceBehavior,
    received: Arc<Mutex<Vec<DecodedRequest>>>,
}

impl DeviceSimulator {
    pub fn bind(addr: impl ToSocketAddrs, behavior: DeviceBehavior) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            behavior,
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections on the calling thread until the process exits.
    pub fn serve_forever(&self) -> io::Result<()> {
        self.serve(&AtomicBool::new(false))
    }

    /// Serve on a background thread; stopped when the handle drops.
    pub fn spawn(self) -> io::Result<SimulatorHandle> {
        let addr = self.local_addr()?;
        let received = Arc::clone(&self.received);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("pinpad-simulator".into())
            .spawn(move || {
                if let Err(e) = self.serve(&flag) {
                    warn!("Simulator stopped: {e}");
                }
            })?;
        Ok(SimulatorHandle {
            addr,
            received,
            shutdown,
            thread: Some(thread),
        })
    }

    fn serve(&self, shutdown: &AtomicBool) -> io::Result<()> {
        self.listener.set_nonblocking(true)?;
        info!(
            "Simulated PIN pad listening on {} ({:?})",
            self.local_addr()?,
            self.behavior
        );
        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Simulator accepted {peer}");
                    if let Err(e) = self.handle(stream, shutdown) {
                        warn!("Simulator connection from {peer} failed: {e}");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle(&self, mut stream: TcpStream, shutdown: &AtomicBool) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let raw = match read_frame(&mut stream, shutdown)? {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let request = match codec::decode_request(&raw) {
            Ok(request) => request,
            Err(e) => {
                warn!("Simulator got a bad request frame: {e}");
                return stream.write_all(&[NAK]);
            }
        };
        info!(
            "Simulator received seq {} for {}",
            request.sequence,
            request.request.total_amount()
        );
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let sequence = request.sequence;
        match &self.behavior {
            DeviceBehavior::Approve => {
                stream.write_all(&[ACK])?;
                write_response(&mut stream, &approval_for(&request), sequence)
            }
            DeviceBehavior::Decline { code, message } => {
                stream.write_all(&[ACK])?;
                write_response(&mut stream, &response_for(&request, code, message), sequence)
            }
            DeviceBehavior::Cancel => {
                stream.write_all(&[ACK])?;
                let response = response_for(&request, CANCELLED_CODE, "TRANS CANCELADA");
                write_response(&mut stream, &response, sequence)
            }
            DeviceBehavior::Silent => {
                drain_until_closed(&mut stream, shutdown);
                Ok(())
            }
            DeviceBehavior::HangUp => stream.write_all(&[ACK]),
            DeviceBehavior::Nak => stream.write_all(&[NAK]),
            DeviceBehavior::StaleThenApprove => {
                let stale = if sequence == 1 { MAX_SEQUENCE } else { sequence - 1 };
                stream.write_all(&[ACK])?;
                write_response(&mut stream, &approval_for(&request), stale)?;
                write_response(&mut stream, &approval_for(&request), sequence)
            }
            DeviceBehavior::ApproveAfter(delay) => {
                stream.write_all(&[ACK])?;
                thread::sleep(*delay);
                write_response(&mut stream, &approval_for(&request), sequence)
            }
        }
    }
}

fn read_frame(stream: &mut TcpStream, shutdown: &AtomicBool) -> io::Result<Option<Vec<u8>>> {
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 512];
    while !shutdown.load(Ordering::Relaxed) {
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e),
        };
        assembler.push(&buf[..n]).map_err(to_io)?;
        while let Some(unit) = assembler.next_unit() {
            if let Unit::Frame(raw) = unit {
                return Ok(Some(raw.to_vec()));
            }
        }
    }
    Ok(None)
}

fn write_response(stream: &mut TcpStream, response: &PaymentResponse, sequence: u32) -> io::Result<()> {
    let frame = codec::encode_response(response, sequence).map_err(to_io)?;
    stream.write_all(&frame)?;
    stream.flush()
}

fn drain_until_closed(stream: &mut TcpStream, shutdown: &AtomicBool) {
    let mut buf = [0u8; 64];
    while !shutdown.load(Ordering::Relaxed) {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => return,
        }
    }
}

fn to_io(e: PinPadError) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, e.to_string())
}

/// Running simulator. Dropping it stops the accept loop.
pub struct SimulatorHandle {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<DecodedRequest>>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests decoded so far, oldest first.
    pub fn received(&self) -> Vec<DecodedRequest> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
