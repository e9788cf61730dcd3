//! Scripted in-memory transport for client tests.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use crate::pinpad::codec::{self, ACK, ETX, MAX_SEQUENCE, NAK, STX};
use crate::pinpad::config::{PinPadConfig, PinPadConfigParams};
use crate::pinpad::error::TransportError;
use crate::pinpad::protocol::{
    AcquirerNetwork, PaymentRequest, PaymentRequestParams, PaymentResponse, TransactionType,
};
use crate::pinpad::simulator::{approval_for, response_for};
use crate::pinpad::transport::{PinPadTransport, TransportState};

pub fn example_config(timeout_ms: u64) -> PinPadConfig {
    PinPadConfig::new(PinPadConfigParams {
        host: "192.168.250.10".into(),
        port: 9999,
        timeout_ms,
        merchant_id: "MID123456".into(),
        terminal_id: "TID123456".into(),
        cashier_id: "CID123456".into(),
        protocol_major: 2,
        protocol_minor: 2,
    })
    .unwrap()
}

/// 1.00 exempt + 1.00 taxable + 0.12 tax = 2.12.
pub fn example_request() -> PaymentRequest {
    PaymentRequest::new(PaymentRequestParams {
        transaction_type: TransactionType::Purchase,
        acquirer_network: AcquirerNetwork::Primary,
        deferred_code: "00".into(),
        tax_exempt_amount: Decimal::from_str("1.00").unwrap(),
        taxable_amount: Decimal::from_str("1.00").unwrap(),
        tax_amount: Decimal::from_str("0.12").unwrap(),
        total_amount: Decimal::from_str("2.12").unwrap(),
    })
    .unwrap()
}

/// Structurally valid purchase with the whole total tax-exempt.
pub fn request_with_total(total: &str) -> PaymentRequest {
    let total = Decimal::from_str(total).unwrap();
    PaymentRequest::new(PaymentRequestParams {
        transaction_type: TransactionType::Purchase,
        acquirer_network: AcquirerNetwork::Primary,
        deferred_code: "00".into(),
        tax_exempt_amount: total,
        taxable_amount: Decimal::ZERO,
        tax_amount: Decimal::ZERO,
        total_amount: total,
    })
    .unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    /// Request frame with its sequence number.
    Send(u32),
    Receive,
    Close,
}

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn sent_sequences(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Send(seq) => Some(seq),
                _ => None,
            })
            .collect()
    }
}

/// How the fake device answers each request.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Approve,
    Decline(&'static str),
    Silent,
    HangUp,
    Nak,
    StaleThenApprove,
    Garbage,
    WrongAmount,
    RefuseConnect,
    FailSend,
}

pub struct MockTransport {
    reply: Reply,
    log: EventLog,
    pending: VecDeque<Vec<u8>>,
    open: bool,
    hung_up: bool,
    receive_delay: Option<Duration>,
    open_delay: Option<Duration>,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl MockTransport {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            log: EventLog::default(),
            pending: VecDeque::new(),
            open: false,
            hung_up: false,
            receive_delay: None,
            open_delay: None,
            gate: None,
        }
    }

    pub fn log(&self) -> EventLog {
        self.log.clone()
    }

    pub fn with_receive_delay(mut self, delay: Duration) -> Self {
        self.receive_delay = Some(delay);
        self
    }

    /// A connect that stalls for `delay` regardless of the deadline it is given.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Signal `sent` after each request and then block until `release` fires.
    pub fn with_gate(mut self, sent: Sender<()>, release: Receiver<()>) -> Self {
        self.gate = Some((sent, release));
        self
    }

    fn script(&mut self, raw: &[u8]) {
        let decoded = codec::decode_request(raw).unwrap();
        let seq = decoded.sequence;
        match self.reply {
            Reply::Approve => {
                self.pending.push_back(vec![ACK]);
                self.pending
                    .push_back(codec::encode_response(&approval_for(&decoded), seq).unwrap());
            }
            Reply::Decline(code) => {
                let response = response_for(&decoded, code, "NEGADA");
                self.pending.push_back(vec![ACK]);
                self.pending
                    .push_back(codec::encode_response(&response, seq).unwrap());
            }
            Reply::Silent | Reply::RefuseConnect | Reply::FailSend => {}
            Reply::HangUp => {
                self.pending.push_back(vec![ACK]);
                self.hung_up = true;
            }
            Reply::Nak => self.pending.push_back(vec![NAK]),
            Reply::StaleThenApprove => {
                let stale = if seq == 1 { MAX_SEQUENCE } else { seq - 1 };
                self.pending.push_back(vec![ACK]);
                self.pending
                    .push_back(codec::encode_response(&approval_for(&decoded), stale).unwrap());
                self.pending
                    .push_back(codec::encode_response(&approval_for(&decoded), seq).unwrap());
            }
            Reply::Garbage => {
                self.pending.push_back(vec![ACK]);
                self.pending.push_back(vec![STX, b'X', ETX, 0x00]);
            }
            Reply::WrongAmount => {
                let mut fields = approval_for(&decoded).fields().clone();
                fields.total_amount += Decimal::ONE;
                self.pending.push_back(
                    codec::encode_response(&PaymentResponse::from(fields), seq).unwrap(),
                );
            }
        }
    }
}

impl PinPadTransport for MockTransport {
    fn open(&mut self, _deadline: Instant) -> Result<(), TransportError> {
        self.log.push(Event::Open);
        if let Some(delay) = self.open_delay {
            thread::sleep(delay);
        }
        if let Reply::RefuseConnect = self.reply {
            return Err(TransportError::Connect {
                target: self.description(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        self.open = true;
        Ok(())
    }

    fn send(&mut self, data: &[u8], _deadline: Instant) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if let Reply::FailSend = self.reply {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        let seq = codec::decode_request(data).unwrap().sequence;
        self.log.push(Event::Send(seq));
        self.script(data);
        if let Some((sent, release)) = &self.gate {
            sent.send(()).unwrap();
            release.recv().unwrap();
        }
        Ok(())
    }

    fn receive(&mut self, deadline: Instant) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.log.push(Event::Receive);
        if let Some(delay) = self.receive_delay {
            thread::sleep(delay.min(deadline.saturating_duration_since(Instant::now())));
        }
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(chunk);
        }
        if self.hung_up {
            return Err(TransportError::Closed);
        }
        let wait = deadline.saturating_duration_since(Instant::now());
        thread::sleep(wait);
        Err(TransportError::Timeout {
            waited_ms: wait.as_millis() as u64,
        })
    }

    fn close(&mut self) {
        self.log.push(Event::Close);
        self.open = false;
        self.pending.clear();
        self.hung_up = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn state(&self) -> TransportState {
        if self.open {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }

    fn description(&self) -> String {
        "MOCK".to_string()
    }
}
