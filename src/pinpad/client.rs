//! Transaction client: one payment exchange at a time.
//!
//! The client owns the transport exclusively and serializes callers behind a
//! mutex. It never retries: once the request frame has left, a lost answer
//! means the card may already have been charged, so every failure after
//! send is reported as [`PinPadError::IndeterminateOutcome`] and left to the
//! caller to reconcile.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::pinpad::codec::{self, FrameAssembler, Unit, MAX_SEQUENCE};
use crate::pinpad::config::PinPadConfig;
use crate::pinpad::error::{Phase, PinPadError, TransportError};
use crate::pinpad::protocol::{PaymentRequest, PaymentResponse};
use crate::pinpad::transport::{NetworkTransport, PinPadTransport};

/// Longest single blocking read, so cancellation is noticed promptly.
pub const RECEIVE_SLICE: Duration = Duration::from_millis(200);

/// How often a queued caller re-checks the lock, its deadline and its token.
const QUEUE_POLL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Exchange state machine
// ---------------------------------------------------------------------------

/// What a second caller gets while an exchange is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Wait for the in-flight exchange to finish.
    #[default]
    Queue,
    /// Fail straight away with [`PinPadError::Busy`].
    Reject,
}

/// Lifecycle of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Idle,
    Connecting,
    Sent,
    AwaitingResponse,
    Completed,
    Failed,
    Indeterminate,
}

impl ExchangeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeState::Completed | ExchangeState::Failed | ExchangeState::Indeterminate
        )
    }

    pub fn can_transition_to(self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Failed)
                | (Connecting, Sent)
                | (Connecting, Failed)
                | (Sent, AwaitingResponse)
                | (Sent, Indeterminate)
                | (AwaitingResponse, Completed)
                | (AwaitingResponse, Failed)
                | (AwaitingResponse, Indeterminate)
        )
    }
}

/// Audit record of the most recent exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRecord {
    pub id: Uuid,
    pub sequence: u32,
    pub state: ExchangeState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExchangeRecord {
    fn start(sequence: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            state: ExchangeState::Idle,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn advance(&mut self, next: ExchangeState) {
        if !self.state.can_transition_to(next) {
            error!(
                "Illegal exchange transition {:?} -> {:?} (exchange {})",
                self.state, next, self.id
            );
            debug_assert!(false, "illegal transition {:?} -> {:?}", self.state, next);
        }
        debug!("Exchange {:?} -> {:?}", self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Inner<T> {
    transport: T,
    next_sequence: u32,
    last_exchange: Option<ExchangeRecord>,
}

impl<T> Inner<T> {
    fn take_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = if sequence >= MAX_SEQUENCE {
            1
        } else {
            sequence + 1
        };
        sequence
    }
}

/// Runs payments against one PIN pad.
///
/// Shareable across threads (`Arc<TransactionClient<_>>`); exchanges never
/// overlap on the wire.
pub struct TransactionClient<T: PinPadTransport = NetworkTransport> {
    config: Arc<PinPadConfig>,
    policy: ConcurrencyPolicy,
    inner: Mutex<Inner<T>>,
}

impl TransactionClient<NetworkTransport> {
    /// Client talking TCP to the configured host and port.
    pub fn new(config: PinPadConfig) -> Self {
        let transport = NetworkTransport::from_config(&config);
        Self::with_transport(Arc::new(config), transport)
    }
}

impl<T: PinPadTransport> TransactionClient<T> {
    pub fn with_transport(config: Arc<PinPadConfig>, transport: T) -> Self {
        Self {
            config,
            policy: ConcurrencyPolicy::default(),
            inner: Mutex::new(Inner {
                transport,
                next_sequence: 1,
                last_exchange: None,
            }),
        }
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &PinPadConfig {
        &self.config
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    /// Record of the last finished exchange, if any.
    pub fn last_exchange(&self) -> Option<ExchangeRecord> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_exchange
            .clone()
    }

    /// Run one payment, bounded by the configured timeout.
    pub fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse, PinPadError> {
        self.process_payment_with(request, None, &CancellationToken::new())
    }

    /// Run one payment, bounded by the configured timeout and by `deadline`
    /// if given. Cancelling `cancel` closes the connection; after the request
    /// was sent this yields `IndeterminateOutcome`.
    pub fn process_payment_with(
        &self,
        request: &PaymentRequest,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<PaymentResponse, PinPadError> {
        let called_at = Instant::now();
        request.validate()?;

        let mut guard = self.acquire(called_at, deadline, cancel)?;
        let inner = &mut *guard;

        let now = Instant::now();
        if let Some(d) = deadline {
            if now >= d {
                return Err(PinPadError::Timeout {
                    phase: Phase::Queue,
                    waited_ms: called_at.elapsed().as_millis() as u64,
                });
            }
        }
        if cancel.is_cancelled() {
            return Err(PinPadError::Cancelled {
                phase: Phase::Queue,
            });
        }
        let own_deadline = now + self.config.timeout();
        let deadline = deadline.map_or(own_deadline, |d| d.min(own_deadline));

        let sequence = inner.take_sequence();
        let mut record = ExchangeRecord::start(sequence);
        let span = info_span!("exchange", id = %record.id, seq = sequence);
        let _entered = span.enter();
        info!(
            "Processing {:?} for {} via {}",
            request.transaction_type(),
            request.total_amount(),
            inner.transport.description()
        );

        let result = run_exchange(
            &mut inner.transport,
            &self.config,
            request,
            sequence,
            deadline,
            cancel,
            &mut record,
        );
        inner.transport.close();

        let terminal = match &result {
            Ok(_) => ExchangeState::Completed,
            Err(e) if e.requires_reconciliation() => ExchangeState::Indeterminate,
            Err(_) => ExchangeState::Failed,
        };
        record.advance(terminal);

        match &result {
            Ok(response) => info!(
                "Payment approved: reference {} authorization {}",
                response.reference_number(),
                response.authorization_code()
            ),
            Err(e) if e.requires_reconciliation() => {
                warn!("Payment outcome unknown, reconciliation required: {e}")
            }
            Err(e) => info!("Payment failed: {e}"),
        }

        inner.last_exchange = Some(record);
        result
    }

    /// Take the exchange lock. Queued callers give up when their deadline
    /// passes or their token is cancelled, whichever comes first.
    fn acquire(
        &self,
        called_at: Instant,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, Inner<T>>, PinPadError> {
        let mut logged = false;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }
            if self.policy == ConcurrencyPolicy::Reject {
                debug!("Rejecting payment, exchange already in flight");
                return Err(PinPadError::Busy);
            }
            if !logged {
                debug!("Exchange in flight, queueing payment");
                logged = true;
            }
            if cancel.is_cancelled() {
                return Err(PinPadError::Cancelled {
                    phase: Phase::Queue,
                });
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Err(PinPadError::Timeout {
                    phase: Phase::Queue,
                    waited_ms: called_at.elapsed().as_millis() as u64,
                });
            }
            let nap = deadline.map_or(QUEUE_POLL, |d| QUEUE_POLL.min(d - now));
            thread::sleep(nap);
        }
    }
}

/// Everything between validation and closing the transport.
fn run_exchange<T: PinPadTransport>(
    transport: &mut T,
    config: &PinPadConfig,
    request: &PaymentRequest,
    sequence: u32,
    deadline: Instant,
    cancel: &CancellationToken,
    record: &mut ExchangeRecord,
) -> Result<PaymentResponse, PinPadError> {
    let frame = codec::encode_request(request, config, sequence)?;

    record.advance(ExchangeState::Connecting);
    let connect_started = Instant::now();
    transport
        .open(deadline)
        .map_err(|e| e.in_phase(Phase::Connect))?;
    // Nothing has left yet; a late connect must not turn into a send.
    if cancel.is_cancelled() {
        return Err(PinPadError::Cancelled {
            phase: Phase::Connect,
        });
    }
    if Instant::now() >= deadline {
        return Err(PinPadError::Timeout {
            phase: Phase::Connect,
            waited_ms: connect_started.elapsed().as_millis() as u64,
        });
    }

    // A failed write never delivered a complete frame, so it is a plain failure.
    transport
        .send(&frame, deadline)
        .map_err(|e| e.in_phase(Phase::Send))?;
    record.advance(ExchangeState::Sent);

    record.advance(ExchangeState::AwaitingResponse);
    await_response(transport, config, request, sequence, deadline, cancel).map_err(|e| match e {
        confirmed @ (PinPadError::Device { .. } | PinPadError::Rejected) => confirmed,
        other => PinPadError::indeterminate(other),
    })
}

/// Read until the frame answering `sequence` arrives.
fn await_response<T: PinPadTransport>(
    transport: &mut T,
    config: &PinPadConfig,
    request: &PaymentRequest,
    sequence: u32,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<PaymentResponse, PinPadError> {
    let sent_at = Instant::now();
    let mut assembler = FrameAssembler::new();

    loop {
        while let Some(unit) = assembler.next_unit() {
            match unit {
                Unit::Ack => debug!("Device acknowledged request"),
                Unit::Nak => return Err(PinPadError::Rejected),
                Unit::Frame(raw) => {
                    let (echoed, response) = codec::decode_response(&raw)?;
                    if echoed != sequence {
                        warn!("Discarding stale response for sequence {echoed}");
                        continue;
                    }
                    let response = codec::classify(response)?;
                    verify_echo(&response, request, config)?;
                    return Ok(response);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(PinPadError::Cancelled {
                phase: Phase::Receive,
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(PinPadError::Timeout {
                phase: Phase::Receive,
                waited_ms: sent_at.elapsed().as_millis() as u64,
            });
        }

        match transport.receive(deadline.min(now + RECEIVE_SLICE)) {
            Ok(chunk) => {
                let chunk = Zeroizing::new(chunk);
                assembler.push(&chunk)?;
            }
            Err(TransportError::Timeout { .. }) => continue,
            Err(e) => return Err(e.in_phase(Phase::Receive)),
        }
    }
}

/// An approval must be for the amount and terminal we sent.
fn verify_echo(
    response: &PaymentResponse,
    request: &PaymentRequest,
    config: &PinPadConfig,
) -> Result<(), PinPadError> {
    if response.total_amount() != request.total_amount() {
        return Err(PinPadError::decoding(
            "total amount",
            format!(
                "device approved {} but {} was requested",
                response.total_amount(),
                request.total_amount()
            ),
        ));
    }
    if response.terminal_id() != config.terminal_id() {
        return Err(PinPadError::decoding(
            "terminal id",
            format!("answer is for terminal '{}'", response.terminal_id()),
        ));
    }
    if response.merchant_id() != config.merchant_id() {
        return Err(PinPadError::decoding(
            "merchant id",
            format!("answer is for merchant '{}'", response.merchant_id()),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinpad::protocol::ResponseStatus;
    use crate::pinpad::testing::{
        example_config, example_request, request_with_total, Event, EventLog, MockTransport,
        Reply,
    };
    use std::sync::mpsc;
    use std::thread;

    fn client(reply: Reply) -> (TransactionClient<MockTransport>, EventLog) {
        let transport = MockTransport::new(reply);
        let log = transport.log();
        let client = TransactionClient::with_transport(Arc::new(example_config(90_000)), transport);
        (client, log)
    }

    #[test]
    fn test_example_scenario_approval() {
        let (client, log) = client(Reply::Approve);
        let request = example_request();

        let response = client.process_payment(&request).unwrap();

        assert_eq!(response.status(), ResponseStatus::Approved);
        assert_eq!(response.response_code(), "00");
        assert_eq!(response.total_amount(), request.total_amount());
        assert_eq!(response.terminal_id(), "TID123456");

        let record = client.last_exchange().unwrap();
        assert_eq!(record.state, ExchangeState::Completed);
        assert_eq!(record.sequence, 1);
        assert!(record.finished_at.is_some());

        let events = log.events();
        assert!(matches!(events.first(), Some(Event::Open)));
        assert!(matches!(events.last(), Some(Event::Close)));
    }

    #[test]
    fn test_sequence_increments_per_exchange() {
        let (client, log) = client(Reply::Approve);
        let request = example_request();
        client.process_payment(&request).unwrap();
        client.process_payment(&request).unwrap();
        assert_eq!(log.sent_sequences(), vec![1, 2]);
        assert_eq!(client.last_exchange().unwrap().sequence, 2);
    }

    #[test]
    fn test_sequence_wraps_after_maximum() {
        let mut inner = Inner {
            transport: (),
            next_sequence: MAX_SEQUENCE,
            last_exchange: None,
        };
        assert_eq!(inner.take_sequence(), MAX_SEQUENCE);
        assert_eq!(inner.take_sequence(), 1);
    }

    #[test]
    fn test_decline_is_confirmed_failure() {
        let (client, _) = client(Reply::Decline("05"));
        let err = client.process_payment(&example_request()).unwrap_err();
        match err {
            PinPadError::Device { code, status, .. } => {
                assert_eq!(code, "05");
                assert_eq!(status, ResponseStatus::Declined);
            }
            other => panic!("expected Device error, got {other:?}"),
        }
        assert_eq!(client.last_exchange().unwrap().state, ExchangeState::Failed);
    }

    #[test]
    fn test_connect_failure_is_plain_failure() {
        let (client, log) = client(Reply::RefuseConnect);
        let err = client.process_payment(&example_request()).unwrap_err();
        assert!(matches!(err, PinPadError::Connect { .. }));
        assert!(err.is_retryable());
        assert!(log.sent_sequences().is_empty());
        assert_eq!(client.last_exchange().unwrap().state, ExchangeState::Failed);
    }

    #[test]
    fn test_send_failure_is_plain_failure() {
        let (client, _) = client(Reply::FailSend);
        let err = client.process_payment(&example_request()).unwrap_err();
        assert!(matches!(err, PinPadError::Io { phase: Phase::Send, .. }));
        assert!(!err.requires_reconciliation());
    }

    #[test]
    fn test_drop_after_send_is_indeterminate() {
        let (client, log) = client(Reply::HangUp);
        let err = client.process_payment(&example_request()).unwrap_err();
        assert!(err.requires_reconciliation());
        assert!(matches!(
            err.root_cause(),
            PinPadError::ConnectionClosed { phase: Phase::Receive }
        ));
        assert_eq!(
            client.last_exchange().unwrap().state,
            ExchangeState::Indeterminate
        );
        assert!(matches!(log.events().last(), Some(Event::Close)));
    }

    #[test]
    fn test_silence_times_out_as_indeterminate() {
        let transport = MockTransport::new(Reply::Silent);
        let client =
            TransactionClient::with_transport(Arc::new(example_config(300)), transport);

        let started = Instant::now();
        let err = client.process_payment(&example_request()).unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.requires_reconciliation());
        assert!(matches!(
            err.root_cause(),
            PinPadError::Timeout { phase: Phase::Receive, .. }
        ));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn test_caller_deadline_beats_config_timeout() {
        let (client, _) = client(Reply::Silent);
        let started = Instant::now();
        let err = client
            .process_payment_with(
                &example_request(),
                Some(started + Duration::from_millis(250)),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err.root_cause(), PinPadError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_expired_deadline_fails_before_sending() {
        let (client, log) = client(Reply::Approve);
        let err = client
            .process_payment_with(
                &example_request(),
                Some(Instant::now() - Duration::from_millis(1)),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PinPadError::Timeout { phase: Phase::Queue, .. }));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_cancel_while_awaiting_is_indeterminate() {
        let (client, log) = client(Reply::Silent);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let err = client
            .process_payment_with(&example_request(), None, &cancel)
            .unwrap_err();
        canceller.join().unwrap();

        assert!(err.requires_reconciliation());
        assert!(matches!(
            err.root_cause(),
            PinPadError::Cancelled { phase: Phase::Receive }
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(log.events().last(), Some(Event::Close)));
    }

    #[test]
    fn test_cancel_before_start_sends_nothing() {
        let (client, log) = client(Reply::Approve);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .process_payment_with(&example_request(), None, &cancel)
            .unwrap_err();
        assert!(matches!(err, PinPadError::Cancelled { phase: Phase::Queue }));
        assert!(log.sent_sequences().is_empty());
    }

    #[test]
    fn test_nak_is_rejected_not_indeterminate() {
        let (client, _) = client(Reply::Nak);
        let err = client.process_payment(&example_request()).unwrap_err();
        assert!(matches!(err, PinPadError::Rejected));
        assert!(err.is_retryable());
        assert_eq!(client.last_exchange().unwrap().state, ExchangeState::Failed);
    }

    #[test]
    fn test_stale_frame_is_skipped() {
        let (client, _) = client(Reply::StaleThenApprove);
        let response = client.process_payment(&example_request()).unwrap();
        assert!(response.is_approved());
    }

    #[test]
    fn test_garbled_response_is_indeterminate() {
        let (client, _) = client(Reply::Garbage);
        let err = client.process_payment(&example_request()).unwrap_err();
        assert!(err.requires_reconciliation());
        assert!(matches!(err.root_cause(), PinPadError::Decoding { .. }));
    }

    #[test]
    fn test_wrong_amount_echo_is_indeterminate() {
        let (client, _) = client(Reply::WrongAmount);
        let err = client.process_payment(&example_request()).unwrap_err();
        assert!(err.requires_reconciliation());
        assert!(matches!(
            err.root_cause(),
            PinPadError::Decoding { field: Some("total amount"), .. }
        ));
    }

    #[test]
    fn test_concurrent_callers_never_interleave() {
        let transport = MockTransport::new(Reply::Approve).with_receive_delay(Duration::from_millis(30));
        let log = transport.log();
        let client = Arc::new(TransactionClient::with_transport(
            Arc::new(example_config(90_000)),
            transport,
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let client = Arc::clone(&client);
                thread::spawn(move || client.process_payment(&example_request()))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        // Every exchange is Open, Send, Receive..., Close with nothing in between.
        let events = log.events();
        let mut open = false;
        let mut sends_in_exchange = 0;
        for event in &events {
            match event {
                Event::Open => {
                    assert!(!open, "exchange opened while another was running");
                    open = true;
                    sends_in_exchange = 0;
                }
                Event::Send(_) => {
                    assert!(open, "send outside an exchange");
                    sends_in_exchange += 1;
                    assert_eq!(sends_in_exchange, 1, "two requests in one exchange");
                }
                Event::Receive => assert!(open, "receive outside an exchange"),
                Event::Close => open = false,
            }
        }
        let mut sequences = log.sent_sequences();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reject_policy_reports_busy() {
        let (client, release_tx, sent_rx) = gated_client(ConcurrencyPolicy::Reject);

        let first = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.process_payment(&example_request()))
        };
        sent_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let err = client.process_payment(&example_request()).unwrap_err();
        assert!(matches!(err, PinPadError::Busy));

        release_tx.send(()).unwrap();
        assert!(first.join().unwrap().is_ok());
    }

    fn gated_client(
        policy: ConcurrencyPolicy,
    ) -> (Arc<TransactionClient<MockTransport>>, mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (release_tx, release_rx) = mpsc::channel();
        let (sent_tx, sent_rx) = mpsc::channel();
        let transport = MockTransport::new(Reply::Approve).with_gate(sent_tx, release_rx);
        let client = Arc::new(
            TransactionClient::with_transport(Arc::new(example_config(90_000)), transport)
                .with_policy(policy),
        );
        (client, release_tx, sent_rx)
    }

    #[test]
    fn test_queued_caller_gives_up_at_its_deadline() {
        let (client, release_tx, sent_rx) = gated_client(ConcurrencyPolicy::Queue);
        let first = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.process_payment(&example_request()))
        };
        sent_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        let err = client
            .process_payment_with(
                &example_request(),
                Some(started + Duration::from_millis(200)),
                &CancellationToken::new(),
            )
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, PinPadError::Timeout { phase: Phase::Queue, .. }), "{err:?}");
        assert!(!err.requires_reconciliation());
        assert!(elapsed >= Duration::from_millis(200), "gave up early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "overran deadline: {elapsed:?}");

        release_tx.send(()).unwrap();
        assert!(first.join().unwrap().is_ok());
    }

    #[test]
    fn test_queued_caller_can_be_cancelled() {
        let (client, release_tx, sent_rx) = gated_client(ConcurrencyPolicy::Queue);
        let first = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.process_payment(&example_request()))
        };
        sent_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = Instant::now();
        let err = client
            .process_payment_with(&example_request(), None, &cancel)
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, PinPadError::Cancelled { phase: Phase::Queue }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));

        release_tx.send(()).unwrap();
        assert!(first.join().unwrap().is_ok());
    }

    #[test]
    fn test_slow_connect_past_deadline_sends_nothing() {
        let transport = MockTransport::new(Reply::Approve).with_open_delay(Duration::from_millis(300));
        let log = transport.log();
        let client = TransactionClient::with_transport(Arc::new(example_config(90_000)), transport);

        let err = client
            .process_payment_with(
                &example_request(),
                Some(Instant::now() + Duration::from_millis(100)),
                &CancellationToken::new(),
            )
            .unwrap_err();

        assert!(matches!(err, PinPadError::Timeout { phase: Phase::Connect, .. }), "{err:?}");
        assert!(!err.requires_reconciliation());
        assert!(log.sent_sequences().is_empty());
        assert_eq!(log.events(), vec![Event::Open, Event::Close]);
        assert_eq!(client.last_exchange().unwrap().state, ExchangeState::Failed);
    }

    #[test]
    fn test_cancel_during_connect_sends_nothing() {
        let transport = MockTransport::new(Reply::Approve).with_open_delay(Duration::from_millis(200));
        let log = transport.log();
        let client = TransactionClient::with_transport(Arc::new(example_config(90_000)), transport);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        let err = client
            .process_payment_with(&example_request(), None, &cancel)
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, PinPadError::Cancelled { phase: Phase::Connect }), "{err:?}");
        assert!(!err.requires_reconciliation());
        assert!(log.sent_sequences().is_empty());
        assert_eq!(client.last_exchange().unwrap().state, ExchangeState::Failed);
    }

    #[test]
    fn test_unencodable_amount_sends_nothing() {
        let (client, log) = client(Reply::Approve);
        let json = serde_json::json!({
            "transactionType": 1,
            "acquirerNetwork": 1,
            "taxExemptAmount": "1.00",
            "taxableAmount": "1.00",
            "taxAmount": "0.12",
            "totalAmount": "2.12",
        });
        let request: PaymentRequest = serde_json::from_value(json).unwrap();
        client.process_payment(&request).unwrap();
        assert_eq!(log.sent_sequences().len(), 1);

        let oversized = request_with_total("10000000000.00");
        let err = client.process_payment(&oversized).unwrap_err();
        assert!(matches!(err, PinPadError::Encoding { .. }));
        assert_eq!(log.sent_sequences().len(), 1);
        assert_eq!(client.last_exchange().unwrap().state, ExchangeState::Failed);
    }

    #[test]
    fn test_state_machine_transitions() {
        use ExchangeState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(AwaitingResponse.can_transition_to(Indeterminate));
        assert!(!Idle.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Idle));
        assert!(!Failed.can_transition_to(Connecting));
        assert!(Completed.is_terminal() && Failed.is_terminal() && Indeterminate.is_terminal());
        assert!(!AwaitingResponse.is_terminal());
    }
}
