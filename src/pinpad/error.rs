//! Error types for PIN-pad exchanges.
//!
//! Every error carries the [`Phase`] it was raised in, so an operator can tell
//! whether the request ever reached the device. The one variant that must
//! never be treated as a plain failure is [`PinPadError::IndeterminateOutcome`]:
//! the card may have been charged and the exchange needs reconciliation.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::pinpad::protocol::{PaymentResponse, ResponseStatus};

/// Stage of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Configure,
    Validate,
    Queue,
    Connect,
    Encode,
    Send,
    Receive,
    Decode,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Configure => "configure",
            Phase::Validate => "validate",
            Phase::Queue => "queue",
            Phase::Connect => "connect",
            Phase::Encode => "encode",
            Phase::Send => "send",
            Phase::Receive => "receive",
            Phase::Decode => "decode",
        };
        f.write_str(name)
    }
}

/// A single rejected field of a configuration or payment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: &'static str,
    pub reason: String,
}

impl FieldViolation {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Byte-level failures raised by a [`PinPadTransport`](crate::pinpad::transport::PinPadTransport).
///
/// The client maps these into [`PinPadError`] once it knows which phase of
/// the exchange was running.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no data within {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("connection closed by peer")]
    Closed,

    #[error("transport is not open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Attach the exchange phase the failure happened in.
    pub fn in_phase(self, phase: Phase) -> PinPadError {
        match self {
            TransportError::Connect { target, source } => PinPadError::Connect { target, source },
            TransportError::Timeout { waited_ms } => PinPadError::Timeout { phase, waited_ms },
            TransportError::Closed => PinPadError::ConnectionClosed { phase },
            TransportError::NotOpen => PinPadError::Io {
                phase,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "transport is not open",
                ),
            },
            TransportError::Io(source) => PinPadError::Io { phase, source },
        }
    }
}

// ---------------------------------------------------------------------------
// Client errors
// ---------------------------------------------------------------------------

/// Everything `process_payment` can fail with.
#[derive(Debug, Error)]
pub enum PinPadError {
    /// Bad setup. Lists every violated field, not only the first.
    #[error("invalid configuration: {}", join_violations(violations))]
    Configuration { violations: Vec<FieldViolation> },

    /// The request breaks a structural rule; nothing was sent.
    #[error("invalid payment request: {}", join_violations(violations))]
    InvalidRequest { violations: Vec<FieldViolation> },

    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {waited_ms}ms during {phase}")]
    Timeout { phase: Phase, waited_ms: u64 },

    #[error("connection closed by device during {phase}")]
    ConnectionClosed { phase: Phase },

    #[error("I/O error during {phase}: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    /// A request field does not fit the wire format.
    #[error("cannot encode {field}: {reason}")]
    Encoding { field: &'static str, reason: String },

    /// The device sent bytes this codec cannot parse.
    #[error("malformed response{}: {reason}", field.map(|f| format!(" field {f}")).unwrap_or_default())]
    Decoding {
        field: Option<&'static str>,
        reason: String,
    },

    /// The device answered, and the answer is not an approval. The full
    /// decoded response is kept for the receipt and the operator.
    #[error("device answered {code} ({status}): {message}")]
    Device {
        code: String,
        status: ResponseStatus,
        message: String,
        response: Box<PaymentResponse>,
    },

    /// The device NAKed the request frame and did not process it.
    #[error("device rejected the request frame (NAK)")]
    Rejected,

    #[error("exchange cancelled during {phase}")]
    Cancelled { phase: Phase },

    /// The request reached the device but no confirmed answer came back.
    /// The card may have been charged.
    #[error("outcome unknown after {phase}, reconcile before retrying: {cause}")]
    IndeterminateOutcome {
        phase: Phase,
        #[source]
        cause: Box<PinPadError>,
    },

    #[error("PIN pad is busy with another transaction")]
    Busy,
}

impl PinPadError {
    pub fn encoding(field: &'static str, reason: impl Into<String>) -> Self {
        PinPadError::Encoding {
            field,
            reason: reason.into(),
        }
    }

    pub fn decoding(field: &'static str, reason: impl Into<String>) -> Self {
        PinPadError::Decoding {
            field: Some(field),
            reason: reason.into(),
        }
    }

    /// Framing-level decode failure not tied to a single field.
    pub fn malformed_frame(reason: impl Into<String>) -> Self {
        PinPadError::Decoding {
            field: None,
            reason: reason.into(),
        }
    }

    pub fn indeterminate(cause: PinPadError) -> Self {
        PinPadError::IndeterminateOutcome {
            phase: cause.phase(),
            cause: Box::new(cause),
        }
    }

    /// Phase of the exchange the error was raised in.
    pub fn phase(&self) -> Phase {
        match self {
            PinPadError::Configuration { .. } => Phase::Configure,
            PinPadError::InvalidRequest { .. } => Phase::Validate,
            PinPadError::Connect { .. } => Phase::Connect,
            PinPadError::Timeout { phase, .. }
            | PinPadError::ConnectionClosed { phase }
            | PinPadError::Io { phase, .. }
            | PinPadError::Cancelled { phase }
            | PinPadError::IndeterminateOutcome { phase, .. } => *phase,
            PinPadError::Encoding { .. } => Phase::Encode,
            PinPadError::Decoding { .. } | PinPadError::Device { .. } => Phase::Decode,
            PinPadError::Rejected => Phase::Send,
            PinPadError::Busy => Phase::Queue,
        }
    }

    /// Transport-level failures that happened before the device could have
    /// acted on the request. Retrying is the caller's call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PinPadError::Connect { .. }
                | PinPadError::Timeout { .. }
                | PinPadError::ConnectionClosed { .. }
                | PinPadError::Io { .. }
                | PinPadError::Rejected
                | PinPadError::Busy
        )
    }

    /// True when the card may have been charged without a confirmed answer.
    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, PinPadError::IndeterminateOutcome { .. })
    }

    /// Innermost error, looking through `IndeterminateOutcome`.
    pub fn root_cause(&self) -> &PinPadError {
        match self {
            PinPadError::IndeterminateOutcome { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
