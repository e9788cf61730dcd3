//! PIN-pad payment terminal client over the local network.
//!
//! One request/response exchange per payment: the client validates the
//! request, frames it for the device, sends it over TCP and waits for the
//! device's answer within a bounded time. It never retries on its own; an
//! exchange that loses its answer after the request was sent surfaces as
//! an indeterminate outcome for the caller to reconcile.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod simulator;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{ConcurrencyPolicy, ExchangeRecord, ExchangeState, TransactionClient};
pub use config::{PinPadConfig, PinPadConfigParams};
pub use error::{Phase, PinPadError, TransportError};
pub use protocol::{
    AcquirerNetwork, PaymentRequest, PaymentRequestParams, PaymentResponse, ResponseStatus,
    TransactionType,
};
pub use transport::{NetworkTransport, PinPadTransport, TransportState};
