//! LAN client for point-of-sale PIN-pad payment terminals.
//!
//! ```no_run
//! use pinpad_lan::{PaymentRequest, PinPadConfig, TransactionClient};
//!
//! # fn main() -> Result<(), pinpad_lan::PinPadError> {
//! let config = PinPadConfig::from_json(&serde_json::json!({
//!     "host": "192.168.250.10",
//!     "port": 9999,
//!     "merchantId": "MID123456",
//!     "terminalId": "TID123456",
//!     "cashierId": "CID123456",
//! }))?;
//! let request: PaymentRequest = serde_json::from_value(serde_json::json!({
//!     "transactionType": 1,
//!     "acquirerNetwork": 1,
//!     "taxExemptAmount": "1.00",
//!     "taxableAmount": "1.00",
//!     "taxAmount": "0.12",
//!     "totalAmount": "2.12",
//! }))
//! .expect("valid request");
//!
//! let client = TransactionClient::new(config);
//! let response = client.process_payment(&request)?;
//! println!("approved, authorization {}", response.authorization_code());
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod pinpad;

pub use pinpad::{
    AcquirerNetwork, ConcurrencyPolicy, ExchangeRecord, ExchangeState, NetworkTransport, Phase,
    PaymentRequest, PaymentRequestParams, PaymentResponse, PinPadConfig, PinPadConfigParams,
    PinPadError, PinPadTransport, ResponseStatus, TransactionClient, TransactionType,
};

/// Install the global subscriber: console on stderr plus, when `log_dir` is
/// given, a daily rolling file (JSON lines if `json`). `RUST_LOG` overrides
/// the default filter.
///
/// Keep the returned guard alive until exit; dropping it flushes the file.
pub fn init_tracing(log_dir: Option<&Path>, json: bool) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pinpad_lan=debug"));

    let mut guard = None;
    let file_writer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("cannot create log directory {}: {e}", dir.display());
            return None;
        }
        let (writer, g) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "pinpad"));
        guard = Some(g);
        Some(writer)
    });

    let (text_file, json_file) = match (file_writer, json) {
        (Some(writer), true) => (
            None,
            Some(fmt::layer().json().with_writer(writer).with_target(true)),
        ),
        (Some(writer), false) => (
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            ),
            None,
        ),
        (None, _) => (None, None),
    };
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    // A second call (tests, embedding apps) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file)
        .with(json_file)
        .try_init();

    guard
}
