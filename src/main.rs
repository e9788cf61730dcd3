//! `pinpad-lan` command-line tool.
//!
//! ```bash
//! pinpad-lan pay --host 192.168.250.10 --port 9999 \
//!     --merchant-id MID123456 --terminal-id TID123456 --cashier-id CID123456 \
//!     --tax-exempt 1.00 --taxable 1.00 --tax 0.12
//! pinpad-lan pay --config pinpad.json --taxable 10.00 --tax 1.20 --json
//! pinpad-lan simulate --bind 127.0.0.1:9999 --behavior decline
//! ```
//!
//! # Exit Codes
//!
//! - 0: payment approved (or simulator stopped cleanly)
//! - 1: error or decline; nothing was charged
//! - 2: outcome unknown; reconcile with the acquirer before retrying

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use pinpad_lan::pinpad::simulator::{DeviceBehavior, DeviceSimulator};
use pinpad_lan::{
    AcquirerNetwork, ExchangeRecord, PaymentRequest, PaymentRequestParams, PaymentResponse,
    PinPadConfig, PinPadConfigParams, PinPadError, ResponseStatus, TransactionClient,
    TransactionType,
};

#[derive(Parser, Debug)]
#[command(name = "pinpad-lan", version)]
#[command(about = "Run payments against a PIN pad on the local network", long_about = None)]
struct Cli {
    /// Also write daily rolling log files to this directory
    #[arg(long, value_name = "DIR", env = "PINPAD_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Write log files as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one payment and print the device's answer
    Pay(PayArgs),
    /// Run a simulated PIN pad
    Simulate(SimulateArgs),
}

/// Connection settings. Flags override values from `--config`.
#[derive(Args, Debug)]
struct ConnectionArgs {
    /// JSON device config (host, port, timeoutMs, merchantId, ...)
    #[arg(long, value_name = "FILE", env = "PINPAD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PINPAD_HOST")]
    host: Option<String>,

    #[arg(long, env = "PINPAD_PORT")]
    port: Option<u32>,

    #[arg(long, value_name = "MS", env = "PINPAD_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    #[arg(long, env = "PINPAD_MERCHANT_ID")]
    merchant_id: Option<String>,

    #[arg(long, env = "PINPAD_TERMINAL_ID")]
    terminal_id: Option<String>,

    #[arg(long, env = "PINPAD_CASHIER_ID")]
    cashier_id: Option<String>,

    #[arg(long, env = "PINPAD_PROTOCOL_MAJOR")]
    protocol_major: Option<u32>,

    #[arg(long, env = "PINPAD_PROTOCOL_MINOR")]
    protocol_minor: Option<u32>,
}

impl ConnectionArgs {
    fn to_config(&self) -> anyhow::Result<PinPadConfig> {
        let mut params = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<PinPadConfigParams>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => PinPadConfigParams::default(),
        };
        if let Some(host) = &self.host {
            params.host = host.clone();
        }
        if let Some(port) = self.port {
            params.port = port;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            params.timeout_ms = timeout_ms;
        }
        if let Some(mid) = &self.merchant_id {
            params.merchant_id = mid.clone();
        }
        if let Some(tid) = &self.terminal_id {
            params.terminal_id = tid.clone();
        }
        if let Some(cid) = &self.cashier_id {
            params.cashier_id = cid.clone();
        }
        if let Some(major) = self.protocol_major {
            params.protocol_major = major;
        }
        if let Some(minor) = self.protocol_minor {
            params.protocol_minor = minor;
        }
        Ok(PinPadConfig::new(params)?)
    }
}

#[derive(Args, Debug)]
struct PayArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// 1 purchase, 2 deferred with interest, 3 deferred without interest, 4 void
    #[arg(long, default_value_t = 1)]
    transaction_type: u8,

    /// 1 primary, 2 secondary acquirer
    #[arg(long, default_value_t = 1)]
    network: u8,

    /// Two-digit deferral plan, "00" for a single charge
    #[arg(long, default_value = "00")]
    deferred_code: String,

    #[arg(long, value_name = "AMOUNT", default_value = "0")]
    tax_exempt: Decimal,

    #[arg(long, value_name = "AMOUNT", default_value = "0")]
    taxable: Decimal,

    #[arg(long, value_name = "AMOUNT", default_value = "0")]
    tax: Decimal,

    /// Defaults to the sum of the three components
    #[arg(long, value_name = "AMOUNT")]
    total: Option<Decimal>,

    /// Give up waiting after this long, even if the configured timeout is longer
    #[arg(long, value_name = "MS")]
    wait_ms: Option<u64>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

impl PayArgs {
    fn to_request(&self) -> anyhow::Result<PaymentRequest> {
        let transaction_type = TransactionType::try_from(self.transaction_type)?;
        let acquirer_network = AcquirerNetwork::try_from(self.network)?;
        let total = match self.total {
            Some(total) => total,
            None => self
                .tax_exempt
                .checked_add(self.taxable)
                .and_then(|s| s.checked_add(self.tax))
                .ok_or_else(|| anyhow!("amounts overflow"))?,
        };
        Ok(PaymentRequest::new(PaymentRequestParams {
            transaction_type,
            acquirer_network,
            deferred_code: self.deferred_code.clone(),
            tax_exempt_amount: self.tax_exempt,
            taxable_amount: self.taxable,
            tax_amount: self.tax,
            total_amount: total,
        })?)
    }
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long, default_value = "127.0.0.1:9999")]
    bind: String,

    #[arg(long, value_enum, default_value_t = Behavior::Approve)]
    behavior: Behavior,

    /// Delay before answering, for `--behavior slow`
    #[arg(long, value_name = "MS", default_value_t = 3_000)]
    delay_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Behavior {
    Approve,
    Decline,
    Cancel,
    Silent,
    HangUp,
    Nak,
    Stale,
    Slow,
}

impl SimulateArgs {
    fn device_behavior(&self) -> DeviceBehavior {
        match self.behavior {
            Behavior::Approve => DeviceBehavior::Approve,
            Behavior::Decline => DeviceBehavior::Decline {
                code: "05".into(),
                message: "NEGADA".into(),
            },
            Behavior::Cancel => DeviceBehavior::Cancel,
            Behavior::Silent => DeviceBehavior::Silent,
            Behavior::HangUp => DeviceBehavior::HangUp,
            Behavior::Nak => DeviceBehavior::Nak,
            Behavior::Stale => DeviceBehavior::StaleThenApprove,
            Behavior::Slow => DeviceBehavior::ApproveAfter(Duration::from_millis(self.delay_ms)),
        }
    }
}

// ---------------------------------------------------------------------------
// Result reporting
// ---------------------------------------------------------------------------

fn exit_code(result: &Result<PaymentResponse, PinPadError>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(e) if e.requires_reconciliation() => 2,
        Err(_) => 1,
    }
}

/// Result in the `{status, transaction | message}` shape POS frontends read.
fn outcome_json(
    result: &Result<PaymentResponse, PinPadError>,
    exchange: Option<&ExchangeRecord>,
) -> Value {
    let mut out = match result {
        Ok(response) => json!({ "status": "success", "transaction": response }),
        Err(PinPadError::Device {
            status,
            message,
            response,
            ..
        }) => {
            let status = if *status == ResponseStatus::Cancelled {
                "cancelled"
            } else {
                "declined"
            };
            json!({ "status": status, "message": message, "transaction": response })
        }
        Err(e) if e.requires_reconciliation() => json!({
            "status": "indeterminate",
            "message": e.to_string(),
        }),
        Err(e) => json!({ "status": "error", "message": e.to_string() }),
    };
    if let Some(exchange) = exchange {
        out["exchange"] = json!(exchange);
    }
    out
}

fn print_text(result: &Result<PaymentResponse, PinPadError>) {
    let response = match result {
        Ok(response) => response,
        Err(PinPadError::Device { response, .. }) => &**response,
        Err(e) => {
            println!("Result: {}", if e.requires_reconciliation() { "UNKNOWN" } else { "ERROR" });
            println!("Message: {e}");
            return;
        }
    };
    println!("Result: {}", response.status());
    println!("Response code: {}", response.response_code());
    println!("Message: {}", response.response_message());
    println!("Batch: {}", response.batch_number());
    println!("Reference: {}", response.reference_number());
    println!("Authorization: {}", response.authorization_code());
    println!("Acquirer: {}", response.acquirer_code());
    println!("Card: {} {}", response.card_group_name(), response.masked_card_number());
    println!("Cardholder: {}", response.cardholder_name());
    println!("Entry mode: {}", response.entry_mode());
    println!("PIN verified: {}", if response.pin_verified() { "yes" } else { "no" });
    println!("Total: {}", response.total_amount());
}

fn pay(args: PayArgs) -> anyhow::Result<ExitCode> {
    let config = args.connection.to_config()?;
    let request = args.to_request()?;
    let client = TransactionClient::new(config);
    let deadline = args
        .wait_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let result = client.process_payment_with(&request, deadline, &CancellationToken::new());

    if args.json {
        let exchange = client.last_exchange();
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome_json(&result, exchange.as_ref()))?
        );
    } else {
        print_text(&result);
    }
    Ok(ExitCode::from(exit_code(&result)))
}

fn simulate(args: SimulateArgs) -> anyhow::Result<ExitCode> {
    let simulator = DeviceSimulator::bind(args.bind.as_str(), args.device_behavior())
        .with_context(|| format!("binding {}", args.bind))?;
    info!("Simulator ready on {}", simulator.local_addr()?);
    simulator.serve_forever()?;
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = pinpad_lan::init_tracing(cli.log_dir.as_deref(), cli.log_json);

    let result = match cli.command {
        Command::Pay(args) => pay(args),
        Command::Simulate(args) => simulate(args),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
