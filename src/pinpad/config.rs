//! PIN-pad connection and identity settings.
//!
//! A [`PinPadConfig`] is validated once and read-only afterwards. Validation
//! reports every bad field at once so a misconfigured install can be fixed in
//! one pass.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pinpad::codec::{CASHIER_ID_WIDTH, MERCHANT_ID_WIDTH, TERMINAL_ID_WIDTH};
use crate::pinpad::error::{FieldViolation, PinPadError};

pub const DEFAULT_TIMEOUT_MS: u64 = 90_000;
pub const DEFAULT_PROTOCOL_MAJOR: u32 = 2;
pub const DEFAULT_PROTOCOL_MINOR: u32 = 2;

/// Unvalidated settings. Numeric fields are wider than the validated ones so
/// out-of-range values reach validation instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PinPadConfigParams {
    #[serde(alias = "ip")]
    pub host: String,
    pub port: u32,
    #[serde(alias = "timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(alias = "merchant_id", alias = "mid")]
    pub merchant_id: String,
    #[serde(alias = "terminal_id", alias = "tid")]
    pub terminal_id: String,
    #[serde(alias = "cashier_id", alias = "cid")]
    pub cashier_id: String,
    #[serde(alias = "protocol_major")]
    pub protocol_major: u32,
    #[serde(alias = "protocol_minor")]
    pub protocol_minor: u32,
}

impl Default for PinPadConfigParams {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            merchant_id: String::new(),
            terminal_id: String::new(),
            cashier_id: String::new(),
            protocol_major: DEFAULT_PROTOCOL_MAJOR,
            protocol_minor: DEFAULT_PROTOCOL_MINOR,
        }
    }
}

/// Validated PIN-pad settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PinPadConfigParams", into = "PinPadConfigParams")]
pub struct PinPadConfig {
    host: String,
    port: u16,
    timeout_ms: u64,
    merchant_id: String,
    terminal_id: String,
    cashier_id: String,
    protocol_major: u8,
    protocol_minor: u8,
}

fn check_identifier(
    violations: &mut Vec<FieldViolation>,
    field: &'static str,
    value: &str,
    width: usize,
) {
    if value.trim().is_empty() {
        violations.push(FieldViolation::new(field, "must not be empty"));
        return;
    }
    if !value.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        violations.push(FieldViolation::new(field, "must be printable ASCII"));
    }
    if value.len() > width {
        violations.push(FieldViolation::new(
            field,
            format!("must be at most {width} characters (got {})", value.len()),
        ));
    }
}

impl PinPadConfig {
    pub fn new(params: PinPadConfigParams) -> Result<Self, PinPadError> {
        let mut violations = Vec::new();

        if params.host.trim().is_empty() {
            violations.push(FieldViolation::new("host", "must not be empty"));
        }
        let port = u16::try_from(params.port).ok().filter(|&p| p != 0);
        if port.is_none() {
            violations.push(FieldViolation::new(
                "port",
                format!("must be between 1 and 65535 (got {})", params.port),
            ));
        }
        if params.timeout_ms == 0 {
            violations.push(FieldViolation::new("timeoutMs", "must be greater than zero"));
        }
        check_identifier(
            &mut violations,
            "merchantId",
            &params.merchant_id,
            MERCHANT_ID_WIDTH,
        );
        check_identifier(
            &mut violations,
            "terminalId",
            &params.terminal_id,
            TERMINAL_ID_WIDTH,
        );
        check_identifier(
            &mut violations,
            "cashierId",
            &params.cashier_id,
            CASHIER_ID_WIDTH,
        );
        for (field, value) in [
            ("protocolMajor", params.protocol_major),
            ("protocolMinor", params.protocol_minor),
        ] {
            if value > 99 {
                violations.push(FieldViolation::new(
                    field,
                    format!("must be between 0 and 99 (got {value})"),
                ));
            }
        }

        match port {
            Some(port) if violations.is_empty() => Ok(Self {
                host: params.host.trim().to_string(),
                port,
                timeout_ms: params.timeout_ms,
                merchant_id: params.merchant_id,
                terminal_id: params.terminal_id,
                cashier_id: params.cashier_id,
                protocol_major: params.protocol_major as u8,
                protocol_minor: params.protocol_minor as u8,
            }),
            _ => Err(PinPadError::Configuration { violations }),
        }
    }

    /// Load from a device-config JSON object (camelCase or snake_case keys).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, PinPadError> {
        let params: PinPadConfigParams =
            serde_json::from_value(value.clone()).map_err(|e| PinPadError::Configuration {
                violations: vec![FieldViolation::new("config", e.to_string())],
            })?;
        Self::new(params)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, for logs and error messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn merchant_id(&self) -> &str {
        &self.merchant_id
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn cashier_id(&self) -> &str {
        &self.cashier_id
    }

    pub fn protocol_major(&self) -> u8 {
        self.protocol_major
    }

    pub fn protocol_minor(&self) -> u8 {
        self.protocol_minor
    }
}

impl TryFrom<PinPadConfigParams> for PinPadConfig {
    type Error = PinPadError;

    fn try_from(params: PinPadConfigParams) -> Result<Self, Self::Error> {
        Self::new(params)
    }
}

impl From<PinPadConfig> for PinPadConfigParams {
    fn from(c: PinPadConfig) -> Self {
        Self {
            host: c.host,
            port: c.port.into(),
            timeout_ms: c.timeout_ms,
            merchant_id: c.merchant_id,
            terminal_id: c.terminal_id,
            cashier_id: c.cashier_id,
            protocol_major: c.protocol_major.into(),
            protocol_minor: c.protocol_minor.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
