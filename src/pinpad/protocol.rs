//! Payment request/response value types.
//!
//! Both types are validated once at construction and immutable afterwards.
//! Amounts are exact decimals; the wire scaling lives in the codec.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pinpad::error::{FieldViolation, PinPadError};

// ---------------------------------------------------------------------------
// Enumerated wire codes
// ---------------------------------------------------------------------------

/// A numeric wire code with no matching variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown {kind} code {code:02}")]
pub struct UnknownCode {
    pub kind: &'static str,
    pub code: u8,
}

/// Kind of payment the PIN pad should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TransactionType {
    /// Regular purchase, paid in one charge.
    Purchase,
    DeferredWithInterest,
    DeferredWithoutInterest,
    Void,
}

impl TransactionType {
    pub fn code(self) -> u8 {
        match self {
            TransactionType::Purchase => 1,
            TransactionType::DeferredWithInterest => 2,
            TransactionType::DeferredWithoutInterest => 3,
            TransactionType::Void => 4,
        }
    }

    /// Whether the transaction is split into installments.
    pub fn is_deferred(self) -> bool {
        matches!(
            self,
            TransactionType::DeferredWithInterest | TransactionType::DeferredWithoutInterest
        )
    }
}

impl TryFrom<u8> for TransactionType {
    type Error = UnknownCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(TransactionType::Purchase),
            2 => Ok(TransactionType::DeferredWithInterest),
            3 => Ok(TransactionType::DeferredWithoutInterest),
            4 => Ok(TransactionType::Void),
            code => Err(UnknownCode {
                kind: "transaction type",
                code,
            }),
        }
    }
}

impl From<TransactionType> for u8 {
    fn from(t: TransactionType) -> u8 {
        t.code()
    }
}

/// Acquirer network the device routes the authorization through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AcquirerNetwork {
    Primary,
    Secondary,
}

impl AcquirerNetwork {
    pub fn code(self) -> u8 {
        match self {
            AcquirerNetwork::Primary => 1,
            AcquirerNetwork::Secondary => 2,
        }
    }
}

impl TryFrom<u8> for AcquirerNetwork {
    type Error = UnknownCode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(AcquirerNetwork::Primary),
            2 => Ok(AcquirerNetwork::Secondary),
            code => Err(UnknownCode {
                kind: "acquirer network",
                code,
            }),
        }
    }
}

impl From<AcquirerNetwork> for u8 {
    fn from(n: AcquirerNetwork) -> u8 {
        n.code()
    }
}

/// Business outcome carried by a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Approved,
    /// Declined by the authorizing host.
    Declined,
    /// Aborted on the PIN pad by the cardholder or the operator.
    Cancelled,
    /// The device itself failed or gave up waiting for a card.
    DeviceFault,
}

pub const APPROVED_CODE: &str = "00";
pub const CANCELLED_CODE: &str = "TC";
pub const DEVICE_ERROR_CODE: &str = "ER";
pub const DEVICE_TIMEOUT_CODE: &str = "TO";

impl ResponseStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            APPROVED_CODE => ResponseStatus::Approved,
            CANCELLED_CODE => ResponseStatus::Cancelled,
            DEVICE_ERROR_CODE | DEVICE_TIMEOUT_CODE => ResponseStatus::DeviceFault,
            _ => ResponseStatus::Declined,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseStatus::Approved => "approved",
            ResponseStatus::Declined => "declined",
            ResponseStatus::Cancelled => "cancelled",
            ResponseStatus::DeviceFault => "device fault",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Payment request
// ---------------------------------------------------------------------------

/// Deferral code for transactions paid in one charge.
pub const NO_DEFERRAL: &str = "00";

fn default_deferred_code() -> String {
    NO_DEFERRAL.to_string()
}

/// Unvalidated request fields, as supplied by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequestParams {
    pub transaction_type: TransactionType,
    pub acquirer_network: AcquirerNetwork,
    #[serde(default = "default_deferred_code", alias = "deferred_code")]
    pub deferred_code: String,
    #[serde(alias = "tax_exempt_amount")]
    pub tax_exempt_amount: Decimal,
    #[serde(alias = "taxable_amount")]
    pub taxable_amount: Decimal,
    #[serde(alias = "tax_amount")]
    pub tax_amount: Decimal,
    #[serde(alias = "total_amount")]
    pub total_amount: Decimal,
}

/// A payment to run on the PIN pad.
///
/// `total_amount` always equals `tax_exempt_amount + taxable_amount +
/// tax_amount`; construction fails otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PaymentRequestParams", into = "PaymentRequestParams")]
pub struct PaymentRequest {
    transaction_type: TransactionType,
    acquirer_network: AcquirerNetwork,
    deferred_code: String,
    tax_exempt_amount: Decimal,
    taxable_amount: Decimal,
    tax_amount: Decimal,
    total_amount: Decimal,
}

impl PaymentRequest {
    pub fn new(params: PaymentRequestParams) -> Result<Self, PinPadError> {
        let request = Self {
            transaction_type: params.transaction_type,
            acquirer_network: params.acquirer_network,
            deferred_code: params.deferred_code,
            tax_exempt_amount: params.tax_exempt_amount,
            taxable_amount: params.taxable_amount,
            tax_amount: params.tax_amount,
            total_amount: params.total_amount,
        };
        request.validate()?;
        Ok(request)
    }

    /// Re-check the structural rules. Reports every violation at once.
    pub fn validate(&self) -> Result<(), PinPadError> {
        let mut violations = Vec::new();

        let amounts = [
            ("taxExemptAmount", self.tax_exempt_amount),
            ("taxableAmount", self.taxable_amount),
            ("taxAmount", self.tax_amount),
            ("totalAmount", self.total_amount),
        ];
        for (field, amount) in amounts {
            if amount.is_sign_negative() && !amount.is_zero() {
                violations.push(FieldViolation::new(field, "must not be negative"));
            }
            if amount.normalize().scale() > 2 {
                violations.push(FieldViolation::new(
                    field,
                    format!("{amount} has more than two decimal places"),
                ));
            }
        }
        if self.total_amount <= Decimal::ZERO {
            violations.push(FieldViolation::new(
                "totalAmount",
                "must be greater than zero",
            ));
        }

        let sum = self
            .tax_exempt_amount
            .checked_add(self.taxable_amount)
            .and_then(|s| s.checked_add(self.tax_amount));
        match sum {
            Some(sum) if sum == self.total_amount => {}
            Some(sum) => violations.push(FieldViolation::new(
                "totalAmount",
                format!(
                    "{} does not equal taxExemptAmount + taxableAmount + taxAmount ({sum})",
                    self.total_amount
                ),
            )),
            None => violations.push(FieldViolation::new(
                "totalAmount",
                "component amounts overflow",
            )),
        }

        let code = &self.deferred_code;
        if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_digit()) {
            violations.push(FieldViolation::new(
                "deferredCode",
                format!("'{code}' must be exactly two digits"),
            ));
        } else if !self.transaction_type.is_deferred() && code != NO_DEFERRAL {
            violations.push(FieldViolation::new(
                "deferredCode",
                format!(
                    "'{code}' is only valid for deferred transaction types, not {:?}",
                    self.transaction_type
                ),
            ));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(PinPadError::InvalidRequest { violations })
        }
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub fn acquirer_network(&self) -> AcquirerNetwork {
        self.acquirer_network
    }

    pub fn deferred_code(&self) -> &str {
        &self.deferred_code
    }

    pub fn tax_exempt_amount(&self) -> Decimal {
        self.tax_exempt_amount
    }

    pub fn taxable_amount(&self) -> Decimal {
        self.taxable_amount
    }

    pub fn tax_amount(&self) -> Decimal {
        self.tax_amount
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_amount
    }
}

impl TryFrom<PaymentRequestParams> for PaymentRequest {
    type Error = PinPadError;

    fn try_from(params: PaymentRequestParams) -> Result<Self, Self::Error> {
        Self::new(params)
    }
}

impl From<PaymentRequest> for PaymentRequestParams {
    fn from(r: PaymentRequest) -> Self {
        Self {
            transaction_type: r.transaction_type,
            acquirer_network: r.acquirer_network,
            deferred_code: r.deferred_code,
            tax_exempt_amount: r.tax_exempt_amount,
            taxable_amount: r.taxable_amount,
            tax_amount: r.tax_amount,
            total_amount: r.total_amount,
        }
    }
}

// ---------------------------------------------------------------------------
// Payment response
// ---------------------------------------------------------------------------

/// Raw response fields as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponseFields {
    pub response_code: String,
    pub response_message: String,
    pub batch_number: String,
    pub reference_number: String,
    pub authorization_code: String,
    pub acquirer_code: String,
    pub acquirer_response_code: String,
    pub card_group_name: String,
    pub cardholder_name: String,
    pub masked_card_number: String,
    pub entry_mode: String,
    pub pin_verified: bool,
    pub total_amount: Decimal,
    pub terminal_id: String,
    pub merchant_id: String,
}

/// The device's answer to one payment request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PaymentResponseFields", into = "PaymentResponseFields")]
pub struct PaymentResponse {
    fields: PaymentResponseFields,
}

impl PaymentResponse {
    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::from_code(&self.fields.response_code)
    }

    pub fn is_approved(&self) -> bool {
        self.status() == ResponseStatus::Approved
    }

    pub fn response_code(&self) -> &str {
        &self.fields.response_code
    }

    /// Authorizer message, e.g. `APROBADA TRANS.`
    pub fn response_message(&self) -> &str {
        &self.fields.response_message
    }

    pub fn batch_number(&self) -> &str {
        &self.fields.batch_number
    }

    pub fn reference_number(&self) -> &str {
        &self.fields.reference_number
    }

    pub fn authorization_code(&self) -> &str {
        &self.fields.authorization_code
    }

    pub fn acquirer_code(&self) -> &str {
        &self.fields.acquirer_code
    }

    pub fn acquirer_response_code(&self) -> &str {
        &self.fields.acquirer_response_code
    }

    pub fn card_group_name(&self) -> &str {
        &self.fields.card_group_name
    }

    pub fn cardholder_name(&self) -> &str {
        &self.fields.cardholder_name
    }

    pub fn masked_card_number(&self) -> &str {
        &self.fields.masked_card_number
    }

    /// How the card was read (`CH` chip, `BA` stripe, `CT` contactless, `MA` manual).
    pub fn entry_mode(&self) -> &str {
        &self.fields.entry_mode
    }

    pub fn pin_verified(&self) -> bool {
        self.fields.pin_verified
    }

    pub fn total_amount(&self) -> Decimal {
        self.fields.total_amount
    }

    pub fn terminal_id(&self) -> &str {
        &self.fields.terminal_id
    }

    pub fn merchant_id(&self) -> &str {
        &self.fields.merchant_id
    }

    pub fn fields(&self) -> &PaymentResponseFields {
        &self.fields
    }
}

impl From<PaymentResponseFields> for PaymentResponse {
    fn from(fields: PaymentResponseFields) -> Self {
        Self { fields }
    }
}

impl From<PaymentResponse> for PaymentResponseFields {
    fn from(r: PaymentResponse) -> Self {
        r.fields
    }
}

// Cardholder names stay out of logs and panic messages.
impl fmt::Debug for PaymentResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.fields;
        f.debug_struct("PaymentResponse")
            .field("response_code", &r.response_code)
            .field("response_message", &r.response_message)
            .field("batch_number", &r.batch_number)
            .field("reference_number", &r.reference_number)
            .field("authorization_code", &r.authorization_code)
            .field("acquirer_code", &r.acquirer_code)
            .field("acquirer_response_code", &r.acquirer_response_code)
            .field("card_group_name", &r.card_group_name)
            .field("cardholder_name", &"<redacted>")
            .field("masked_card_number", &r.masked_card_number)
            .field("entry_mode", &r.entry_mode)
            .field("pin_verified", &r.pin_verified)
            .field("total_amount", &r.total_amount)
            .field("terminal_id", &r.terminal_id)
            .field("merchant_id", &r.merchant_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
