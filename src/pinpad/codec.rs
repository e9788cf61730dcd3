//! LAN wire codec for the PIN pad.
//!
//! Every message is framed as `STX | payload | ETX | LRC`, with the LRC being
//! the XOR of all payload bytes and the ETX byte. The payload is printable
//! ASCII fields joined by FS. The device may also answer with a single ACK
//! (frame received) or NAK (frame rejected, not processed).
//!
//! Amounts travel as 12-digit zero-padded integers scaled by 100 (cents), in
//! both directions. Nothing is ever rounded: an amount that does not fit is
//! an encoding error.
//!
//! Request (`PP`) fields, in order:
//!
//! | field             | width | format                          |
//! |-------------------|-------|---------------------------------|
//! | message type      | 2     | `PP`                            |
//! | protocol version  | 4     | major (2 digits) + minor (2)    |
//! | sequence          | 6     | 000001..=999999                 |
//! | transaction type  | 2     | digits                          |
//! | acquirer network  | 2     | digits                          |
//! | deferred code     | 2     | digits                          |
//! | tax-exempt amount | 12    | cents                           |
//! | taxable amount    | 12    | cents                           |
//! | tax amount        | 12    | cents                           |
//! | total amount      | 12    | cents                           |
//! | merchant id       | 15    | left aligned, space padded      |
//! | terminal id       | 10    | left aligned, space padded      |
//! | cashier id        | 10    | left aligned, space padded      |
//!
//! Response (`RP`) fields, in order:
//!
//! | field                  | width | format                         |
//! |------------------------|-------|--------------------------------|
//! | message type           | 2     | `RP`                           |
//! | sequence               | 6     | echo of the request            |
//! | response code          | 2     | alphanumeric                   |
//! | response message       | ≤ 32  | free text                      |
//! | batch number           | 6     | digits or spaces               |
//! | reference number       | 6     | digits or spaces               |
//! | authorization code     | 6     | alphanumeric, space padded     |
//! | acquirer code          | 2     | digits or spaces               |
//! | acquirer response code | 2     | alphanumeric or spaces         |
//! | card group name        | ≤ 20  | free text                      |
//! | cardholder name        | ≤ 40  | free text                      |
//! | masked card number     | ≤ 19  | digits, `*`, `X`               |
//! | entry mode             | 2     | alphanumeric or spaces         |
//! | PIN verified           | 1     | `S` / `N`                      |
//! | total amount           | 12    | cents                          |
//! | terminal id            | 10    | space padded                   |
//! | merchant id            | 15    | space padded                   |
//!
//! Fixed-width text is right-trimmed on decode; free text is kept verbatim.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::pinpad::config::PinPadConfig;
use crate::pinpad::error::PinPadError;
use crate::pinpad::protocol::{
    AcquirerNetwork, PaymentRequest, PaymentRequestParams, PaymentResponse, PaymentResponseFields,
    TransactionType,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const FS: u8 = 0x1C;

pub const REQUEST_TYPE: &str = "PP";
pub const RESPONSE_TYPE: &str = "RP";

pub const MERCHANT_ID_WIDTH: usize = 15;
pub const TERMINAL_ID_WIDTH: usize = 10;
pub const CASHIER_ID_WIDTH: usize = 10;
pub const AMOUNT_WIDTH: usize = 12;
pub const SEQUENCE_WIDTH: usize = 6;
pub const MAX_SEQUENCE: u32 = 999_999;
pub const MAX_AMOUNT_CENTS: u64 = 999_999_999_999;

pub const RESPONSE_MESSAGE_MAX: usize = 32;
pub const CARD_GROUP_MAX: usize = 20;
pub const CARDHOLDER_MAX: usize = 40;
pub const MASKED_CARD_MAX: usize = 19;

/// Largest frame the assembler buffers before giving up on the stream.
pub const MAX_FRAME_LEN: usize = 4096;

const REQUEST_FIELDS: usize = 13;
const RESPONSE_FIELDS: usize = 17;

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// XOR checksum over `bytes`.
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn is_payload_byte(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

/// Build `STX + f1 + FS + f2 + ... + ETX + LRC`.
fn build_frame(fields: &[String]) -> Vec<u8> {
    let payload_len: usize = fields.iter().map(String::len).sum::<usize>() + fields.len();
    let mut frame = Vec::with_capacity(payload_len + 3);
    frame.push(STX);
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            frame.push(FS);
        }
        frame.extend_from_slice(field.as_bytes());
    }
    frame.push(ETX);
    let checksum = lrc(&frame[1..]);
    frame.push(checksum);
    frame
}

/// Check framing and LRC, then split the payload into fields.
fn split_frame(raw: &[u8]) -> Result<Vec<String>, PinPadError> {
    if raw.len() < 3 {
        return Err(PinPadError::malformed_frame(format!(
            "frame too short ({} bytes)",
            raw.len()
        )));
    }
    if raw[0] != STX {
        return Err(PinPadError::malformed_frame(format!(
            "expected STX, found 0x{:02X}",
            raw[0]
        )));
    }
    let etx_pos = raw.len() - 2;
    if raw[etx_pos] != ETX {
        return Err(PinPadError::malformed_frame("missing ETX before LRC"));
    }
    let expected = lrc(&raw[1..=etx_pos]);
    let actual = raw[raw.len() - 1];
    if expected != actual {
        return Err(PinPadError::malformed_frame(format!(
            "LRC mismatch: computed 0x{expected:02X}, received 0x{actual:02X}"
        )));
    }

    let payload = &raw[1..etx_pos];
    if let Some(offset) = payload
        .iter()
        .position(|&b| b != FS && !is_payload_byte(b))
    {
        return Err(PinPadError::malformed_frame(format!(
            "non-printable byte 0x{:02X} at payload offset {offset}",
            payload[offset]
        )));
    }

    Ok(payload
        .split(|&b| b == FS)
        .map(|chunk| chunk.iter().map(|&b| b as char).collect())
        .collect())
}

// ---------------------------------------------------------------------------
// Field encoders
// ---------------------------------------------------------------------------

/// Amount as 12-digit cents. Fails instead of rounding.
pub fn encode_amount(field: &'static str, amount: Decimal) -> Result<String, PinPadError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(PinPadError::encoding(field, format!("{amount} is negative")));
    }
    let scaled = amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .ok_or_else(|| PinPadError::encoding(field, format!("{amount} overflows")))?;
    if !scaled.fract().is_zero() {
        return Err(PinPadError::encoding(
            field,
            format!("{amount} has more than two decimal places"),
        ));
    }
    let cents = scaled
        .to_u64()
        .filter(|&c| c <= MAX_AMOUNT_CENTS)
        .ok_or_else(|| {
            PinPadError::encoding(field, format!("{amount} exceeds {AMOUNT_WIDTH} digits"))
        })?;
    Ok(format!("{cents:0width$}", width = AMOUNT_WIDTH))
}

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), PinPadError> {
    if let Some(c) = value.chars().find(|&c| !c.is_ascii() || !is_payload_byte(c as u8)) {
        return Err(PinPadError::encoding(
            field,
            format!("character {c:?} is not printable ASCII"),
        ));
    }
    if value.len() > max {
        return Err(PinPadError::encoding(
            field,
            format!("{} characters exceed the {max}-character field", value.len()),
        ));
    }
    Ok(())
}

/// Left-aligned, space padded to exactly `width`.
fn encode_padded(field: &'static str, value: &str, width: usize) -> Result<String, PinPadError> {
    check_text(field, value, width)?;
    Ok(format!("{value:<width$}"))
}

fn encode_digits(field: &'static str, value: u32, width: usize) -> Result<String, PinPadError> {
    let s = format!("{value:0width$}");
    if s.len() > width {
        return Err(PinPadError::encoding(
            field,
            format!("{value} does not fit in {width} digits"),
        ));
    }
    Ok(s)
}

/// Fixed-width field that may be blank (all spaces) and otherwise must match `valid`.
fn encode_optional_fixed(
    field: &'static str,
    value: &str,
    width: usize,
    valid: fn(u8) -> bool,
) -> Result<String, PinPadError> {
    if !value.bytes().all(valid) {
        return Err(PinPadError::encoding(
            field,
            format!("'{value}' contains invalid characters"),
        ));
    }
    encode_padded(field, value, width)
}

// ---------------------------------------------------------------------------
// Field decoders
// ---------------------------------------------------------------------------

/// Exactly `width` characters; returned right-trimmed.
fn decode_fixed<'a>(
    field: &'static str,
    value: &'a str,
    width: usize,
) -> Result<&'a str, PinPadError> {
    if value.len() != width {
        return Err(PinPadError::decoding(
            field,
            format!("expected {width} characters, got {}", value.len()),
        ));
    }
    Ok(value.trim_end_matches(' '))
}

fn decode_optional_fixed(
    field: &'static str,
    value: &str,
    width: usize,
    valid: fn(u8) -> bool,
) -> Result<String, PinPadError> {
    let trimmed = decode_fixed(field, value, width)?;
    if !trimmed.bytes().all(valid) {
        return Err(PinPadError::decoding(
            field,
            format!("'{trimmed}' contains invalid characters"),
        ));
    }
    Ok(trimmed.to_string())
}

fn decode_number(field: &'static str, value: &str, width: usize) -> Result<u64, PinPadError> {
    if value.len() != width || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PinPadError::decoding(
            field,
            format!("'{value}' is not {width} digits"),
        ));
    }
    value
        .parse()
        .map_err(|e| PinPadError::decoding(field, format!("'{value}': {e}")))
}

pub fn decode_amount(field: &'static str, value: &str) -> Result<Decimal, PinPadError> {
    let cents = decode_number(field, value, AMOUNT_WIDTH)?;
    Ok(Decimal::new(cents as i64, 2))
}

fn decode_sequence(value: &str) -> Result<u32, PinPadError> {
    let seq = decode_number("sequence", value, SEQUENCE_WIDTH)? as u32;
    if seq == 0 {
        return Err(PinPadError::decoding("sequence", "sequence 0 is reserved"));
    }
    Ok(seq)
}

fn decode_variable(field: &'static str, value: &str, max: usize) -> Result<String, PinPadError> {
    if value.len() > max {
        return Err(PinPadError::decoding(
            field,
            format!("{} characters exceed the {max}-character field", value.len()),
        ));
    }
    Ok(value.to_string())
}

fn is_digit(b: u8) -> bool {
    b.is_ascii_digit()
}

fn is_alnum(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

fn is_masked_pan(b: u8) -> bool {
    b.is_ascii_digit() || b == b'*' || b == b'X'
}

fn check_sequence(sequence: u32) -> Result<String, PinPadError> {
    if sequence == 0 || sequence > MAX_SEQUENCE {
        return Err(PinPadError::encoding(
            "sequence",
            format!("{sequence} outside 1..={MAX_SEQUENCE}"),
        ));
    }
    Ok(format!("{sequence:0width$}", width = SEQUENCE_WIDTH))
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Serialize a payment request into a `PP` frame.
pub fn encode_request(
    request: &PaymentRequest,
    config: &PinPadConfig,
    sequence: u32,
) -> Result<Vec<u8>, PinPadError> {
    let deferred = request.deferred_code();
    if deferred.len() != 2 || !deferred.bytes().all(is_digit) {
        return Err(PinPadError::encoding(
            "deferred code",
            format!("'{deferred}' is not two digits"),
        ));
    }

    let fields = vec![
        REQUEST_TYPE.to_string(),
        format!(
            "{}{}",
            encode_digits("protocol major", config.protocol_major().into(), 2)?,
            encode_digits("protocol minor", config.protocol_minor().into(), 2)?
        ),
        check_sequence(sequence)?,
        encode_digits("transaction type", request.transaction_type().code().into(), 2)?,
        encode_digits("acquirer network", request.acquirer_network().code().into(), 2)?,
        deferred.to_string(),
        encode_amount("tax-exempt amount", request.tax_exempt_amount())?,
        encode_amount("taxable amount", request.taxable_amount())?,
        encode_amount("tax amount", request.tax_amount())?,
        encode_amount("total amount", request.total_amount())?,
        encode_padded("merchant id", config.merchant_id(), MERCHANT_ID_WIDTH)?,
        encode_padded("terminal id", config.terminal_id(), TERMINAL_ID_WIDTH)?,
        encode_padded("cashier id", config.cashier_id(), CASHIER_ID_WIDTH)?,
    ];

    let frame = build_frame(&fields);
    trace!(sequence, len = frame.len(), "encoded payment request");
    Ok(frame)
}

/// A request frame as the device sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub sequence: u32,
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub request: PaymentRequest,
    pub merchant_id: String,
    pub terminal_id: String,
    pub cashier_id: String,
}

/// Device-side parser for `PP` frames; the inverse of [`encode_request`].
pub fn decode_request(raw: &[u8]) -> Result<DecodedRequest, PinPadError> {
    let fields = split_frame(raw)?;
    if fields.len() != REQUEST_FIELDS {
        return Err(PinPadError::malformed_frame(format!(
            "expected {REQUEST_FIELDS} request fields, got {}",
            fields.len()
        )));
    }
    if fields[0] != REQUEST_TYPE {
        return Err(PinPadError::decoding(
            "message type",
            format!("expected {REQUEST_TYPE}, got '{}'", fields[0]),
        ));
    }

    let version = decode_number("protocol version", &fields[1], 4)?;
    let sequence = decode_sequence(&fields[2])?;
    let transaction_type = TransactionType::try_from(
        decode_number("transaction type", &fields[3], 2)? as u8,
    )
    .map_err(|e| PinPadError::decoding("transaction type", e.to_string()))?;
    let acquirer_network = AcquirerNetwork::try_from(
        decode_number("acquirer network", &fields[4], 2)? as u8,
    )
    .map_err(|e| PinPadError::decoding("acquirer network", e.to_string()))?;
    decode_number("deferred code", &fields[5], 2)?;

    let request = PaymentRequest::new(PaymentRequestParams {
        transaction_type,
        acquirer_network,
        deferred_code: fields[5].clone(),
        tax_exempt_amount: decode_amount("tax-exempt amount", &fields[6])?,
        taxable_amount: decode_amount("taxable amount", &fields[7])?,
        tax_amount: decode_amount("tax amount", &fields[8])?,
        total_amount: decode_amount("total amount", &fields[9])?,
    })
    .map_err(|e| PinPadError::malformed_frame(e.to_string()))?;

    Ok(DecodedRequest {
        sequence,
        protocol_major: (version / 100) as u8,
        protocol_minor: (version % 100) as u8,
        request,
        merchant_id: decode_fixed("merchant id", &fields[10], MERCHANT_ID_WIDTH)?.to_string(),
        terminal_id: decode_fixed("terminal id", &fields[11], TERMINAL_ID_WIDTH)?.to_string(),
        cashier_id: decode_fixed("cashier id", &fields[12], CASHIER_ID_WIDTH)?.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Device-side encoder for `RP` frames; the inverse of [`decode_response`].
pub fn encode_response(response: &PaymentResponse, sequence: u32) -> Result<Vec<u8>, PinPadError> {
    let r = response.fields();

    if r.response_code.len() != 2 || !r.response_code.bytes().all(is_alnum) {
        return Err(PinPadError::encoding(
            "response code",
            format!("'{}' is not two alphanumerics", r.response_code),
        ));
    }
    check_text("response message", &r.response_message, RESPONSE_MESSAGE_MAX)?;
    check_text("card group name", &r.card_group_name, CARD_GROUP_MAX)?;
    check_text("cardholder name", &r.cardholder_name, CARDHOLDER_MAX)?;
    check_text("masked card number", &r.masked_card_number, MASKED_CARD_MAX)?;
    if !r.masked_card_number.bytes().all(is_masked_pan) {
        return Err(PinPadError::encoding(
            "masked card number",
            "only digits, '*' and 'X' are allowed",
        ));
    }

    let fields = vec![
        RESPONSE_TYPE.to_string(),
        check_sequence(sequence)?,
        r.response_code.clone(),
        r.response_message.clone(),
        encode_optional_fixed("batch number", &r.batch_number, 6, is_digit)?,
        encode_optional_fixed("reference number", &r.reference_number, 6, is_digit)?,
        encode_optional_fixed("authorization code", &r.authorization_code, 6, is_alnum)?,
        encode_optional_fixed("acquirer code", &r.acquirer_code, 2, is_digit)?,
        encode_optional_fixed(
            "acquirer response code",
            &r.acquirer_response_code,
            2,
            is_alnum,
        )?,
        r.card_group_name.clone(),
        r.cardholder_name.clone(),
        r.masked_card_number.clone(),
        encode_optional_fixed("entry mode", &r.entry_mode, 2, is_alnum)?,
        if r.pin_verified { "S" } else { "N" }.to_string(),
        encode_amount("total amount", r.total_amount)?,
        encode_padded("terminal id", &r.terminal_id, TERMINAL_ID_WIDTH)?,
        encode_padded("merchant id", &r.merchant_id, MERCHANT_ID_WIDTH)?,
    ];
    Ok(build_frame(&fields))
}

/// Parse an `RP` frame into its sequence number and response. Pure: the
/// same bytes always give the same result, whatever the response code says.
pub fn decode_response(raw: &[u8]) -> Result<(u32, PaymentResponse), PinPadError> {
    let fields = split_frame(raw)?;
    if fields.len() != RESPONSE_FIELDS {
        return Err(PinPadError::malformed_frame(format!(
            "expected {RESPONSE_FIELDS} response fields, got {}",
            fields.len()
        )));
    }
    if fields[0] != RESPONSE_TYPE {
        return Err(PinPadError::decoding(
            "message type",
            format!("expected {RESPONSE_TYPE}, got '{}'", fields[0]),
        ));
    }

    let sequence = decode_sequence(&fields[1])?;

    let code = &fields[2];
    if code.len() != 2 || !code.bytes().all(is_alnum) {
        return Err(PinPadError::decoding(
            "response code",
            format!("'{code}' is not two alphanumerics"),
        ));
    }

    let pin_verified = match fields[13].as_str() {
        "S" => true,
        "N" => false,
        other => {
            return Err(PinPadError::decoding(
                "PIN verified",
                format!("expected S or N, got '{other}'"),
            ))
        }
    };

    let masked = decode_variable("masked card number", &fields[11], MASKED_CARD_MAX)?;
    if !masked.bytes().all(is_masked_pan) {
        return Err(PinPadError::decoding(
            "masked card number",
            "only digits, '*' and 'X' are allowed",
        ));
    }

    let response = PaymentResponse::from(PaymentResponseFields {
        response_code: code.clone(),
        response_message: decode_variable("response message", &fields[3], RESPONSE_MESSAGE_MAX)?,
        batch_number: decode_optional_fixed("batch number", &fields[4], 6, is_digit)?,
        reference_number: decode_optional_fixed("reference number", &fields[5], 6, is_digit)?,
        authorization_code: decode_optional_fixed("authorization code", &fields[6], 6, is_alnum)?,
        acquirer_code: decode_optional_fixed("acquirer code", &fields[7], 2, is_digit)?,
        acquirer_response_code: decode_optional_fixed(
            "acquirer response code",
            &fields[8],
            2,
            is_alnum,
        )?,
        card_group_name: decode_variable("card group name", &fields[9], CARD_GROUP_MAX)?,
        cardholder_name: decode_variable("cardholder name", &fields[10], CARDHOLDER_MAX)?,
        masked_card_number: masked,
        entry_mode: decode_optional_fixed("entry mode", &fields[12], 2, is_alnum)?,
        pin_verified,
        total_amount: decode_amount("total amount", &fields[14])?,
        terminal_id: decode_fixed("terminal id", &fields[15], TERMINAL_ID_WIDTH)?.to_string(),
        merchant_id: decode_fixed("merchant id", &fields[16], MERCHANT_ID_WIDTH)?.to_string(),
    });

    Ok((sequence, response))
}

/// Turn a non-approval into a [`PinPadError::Device`].
pub fn classify(response: PaymentResponse) -> Result<PaymentResponse, PinPadError> {
    let status = response.status();
    if response.is_approved() {
        return Ok(response);
    }
    Err(PinPadError::Device {
        code: response.response_code().to_string(),
        status,
        message: response.response_message().to_string(),
        response: Box::new(response),
    })
}

/// [`decode_response`] followed by [`classify`].
pub fn decode(raw: &[u8]) -> Result<PaymentResponse, PinPadError> {
    let (_, response) = decode_response(raw)?;
    classify(response)
}

// ---------------------------------------------------------------------------
// Stream assembly
// ---------------------------------------------------------------------------

/// One complete message pulled off the byte stream.
#[derive(Debug)]
pub enum Unit {
    Ack,
    Nak,
    Frame(Zeroizing<Vec<u8>>),
}

/// Incremental frame scanner for bytes arriving in arbitrary chunks.
///
/// The buffer is wiped on drop since frames carry cardholder data. It never
/// reallocates in place, so no unwiped copy is left behind when it grows.
pub struct FrameAssembler {
    buf: Zeroizing<Vec<u8>>,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self {
            buf: Zeroizing::new(Vec::with_capacity(MAX_FRAME_LEN)),
        }
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes. Only the frame still waiting for its ETX and
    /// LRC counts toward [`MAX_FRAME_LEN`]; complete units may pile up until
    /// [`next_unit`](Self::next_unit) takes them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), PinPadError> {
        let needed = self.buf.len() + bytes.len();
        if needed > self.buf.capacity() {
            let mut grown = Zeroizing::new(Vec::with_capacity(needed.max(2 * self.buf.capacity())));
            grown.extend_from_slice(&self.buf);
            // The old buffer is wiped as it drops.
            self.buf = grown;
        }
        self.buf.extend_from_slice(bytes);

        let pending = self.unterminated_len();
        if pending > MAX_FRAME_LEN {
            self.buf.clear();
            return Err(PinPadError::malformed_frame(format!(
                "no complete frame within {MAX_FRAME_LEN} bytes (got {pending})"
            )));
        }
        Ok(())
    }

    /// Length of the trailing frame that has an STX but no ETX and LRC yet.
    fn unterminated_len(&self) -> usize {
        let buf = &self.buf[..];
        let mut i = 0;
        while i < buf.len() {
            match buf[i] {
                STX => match buf[i + 1..].iter().position(|&b| b == ETX) {
                    Some(offset) if i + offset + 2 < buf.len() => i += offset + 3,
                    _ => return buf.len() - i,
                },
                _ => i += 1,
            }
        }
        0
    }

    /// Next complete unit, or `None` until more bytes arrive. Bytes before
    /// an STX/ACK/NAK are line noise and are dropped.
    pub fn next_unit(&mut self) -> Option<Unit> {
        loop {
            let first = *self.buf.first()?;
            match first {
                ACK => {
                    self.buf.drain(..1);
                    return Some(Unit::Ack);
                }
                NAK => {
                    self.buf.drain(..1);
                    return Some(Unit::Nak);
                }
                STX => {
                    let etx = self.buf.iter().skip(1).position(|&b| b == ETX)? + 1;
                    if etx + 1 >= self.buf.len() {
                        // LRC byte not here yet.
                        return None;
                    }
                    let frame: Vec<u8> = self.buf.drain(..=etx + 1).collect();
                    return Some(Unit::Frame(Zeroizing::new(frame)));
                }
                _ => {
                    let skip = self
                        .buf
                        .iter()
                        .position(|&b| matches!(b, STX | ACK | NAK))
                        .unwrap_or(self.buf.len());
                    debug!("Discarding {skip} bytes of line noise");
                    self.buf.drain(..skip);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
