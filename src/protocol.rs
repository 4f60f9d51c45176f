//! Wire codec for the DUT command/response protocol.
//!
//! Devices speak a semicolon-delimited textual protocol: a message name
//! followed by `KEY=VALUE` pairs, every part terminated by `;`. For
//! example the discovery response:
//!
//! ```text
//! ID;MODEL=M001;SERIAL=SN0123457;
//! ```
//!
//! The codec is a pure transform with no socket or session knowledge.
//! [`decode`] is total: any byte sequence yields exactly one [`Message`]
//! variant or a [`DecodeError`], never a panic or a partial parse.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Signed fixed-point quantity with two decimal places, stored as an
/// integer count of hundredths.
///
/// Telemetry values (milliamps, millivolts) are reported by devices with
/// exactly two decimals. Keeping them as integer hundredths makes
/// aggregate arithmetic exact; `50.60 + 13.60` is `5060 + 1360`, with no
/// float accumulation error.
///
/// # Examples
///
/// ```
/// use dutnet::protocol::Centi;
///
/// let ma: Centi = "50.6".parse().unwrap();
/// assert_eq!(ma.raw(), 5060);
/// assert_eq!(ma.to_string(), "50.60");
/// assert_eq!(ma.as_f64(), 50.6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Centi(i64);

impl Centi {
    /// Creates a value from a raw count of hundredths.
    pub const fn from_raw(hundredths: i64) -> Self {
        Centi(hundredths)
    }

    /// Returns the raw count of hundredths.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Returns the value as a float (e.g. `5060` -> `50.6`).
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Centi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Serialize for Centi {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl FromStr for Centi {
    type Err = DecodeError;

    /// Parses a signed decimal with at most two fractional digits.
    ///
    /// Malformed input (empty, stray characters, more than two decimal
    /// places) is rejected rather than clamped or rounded.
    fn from_str(s: &str) -> Result<Self, DecodeError> {
        let malformed = || DecodeError::InvalidNumber(s.to_string());
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() || frac_part.len() > 2 {
            return Err(malformed());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }

        let whole: i64 = int_part.parse().map_err(|_| malformed())?;
        let mut frac: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| malformed())?
        };
        if frac_part.len() == 1 {
            frac *= 10;
        }

        let magnitude = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(malformed)?;
        Ok(Centi(if negative { -magnitude } else { magnitude }))
    }
}

/// Errors produced while decoding an inbound datagram.
///
/// Decode failures are always local to the offending datagram: the
/// dispatcher and discovery client count and discard them, they never
/// abort a window or fail another device's session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,

    #[error("unrecognized message: {0}")]
    UnknownMessage(String),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("invalid numeric field: {0:?}")]
    InvalidNumber(String),
}

/// Messages exchanged with devices under test.
///
/// This is the closed variant set of the protocol. Outbound messages
/// (`DiscoveryProbe`, `StartTest`) travel caller -> device; the rest
/// travel device -> caller.
///
/// # Protocol flow
///
/// 1. Caller multicasts `DiscoveryProbe`; each device replies unicast
///    with `DiscoveryResponse`.
/// 2. Caller sends `StartTest` unicast to a device's command address.
/// 3. Device replies `TestStarted`, then a `StatusUpdate` roughly every
///    `rate_ms` milliseconds while the test runs.
/// 4. Device signals `TestCompleted` when it returns to idle.
/// 5. `Error` can arrive at any point to abort the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Multicast probe asking devices to identify themselves.
    DiscoveryProbe,

    /// Unicast identification reply from a device.
    DiscoveryResponse { model: String, serial: String },

    /// Start-test command: run for `duration_s` seconds, reporting
    /// status every `rate_ms` milliseconds.
    StartTest { duration_s: u64, rate_ms: u64 },

    /// Device acknowledgment that the test is running.
    TestStarted,

    /// One telemetry sample: elapsed milliseconds since test start (as
    /// reported by the device), current in mA, voltage in mV.
    StatusUpdate {
        elapsed_ms: u64,
        current_ma: Centi,
        voltage_mv: Centi,
    },

    /// Device has finished the test and returned to idle.
    TestCompleted,

    /// Device-reported failure.
    Error { reason: String },
}

impl Message {
    /// Creates a StartTest command.
    ///
    /// # Arguments
    ///
    /// * `duration_s` - Test duration in seconds
    /// * `rate_ms` - Status report period in milliseconds
    pub fn start_test(duration_s: u64, rate_ms: u64) -> Self {
        Message::StartTest {
            duration_s,
            rate_ms,
        }
    }

    /// Creates a StatusUpdate sample message.
    pub fn status_update(elapsed_ms: u64, current_ma: Centi, voltage_mv: Centi) -> Self {
        Message::StatusUpdate {
            elapsed_ms,
            current_ma,
            voltage_mv,
        }
    }
}

/// Encodes a message to its wire form.
///
/// # Examples
///
/// ```
/// use dutnet::protocol::{encode, Message};
///
/// assert_eq!(encode(&Message::DiscoveryProbe), b"ID;");
/// assert_eq!(
///     encode(&Message::start_test(5, 100)),
///     b"TEST;CMD=START;DURATION=5;RATE=100;"
/// );
/// ```
pub fn encode(msg: &Message) -> Vec<u8> {
    let text = match msg {
        Message::DiscoveryProbe => "ID;".to_string(),
        Message::DiscoveryResponse { model, serial } => {
            format!("ID;MODEL={model};SERIAL={serial};")
        }
        Message::StartTest {
            duration_s,
            rate_ms,
        } => format!("TEST;CMD=START;DURATION={duration_s};RATE={rate_ms};"),
        Message::TestStarted => "TEST;RESULT=STARTED;".to_string(),
        Message::StatusUpdate {
            elapsed_ms,
            current_ma,
            voltage_mv,
        } => format!("STATUS;TIME={elapsed_ms};MA={current_ma};MV={voltage_mv};"),
        Message::TestCompleted => "STATUS;STATE=IDLE;".to_string(),
        Message::Error { reason } => format!("ERROR;REASON={reason};"),
    };
    text.into_bytes()
}

/// Decodes a datagram into exactly one [`Message`].
///
/// Bytes are interpreted lossily as text (devices use a latin-1-ish
/// encoding; unmappable bytes become replacement characters and then
/// fail field validation), then parsed strictly against the closed
/// message set.
///
/// # Errors
///
/// Returns a [`DecodeError`] for anything outside the closed variant
/// set: empty input, unknown message names, missing keys, malformed
/// `KEY=VALUE` parts, or numeric fields that are not valid signed
/// two-decimal fixed-point / integers.
///
/// # Examples
///
/// ```
/// use dutnet::protocol::{decode, Message};
///
/// let msg = decode(b"ID;MODEL=M001;SERIAL=SN0123457;").unwrap();
/// assert_eq!(
///     msg,
///     Message::DiscoveryResponse {
///         model: "M001".into(),
///         serial: "SN0123457".into(),
///     }
/// );
/// assert!(decode(b"STATUS;TIME=oops;").is_err());
/// ```
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let text = String::from_utf8_lossy(bytes);
    let mut parts = text.split(';');

    let name = parts.next().unwrap_or("");
    if name.is_empty() {
        return Err(DecodeError::Empty);
    }

    // KEY=VALUE pairs, in wire order. The trailing ';' leaves one empty
    // part which is skipped, as are interior empty parts.
    let mut fields: Vec<(&str, &str)> = Vec::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => fields.push((key, value)),
            None => return Err(DecodeError::InvalidField(part.to_string())),
        }
    }
    let get = |key: &'static str| -> Result<&str, DecodeError> {
        fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .ok_or(DecodeError::MissingField(key))
    };

    match name {
        "ID" if fields.is_empty() => Ok(Message::DiscoveryProbe),
        "ID" => Ok(Message::DiscoveryResponse {
            model: get("MODEL")?.to_string(),
            serial: get("SERIAL")?.to_string(),
        }),
        "TEST" => {
            if get("CMD") == Ok("START") {
                return Ok(Message::StartTest {
                    duration_s: parse_u64(get("DURATION")?)?,
                    rate_ms: parse_u64(get("RATE")?)?,
                });
            }
            match get("RESULT")? {
                "STARTED" => Ok(Message::TestStarted),
                other => Err(DecodeError::InvalidField(format!("RESULT={other}"))),
            }
        }
        "STATUS" => {
            // The device signals completion by reporting an idle state
            // inside a STATUS message.
            if get("STATE") == Ok("IDLE") {
                return Ok(Message::TestCompleted);
            }
            Ok(Message::StatusUpdate {
                elapsed_ms: parse_u64(get("TIME")?)?,
                current_ma: get("MA")?.parse()?,
                voltage_mv: get("MV")?.parse()?,
            })
        }
        "ERROR" => Ok(Message::Error {
            reason: get("REASON")?.to_string(),
        }),
        other => Err(DecodeError::UnknownMessage(other.to_string())),
    }
}

fn parse_u64(s: &str) -> Result<u64, DecodeError> {
    s.parse()
        .map_err(|_| DecodeError::InvalidNumber(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Centi fixed-point
    // ============================================================

    #[test]
    fn test_centi_parse_two_decimals() {
        assert_eq!("4477.30".parse::<Centi>().unwrap().raw(), 447730);
    }

    #[test]
    fn test_centi_parse_one_decimal() {
        assert_eq!("50.6".parse::<Centi>().unwrap().raw(), 5060);
    }

    #[test]
    fn test_centi_parse_integer() {
        assert_eq!("7".parse::<Centi>().unwrap().raw(), 700);
    }

    #[test]
    fn test_centi_parse_negative() {
        assert_eq!("-13.25".parse::<Centi>().unwrap().raw(), -1325);
        assert_eq!("-0.05".parse::<Centi>().unwrap().raw(), -5);
    }

    #[test]
    fn test_centi_rejects_malformed() {
        for bad in ["", "-", ".", "1.234", "1,5", "1.2.3", "abc", "--1", "1e3"] {
            assert!(bad.parse::<Centi>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_centi_display() {
        assert_eq!(Centi::from_raw(5060).to_string(), "50.60");
        assert_eq!(Centi::from_raw(-5).to_string(), "-0.05");
        assert_eq!(Centi::from_raw(0).to_string(), "0.00");
    }

    // ============================================================
    // Encoding
    // ============================================================

    #[test]
    fn test_encode_probe() {
        assert_eq!(encode(&Message::DiscoveryProbe), b"ID;");
    }

    #[test]
    fn test_encode_start_test() {
        let msg = Message::start_test(5, 100);
        assert_eq!(encode(&msg), b"TEST;CMD=START;DURATION=5;RATE=100;");
    }

    #[test]
    fn test_encode_status_update() {
        let msg = Message::status_update(100, Centi::from_raw(5060), Centi::from_raw(447730));
        assert_eq!(encode(&msg), b"STATUS;TIME=100;MA=50.60;MV=4477.30;");
    }

    #[test]
    fn test_encode_completed() {
        assert_eq!(encode(&Message::TestCompleted), b"STATUS;STATE=IDLE;");
    }

    // ============================================================
    // Decoding
    // ============================================================

    #[test]
    fn test_decode_discovery_response() {
        let msg = decode(b"ID;MODEL=M001;SERIAL=SN0123457;").unwrap();
        assert_eq!(
            msg,
            Message::DiscoveryResponse {
                model: "M001".to_string(),
                serial: "SN0123457".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_status_update() {
        let msg = decode(b"STATUS;TIME=200;MA=13.60;MV=4460.30;").unwrap();
        assert_eq!(
            msg,
            Message::status_update(200, Centi::from_raw(1360), Centi::from_raw(446030))
        );
    }

    #[test]
    fn test_decode_completed_state_idle() {
        assert_eq!(decode(b"STATUS;STATE=IDLE;"), Ok(Message::TestCompleted));
    }

    #[test]
    fn test_decode_error_message() {
        let msg = decode(b"ERROR;REASON=overcurrent;").unwrap();
        assert_eq!(
            msg,
            Message::Error {
                reason: "overcurrent".to_string()
            }
        );
    }

    #[test]
    fn test_decode_empty_is_error() {
        assert_eq!(decode(b""), Err(DecodeError::Empty));
        assert_eq!(decode(b";MODEL=M001;"), Err(DecodeError::Empty));
    }

    #[test]
    fn test_decode_unknown_name() {
        assert!(matches!(
            decode(b"BOGUS;X=1;"),
            Err(DecodeError::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_decode_missing_field() {
        assert_eq!(
            decode(b"ID;MODEL=M001;"),
            Err(DecodeError::MissingField("SERIAL"))
        );
        assert_eq!(
            decode(b"STATUS;TIME=100;MA=1.00;"),
            Err(DecodeError::MissingField("MV"))
        );
    }

    #[test]
    fn test_decode_bare_part_is_error() {
        assert!(matches!(
            decode(b"STATUS;TIME100;"),
            Err(DecodeError::InvalidField(_))
        ));
    }

    #[test]
    fn test_decode_malformed_numeric_fails_not_clamps() {
        assert!(matches!(
            decode(b"STATUS;TIME=abc;MA=1.00;MV=2.00;"),
            Err(DecodeError::InvalidNumber(_))
        ));
        assert!(matches!(
            decode(b"STATUS;TIME=100;MA=1.234;MV=2.00;"),
            Err(DecodeError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_decode_non_utf8_is_rejected_not_panicking() {
        // Lossy text decode turns stray bytes into replacement chars,
        // which then fail strict parsing.
        assert!(decode(&[0xff, 0xfe, 0x3b]).is_err());
    }

    #[test]
    fn test_roundtrip_every_variant() {
        let all = [
            Message::DiscoveryProbe,
            Message::DiscoveryResponse {
                model: "M001".to_string(),
                serial: "SN0123457".to_string(),
            },
            Message::start_test(30, 100),
            Message::TestStarted,
            Message::status_update(1500, Centi::from_raw(-250), Centi::from_raw(447730)),
            Message::TestCompleted,
            Message::Error {
                reason: "overheat".to_string(),
            },
        ];
        for msg in all {
            assert_eq!(decode(&encode(&msg)), Ok(msg.clone()), "variant {msg:?}");
        }
    }

    // ============================================================
    // Property-Based Tests
    // ============================================================

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        // Identifier-ish strings that survive the ;/= framing
        fn token_strategy() -> impl Strategy<Value = String> {
            "[A-Za-z0-9_.-]{1,16}"
        }

        proptest! {
            /// Property: any DiscoveryResponse round-trips
            #[test]
            fn prop_discovery_response_roundtrip(
                model in token_strategy(),
                serial in token_strategy(),
            ) {
                let msg = Message::DiscoveryResponse { model, serial };
                prop_assert_eq!(decode(&encode(&msg)), Ok(msg.clone()));
            }

            /// Property: any StartTest round-trips
            #[test]
            fn prop_start_test_roundtrip(
                duration_s in 0u64..86_400,
                rate_ms in 1u64..10_000,
            ) {
                let msg = Message::start_test(duration_s, rate_ms);
                prop_assert_eq!(decode(&encode(&msg)), Ok(msg.clone()));
            }

            /// Property: any StatusUpdate round-trips, including signed
            /// telemetry values
            #[test]
            fn prop_status_update_roundtrip(
                elapsed_ms in any::<u32>(),
                current in -1_000_000i64..1_000_000,
                voltage in -1_000_000i64..1_000_000,
            ) {
                let msg = Message::status_update(
                    elapsed_ms as u64,
                    Centi::from_raw(current),
                    Centi::from_raw(voltage),
                );
                prop_assert_eq!(decode(&encode(&msg)), Ok(msg.clone()));
            }

            /// Property: Centi formatting and parsing are inverses
            #[test]
            fn prop_centi_roundtrip(raw in -10_000_000i64..10_000_000) {
                let c = Centi::from_raw(raw);
                prop_assert_eq!(c.to_string().parse::<Centi>(), Ok(c));
            }

            /// Property: decode never panics on arbitrary bytes
            #[test]
            fn prop_decode_total(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = decode(&bytes);
            }
        }
    }
}
