/*!
 * Controller wire protocol.
 *
 * The controller speaks short newline-terminated text lines. Replies start with
 * a three-letter prefix followed by the payload (`GTW24`, `GMD2`, ...); requests
 * are path-like commands (`/pompe/mode`, `/slot/3/add`). There are no request
 * identifiers: a reply can only be matched to a request by ordering.
 */
use std::fmt;

use thiserror::Error;

use poolflow_core::types::{ErrorFlags, PumpMode, SlotIndex, MAX_SLOT_HOURS};

/// Water temperature report
pub const WATER_PREFIX: &str = "GTW";
/// Air temperature report
pub const AIR_PREFIX: &str = "GTA";
/// Pump mode report
pub const MODE_PREFIX: &str = "GMD";
/// Time slot report
pub const SLOT_PREFIX: &str = "GTS";
/// Error bitmask report
pub const ERRORS_PREFIX: &str = "GER";

/// Why a line could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Blank line
    #[error("Empty message")]
    Empty,

    /// The line does not start with a known prefix
    #[error("Unrecognized message: {0:?}")]
    UnknownPrefix(String),

    /// Known prefix, unusable payload
    #[error("Invalid payload for {prefix}: {payload:?}")]
    InvalidPayload {
        /// The message prefix
        prefix: &'static str,
        /// The payload as received
        payload: String,
    },
}

/// A decoded controller report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// `GTW<int>`
    WaterTemperature(i32),
    /// `GTA<int>`
    AirTemperature(i32),
    /// `GMD<0|1|2>`
    PumpMode(PumpMode),
    /// `GTS<slot><hours>` or bare `GTS<hours>`; a bare report has no slot
    TimeSlot {
        /// Slot named by the report, if any
        slot: Option<SlotIndex>,
        /// Duration in hours
        hours: u16,
    },
    /// `GER<mask>`
    ErrorFlags(ErrorFlags),
}

impl Message {
    /// Decode one line received from the controller
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(DecodeError::Empty);
        }

        if let Some(payload) = line.strip_prefix(WATER_PREFIX) {
            return parse_temperature(WATER_PREFIX, payload).map(Message::WaterTemperature);
        }
        if let Some(payload) = line.strip_prefix(AIR_PREFIX) {
            return parse_temperature(AIR_PREFIX, payload).map(Message::AirTemperature);
        }
        if let Some(payload) = line.strip_prefix(MODE_PREFIX) {
            return PumpMode::from_code(payload)
                .map(Message::PumpMode)
                .ok_or_else(|| invalid(MODE_PREFIX, payload));
        }
        if let Some(payload) = line.strip_prefix(SLOT_PREFIX) {
            return parse_slot(payload);
        }
        if let Some(payload) = line.strip_prefix(ERRORS_PREFIX) {
            return leading_int(payload)
                .and_then(|mask| u8::try_from(mask).ok())
                .filter(|mask| *mask <= ErrorFlags::MAX_MASK)
                .map(|mask| Message::ErrorFlags(ErrorFlags::from_mask(mask)))
                .ok_or_else(|| invalid(ERRORS_PREFIX, payload));
        }

        Err(DecodeError::UnknownPrefix(line.to_string()))
    }

    /// Whether a line looks like a controller reply to a probe query
    pub fn is_controller_reply(line: &str) -> bool {
        let line = line.trim_start();
        [MODE_PREFIX, WATER_PREFIX, AIR_PREFIX]
            .iter()
            .any(|prefix| line.starts_with(prefix))
    }

    /// Encode the report as the controller would send it
    pub fn encode(&self) -> String {
        match self {
            Message::WaterTemperature(t) => format!("{}{}", WATER_PREFIX, t),
            Message::AirTemperature(t) => format!("{}{}", AIR_PREFIX, t),
            Message::PumpMode(mode) => format!("{}{}", MODE_PREFIX, mode.code()),
            Message::TimeSlot { slot: Some(slot), hours } => {
                format!("{}{}{}", SLOT_PREFIX, slot, hours)
            }
            Message::TimeSlot { slot: None, hours } => format!("{}{}", SLOT_PREFIX, hours),
            Message::ErrorFlags(flags) => format!("{}{}", ERRORS_PREFIX, flags.mask()),
        }
    }
}

fn invalid(prefix: &'static str, payload: &str) -> DecodeError {
    DecodeError::InvalidPayload {
        prefix,
        payload: payload.to_string(),
    }
}

/// Lenient integer parse: optional sign, at least one digit, trailing text ignored
fn leading_int(payload: &str) -> Option<i64> {
    let payload = payload.trim_start();
    let bytes = payload.as_bytes();
    let sign = usize::from(matches!(bytes.first(), Some(b'-') | Some(b'+')));
    let digits = bytes[sign..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    payload[..sign + digits].parse().ok()
}

fn parse_temperature(prefix: &'static str, payload: &str) -> Result<i32, DecodeError> {
    leading_int(payload)
        .and_then(|t| i32::try_from(t).ok())
        .ok_or_else(|| invalid(prefix, payload))
}

fn parse_slot(payload: &str) -> Result<Message, DecodeError> {
    let all_digits = !payload.is_empty() && payload.bytes().all(|b| b.is_ascii_digit());
    if !all_digits || payload.len() > 3 {
        return Err(invalid(SLOT_PREFIX, payload));
    }

    // The indexed form wins whenever the payload fits it: "12" is slot 1, 2 h
    let (slot, hours) = match payload.as_bytes()[0] {
        b @ b'0'..=b'5' if payload.len() >= 2 => {
            (SlotIndex::new(usize::from(b - b'0')), &payload[1..])
        }
        _ => (None, payload),
    };

    let hours: u16 = hours.parse().map_err(|_| invalid(SLOT_PREFIX, payload))?;
    if hours > MAX_SLOT_HOURS {
        return Err(invalid(SLOT_PREFIX, payload));
    }
    Ok(Message::TimeSlot { slot, hours })
}

/// An outgoing command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `/pompe/mode`
    PumpMode,
    /// `/pompe/<off|on|auto>`
    SetPumpMode(PumpMode),
    /// `/temp/water`
    WaterTemperature,
    /// `/temp/air`
    AirTemperature,
    /// `/slot/<n>`
    TimeSlot(SlotIndex),
    /// `/slot/<n>/add`
    IncrementSlot(SlotIndex),
    /// `/slot/<n>/sub`
    DecrementSlot(SlotIndex),
    /// `/errors`
    Errors,
    /// A caller-supplied line sent verbatim
    Raw(String),
}

impl Request {
    /// Slot whose reply this request expects, if any
    pub fn slot(&self) -> Option<SlotIndex> {
        match self {
            Request::TimeSlot(slot) | Request::IncrementSlot(slot) | Request::DecrementSlot(slot) => {
                Some(*slot)
            }
            _ => None,
        }
    }

    /// Parse a command line as the controller reads it
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line.strip_prefix('/')?.split('/').collect();
        match parts.as_slice() {
            ["pompe", "mode"] => Some(Request::PumpMode),
            ["pompe", mode] => mode.parse().ok().map(Request::SetPumpMode),
            ["temp", "water"] => Some(Request::WaterTemperature),
            ["temp", "air"] => Some(Request::AirTemperature),
            ["errors"] => Some(Request::Errors),
            ["slot", index] => parse_slot_index(index).map(Request::TimeSlot),
            ["slot", index, "add"] => parse_slot_index(index).map(Request::IncrementSlot),
            ["slot", index, "sub"] => parse_slot_index(index).map(Request::DecrementSlot),
            _ => None,
        }
    }
}

fn parse_slot_index(index: &str) -> Option<SlotIndex> {
    index.parse::<usize>().ok().and_then(SlotIndex::new)
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::PumpMode => f.write_str("/pompe/mode"),
            Request::SetPumpMode(mode) => write!(f, "/pompe/{}", mode),
            Request::WaterTemperature => f.write_str("/temp/water"),
            Request::AirTemperature => f.write_str("/temp/air"),
            Request::TimeSlot(slot) => write!(f, "/slot/{}", slot),
            Request::IncrementSlot(slot) => write!(f, "/slot/{}/add", slot),
            Request::DecrementSlot(slot) => write!(f, "/slot/{}/sub", slot),
            Request::Errors => f.write_str("/errors"),
            Request::Raw(line) => f.write_str(line),
        }
    }
}
