//! Reply decoding for the SMC100 line protocol.
//!
//! Reply layout (manual p. 61-65), offsets from line start:
//!
//! ```text
//! 1TP12.3456      position / numeric queries: value token at offset 3
//! 1TS000033       status: 4 error-bit chars at 3..7, state code at 7..9
//! 1TEA            last command error: error char at offset 3
//! ```
//!
//! Every accessor checks the length before slicing and reports `SlaError::Parse`
//! instead of reading past the end.

use std::fmt;

use crate::error::{AppResult, SlaError};
use crate::protocol::command::CommandType;

/// Length of the `<address><wire code>` header that precedes every value.
pub const REPLY_HEADER_LEN: usize = 3;
/// Offset of the two-character controller state in a `TS` reply.
pub const STATUS_CODE_OFFSET: usize = 7;
/// Width of the controller state token.
pub const STATUS_CODE_LEN: usize = 2;
/// Offset of the error character in a `TE` reply.
pub const ERROR_CHAR_OFFSET: usize = 3;

/// Coarse controller state, grouped from the manual's state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// Not referenced; homing required.
    NoReference,
    /// Configuration state.
    Config,
    /// Home search in progress.
    Homing,
    /// Executing a move.
    Moving,
    /// Ready for a move.
    Ready,
    /// Motor disabled.
    Disabled,
    /// Jogging from the keypad.
    Jogging,
    /// ESP stage error.
    Error,
    /// No recognized state.
    Unknown,
}

impl ControllerState {
    /// Display name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::NoReference => "No Reference",
            ControllerState::Config => "Configuration",
            ControllerState::Homing => "Homing",
            ControllerState::Moving => "Moving",
            ControllerState::Ready => "Ready",
            ControllerState::Disabled => "Disabled",
            ControllerState::Jogging => "Jogging",
            ControllerState::Error => "Error",
            ControllerState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static STATUS_TABLE: &[(&str, ControllerState)] = &[
    // NOT REFERENCED from reset, homing, configuration, disable, moving, ready,
    // ESP stage error, jogging
    ("0A", ControllerState::NoReference),
    ("0B", ControllerState::NoReference),
    ("0C", ControllerState::NoReference),
    ("0D", ControllerState::NoReference),
    ("0E", ControllerState::NoReference),
    ("0F", ControllerState::NoReference),
    ("10", ControllerState::NoReference),
    ("11", ControllerState::NoReference),
    ("14", ControllerState::Config),
    // HOMING commanded from RS-232-C, from SMC-RC
    ("1E", ControllerState::Homing),
    ("1F", ControllerState::Homing),
    ("28", ControllerState::Moving),
    // READY from homing, moving, disable, jogging
    ("32", ControllerState::Ready),
    ("33", ControllerState::Ready),
    ("34", ControllerState::Ready),
    ("35", ControllerState::Ready),
    // DISABLE from ready, moving, jogging
    ("3C", ControllerState::Disabled),
    ("3D", ControllerState::Disabled),
    ("3E", ControllerState::Disabled),
    // JOGGING from ready, disable
    ("46", ControllerState::Jogging),
    ("47", ControllerState::Jogging),
];

/// A decoded status token. `state` is `Unknown` when the token is not in the table;
/// the raw token is kept for diagnostics either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCode {
    /// Two-character code as received.
    pub token: String,
    /// Mapped state.
    pub state: ControllerState,
    recognized: bool,
}

impl StatusCode {
    /// Map a raw token through the state table.
    pub fn lookup(token: &str) -> Self {
        let entry = STATUS_TABLE
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(token));
        Self {
            token: token.to_string(),
            state: entry.map_or(ControllerState::Unknown, |(_, state)| *state),
            recognized: entry.is_some(),
        }
    }

    /// Whether the token was found in the table.
    pub fn is_recognized(&self) -> bool {
        self.recognized
    }

    /// The operator-facing reading for this code.
    pub fn reading(&self) -> StatusReading {
        if self.recognized {
            StatusReading::Known(self.state)
        } else {
            StatusReading::UnknownCode(self.token.clone())
        }
    }
}

/// What `getCurrentStatus` reports. `UnknownCode` (token absent from the table)
/// is kept apart from `Known(ControllerState::Unknown)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReading {
    /// A code from the state table.
    Known(ControllerState),
    /// A code the table does not list.
    UnknownCode(String),
}

impl StatusReading {
    /// True only for a recognized Ready code.
    pub fn is_ready(&self) -> bool {
        matches!(self, StatusReading::Known(ControllerState::Ready))
    }
}

impl fmt::Display for StatusReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusReading::Known(state) => write!(f, "{state}"),
            StatusReading::UnknownCode(token) => write!(f, "Unknown Status Code: {token}"),
        }
    }
}

/// Error character from a `TE` reply with its manual description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceErrorCode {
    /// Character at the error offset.
    pub code: char,
    /// Manual text for the character.
    pub description: &'static str,
}

/// Error character meaning "no error".
pub const NO_ERROR_CHAR: char = '@';

impl DeviceErrorCode {
    /// Look up the manual description of `code`.
    pub fn from_char(code: char) -> Self {
        let description = match code {
            '@' => "No error encountered",
            'A' => "Unknown message",
            'B' => "Incorrect address",
            'C' => "Parameter missing",
            'D' => "Command not allowed",
            'E' => "Already homing",
            'F' => "ESP stage unknown",
            'G' => "Displacement out of limits",
            'H' => "Not allowed in NOT REFERENCED",
            'I' => "Not allowed in CONFIGURATION",
            'J' => "Not allowed in DISABLED",
            'K' => "Not allowed in READY",
            'L' => "Not allowed in HOMING",
            'M' => "Not allowed in MOVING",
            'N' => "Out of soft limits",
            'S' => "Communication time out",
            'U' => "EEPROM error",
            'V' => "Error during command execution",
            'W' => "Command not allowed for PP",
            'X' => "Command not allowed for CC",
            _ => "Unrecognized error",
        };
        Self { code, description }
    }

    /// Anything but `@` is an error.
    pub fn is_error(&self) -> bool {
        self.code != NO_ERROR_CHAR
    }

    /// Turn a reported error into `SlaError::Device` for callers that halt on it.
    pub fn into_result(self) -> AppResult<()> {
        if self.is_error() {
            Err(SlaError::Device {
                code: self.code,
                description: self.description,
            })
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description, self.code)
    }
}

/// Numeric fields the controller reports, with the minimum value width each
/// reply must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyField {
    /// Current position (`TP`).
    Position,
    /// Velocity (`VA`).
    Velocity,
    /// Acceleration (`AC`).
    Acceleration,
    /// Positive software limit (`SR`).
    PositiveLimit,
    /// Negative software limit (`SL`).
    NegativeLimit,
}

impl ReplyField {
    /// Fewest value characters a reply may carry.
    pub fn min_width(self) -> usize {
        match self {
            ReplyField::Position => 6,
            ReplyField::Velocity
            | ReplyField::Acceleration
            | ReplyField::PositiveLimit
            | ReplyField::NegativeLimit => 2,
        }
    }

    /// Query that reports this field.
    pub fn command(self) -> CommandType {
        match self {
            ReplyField::Position => CommandType::PositionReal,
            ReplyField::Velocity => CommandType::Velocity,
            ReplyField::Acceleration => CommandType::Acceleration,
            ReplyField::PositiveLimit => CommandType::PositiveSoftwareLimit,
            ReplyField::NegativeLimit => CommandType::NegativeSoftwareLimit,
        }
    }
}

fn strip_terminators(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn field<'a>(line: &'a str, offset: usize, len: usize, what: &str) -> AppResult<&'a str> {
    line.get(offset..offset + len).ok_or_else(|| {
        SlaError::parse(
            line,
            format!(
                "{what} needs {} characters, reply has {}",
                offset + len,
                line.len()
            ),
        )
    })
}

/// Extract the controller state from a `TS` reply.
///
/// Unmapped tokens decode to `ControllerState::Unknown`; only a reply too short
/// to contain a token is an error.
pub fn decode_status(line: &str) -> AppResult<StatusCode> {
    let line = strip_terminators(line);
    let token = field(line, STATUS_CODE_OFFSET, STATUS_CODE_LEN, "status code")?;
    Ok(StatusCode::lookup(token))
}

/// Extract the error character from a `TE` reply.
pub fn decode_error(line: &str) -> AppResult<DeviceErrorCode> {
    let line = strip_terminators(line);
    let code = field(line, ERROR_CHAR_OFFSET, 1, "error character")?;
    // `field` returned one byte on a char boundary, so this is a single char
    let code = code.chars().next().unwrap_or('?');
    Ok(DeviceErrorCode::from_char(code))
}

/// Parse the numeric value of a reply to a `field` query.
///
/// The header must name the field's command, and the value token must be at
/// least `field.min_width()` characters long.
pub fn decode_numeric(line: &str, field_kind: ReplyField) -> AppResult<f64> {
    let line = strip_terminators(line).trim_start();
    let expected = field_kind.command().wire_code();
    let code = field(line, 1, 2, "command code")?;
    if !code.eq_ignore_ascii_case(expected) {
        return Err(SlaError::parse(
            line,
            format!("expected {expected} reply, got {code}"),
        ));
    }

    let value = line[REPLY_HEADER_LEN..].trim_end();
    if value.len() < field_kind.min_width() {
        return Err(SlaError::parse(
            line,
            format!(
                "{field_kind:?} value needs at least {} characters, got {}",
                field_kind.min_width(),
                value.len()
            ),
        ));
    }

    let token_len = value
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
        .unwrap_or(value.len());
    value[..token_len]
        .parse::<f64>()
        .map_err(|_| SlaError::parse(line, format!("{:?} is not a number", &value[..token_len])))
}
