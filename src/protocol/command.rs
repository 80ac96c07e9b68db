//! SMC100 command table and outbound line encoding.
//!
//! Reference: SMC100CC/PP user manual, command set p. 22-70.
//!
//! Outbound format: `<address><wire code>[<value>|?]\r\n`, ASCII.
//! - `?` suffix: query the current value (Get intent)
//! - numeric suffix: set a value, formatted per the command's parameter kind
//! - no suffix: plain action (home, stop, reset)

use crate::error::{AppResult, SlaError};

/// Line terminator expected by the controller on every command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Suffix that turns a command into a query.
pub const QUERY_MARKER: char = '?';

/// Every command the controller understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Acceleration (`AC`).
    Acceleration,
    /// Backlash compensation (`BA`).
    BacklashComp,
    /// Hysteresis compensation (`BH`).
    HysteresisComp,
    /// Motor driver voltage (`DV`).
    DriverVoltage,
    /// Low-pass filter cut-off for Kd (`FD`).
    KdLowPassFilterCutOff,
    /// Following error limit (`FE`).
    FollowingErrorLimit,
    /// Friction compensation (`FF`).
    FrictionComp,
    /// Home search type (`HT`).
    HomeSearchType,
    /// Stage identifier (`ID`).
    StageIdentifier,
    /// Leave the jogging state (`JD`).
    LeaveJoggingState,
    /// Keypad enable (`JM`).
    KeypadEnable,
    /// Jerk time (`JR`).
    JerkTime,
    /// Derivative gain (`KD`).
    DerivativeGain,
    /// Integral gain (`KI`).
    IntegralGain,
    /// Proportional gain (`KP`).
    ProportionalGain,
    /// Velocity feed forward (`KV`).
    VelocityFeedForward,
    /// Enter or leave the disabled state (`MM`).
    Enable,
    /// Home search velocity (`OH`).
    HomeSearchVelocity,
    /// Execute home search (`OR`).
    HomeSearch,
    /// Home search time-out (`OT`).
    HomeSearchTimeout,
    /// Move absolute (`PA`).
    MoveAbsolute,
    /// Move relative (`PR`).
    MoveRelative,
    /// Motion time for a relative move (`PT`).
    MoveEstimate,
    /// Enter or leave configuration state (`PW`).
    Configure,
    /// Analog input value (`RA`).
    Analog,
    /// TTL input value (`RB`).
    TtlInputValue,
    /// Reset the controller (`RS`).
    Reset,
    /// RS-485 address (`SA`).
    Rs485Address,
    /// TTL output value (`SB`).
    TtlOutputValue,
    /// Control loop state (`SC`).
    ControlLoopState,
    /// Negative software limit (`SL`).
    NegativeSoftwareLimit,
    /// Positive software limit (`SR`).
    PositiveSoftwareLimit,
    /// Stop motion (`ST`).
    StopMotion,
    /// Encoder increment value (`SU`).
    EncoderIncrementValue,
    /// Command error string (`TB`).
    CommandErrorString,
    /// Last command error (`TE`).
    LastCommandError,
    /// Set-point position (`TH`).
    PositionAsSet,
    /// Current position (`TP`).
    PositionReal,
    /// Positioner error and controller state (`TS`).
    ErrorStatus,
    /// Velocity (`VA`).
    Velocity,
    /// Base velocity (`VB`).
    BaseVelocity,
    /// Controller revision (`VE`).
    ControllerRevisionInfo,
    /// All configuration parameters (`ZT`).
    AllConfigParameters,
    /// ESP stage configuration (`ZX`).
    EspStageConfig,
}

/// How the numeric argument of a set command is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// No argument.
    None,
    /// Rendered as an integer.
    Int,
    /// Rendered with six decimals.
    Float,
}

/// Which intents a command accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Action only.
    None,
    /// Query only.
    Get,
    /// Set only.
    Set,
    /// Query or set.
    GetSet,
    /// Always a query.
    GetAlways,
}

impl Capability {
    /// Whether a `?` query of this command is meaningful.
    pub fn allows_get(self) -> bool {
        matches!(self, Capability::Get | Capability::GetSet | Capability::GetAlways)
    }
}

/// What a single request asks of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Plain action, nothing appended after the wire code.
    None,
    /// Append `?`.
    Get,
    /// Append the formatted parameter.
    Set,
}

/// One row of the static command table.
#[derive(Debug, PartialEq, Eq)]
pub struct Command {
    /// Which command the row describes.
    pub kind: CommandType,
    /// Two-character mnemonic.
    pub wire_code: &'static str,
    /// How a set value is rendered.
    pub parameter: ParameterKind,
    /// Intents the command accepts.
    pub capability: Capability,
}

/// Expands to the static table and a `match` lookup over the same rows, so a
/// variant without a row fails to compile.
macro_rules! command_table {
    ($(($kind:ident, $code:literal, $param:ident, $cap:ident)),* $(,)?) => {
        static COMMANDS: &[Command] = &[
            $(Command {
                kind: CommandType::$kind,
                wire_code: $code,
                parameter: ParameterKind::$param,
                capability: Capability::$cap,
            }),*
        ];

        impl CommandType {
            /// Table entry for this command.
            pub fn descriptor(self) -> &'static Command {
                match self {
                    $(CommandType::$kind => &Command {
                        kind: CommandType::$kind,
                        wire_code: $code,
                        parameter: ParameterKind::$param,
                        capability: Capability::$cap,
                    },)*
                }
            }
        }
    };
}

command_table![
    (Acceleration, "AC", Float, GetSet),
    (BacklashComp, "BA", Float, GetSet),
    (HysteresisComp, "BH", Float, GetSet),
    (DriverVoltage, "DV", Float, GetSet),
    (KdLowPassFilterCutOff, "FD", Float, GetSet),
    (FollowingErrorLimit, "FE", Float, GetSet),
    (FrictionComp, "FF", Float, GetSet),
    (HomeSearchType, "HT", Int, GetSet),
    (StageIdentifier, "ID", Float, GetSet),
    (LeaveJoggingState, "JD", None, None),
    (KeypadEnable, "JM", Int, GetSet),
    (JerkTime, "JR", Float, GetSet),
    (DerivativeGain, "KD", Float, GetSet),
    (IntegralGain, "KI", Float, GetSet),
    (ProportionalGain, "KP", Float, GetSet),
    (VelocityFeedForward, "KV", Float, GetSet),
    (Enable, "MM", Int, None),
    (HomeSearchVelocity, "OH", Float, GetSet),
    (HomeSearch, "OR", None, None),
    (HomeSearchTimeout, "OT", Float, GetSet),
    (MoveAbsolute, "PA", Float, GetSet),
    (MoveRelative, "PR", Float, GetSet),
    (MoveEstimate, "PT", Float, GetAlways),
    (Configure, "PW", Int, GetSet),
    (Analog, "RA", None, GetAlways),
    (TtlInputValue, "RB", None, GetAlways),
    (Reset, "RS", None, None),
    (Rs485Address, "SA", Int, GetSet),
    (TtlOutputValue, "SB", Int, GetSet),
    (ControlLoopState, "SC", Int, GetSet),
    (NegativeSoftwareLimit, "SL", Float, GetSet),
    (PositiveSoftwareLimit, "SR", Float, GetSet),
    (StopMotion, "ST", None, None),
    (EncoderIncrementValue, "SU", Float, GetSet),
    (CommandErrorString, "TB", None, GetAlways),
    (LastCommandError, "TE", None, GetAlways),
    (PositionAsSet, "TH", None, GetAlways),
    (PositionReal, "TP", None, GetAlways),
    (ErrorStatus, "TS", None, GetAlways),
    (Velocity, "VA", Float, GetSet),
    (BaseVelocity, "VB", Float, GetSet),
    (ControllerRevisionInfo, "VE", None, GetAlways),
    (AllConfigParameters, "ZT", None, GetAlways),
    (EspStageConfig, "ZX", None, GetSet),
];

impl CommandType {
    /// Two-character token sent on the wire.
    pub fn wire_code(self) -> &'static str {
        self.descriptor().wire_code
    }

    /// Look a command up by its wire code (case-insensitive).
    pub fn from_wire_code(code: &str) -> Option<Self> {
        COMMANDS
            .iter()
            .find(|entry| entry.wire_code.eq_ignore_ascii_case(code))
            .map(|entry| entry.kind)
    }
}

/// The full command table, in manual order.
pub fn command_table() -> &'static [Command] {
    COMMANDS
}

/// A command plus the value and intent for one call. Built per call and dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandRequest {
    /// Command to send.
    pub command: CommandType,
    /// Value for a set; ignored otherwise.
    pub parameter: f64,
    /// Query, set or plain action.
    pub intent: Intent,
}

impl CommandRequest {
    /// Query the current value.
    pub fn get(command: CommandType) -> Self {
        Self {
            command,
            parameter: 0.0,
            intent: Intent::Get,
        }
    }

    /// Set a value.
    pub fn set(command: CommandType, parameter: f64) -> Self {
        Self {
            command,
            parameter,
            intent: Intent::Set,
        }
    }

    /// Plain action with no suffix.
    pub fn action(command: CommandType) -> Self {
        Self {
            command,
            parameter: 0.0,
            intent: Intent::None,
        }
    }
}

/// Encode a request into a complete wire line for the controller at `address`.
pub fn encode(address: &str, request: &CommandRequest) -> AppResult<String> {
    let desc = request.command.descriptor();
    let mut line = String::with_capacity(16);
    line.push_str(address);
    line.push_str(desc.wire_code);

    match request.intent {
        Intent::Get => {
            if !desc.capability.allows_get() {
                return Err(SlaError::Encoding {
                    command: desc.wire_code,
                    reason: "command cannot be queried".into(),
                });
            }
            line.push(QUERY_MARKER);
        }
        Intent::Set => {
            if !request.parameter.is_finite() {
                return Err(SlaError::Encoding {
                    command: desc.wire_code,
                    reason: format!("parameter {} is not finite", request.parameter),
                });
            }
            match desc.parameter {
                ParameterKind::None => {
                    return Err(SlaError::Encoding {
                        command: desc.wire_code,
                        reason: "command takes no parameter".into(),
                    })
                }
                ParameterKind::Int => line.push_str(&(request.parameter as i64).to_string()),
                ParameterKind::Float => line.push_str(&format!("{:.6}", request.parameter)),
            }
        }
        Intent::None => {}
    }

    line.push_str(LINE_TERMINATOR);
    Ok(line)
}

/// An outbound line decoded back into its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCommand {
    /// Controller address digits.
    pub address: String,
    /// Decoded command.
    pub command: CommandType,
    /// Query, set or plain action.
    pub intent: Intent,
    /// Numeric argument of a set.
    pub parameter: Option<f64>,
}

/// Decode an outbound command line, as the controller would.
///
/// The address is the leading run of digits; the next two characters are
/// the wire code. A trailing `?` marks a query, any other suffix must be numeric.
pub fn parse_command_line(line: &str) -> AppResult<DecodedCommand> {
    let line = line.trim_end_matches(['\r', '\n']);
    let address_len = line.bytes().take_while(u8::is_ascii_digit).count();
    if address_len == 0 {
        return Err(SlaError::parse(line, "missing controller address"));
    }
    let code = line
        .get(address_len..address_len + 2)
        .ok_or_else(|| SlaError::parse(line, "missing command code"))?;
    let command = CommandType::from_wire_code(code)
        .ok_or_else(|| SlaError::parse(line, format!("unknown command code {code:?}")))?;
    let rest = &line[address_len + 2..];

    let (intent, parameter) = if rest == "?" {
        (Intent::Get, None)
    } else if rest.is_empty() {
        (Intent::None, None)
    } else {
        let value = rest
            .parse::<f64>()
            .map_err(|_| SlaError::parse(line, format!("non-numeric argument {rest:?}")))?;
        (Intent::Set, Some(value))
    };

    Ok(DecodedCommand {
        address: line[..address_len].to_string(),
        command,
        intent,
        parameter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: &[CommandType] = &[
        CommandType::Acceleration,
        CommandType::BacklashComp,
        CommandType::HysteresisComp,
        CommandType::DriverVoltage,
        CommandType::KdLowPassFilterCutOff,
        CommandType::FollowingErrorLimit,
        CommandType::FrictionComp,
        CommandType::HomeSearchType,
        CommandType::StageIdentifier,
        CommandType::LeaveJoggingState,
        CommandType::KeypadEnable,
        CommandType::JerkTime,
        CommandType::DerivativeGain,
        CommandType::IntegralGain,
        CommandType::ProportionalGain,
        CommandType::VelocityFeedForward,
        CommandType::Enable,
        CommandType::HomeSearchVelocity,
        CommandType::HomeSearch,
        CommandType::HomeSearchTimeout,
        CommandType::MoveAbsolute,
        CommandType::MoveRelative,
        CommandType::MoveEstimate,
        CommandType::Configure,
        CommandType::Analog,
        CommandType::TtlInputValue,
        CommandType::Reset,
        CommandType::Rs485Address,
        CommandType::TtlOutputValue,
        CommandType::ControlLoopState,
        CommandType::NegativeSoftwareLimit,
        CommandType::PositiveSoftwareLimit,
        CommandType::StopMotion,
        CommandType::EncoderIncrementValue,
        CommandType::CommandErrorString,
        CommandType::LastCommandError,
        CommandType::PositionAsSet,
        CommandType::PositionReal,
        CommandType::ErrorStatus,
        CommandType::Velocity,
        CommandType::BaseVelocity,
        CommandType::ControllerRevisionInfo,
        CommandType::AllConfigParameters,
        CommandType::EspStageConfig,
    ];

    #[test]
    fn test_table_has_one_entry_per_command() {
        assert_eq!(command_table().len(), ALL.len());
        for kind in ALL {
            let matches = command_table().iter().filter(|c| c.kind == *kind).count();
            assert_eq!(matches, 1, "{kind:?}");
            assert_eq!(kind.descriptor().kind, *kind);
            assert_eq!(
                CommandType::from_wire_code(kind.wire_code()),
                Some(*kind),
                "{kind:?}"
            );
        }
    }

    #[test]
    fn test_wire_codes_are_unique() {
        let codes: HashSet<_> = command_table()
            .iter()
            .map(|c| c.wire_code.to_ascii_uppercase())
            .collect();
        assert_eq!(codes.len(), command_table().len());
    }

    #[test]
    fn test_lookup_agrees_with_table_row() {
        for row in command_table() {
            assert_eq!(row.kind.descriptor(), row);
        }
        assert_eq!(CommandType::PositionReal.wire_code(), "TP");
        assert_eq!(CommandType::Acceleration.wire_code(), "AC");
        assert_eq!(CommandType::EspStageConfig.wire_code(), "ZX");
    }

    #[test]
    fn test_encode_query() {
        let line = encode("1", &CommandRequest::get(CommandType::PositionReal)).unwrap();
        assert_eq!(line, "1TP?\r\n");
    }

    #[test]
    fn test_encode_float_and_int_set() {
        let line = encode("1", &CommandRequest::set(CommandType::MoveRelative, -0.05)).unwrap();
        assert_eq!(line, "1PR-0.050000\r\n");

        let line = encode("1", &CommandRequest::set(CommandType::Enable, 1.0)).unwrap();
        assert_eq!(line, "1MM1\r\n");
    }

    #[test]
    fn test_encode_action_has_no_suffix() {
        let line = encode("1", &CommandRequest::action(CommandType::HomeSearch)).unwrap();
        assert_eq!(line, "1OR\r\n");
    }

    #[test]
    fn test_encode_rejects_invalid_shapes() {
        let err = encode("1", &CommandRequest::set(CommandType::StopMotion, 1.0)).unwrap_err();
        assert!(matches!(err, SlaError::Encoding { command: "ST", .. }));

        let err = encode("1", &CommandRequest::get(CommandType::Reset)).unwrap_err();
        assert!(matches!(err, SlaError::Encoding { .. }));

        let err =
            encode("1", &CommandRequest::set(CommandType::Velocity, f64::NAN)).unwrap_err();
        assert!(matches!(err, SlaError::Encoding { .. }));
    }

    #[test]
    fn test_every_encodable_request_decodes_to_same_code_and_intent() {
        for kind in ALL {
            let desc = kind.descriptor();
            let mut requests = vec![CommandRequest::action(*kind)];
            if desc.capability.allows_get() {
                requests.push(CommandRequest::get(*kind));
            }
            if desc.parameter != ParameterKind::None {
                requests.push(CommandRequest::set(*kind, 12.5));
            }

            for request in requests {
                let line = encode("1", &request).unwrap();
                let decoded = parse_command_line(&line).unwrap();
                assert_eq!(decoded.address, "1");
                assert_eq!(decoded.command, *kind, "{line:?}");
                assert_eq!(decoded.intent, request.intent, "{line:?}");
            }
        }
    }

    #[test]
    fn test_parse_command_line_rejects_garbage() {
        assert!(parse_command_line("TP?").is_err());
        assert!(parse_command_line("1Q").is_err());
        assert!(parse_command_line("1ZZ?").is_err());
        assert!(parse_command_line("1PAabc").is_err());
    }
}
