//! Line-oriented ASCII protocol spoken by the SMC100 stage controller.
//!
//! Pure encoding and decoding, no I/O. [`command`] builds outbound lines,
//! [`reply`] interprets what comes back.

pub mod command;
pub mod reply;

pub use command::{
    encode, parse_command_line, Capability, Command, CommandRequest, CommandType,
    DecodedCommand, Intent, ParameterKind,
};
pub use reply::{
    decode_error, decode_numeric, decode_status, ControllerState, DeviceErrorCode, ReplyField,
    StatusCode, StatusReading,
};
