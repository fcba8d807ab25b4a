use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// First value of the numeric range reserved for CANIOT error codes.
pub const ERROR_BASE: u32 = 0x3A00;

/// Last value of the reserved range (remote codes included).
pub const ERROR_LAST: u32 = 0x3BFF;

/// Set on codes that were produced by a remote device and forwarded by the controller.
pub const REMOTE_BIT: u32 = 0x0100;

pub type Result<T> = core::result::Result<T, Error>;

/// Stable numeric codes for every local error, as carried in error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum ErrorCode {
    InvalidArgument = 0x3A00,
    UnknownSection = 0x3A01,
    UnknownAttribute = 0x3A02,
    UnknownPart = 0x3A03,
    NoSuchCustomAttribute = 0x3A04,
    ReadOnly = 0x3A05,
    HandlerMissing = 0x3A06,
    InvalidEndpoint = 0x3A07,
    Busy = 0x3A08,
    PoolExhausted = 0x3A09,
    NoSuchHandle = 0x3A0A,
    NotSupported = 0x3A0B,
    NotImplemented = 0x3A0C,
    Driver = 0x3A0D,
}

/// The primary error type for the `caniot-lib` library.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Unknown attribute section")]
    UnknownSection,

    #[error("Unknown attribute")]
    UnknownAttribute,

    #[error("Unknown attribute part")]
    UnknownPart,

    #[error("No such custom attribute")]
    NoSuchCustomAttribute,

    #[error("Attribute is read-only")]
    ReadOnly,

    #[error("No handler registered for this request")]
    HandlerMissing,

    #[error("Invalid endpoint")]
    InvalidEndpoint,

    #[error("Device busy: a query is already pending for this device")]
    Busy,

    #[error("Pending query pool exhausted")]
    PoolExhausted,

    #[error("No such pending query handle")]
    NoSuchHandle,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Not implemented")]
    NotImplemented,

    #[error("Driver error: {0}")]
    Driver(i32),

    #[error("Device error {code:#06x} (argument {arg:#010x})")]
    Remote { code: u32, arg: u32 },
}

impl Error {
    /// Numeric code of this error. Remote errors keep the remote bit set.
    pub fn code(&self) -> u32 {
        let code = match self {
            Error::InvalidArgument => ErrorCode::InvalidArgument,
            Error::UnknownSection => ErrorCode::UnknownSection,
            Error::UnknownAttribute => ErrorCode::UnknownAttribute,
            Error::UnknownPart => ErrorCode::UnknownPart,
            Error::NoSuchCustomAttribute => ErrorCode::NoSuchCustomAttribute,
            Error::ReadOnly => ErrorCode::ReadOnly,
            Error::HandlerMissing => ErrorCode::HandlerMissing,
            Error::InvalidEndpoint => ErrorCode::InvalidEndpoint,
            Error::Busy => ErrorCode::Busy,
            Error::PoolExhausted => ErrorCode::PoolExhausted,
            Error::NoSuchHandle => ErrorCode::NoSuchHandle,
            Error::NotSupported => ErrorCode::NotSupported,
            Error::NotImplemented => ErrorCode::NotImplemented,
            Error::Driver(_) => ErrorCode::Driver,
            Error::Remote { code, .. } => return *code,
        };
        code.into()
    }

    /// Build the error surfaced by the controller for an error frame received from a device.
    pub fn from_wire(code: u32, arg: u32) -> Self {
        Error::Remote {
            code: code | REMOTE_BIT,
            arg,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }

    /// For a remote error, the local error kind the device reported, if the code is known.
    pub fn remote_cause(&self) -> Option<ErrorCode> {
        match self {
            Error::Remote { code, .. } => ErrorCode::try_from(code & !REMOTE_BIT).ok(),
            _ => None,
        }
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidArgument => Error::InvalidArgument,
            ErrorCode::UnknownSection => Error::UnknownSection,
            ErrorCode::UnknownAttribute => Error::UnknownAttribute,
            ErrorCode::UnknownPart => Error::UnknownPart,
            ErrorCode::NoSuchCustomAttribute => Error::NoSuchCustomAttribute,
            ErrorCode::ReadOnly => Error::ReadOnly,
            ErrorCode::HandlerMissing => Error::HandlerMissing,
            ErrorCode::InvalidEndpoint => Error::InvalidEndpoint,
            ErrorCode::Busy => Error::Busy,
            ErrorCode::PoolExhausted => Error::PoolExhausted,
            ErrorCode::NoSuchHandle => Error::NoSuchHandle,
            ErrorCode::NotSupported => Error::NotSupported,
            ErrorCode::NotImplemented => Error::NotImplemented,
            ErrorCode::Driver => Error::Driver(0),
        }
    }
}

/// Whether a raw value belongs to the reserved CANIOT error range.
pub fn is_caniot_error(code: u32) -> bool {
    (ERROR_BASE..=ERROR_LAST).contains(&code)
}
