use thiserror::Error;

/// Errors raised while interpreting command line input.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid hex string '{0}'")]
    InvalidHex(String),

    #[error("Identifier {0:#x} does not fit in 11 bits")]
    IdentifierTooLarge(u32),

    #[error("Payload of {0} bytes exceeds the 8 byte CAN limit")]
    PayloadTooLong(usize),

    #[error("Value {value} out of range for {field} (max {max})")]
    OutOfRange { field: &'static str, value: u8, max: u8 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] caniot_lib::Error),
}
