//! `decode` and `encode` subcommands: explain raw CANIOT frames and build them.

use crate::error::CliError;
use anyhow::Result;
use caniot_lib::error::ErrorCode;
use caniot_lib::identifier::ID_MASK;
use caniot_lib::{AttributeKey, Did, Direction, Endpoint, Frame, FrameType, Id};
use clap::{Args, ValueEnum};
use num_enum::FromPrimitive;
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FrameTypeArg {
    Command,
    Telemetry,
    WriteAttribute,
    ReadAttribute,
}

impl From<FrameTypeArg> for FrameType {
    fn from(arg: FrameTypeArg) -> Self {
        match arg {
            FrameTypeArg::Command => FrameType::Command,
            FrameTypeArg::Telemetry => FrameType::Telemetry,
            FrameTypeArg::WriteAttribute => FrameType::WriteAttribute,
            FrameTypeArg::ReadAttribute => FrameType::ReadAttribute,
        }
    }
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// CAN identifier in hex (e.g. 0x089).
    pub id: String,
    /// Payload in hex, bytes optionally separated by ':' or spaces.
    #[arg(default_value = "")]
    pub data: String,
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    #[arg(short = 't', long = "type", value_enum)]
    pub frame_type: FrameTypeArg,
    /// Build a response instead of a query.
    #[arg(short, long)]
    pub response: bool,
    /// Device class (0-7).
    #[arg(short, long, default_value_t = 0)]
    pub class: u8,
    /// Device sub-id (0-7).
    #[arg(short, long, default_value_t = 0)]
    pub subid: u8,
    /// Address every device.
    #[arg(short, long, conflicts_with_all = ["class", "subid"])]
    pub broadcast: bool,
    /// Endpoint (0-3).
    #[arg(short, long, default_value_t = 0)]
    pub endpoint: u8,
    /// Payload in hex.
    #[arg(short, long, default_value = "", conflicts_with = "key")]
    pub data: String,
    /// Attribute key in hex, for attribute frames.
    #[arg(short, long)]
    pub key: Option<String>,
    /// Attribute value, for write queries and read responses.
    #[arg(long, requires = "key")]
    pub value: Option<u32>,
}

/// Decode a hex string, tolerating a `0x` prefix and ':' or ' ' separators.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, CliError> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect();
    hex::decode(&cleaned).map_err(|_| CliError::InvalidHex(input.to_string()))
}

fn parse_id(input: &str) -> Result<u16, CliError> {
    let trimmed = input.trim().trim_start_matches("0x");
    let raw = u32::from_str_radix(trimmed, 16).map_err(|_| CliError::InvalidHex(input.to_string()))?;
    if raw > ID_MASK as u32 {
        return Err(CliError::IdentifierTooLarge(raw));
    }
    Ok(raw as u16)
}

fn check_range(field: &'static str, value: u8, max: u8) -> Result<u8, CliError> {
    if value > max {
        return Err(CliError::OutOfRange { field, value, max });
    }
    Ok(value)
}

pub fn decode(args: &DecodeArgs, json: bool) -> Result<()> {
    let raw_id = parse_id(&args.id)?;
    let data = parse_hex(&args.data)?;
    if data.len() > caniot_lib::frame::MAX_PAYLOAD {
        return Err(CliError::PayloadTooLong(data.len()).into());
    }
    let frame = Frame::from_wire(raw_id, &data).map_err(CliError::from)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&describe(&frame))?);
    } else {
        print_frame(&frame);
    }
    Ok(())
}

pub fn encode(args: &EncodeArgs, json: bool) -> Result<()> {
    let did = if args.broadcast {
        Did::BROADCAST
    } else {
        Did::new(
            check_range("class", args.class, Did::CLASS_MAX)?,
            check_range("sub-id", args.subid, Did::SUBID_MAX)?,
        )
    };
    let endpoint = Endpoint::from_primitive(check_range("endpoint", args.endpoint, 3)?);
    let direction = if args.response {
        Direction::Response
    } else {
        Direction::Query
    };

    let id = Id::new(args.frame_type.into(), direction, did, endpoint);
    let frame = match &args.key {
        Some(key) if id.frame_type.is_attribute() => {
            let key = parse_key(key)?;
            let value = args.value.unwrap_or(0);
            let mut frame = match (id.frame_type, direction) {
                (FrameType::ReadAttribute, Direction::Query) => Frame::read_attribute(did, key),
                (FrameType::ReadAttribute, Direction::Response) => Frame::attribute_response(did, key, value),
                _ => Frame::write_attribute(did, key, value),
            };
            frame.id = id;
            frame
        }
        _ => {
            let data = parse_hex(&args.data)?;
            Frame::new(id, &data).map_err(|_| CliError::PayloadTooLong(data.len()))?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&describe(&frame))?);
    } else {
        // candump notation
        println!("{:03X}#{}", frame.id.encode(), hex::encode_upper(frame.payload()));
        print_frame(&frame);
    }
    Ok(())
}

fn print_frame(frame: &Frame) {
    let id = frame.id;
    println!("{}", frame);
    println!("  type       {}", id.frame_type);
    println!("  direction  {}", id.direction);
    println!(
        "  did        {} (class {}, sub-id {})",
        id.did,
        id.did.class(),
        id.did.subid()
    );
    println!("  endpoint   {}", id.endpoint);
    if let Some((code, arg)) = frame.error() {
        println!("  error      {:#06x} {}", code, error_name(code));
        println!("  argument   {:#010x}", arg);
        return;
    }
    if let Some(key) = frame.attribute_key() {
        println!("  key        {}", key);
        if let Some(value) = frame.attribute_value() {
            println!("  value      {} ({:#010x})", value, value);
        }
        return;
    }
    if !frame.is_empty() {
        println!("  payload    {}", hex::encode(frame.payload()));
    }
}

fn error_name(code: u32) -> String {
    match ErrorCode::try_from(code) {
        Ok(known) => format!("({:?})", known),
        Err(_) => String::from("(unknown)"),
    }
}

fn describe(frame: &Frame) -> Value {
    let id = frame.id;
    let mut report = json!({
        "id": id.encode(),
        "type": id.frame_type.to_string(),
        "direction": id.direction.to_string(),
        "did": {
            "raw": id.did.raw(),
            "class": id.did.class(),
            "subid": id.did.subid(),
            "broadcast": id.did.is_broadcast(),
        },
        "endpoint": id.endpoint.to_string(),
        "payload": hex::encode(frame.payload()),
    });

    if let Some((code, arg)) = frame.error() {
        report["error"] = json!({ "code": code, "arg": arg, "name": error_name(code) });
    } else if let Some(key) = frame.attribute_key() {
        report["attribute"] = json!({
            "key": key.raw(),
            "name": key.name(),
            "part": key.part(),
            "value": frame.attribute_value(),
        });
    }
    report
}

fn parse_key(input: &str) -> Result<AttributeKey, CliError> {
    let trimmed = input.trim().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16)
        .map(AttributeKey::from_raw)
        .map_err(|_| CliError::InvalidHex(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_separators() {
        assert_eq!(parse_hex("0x01:02 03").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert!(matches!(parse_hex("zz"), Err(CliError::InvalidHex(_))));
    }

    #[test]
    fn test_parse_id_limits() {
        assert_eq!(parse_id("0x089").unwrap(), 0x089);
        assert_eq!(parse_id("7ff").unwrap(), 0x7FF);
        assert!(matches!(parse_id("800"), Err(CliError::IdentifierTooLarge(0x800))));
    }

    #[test]
    fn test_describe_error_frame() {
        let frame = Frame::error_response(Did::new(1, 2), FrameType::ReadAttribute, Endpoint::App, 0x3A02, 0x1F0);
        let report = describe(&frame);
        assert_eq!(report["type"], "write-attribute");
        assert_eq!(report["error"]["code"], 0x3A02);
        assert_eq!(report["error"]["name"], "(UnknownAttribute)");
        assert_eq!(report["did"]["class"], 1);
    }
}
