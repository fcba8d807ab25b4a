use crate::attribute::AttributeKey;
use crate::error::{Error, Result};
use crate::identifier::{Did, Direction, Endpoint, FrameType, Id};
use std::fmt;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Maximum payload of a classic CAN frame.
pub const MAX_PAYLOAD: usize = 8;

/// Payload of read/write attribute frames (6 bytes).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AttributePayload {
    pub key: U16,
    pub value: U32,
}

/// Payload of error frames (8 bytes, the argument may be omitted on the wire).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ErrorPayload {
    pub code: U32,
    pub arg: U32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    pub id: Id,
    buf: [u8; MAX_PAYLOAD],
    len: u8,
}

impl Frame {
    /// Frame without payload.
    pub fn empty(id: Id) -> Self {
        Self {
            id,
            buf: [0; MAX_PAYLOAD],
            len: 0,
        }
    }

    pub fn new(id: Id, payload: &[u8]) -> Result<Self> {
        let mut frame = Self::empty(id);
        frame.set_payload(payload)?;
        Ok(frame)
    }

    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidArgument);
        }
        self.buf = [0; MAX_PAYLOAD];
        self.buf[..payload.len()].copy_from_slice(payload);
        self.len = payload.len() as u8;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn did(&self) -> Did {
        self.id.did
    }

    pub fn telemetry_query(did: Did, endpoint: Endpoint) -> Self {
        Self::empty(Id::query(FrameType::Telemetry, did, endpoint))
    }

    pub fn command(did: Did, endpoint: Endpoint, payload: &[u8]) -> Result<Self> {
        Self::new(Id::query(FrameType::Command, did, endpoint), payload)
    }

    pub fn read_attribute(did: Did, key: AttributeKey) -> Self {
        let mut frame = Self::empty(Id::query(FrameType::ReadAttribute, did, Endpoint::App));
        frame.buf[..2].copy_from_slice(&key.raw().to_le_bytes());
        frame.len = 2;
        frame
    }

    pub fn write_attribute(did: Did, key: AttributeKey, value: u32) -> Self {
        Self::attribute(Id::query(FrameType::WriteAttribute, did, Endpoint::App), key, value)
    }

    pub fn telemetry_response(did: Did, endpoint: Endpoint, payload: &[u8]) -> Result<Self> {
        Self::new(Id::response(FrameType::Telemetry, did, endpoint), payload)
    }

    /// Read-attribute response carrying `value` for `key`.
    pub fn attribute_response(did: Did, key: AttributeKey, value: u32) -> Self {
        Self::attribute(Id::response(FrameType::ReadAttribute, did, Endpoint::App), key, value)
    }

    /// Error response to a query of type `query_type`.
    pub fn error_response(did: Did, query_type: FrameType, endpoint: Endpoint, code: u32, arg: u32) -> Self {
        let id = Id::response(query_type.error_response_type(), did, endpoint);
        let payload = ErrorPayload {
            code: U32::new(code),
            arg: U32::new(arg),
        };
        let mut frame = Self::empty(id);
        frame.buf.copy_from_slice(payload.as_bytes());
        frame.len = MAX_PAYLOAD as u8;
        frame
    }

    fn attribute(id: Id, key: AttributeKey, value: u32) -> Self {
        let payload = AttributePayload {
            key: U16::new(key.raw()),
            value: U32::new(value),
        };
        let mut frame = Self::empty(id);
        let bytes = payload.as_bytes();
        frame.buf[..bytes.len()].copy_from_slice(bytes);
        frame.len = bytes.len() as u8;
        frame
    }

    /// Attribute key of an attribute frame.
    pub fn attribute_key(&self) -> Option<AttributeKey> {
        if !self.id.frame_type.is_attribute() {
            return None;
        }
        let (key, _) = U16::read_from_prefix(self.payload()).ok()?;
        Some(AttributeKey::from_raw(key.get()))
    }

    /// Attribute value of a write query or read response.
    pub fn attribute_value(&self) -> Option<u32> {
        if !self.id.frame_type.is_attribute() {
            return None;
        }
        let (payload, _) = AttributePayload::read_from_prefix(self.payload()).ok()?;
        Some(payload.value.get())
    }

    /// `(error_code, error_argument)` of an error frame; a missing argument reads as 0.
    pub fn error(&self) -> Option<(u32, u32)> {
        if !self.id.is_error() {
            return None;
        }
        let payload = self.payload();
        let (code, rest) = U32::read_from_prefix(payload).ok()?;
        let arg = U32::read_from_prefix(rest).map(|(arg, _)| arg.get()).unwrap_or(0);
        Some((code.get(), arg))
    }

    /// Split into the raw CAN identifier, payload buffer and DLC.
    pub fn to_wire(&self) -> (u16, [u8; MAX_PAYLOAD], u8) {
        (self.id.encode(), self.buf, self.len)
    }

    pub fn from_wire(raw_id: u16, data: &[u8]) -> Result<Self> {
        Self::new(Id::decode(raw_id), data)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("payload", &self.payload())
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#05x}] {} ", self.id.encode(), self.id.did)?;
        if let Some((code, arg)) = self.error() {
            let query = match self.id.frame_type {
                FrameType::Command => "command/telemetry",
                _ => "attribute",
            };
            return write!(f, "{} error {:#06x} arg {:#010x}", query, code, arg);
        }

        let dir = match self.id.direction {
            Direction::Query => "query",
            Direction::Response => "response",
        };
        match self.id.frame_type {
            FrameType::Command | FrameType::Telemetry => {
                write!(f, "{} {} ep {} :", self.id.frame_type, dir, self.id.endpoint)?;
                for byte in self.payload() {
                    write!(f, " {:02x}", byte)?;
                }
                Ok(())
            }
            FrameType::WriteAttribute | FrameType::ReadAttribute => {
                write!(f, "{} {}", self.id.frame_type, dir)?;
                if let Some(key) = self.attribute_key() {
                    write!(f, " key {}", key)?;
                }
                if let Some(value) = self.attribute_value() {
                    write!(f, " = {:#010x}", value)?;
                }
                Ok(())
            }
        }
    }
}
