//! # CANIOT identifier codec
//!
//! A CANIOT frame is addressed by an 11-bit standard CAN identifier. The
//! fields are packed low-to-high:
//!
//! ```text
//!  10  9 | 8  7  6 | 5  4  3 | 2 | 1  0
//! endpoint| sub-id  |  class  |dir| type
//! ```
//!
//! Class and sub-id together form the device identifier ([`Did`]). Encoding
//! and decoding are plain shift/mask operations on a `u16`, so the layout does
//! not depend on the host.

use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt;
use strum_macros::Display;

/// Mask of the 11 significant bits of a standard CAN identifier.
pub const ID_MASK: u16 = 0x07FF;

const TYPE_SHIFT: u16 = 0;
const TYPE_MASK: u16 = 0x3;
const DIRECTION_SHIFT: u16 = 2;
const DIRECTION_MASK: u16 = 0x1;
const DID_SHIFT: u16 = 3;
const DID_MASK: u16 = 0x3F;
const ENDPOINT_SHIFT: u16 = 9;
const ENDPOINT_MASK: u16 = 0x3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FrameType {
    #[num_enum(default)]
    #[strum(to_string = "command")]
    Command = 0,
    #[strum(to_string = "telemetry")]
    Telemetry = 1,
    #[strum(to_string = "write-attribute")]
    WriteAttribute = 2,
    #[strum(to_string = "read-attribute")]
    ReadAttribute = 3,
}

impl FrameType {
    /// Frame type used by a device to report the failure of a query of this type.
    pub fn error_response_type(self) -> FrameType {
        match self {
            FrameType::Command | FrameType::Telemetry => FrameType::Command,
            FrameType::WriteAttribute | FrameType::ReadAttribute => FrameType::WriteAttribute,
        }
    }

    pub fn is_attribute(self) -> bool {
        matches!(self, FrameType::WriteAttribute | FrameType::ReadAttribute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Direction {
    #[num_enum(default)]
    #[strum(to_string = "query")]
    Query = 0,
    #[strum(to_string = "response")]
    Response = 1,
}

/// Logical command/telemetry channel of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Endpoint {
    #[num_enum(default)]
    #[strum(to_string = "app")]
    App = 0,
    #[strum(to_string = "ep-1")]
    Ep1 = 1,
    #[strum(to_string = "ep-2")]
    Ep2 = 2,
    #[strum(to_string = "board-control")]
    BoardControl = 3,
}

/// Device identifier: 3-bit class and 3-bit sub-id, stored as `class | subid << 3`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Did(u8);

impl Did {
    pub const CLASS_MAX: u8 = 7;
    pub const SUBID_MAX: u8 = 7;

    /// Reserved address reaching every device on the bus.
    pub const BROADCAST: Did = Did(0x3F);

    /// Number of distinct device identifiers, broadcast included.
    pub const COUNT: usize = 64;

    /// Build a DID; bits of `class` and `subid` above the 3-bit range are dropped.
    pub const fn new(class: u8, subid: u8) -> Self {
        Did((class & 0x7) | ((subid & 0x7) << 3))
    }

    /// Build a DID from its byte form, ignoring the two upper bits.
    pub const fn from_raw(raw: u8) -> Self {
        Did(raw & 0x3F)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn class(self) -> u8 {
        self.0 & 0x7
    }

    pub const fn subid(self) -> u8 {
        (self.0 >> 3) & 0x7
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    /// Bit of this DID in a 64-bit device bitmap.
    pub(crate) const fn bit(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({}, {})", self.class(), self.subid())
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{}:{}", self.class(), self.subid())
        }
    }
}

pub fn is_broadcast(did: Did) -> bool {
    did.is_broadcast()
}

/// A frame from `incoming` concerns `target` when it is addressed to it or to everyone.
pub fn did_matches(target: Did, incoming: Did) -> bool {
    incoming == target || incoming.is_broadcast()
}

/// Structured form of the 11-bit CANIOT identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Id {
    pub frame_type: FrameType,
    pub direction: Direction,
    pub did: Did,
    pub endpoint: Endpoint,
}

impl Id {
    pub fn new(frame_type: FrameType, direction: Direction, did: Did, endpoint: Endpoint) -> Self {
        Self {
            frame_type,
            direction,
            did,
            endpoint,
        }
    }

    pub fn query(frame_type: FrameType, did: Did, endpoint: Endpoint) -> Self {
        Self::new(frame_type, Direction::Query, did, endpoint)
    }

    pub fn response(frame_type: FrameType, did: Did, endpoint: Endpoint) -> Self {
        Self::new(frame_type, Direction::Response, did, endpoint)
    }

    pub fn encode(&self) -> u16 {
        let frame_type: u8 = self.frame_type.into();
        let direction: u8 = self.direction.into();
        let endpoint: u8 = self.endpoint.into();

        ((frame_type as u16 & TYPE_MASK) << TYPE_SHIFT)
            | ((direction as u16 & DIRECTION_MASK) << DIRECTION_SHIFT)
            | ((self.did.raw() as u16 & DID_MASK) << DID_SHIFT)
            | ((endpoint as u16 & ENDPOINT_MASK) << ENDPOINT_SHIFT)
    }

    /// Decode an identifier; bits above the 11-bit range are ignored.
    pub fn decode(raw: u16) -> Self {
        Self {
            frame_type: FrameType::from_primitive(((raw >> TYPE_SHIFT) & TYPE_MASK) as u8),
            direction: Direction::from_primitive(((raw >> DIRECTION_SHIFT) & DIRECTION_MASK) as u8),
            did: Did::from_raw(((raw >> DID_SHIFT) & DID_MASK) as u8),
            endpoint: Endpoint::from_primitive(((raw >> ENDPOINT_SHIFT) & ENDPOINT_MASK) as u8),
        }
    }

    pub fn is_query(&self) -> bool {
        self.direction == Direction::Query
    }

    pub fn is_response(&self) -> bool {
        self.direction == Direction::Response
    }

    /// Responses of type command or write-attribute signal the failure of a query.
    pub fn is_error(&self) -> bool {
        self.is_response() && matches!(self.frame_type, FrameType::Command | FrameType::WriteAttribute)
    }
}

impl From<Id> for u16 {
    fn from(id: Id) -> Self {
        id.encode()
    }
}

impl From<u16> for Id {
    fn from(raw: u16) -> Self {
        Id::decode(raw)
    }
}

pub fn encode(id: &Id) -> u16 {
    id.encode()
}

pub fn decode(raw: u16) -> Id {
    Id::decode(raw)
}

pub fn is_error_frame(id: &Id) -> bool {
    id.is_error()
}

pub fn error_response_type_for(query_type: FrameType) -> FrameType {
    query_type.error_response_type()
}
