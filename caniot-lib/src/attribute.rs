//! # Device attributes
//!
//! Attributes are addressed by a 16-bit key:
//!
//! ```text
//! 15    12 11           4 3     0
//! section | attribute idx | part
//! ```
//!
//! Standard sections map onto the fixed-layout [`Identification`], [`System`]
//! and [`Config`] structs. An attribute index selects a field of the section,
//! and the part selects a 4-byte window inside fields wider than 4 bytes
//! (e.g. the 32-byte device name). Keys outside the standard sections are
//! custom attributes handled by the device application.

use crate::error::{Error, Result};
use crate::identifier::{Did, Endpoint};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::mem::{offset_of, size_of};
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{I32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Width of the value window addressed by one attribute part.
pub const PART_SIZE: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttributeKey(u16);

impl AttributeKey {
    pub const fn new(section: u8, attribute: u8, part: u8) -> Self {
        AttributeKey((((section & 0xF) as u16) << 12) | ((attribute as u16) << 4) | ((part & 0xF) as u16))
    }

    pub const fn from_raw(raw: u16) -> Self {
        AttributeKey(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn section(self) -> u8 {
        (self.0 >> 12) as u8
    }

    pub const fn attribute(self) -> u8 {
        ((self.0 >> 4) & 0xFF) as u8
    }

    pub const fn part(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    /// Same attribute, another 4-byte window.
    pub const fn with_part(self, part: u8) -> Self {
        AttributeKey((self.0 & !0xF) | (part & 0xF) as u16)
    }

    /// Name of the standard attribute this key belongs to, if any.
    pub fn name(self) -> Option<&'static str> {
        let section = Section::try_from(self.section()).ok()?;
        section.table().get(self.attribute() as usize).map(|def| def.name)
    }
}

impl fmt::Debug for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({:#06x})", self.0)
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{:#06x} ({}[{}])", self.0, name, self.part()),
            None => write!(f, "{:#06x}", self.0),
        }
    }
}

impl From<u16> for AttributeKey {
    fn from(raw: u16) -> Self {
        AttributeKey(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Section {
    #[strum(to_string = "identification")]
    Identification = 0,
    #[strum(to_string = "system")]
    System = 1,
    #[strum(to_string = "config")]
    Config = 2,
}

impl Section {
    fn table(self) -> &'static [AttributeDef] {
        match self {
            Section::Identification => IDENTIFICATION_ATTRIBUTES,
            Section::System => SYSTEM_ATTRIBUTES,
            Section::Config => CONFIG_ATTRIBUTES,
        }
    }

    /// Size in bytes of the struct backing this section.
    pub fn size(self) -> usize {
        match self {
            Section::Identification => size_of::<Identification>(),
            Section::System => size_of::<System>(),
            Section::Config => size_of::<Config>(),
        }
    }
}

/// Read-only device identity.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Identification {
    pub did: u8,
    pub version: U16,
    pub name: [u8; 32],
    pub magic_number: U32,
    pub build_date: U32,
    pub build_commit: [u8; 20],
    pub features: U32,
}

impl Identification {
    /// Identity with `name` truncated to 32 bytes, on a character boundary.
    pub fn new(did: Did, version: u16, name: &str, magic_number: u32) -> Self {
        let mut id = Self {
            did: did.raw(),
            version: U16::new(version),
            magic_number: U32::new(magic_number),
            ..Default::default()
        };
        let mut len = name.len().min(id.name.len());
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        id.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        id
    }

    pub fn did(&self) -> Did {
        Did::from_raw(self.did)
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Runtime counters and clock of a device.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct System {
    pub uptime_synced: U32,
    pub time: U32,
    pub uptime: U32,
    pub start_time: U32,
    pub last_telemetry: U32,
    pub received_total: U32,
    pub received_read_attribute: U32,
    pub received_write_attribute: U32,
    pub received_command: U32,
    pub received_request_telemetry: U32,
    pub received_ignored: U32,
    pub sent_total: U32,
    pub sent_telemetry: U32,
    /// Code of the last failed command, 0 after a successful one.
    pub last_command_error: U16,
    /// Code of the last failed telemetry, 0 after a successful one.
    pub last_telemetry_error: U16,
    pub battery: u8,
}

pub(crate) fn bump(counter: &mut U32) {
    counter.set(counter.get().wrapping_add(1));
}

/// Persisted device configuration.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Config {
    /// Period of unsolicited telemetry, in milliseconds.
    pub telemetry_period: U32,
    /// Fixed delay applied to periodic telemetry, in milliseconds.
    pub telemetry_delay: U16,
    /// Bounds of the random delay for broadcast responses, in milliseconds.
    pub telemetry_delay_min: U16,
    pub telemetry_delay_max: U16,
    pub flags: u8,
    /// Offset to UTC, in seconds.
    pub timezone: I32,
    pub location_region: [u8; 2],
    pub location_country: [u8; 2],
    /// Class specific settings, opaque to the protocol engine.
    pub class_config: [u8; 32],
}

impl Config {
    pub const FLAG_ERROR_RESPONSE: u8 = 1 << 0;
    pub const FLAG_TELEMETRY_DELAY_RDM: u8 = 1 << 1;
    const TELEMETRY_ENDPOINT_SHIFT: u8 = 2;
    const TELEMETRY_ENDPOINT_MASK: u8 = 0x3 << Self::TELEMETRY_ENDPOINT_SHIFT;

    pub fn error_response(&self) -> bool {
        self.flags & Self::FLAG_ERROR_RESPONSE != 0
    }

    pub fn set_error_response(&mut self, enabled: bool) {
        self.set_flag(Self::FLAG_ERROR_RESPONSE, enabled);
    }

    pub fn telemetry_delay_rdm(&self) -> bool {
        self.flags & Self::FLAG_TELEMETRY_DELAY_RDM != 0
    }

    pub fn set_telemetry_delay_rdm(&mut self, enabled: bool) {
        self.set_flag(Self::FLAG_TELEMETRY_DELAY_RDM, enabled);
    }

    /// Endpoint used for periodic telemetry.
    pub fn telemetry_endpoint(&self) -> Endpoint {
        let raw = (self.flags & Self::TELEMETRY_ENDPOINT_MASK) >> Self::TELEMETRY_ENDPOINT_SHIFT;
        Endpoint::from_primitive(raw)
    }

    pub fn set_telemetry_endpoint(&mut self, endpoint: Endpoint) {
        let raw: u8 = endpoint.into();
        self.flags = (self.flags & !Self::TELEMETRY_ENDPOINT_MASK) | (raw << Self::TELEMETRY_ENDPOINT_SHIFT);
    }

    fn set_flag(&mut self, flag: u8, enabled: bool) {
        if enabled {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telemetry_period: U32::new(60_000),
            telemetry_delay: U16::new(5),
            telemetry_delay_min: U16::new(0),
            telemetry_delay_max: U16::new(100),
            flags: Self::FLAG_ERROR_RESPONSE,
            timezone: I32::new(0),
            location_region: [0; 2],
            location_country: [0; 2],
            class_config: [0; 32],
        }
    }
}

struct AttributeDef {
    name: &'static str,
    offset: usize,
    size: usize,
    read_only: bool,
}

const fn ro(name: &'static str, offset: usize, size: usize) -> AttributeDef {
    AttributeDef {
        name,
        offset,
        size,
        read_only: true,
    }
}

const fn rw(name: &'static str, offset: usize, size: usize) -> AttributeDef {
    AttributeDef {
        name,
        offset,
        size,
        read_only: false,
    }
}

macro_rules! attr {
    ($access:ident, $name:literal, $ty:ty, $field:ident: $fty:ty) => {
        $access($name, offset_of!($ty, $field), size_of::<$fty>())
    };
}

static IDENTIFICATION_ATTRIBUTES: &[AttributeDef] = &[
    attr!(ro, "did", Identification, did: u8),
    attr!(ro, "version", Identification, version: U16),
    attr!(ro, "name", Identification, name: [u8; 32]),
    attr!(ro, "magic_number", Identification, magic_number: U32),
    attr!(ro, "build_date", Identification, build_date: U32),
    attr!(ro, "build_commit", Identification, build_commit: [u8; 20]),
    attr!(ro, "features", Identification, features: U32),
];

static SYSTEM_ATTRIBUTES: &[AttributeDef] = &[
    attr!(ro, "uptime_synced", System, uptime_synced: U32),
    attr!(rw, "time", System, time: U32),
    attr!(ro, "uptime", System, uptime: U32),
    attr!(ro, "start_time", System, start_time: U32),
    attr!(ro, "last_telemetry", System, last_telemetry: U32),
    attr!(ro, "received.total", System, received_total: U32),
    attr!(ro, "received.read_attribute", System, received_read_attribute: U32),
    attr!(ro, "received.write_attribute", System, received_write_attribute: U32),
    attr!(ro, "received.command", System, received_command: U32),
    attr!(ro, "received.request_telemetry", System, received_request_telemetry: U32),
    attr!(ro, "received.ignored", System, received_ignored: U32),
    attr!(ro, "sent.total", System, sent_total: U32),
    attr!(ro, "sent.telemetry", System, sent_telemetry: U32),
    attr!(ro, "last_command_error", System, last_command_error: U16),
    attr!(ro, "last_telemetry_error", System, last_telemetry_error: U16),
    attr!(ro, "battery", System, battery: u8),
];

static CONFIG_ATTRIBUTES: &[AttributeDef] = &[
    attr!(rw, "telemetry.period", Config, telemetry_period: U32),
    attr!(rw, "telemetry.delay", Config, telemetry_delay: U16),
    attr!(rw, "telemetry.delay_min", Config, telemetry_delay_min: U16),
    attr!(rw, "telemetry.delay_max", Config, telemetry_delay_max: U16),
    attr!(rw, "flags", Config, flags: u8),
    attr!(rw, "timezone", Config, timezone: I32),
    attr!(rw, "location.region", Config, location_region: [u8; 2]),
    attr!(rw, "location.country", Config, location_country: [u8; 2]),
    attr!(rw, "class_config", Config, class_config: [u8; 32]),
];

/// Well-known keys.
pub mod keys {
    use super::AttributeKey;

    pub const DID: AttributeKey = AttributeKey::new(0, 0, 0);
    pub const VERSION: AttributeKey = AttributeKey::new(0, 1, 0);
    pub const NAME: AttributeKey = AttributeKey::new(0, 2, 0);
    pub const MAGIC_NUMBER: AttributeKey = AttributeKey::new(0, 3, 0);

    pub const UPTIME_SYNCED: AttributeKey = AttributeKey::new(1, 0, 0);
    pub const TIME: AttributeKey = AttributeKey::new(1, 1, 0);
    pub const UPTIME: AttributeKey = AttributeKey::new(1, 2, 0);
    pub const LAST_TELEMETRY: AttributeKey = AttributeKey::new(1, 4, 0);
    pub const RECEIVED_TOTAL: AttributeKey = AttributeKey::new(1, 5, 0);
    pub const SENT_TELEMETRY: AttributeKey = AttributeKey::new(1, 12, 0);
    pub const LAST_COMMAND_ERROR: AttributeKey = AttributeKey::new(1, 13, 0);

    pub const TELEMETRY_PERIOD: AttributeKey = AttributeKey::new(2, 0, 0);
    pub const TELEMETRY_DELAY: AttributeKey = AttributeKey::new(2, 1, 0);
    pub const TELEMETRY_DELAY_MIN: AttributeKey = AttributeKey::new(2, 2, 0);
    pub const TELEMETRY_DELAY_MAX: AttributeKey = AttributeKey::new(2, 3, 0);
    pub const FLAGS: AttributeKey = AttributeKey::new(2, 4, 0);
    pub const TIMEZONE: AttributeKey = AttributeKey::new(2, 5, 0);
    pub const CLASS_CONFIG: AttributeKey = AttributeKey::new(2, 8, 0);
}

/// A resolved standard attribute: a byte window inside one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRef {
    pub section: Section,
    pub offset: usize,
    /// Bytes covered by this part, 1 to 4.
    pub size: usize,
    pub read_only: bool,
}

impl AttributeRef {
    pub fn span(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }

    /// Read the window out of the section bytes, zero-extended little endian.
    pub fn read(&self, section: &[u8]) -> u32 {
        let mut buf = [0u8; PART_SIZE];
        buf[..self.size].copy_from_slice(&section[self.span()]);
        u32::from_le_bytes(buf)
    }

    /// Store the low bytes of `value` in the window.
    pub fn write(&self, section: &mut [u8], value: u32) {
        let span = self.span();
        section[span].copy_from_slice(&value.to_le_bytes()[..self.size]);
    }
}

/// Resolve a key against the standard sections.
///
/// Keys whose section is not standard yield [`Error::UnknownSection`]; the
/// device then gives custom attribute handlers a chance.
pub fn resolve(key: AttributeKey) -> Result<AttributeRef> {
    let section = Section::try_from(key.section()).map_err(|_| Error::UnknownSection)?;
    let def = section
        .table()
        .get(key.attribute() as usize)
        .ok_or(Error::UnknownAttribute)?;

    let part_offset = key.part() as usize * PART_SIZE;
    if part_offset >= def.size {
        return Err(Error::UnknownPart);
    }

    let attr = AttributeRef {
        section,
        offset: def.offset + part_offset,
        size: (def.size - part_offset).min(PART_SIZE),
        read_only: def.read_only,
    };
    debug_assert!(attr.span().end <= section.size());
    Ok(attr)
}

/// Whether the key addresses one of the standard sections.
pub fn is_standard(key: AttributeKey) -> bool {
    Section::try_from(key.section()).is_ok()
}

/// Iterate over the first key of every standard attribute.
pub fn standard_keys() -> impl Iterator<Item = AttributeKey> {
    [Section::Identification, Section::System, Section::Config]
        .into_iter()
        .flat_map(|section| {
            (0..section.table().len()).map(move |idx| AttributeKey::new(section.into(), idx as u8, 0))
        })
}

/// Number of 4-byte parts of the attribute `key` belongs to.
pub fn part_count(key: AttributeKey) -> Result<usize> {
    let section = Section::try_from(key.section()).map_err(|_| Error::UnknownSection)?;
    let def = section
        .table()
        .get(key.attribute() as usize)
        .ok_or(Error::UnknownAttribute)?;
    Ok(def.size.div_ceil(PART_SIZE))
}
