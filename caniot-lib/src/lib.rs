//! # CANIOT protocol engine
//!
//! CANIOT is a small request/response protocol carried in the 11-bit
//! identifier of classic CAN frames. Devices answer command, telemetry and
//! attribute queries; controllers issue queries and track their outcome.
//!
//! - [`identifier`]: identifier codec and device identifiers
//! - [`frame`]: frames and their payload layouts
//! - [`attribute`]: attribute keys and the standard attribute sections
//! - [`device`]: device side dispatcher
//! - [`controller`]: pending query pool, timeouts and response correlation
//! - [`discovery`]: enumeration of the devices on the bus
//! - [`driver`]: the platform collaborator (bus, clock, entropy)

pub mod attribute;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod frame;
pub mod identifier;


pub use attribute::{AttributeKey, Config, Identification, System};
pub use controller::{Controller, Event, EventContext, EventHandler, EventStatus, Handle, QueryTimeout};
pub use device::{Capabilities, Device, DeviceApi};
pub use discovery::{DiscoveryConfig, DiscoveryMode, DiscoveryTarget};
pub use driver::{Driver, Timestamp};
pub use error::{Error, Result};
pub use frame::Frame;
pub use identifier::{Did, Direction, Endpoint, FrameType, Id};
