//! Common test utilities and shared imports

// Shared by every integration test file, not all items are used everywhere
#[allow(unused_imports)]
pub use caniot_lib::attribute::{self, AttributeKey, Config, Identification, keys};
#[allow(unused_imports)]
pub use caniot_lib::controller::{Controller, Event, EventContext, EventHandler, EventStatus, Handle, QueryTimeout};
#[allow(unused_imports)]
pub use caniot_lib::device::{Capabilities, Device, DeviceApi};
#[allow(unused_imports)]
pub use caniot_lib::discovery::{DiscoveryCallback, DiscoveryConfig, DiscoveryMode, DiscoveryTarget};
#[allow(unused_imports)]
pub use caniot_lib::driver::{Driver, Timestamp};
#[allow(unused_imports)]
pub use caniot_lib::error::{Error, ErrorCode, Result};
#[allow(unused_imports)]
pub use caniot_lib::frame::{Frame, MAX_PAYLOAD};
#[allow(unused_imports)]
pub use caniot_lib::identifier::{Did, Direction, Endpoint, FrameType, Id};
#[allow(unused_imports)]
pub use hex;

use std::collections::{BTreeMap, VecDeque};

/// Second byte of every telemetry payload produced by [`TestApp`].
#[allow(dead_code)]
pub const TELEMETRY_MARKER: u8 = 0x42;

/// In-memory bus: records transmitted frames, replays queued received frames.
#[derive(Debug, Default)]
pub struct MockBus {
    pub sent: VecDeque<(Frame, u32)>,
    pub rx: VecDeque<Frame>,
    pub now_ms: u64,
    pub set_time_calls: Vec<u32>,
    /// Value of every byte handed out as entropy.
    pub entropy_byte: u8,
    pub fail_send: bool,
    /// Next `recv` fails once with `Driver(-11)`.
    pub fail_next_recv: bool,
}

#[allow(dead_code)]
impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rx(&mut self, frame: Frame) {
        self.rx.push_back(frame);
    }

    /// Pop the oldest transmitted frame.
    pub fn take_sent(&mut self) -> Option<Frame> {
        self.sent.pop_front().map(|(frame, _)| frame)
    }

    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
    }
}

impl Driver for MockBus {
    fn send(&mut self, frame: &Frame, delay_ms: u32) -> Result<()> {
        if self.fail_send {
            return Err(Error::Driver(-5));
        }
        self.sent.push_back((*frame, delay_ms));
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Frame>> {
        if std::mem::take(&mut self.fail_next_recv) {
            return Err(Error::Driver(-11));
        }
        Ok(self.rx.pop_front())
    }

    fn get_time(&self) -> Timestamp {
        Timestamp::from_millis(self.now_ms)
    }

    fn set_time(&mut self, secs: u32) -> Result<()> {
        self.set_time_calls.push(secs);
        self.now_ms = secs as u64 * 1000;
        Ok(())
    }

    fn entropy(&mut self, buf: &mut [u8]) {
        buf.fill(self.entropy_byte);
    }
}

/// Device application advertising every optional handler.
///
/// Telemetry payloads are `[endpoint, TELEMETRY_MARKER]`. Commands on the
/// board-control endpoint are rejected with [`Error::InvalidEndpoint`].
#[derive(Debug, Default)]
pub struct TestApp {
    pub commands: Vec<(Endpoint, Vec<u8>)>,
    pub custom: BTreeMap<u16, u32>,
    pub config_reads: usize,
    pub config_writes: usize,
    /// Make `config_written` fail, as a failed flash write would.
    pub reject_config: bool,
}

impl DeviceApi for TestApp {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn command(&mut self, endpoint: Endpoint, payload: &[u8]) -> Result<()> {
        if endpoint == Endpoint::BoardControl {
            return Err(Error::InvalidEndpoint);
        }
        self.commands.push((endpoint, payload.to_vec()));
        Ok(())
    }

    fn telemetry(&mut self, endpoint: Endpoint, buf: &mut [u8; MAX_PAYLOAD]) -> Result<usize> {
        buf[0] = endpoint.into();
        buf[1] = TELEMETRY_MARKER;
        Ok(2)
    }

    fn read_custom_attribute(&mut self, key: AttributeKey) -> Result<u32> {
        self.custom.get(&key.raw()).copied().ok_or(Error::NoSuchCustomAttribute)
    }

    fn write_custom_attribute(&mut self, key: AttributeKey, value: u32) -> Result<()> {
        self.custom.insert(key.raw(), value);
        Ok(())
    }

    fn config_read(&mut self, _config: &mut Config) -> Result<()> {
        self.config_reads += 1;
        Ok(())
    }

    fn config_written(&mut self, _config: &Config) -> Result<()> {
        if self.reject_config {
            return Err(Error::Driver(-28));
        }
        self.config_writes += 1;
        Ok(())
    }
}

/// Device application without any optional handler.
#[derive(Debug, Default)]
pub struct BareApp;

impl DeviceApi for BareApp {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

#[allow(dead_code)]
pub fn test_device(did: Did) -> Device<TestApp> {
    let identification = Identification::new(did, 0x0102, "test-node", 0xCAFE_F00D);
    Device::new(identification, Config::default(), TestApp::default())
}

#[allow(dead_code)]
pub fn bare_device(did: Did) -> Device<BareApp> {
    let identification = Identification::new(did, 1, "bare", 0);
    Device::new(identification, Config::default(), BareApp)
}

/// Event handler recording every event it receives.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    /// Ask to stop broadcast queries after this many broadcast events.
    pub stop_after: Option<usize>,
    broadcast_events: usize,
}

#[allow(dead_code)]
impl Recorder {
    pub fn stopping_after(count: usize) -> Self {
        Self {
            stop_after: Some(count),
            ..Self::default()
        }
    }

    pub fn statuses(&self) -> Vec<EventStatus> {
        self.events.iter().map(|e| e.status).collect()
    }
}

impl EventHandler for Recorder {
    fn on_event(&mut self, event: &Event) -> bool {
        self.events.push(*event);
        if event.terminated {
            return true;
        }
        self.broadcast_events += 1;
        self.stop_after.is_none_or(|limit| self.broadcast_events < limit)
    }
}

#[allow(dead_code)]
pub fn controller() -> Controller<Recorder> {
    Controller::new(Recorder::default())
}
