//! # Device side request dispatcher
//!
//! A [`Device`] answers the queries addressed to its DID (or to the broadcast
//! address). Each query produces exactly one response frame: telemetry for
//! command and telemetry queries, a read-attribute response for attribute
//! queries, or an error frame when anything fails. Error frames can be
//! disabled with the `error_response` configuration flag.
//!
//! The application plugs in through [`DeviceApi`]. Which optional handlers it
//! provides is read once from [`DeviceApi::capabilities`] when the device is
//! built.

use crate::attribute::{self, AttributeKey, Config, Identification, Section, System, bump, keys};
use crate::driver::{Driver, Timestamp, random_between};
use crate::error::{Error, Result};
use crate::frame::{Frame, MAX_PAYLOAD};
use crate::identifier::{Did, Endpoint, FrameType, did_matches};
use tracing::{debug, trace, warn};
use zerocopy::IntoBytes;
use zerocopy::byteorder::little_endian::U16;

/// Optional handlers an application implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub command: bool,
    pub telemetry: bool,
    pub custom_attributes: bool,
    pub config_hooks: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            command: true,
            telemetry: true,
            custom_attributes: true,
            config_hooks: true,
        }
    }
}

/// Application handlers of a device.
///
/// Methods whose capability is not advertised are never called.
pub trait DeviceApi {
    fn capabilities(&self) -> Capabilities;

    /// Execute a command received on `endpoint`.
    fn command(&mut self, _endpoint: Endpoint, _payload: &[u8]) -> Result<()> {
        Err(Error::HandlerMissing)
    }

    /// Serialize telemetry of `endpoint` into `buf`, returning the payload length.
    fn telemetry(&mut self, _endpoint: Endpoint, _buf: &mut [u8; MAX_PAYLOAD]) -> Result<usize> {
        Err(Error::HandlerMissing)
    }

    fn read_custom_attribute(&mut self, _key: AttributeKey) -> Result<u32> {
        Err(Error::NoSuchCustomAttribute)
    }

    fn write_custom_attribute(&mut self, _key: AttributeKey, _value: u32) -> Result<()> {
        Err(Error::NoSuchCustomAttribute)
    }

    /// Called before the configuration section is read, to refresh it.
    fn config_read(&mut self, _config: &mut Config) -> Result<()> {
        Ok(())
    }

    /// Called after the configuration section was written, typically to persist it.
    fn config_written(&mut self, _config: &Config) -> Result<()> {
        Ok(())
    }
}

pub struct Device<A: DeviceApi> {
    identification: Identification,
    system: System,
    config: Config,
    api: A,
    capabilities: Capabilities,
    now_ms: u64,
    last_telemetry_ms: Option<u64>,
    requested_telemetry: Option<Endpoint>,
    pending_time_sync: Option<u32>,
}

impl<A: DeviceApi> Device<A> {
    pub fn new(identification: Identification, config: Config, api: A) -> Self {
        let capabilities = api.capabilities();
        Self {
            identification,
            system: System::default(),
            config,
            api,
            capabilities,
            now_ms: 0,
            last_telemetry_ms: None,
            requested_telemetry: None,
            pending_time_sync: None,
        }
    }

    pub fn did(&self) -> Did {
        self.identification.did()
    }

    pub fn identification(&self) -> &Identification {
        &self.identification
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    pub fn set_battery(&mut self, level: u8) {
        self.system.battery = level;
    }

    /// Reset receive/send counters and last error codes.
    pub fn reset_counters(&mut self) {
        let system = &mut self.system;
        for counter in [
            &mut system.received_total,
            &mut system.received_read_attribute,
            &mut system.received_write_attribute,
            &mut system.received_command,
            &mut system.received_request_telemetry,
            &mut system.received_ignored,
            &mut system.sent_total,
            &mut system.sent_telemetry,
        ] {
            counter.set(0);
        }
        system.last_command_error.set(0);
        system.last_telemetry_error.set(0);
    }

    /// Update the system clock fields from the platform time.
    pub fn update_time(&mut self, now: Timestamp) {
        self.now_ms = now.as_millis();
        if self.system.start_time.get() == 0 {
            self.system.start_time.set(now.secs);
        }
        self.system.time.set(now.secs);
        self.system
            .uptime
            .set(now.secs.saturating_sub(self.system.start_time.get()));
    }

    /// Ask for telemetry of `endpoint` to be sent on the next [`Device::process`].
    pub fn trigger_telemetry(&mut self, endpoint: Endpoint) {
        self.requested_telemetry = Some(endpoint);
    }

    /// Milliseconds until the device has periodic telemetry to send.
    pub fn time_until_process(&self) -> u32 {
        if self.requested_telemetry.is_some() {
            return 0;
        }
        let period = self.config.telemetry_period.get() as u64;
        if period == 0 {
            return u32::MAX;
        }
        match self.last_telemetry_ms {
            None => 0,
            Some(last) => {
                let elapsed = self.now_ms.saturating_sub(last);
                period.saturating_sub(elapsed).min(u32::MAX as u64) as u32
            }
        }
    }

    /// Handle one received frame and build the response to transmit, if any.
    ///
    /// Frames that are not queries for this device are counted as ignored.
    pub fn handle_frame(&mut self, query: &Frame) -> Option<Frame> {
        if !query.id.is_query() || !did_matches(self.did(), query.did()) {
            bump(&mut self.system.received_ignored);
            return None;
        }
        bump(&mut self.system.received_total);

        trace!(did = %self.did(), "Handling {}", query);
        let endpoint = query.id.endpoint;
        let result = match query.id.frame_type {
            FrameType::Command => {
                bump(&mut self.system.received_command);
                self.handle_command(endpoint, query.payload())
                    .and_then(|_| self.build_telemetry(endpoint))
            }
            FrameType::Telemetry => {
                bump(&mut self.system.received_request_telemetry);
                self.build_telemetry(endpoint)
            }
            FrameType::WriteAttribute => {
                bump(&mut self.system.received_write_attribute);
                self.handle_write_attribute(query)
            }
            FrameType::ReadAttribute => {
                bump(&mut self.system.received_read_attribute);
                self.handle_read_attribute(query)
            }
        };

        match result {
            Ok(response) => {
                bump(&mut self.system.sent_total);
                if response.id.frame_type == FrameType::Telemetry {
                    bump(&mut self.system.sent_telemetry);
                }
                Some(response)
            }
            Err(err) => {
                let arg = query.attribute_key().map(|key| key.raw() as u32).unwrap_or(0);
                if !self.config.error_response() {
                    warn!(did = %self.did(), "Dropping error response: {}", err);
                    return None;
                }
                debug!(did = %self.did(), "Query failed: {}", err);
                bump(&mut self.system.sent_total);
                Some(Frame::error_response(
                    self.did(),
                    query.id.frame_type,
                    endpoint,
                    err.code(),
                    arg,
                ))
            }
        }
    }

    /// Poll the driver once: answer a received query, then send periodic or
    /// requested telemetry when due.
    ///
    /// A receive error is returned after the due telemetry was sent.
    pub fn process<D: Driver + ?Sized>(&mut self, driver: &mut D) -> Result<()> {
        self.update_time(driver.get_time());

        let received = driver.recv();
        if let Ok(Some(query)) = received {
            if let Some(response) = self.handle_frame(&query) {
                let delay = self.response_delay(driver, &query);
                driver.send(&response, delay)?;
            }

            if let Some(secs) = self.pending_time_sync.take() {
                debug!(did = %self.did(), "Synchronizing platform time to {}", secs);
                driver.set_time(secs)?;
                self.update_time(driver.get_time());
            }
        }

        if let Some(endpoint) = self.telemetry_due() {
            self.last_telemetry_ms = Some(self.now_ms);
            match self.build_telemetry(endpoint) {
                Ok(frame) => {
                    let delay = if self.config.telemetry_delay_rdm() {
                        random_between(
                            driver,
                            self.config.telemetry_delay_min.get() as u32,
                            self.config.telemetry_delay_max.get() as u32,
                        )
                    } else {
                        self.config.telemetry_delay.get() as u32
                    };
                    bump(&mut self.system.sent_total);
                    bump(&mut self.system.sent_telemetry);
                    driver.send(&frame, delay)?;
                }
                Err(err) => warn!(did = %self.did(), "Periodic telemetry failed: {}", err),
            }
        }

        received.map(|_| ())
    }

    /// Read an attribute the way a remote read query would.
    pub fn read_attribute(&mut self, key: AttributeKey) -> Result<u32> {
        match attribute::resolve(key) {
            Ok(attr) => {
                let bytes = match attr.section {
                    Section::Identification => self.identification.as_bytes(),
                    Section::System => self.system.as_bytes(),
                    Section::Config => {
                        if self.capabilities.config_hooks {
                            self.api.config_read(&mut self.config)?;
                        }
                        self.config.as_bytes()
                    }
                };
                Ok(attr.read(bytes))
            }
            Err(Error::UnknownSection) if self.capabilities.custom_attributes => {
                self.api.read_custom_attribute(key)
            }
            Err(err) => Err(err),
        }
    }

    /// Write an attribute the way a remote write query would.
    pub fn write_attribute(&mut self, key: AttributeKey, value: u32) -> Result<()> {
        match attribute::resolve(key) {
            Ok(attr) if attr.read_only => Err(Error::ReadOnly),
            Ok(attr) => match attr.section {
                Section::Identification => Err(Error::ReadOnly),
                Section::System => {
                    attr.write(self.system.as_mut_bytes(), value);
                    if key.attribute() == keys::TIME.attribute() {
                        self.time_written(value);
                    }
                    Ok(())
                }
                Section::Config => {
                    let previous = self.config;
                    attr.write(self.config.as_mut_bytes(), value);
                    if self.capabilities.config_hooks {
                        if let Err(err) = self.api.config_written(&self.config) {
                            self.config = previous;
                            return Err(err);
                        }
                    }
                    Ok(())
                }
            },
            Err(Error::UnknownSection) if self.capabilities.custom_attributes => {
                self.api.write_custom_attribute(key, value)
            }
            Err(err) => Err(err),
        }
    }

    fn time_written(&mut self, secs: u32) {
        let uptime = self.system.uptime.get();
        self.system.start_time.set(secs.saturating_sub(uptime));
        self.system.uptime_synced.set(uptime);
        self.pending_time_sync = Some(secs);
    }

    fn handle_command(&mut self, endpoint: Endpoint, payload: &[u8]) -> Result<()> {
        let result = if self.capabilities.command {
            self.api.command(endpoint, payload)
        } else {
            Err(Error::HandlerMissing)
        };
        self.system.last_command_error = error_code(&result);
        result
    }

    fn build_telemetry(&mut self, endpoint: Endpoint) -> Result<Frame> {
        let mut buf = [0u8; MAX_PAYLOAD];
        let result = if self.capabilities.telemetry {
            self.api.telemetry(endpoint, &mut buf)
        } else {
            Err(Error::HandlerMissing)
        };
        self.system.last_telemetry_error = error_code(&result);

        let len = result?;
        let payload = buf.get(..len).ok_or(Error::InvalidArgument)?;
        let frame = Frame::telemetry_response(self.did(), endpoint, payload)?;
        self.system.last_telemetry.set(self.system.time.get());
        self.last_telemetry_ms = Some(self.now_ms);
        Ok(frame)
    }

    fn handle_write_attribute(&mut self, query: &Frame) -> Result<Frame> {
        let key = query.attribute_key().ok_or(Error::InvalidArgument)?;
        let value = query.attribute_value().ok_or(Error::InvalidArgument)?;
        self.write_attribute(key, value)?;
        let value = self.read_attribute(key)?;
        Ok(Frame::attribute_response(self.did(), key, value))
    }

    fn handle_read_attribute(&mut self, query: &Frame) -> Result<Frame> {
        let key = query.attribute_key().ok_or(Error::InvalidArgument)?;
        let value = self.read_attribute(key)?;
        Ok(Frame::attribute_response(self.did(), key, value))
    }

    fn response_delay<D: Driver + ?Sized>(&self, driver: &mut D, query: &Frame) -> u32 {
        if !query.did().is_broadcast() {
            return 0;
        }
        random_between(
            driver,
            self.config.telemetry_delay_min.get() as u32,
            self.config.telemetry_delay_max.get() as u32,
        )
    }

    fn telemetry_due(&mut self) -> Option<Endpoint> {
        if let Some(endpoint) = self.requested_telemetry.take() {
            return Some(endpoint);
        }
        let period = self.config.telemetry_period.get();
        if period == 0 {
            return None;
        }
        let due = match self.last_telemetry_ms {
            None => true,
            Some(last) => self.now_ms.saturating_sub(last) >= period as u64,
        };
        due.then(|| self.config.telemetry_endpoint())
    }
}

fn error_code<T>(result: &Result<T>) -> U16 {
    match result {
        Ok(_) => U16::new(0),
        Err(err) => U16::new(err.code() as u16),
    }
}
