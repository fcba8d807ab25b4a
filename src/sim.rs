//! `simulate` subcommand: a controller and a few demo devices talking over an
//! in-memory bus.
//!
//! The controller first enumerates the bus (actively, passively, or not at
//! all), synchronizes the devices' clocks with a broadcast time write, then
//! keeps querying the discovered devices in turn.

use crate::bus::{Port, SimBus};
use anyhow::{Result, ensure};
use bytes::{Buf, BufMut};
use caniot_lib::attribute::keys;
use caniot_lib::discovery::DiscoveryCallback;
use caniot_lib::error::Error;
use caniot_lib::frame::MAX_PAYLOAD;
use caniot_lib::{
    AttributeKey, Capabilities, Config, Controller, Device, DeviceApi, Did, DiscoveryConfig, DiscoveryTarget,
    Driver, Endpoint, Event, EventContext, EventHandler, EventStatus, Frame, FrameType, Identification, QueryTimeout,
};
use clap::{Args, ValueEnum};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use strum_macros::Display;
use tokio::signal;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Temperature setpoint, in hundredths of a degree.
pub const SETPOINT_KEY: AttributeKey = AttributeKey::new(0xA, 0, 0);

const DEMO_VERSION: u16 = 0x0100;
const DEMO_MAGIC: u32 = 0x5EED_CA17;
const MAX_PENDING_QUERIES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Display)]
pub enum DiscoveryArg {
    /// Broadcast a telemetry query and collect the answers.
    #[strum(to_string = "active")]
    Active,
    /// Listen to the traffic for a while.
    #[strum(to_string = "passive")]
    Passive,
    /// Assume every simulated device is known.
    #[strum(to_string = "none")]
    None,
}

#[derive(Args, Debug)]
pub struct SimArgs {
    /// Number of simulated devices.
    #[arg(short = 'n', long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=63))]
    pub devices: u8,
    /// How the controller finds the devices.
    #[arg(long, value_enum, default_value_t = DiscoveryArg::Active)]
    pub discovery: DiscoveryArg,
    /// Discovery sweep duration in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub discovery_ms: u32,
    /// Query timeout in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub timeout_ms: u32,
    /// Delay between two queries of the controller, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub query_interval_ms: u64,
    /// Periodic telemetry of the devices in milliseconds (0 disables it).
    #[arg(long, default_value_t = 5000)]
    pub telemetry_period_ms: u32,
    /// Polling period of the simulation loop in milliseconds.
    #[arg(long, default_value_t = 5)]
    pub poll_ms: u64,
    /// Stop after this many seconds (0 runs until Ctrl+C).
    #[arg(short, long, default_value_t = 10)]
    pub duration: u64,
    /// Probability for a frame to get lost on the bus.
    #[arg(long, default_value_t = 0.0)]
    pub drop_rate: f64,
    /// Seed of the bus randomness, for reproducible runs.
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
}

/// A heater with one relay: temperature rises while the relay is on.
#[derive(Debug, Clone)]
pub struct Thermostat {
    /// Hundredths of a degree.
    pub temperature: i16,
    pub setpoint: i16,
    pub relays: u8,
    pub ticks: u16,
}

impl Thermostat {
    pub fn new(temperature: i16) -> Self {
        Self {
            temperature,
            setpoint: 2000,
            relays: 0,
            ticks: 0,
        }
    }

    /// One step of the thermal model.
    pub fn step(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % 20 != 0 {
            return;
        }
        if self.relays & 0x01 != 0 {
            self.temperature = self.temperature.saturating_add(5).min(4000);
        } else {
            self.temperature = self.temperature.saturating_sub(3).max(-1000);
        }
    }
}

impl DeviceApi for Thermostat {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            command: true,
            telemetry: true,
            custom_attributes: true,
            config_hooks: false,
        }
    }

    fn command(&mut self, endpoint: Endpoint, payload: &[u8]) -> caniot_lib::Result<()> {
        match endpoint {
            Endpoint::App => {
                self.relays = *payload.first().ok_or(Error::InvalidArgument)?;
                debug!(relays = self.relays, "Relays switched");
                Ok(())
            }
            Endpoint::BoardControl => {
                self.ticks = 0;
                Ok(())
            }
            _ => Err(Error::InvalidEndpoint),
        }
    }

    fn telemetry(&mut self, endpoint: Endpoint, buf: &mut [u8; MAX_PAYLOAD]) -> caniot_lib::Result<usize> {
        let mut out = &mut buf[..];
        match endpoint {
            Endpoint::App => {
                out.put_i16_le(self.temperature);
                out.put_u8(self.relays);
                out.put_u16_le(self.ticks);
            }
            Endpoint::Ep1 => out.put_i16_le(self.setpoint),
            _ => return Err(Error::InvalidEndpoint),
        }
        Ok(MAX_PAYLOAD - out.len())
    }

    fn read_custom_attribute(&mut self, key: AttributeKey) -> caniot_lib::Result<u32> {
        match key {
            SETPOINT_KEY => Ok(self.setpoint as u16 as u32),
            _ => Err(Error::NoSuchCustomAttribute),
        }
    }

    fn write_custom_attribute(&mut self, key: AttributeKey, value: u32) -> caniot_lib::Result<()> {
        match key {
            SETPOINT_KEY => {
                self.setpoint = i16::try_from(value).map_err(|_| Error::InvalidArgument)?;
                Ok(())
            }
            _ => Err(Error::NoSuchCustomAttribute),
        }
    }
}

/// Human readable form of a thermostat's telemetry frame.
pub fn describe_telemetry(frame: &Frame) -> Option<String> {
    if frame.id.frame_type != FrameType::Telemetry || frame.id.is_error() {
        return None;
    }
    let mut payload = frame.payload();
    match frame.id.endpoint {
        Endpoint::App if payload.remaining() >= 5 => {
            let temperature = payload.get_i16_le();
            let relays = payload.get_u8();
            let ticks = payload.get_u16_le();
            Some(format!(
                "{:.2} °C, relays {:#04x}, tick {}",
                temperature as f32 / 100.0,
                relays,
                ticks
            ))
        }
        Endpoint::Ep1 if payload.remaining() >= 2 => {
            Some(format!("setpoint {:.2} °C", payload.get_i16_le() as f32 / 100.0))
        }
        _ => None,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonitorStats {
    pub ok: u32,
    pub errors: u32,
    pub timeouts: u32,
    pub cancelled: u32,
    pub orphans: u32,
}

/// Event handler reporting every controller event.
pub struct Monitor {
    json: bool,
    pub stats: MonitorStats,
}

impl Monitor {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            stats: MonitorStats::default(),
        }
    }

    fn count(&mut self, event: &Event) {
        let stats = &mut self.stats;
        if event.context == EventContext::Orphan {
            stats.orphans += 1;
            return;
        }
        match event.status {
            EventStatus::Ok => stats.ok += 1,
            EventStatus::Error => stats.errors += 1,
            EventStatus::Timeout => stats.timeouts += 1,
            EventStatus::Cancelled => stats.cancelled += 1,
        }
    }

    fn log(event: &Event) {
        let handle = event.handle.map(|h| h.get());
        let Some(frame) = event.response.as_ref() else {
            match event.status {
                EventStatus::Timeout => warn!(did = %event.did, ?handle, "Query timed out"),
                _ => debug!(did = %event.did, ?handle, "Query {}", event.status),
            }
            return;
        };

        let detail = describe_telemetry(frame).unwrap_or_else(|| frame.to_string());
        match (event.context, event.status) {
            (EventContext::Orphan, _) => debug!(did = %frame.did(), "Unsolicited: {}", detail),
            (_, EventStatus::Error) => {
                let error = event.error().map(|e| e.to_string()).unwrap_or_default();
                warn!(did = %frame.did(), ?handle, "Device error: {}", error)
            }
            _ => info!(did = %frame.did(), ?handle, "{}", detail),
        }
    }
}

impl EventHandler for Monitor {
    fn on_event(&mut self, event: &Event) -> bool {
        self.count(event);
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
        } else {
            Self::log(event);
        }
        true
    }
}

struct Node {
    device: Device<Thermostat>,
    port: Port,
}

impl Node {
    fn new(bus: &SimBus, index: u8, telemetry_period_ms: u32) -> Self {
        let did = Did::from_raw(index);
        let name = format!("thermostat-{}", index);
        let mut config = Config::default();
        config.telemetry_period.set(telemetry_period_ms);
        config.set_telemetry_delay_rdm(true);

        let temperature = 1800 + 25 * index as i16;
        let device = Device::new(
            Identification::new(did, DEMO_VERSION, &name, DEMO_MAGIC),
            config,
            Thermostat::new(temperature),
        );
        Self {
            device,
            port: bus.attach(),
        }
    }

    /// Answer every queued frame, then send due telemetry.
    fn poll(&mut self) -> caniot_lib::Result<()> {
        self.device.api_mut().step();
        loop {
            self.device.process(&mut self.port)?;
            if self.port.pending() == 0 {
                return Ok(());
            }
        }
    }
}

/// The queries the controller cycles through.
#[derive(Debug, Clone, Copy)]
enum Probe {
    Telemetry,
    Uptime,
    ToggleRelay,
    RaiseSetpoint,
    Name,
    /// Endpoint the thermostat does not implement, to exercise error frames.
    BadEndpoint,
}

const PROBES: [Probe; 6] = [
    Probe::Telemetry,
    Probe::Uptime,
    Probe::ToggleRelay,
    Probe::RaiseSetpoint,
    Probe::Name,
    Probe::BadEndpoint,
];

struct Scheduler {
    round: usize,
    relays: u8,
    setpoint: u32,
}

impl Scheduler {
    fn issue<H: EventHandler, const N: usize>(
        &mut self,
        controller: &mut Controller<H, N>,
        port: &mut Port,
        known: &[Did],
        timeout: u32,
    ) -> Result<()> {
        if known.is_empty() {
            return Ok(());
        }
        let did = known[self.round % known.len()];
        let probe = PROBES[(self.round / known.len()) % PROBES.len()];
        self.round += 1;

        let result = match probe {
            Probe::Telemetry => controller.query_telemetry(port, did, Endpoint::App, timeout),
            Probe::Uptime => controller.query_read_attribute(port, did, keys::UPTIME, timeout),
            Probe::ToggleRelay => {
                self.relays ^= 0x01;
                controller.query_command(port, did, Endpoint::App, &[self.relays], timeout)
            }
            Probe::RaiseSetpoint => {
                self.setpoint += 50;
                controller.query_write_attribute(port, did, SETPOINT_KEY, self.setpoint, timeout)
            }
            Probe::Name => controller.query_read_attribute(port, did, keys::NAME, timeout),
            Probe::BadEndpoint => controller.query_telemetry(port, did, Endpoint::Ep2, timeout),
        };

        match result {
            Ok(_) => Ok(()),
            Err(Error::Busy) | Err(Error::PoolExhausted) => {
                debug!(%did, ?probe, "Controller busy, skipping");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn start_discovery<H: EventHandler, const N: usize>(
    args: &SimArgs,
    controller: &mut Controller<H, N>,
    port: &mut Port,
    known: &Rc<RefCell<Vec<Did>>>,
) -> Result<()> {
    let timeout = QueryTimeout::Millis(args.discovery_ms);
    let config = match args.discovery {
        DiscoveryArg::Active => DiscoveryConfig::active(DiscoveryTarget::Telemetry(Endpoint::App), timeout),
        DiscoveryArg::Passive => DiscoveryConfig::passive(DiscoveryTarget::Any, timeout),
        DiscoveryArg::None => {
            known
                .borrow_mut()
                .extend((0..args.devices).map(Did::from_raw));
            return Ok(());
        }
    };

    let sink = Rc::clone(known);
    let callback: DiscoveryCallback = Box::new(move |did: Did, frame: &Frame| {
        info!(%did, "Discovered device: {}", frame);
        sink.borrow_mut().push(did);
        true
    });
    controller.start_discovery(port, config, callback)?;
    Ok(())
}

pub async fn run(args: &SimArgs, json: bool) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&args.drop_rate),
        "Drop rate must be between 0 and 1, got {}",
        args.drop_rate
    );

    let bus = SimBus::new(args.seed, args.drop_rate);
    let mut nodes: Vec<Node> = (0..args.devices)
        .map(|index| Node::new(&bus, index, args.telemetry_period_ms))
        .collect();
    let mut port = bus.attach();
    let mut controller: Controller<Monitor, MAX_PENDING_QUERIES> = Controller::new(Monitor::new(json));
    info!(devices = args.devices, seed = args.seed, "Simulated bus ready");

    let known: Rc<RefCell<Vec<Did>>> = Rc::default();
    start_discovery(args, &mut controller, &mut port, &known)?;

    let mut ticker = time::interval(Duration::from_millis(args.poll_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let query_interval = Duration::from_millis(args.query_interval_ms);
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));

    let mut time_synced = false;
    let mut last_query = Instant::now();
    let mut scheduler = Scheduler {
        round: 0,
        relays: 0,
        setpoint: 2000,
    };

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down.");
                break;
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        bus.deliver();
        for node in nodes.iter_mut() {
            node.poll()?;
        }
        controller.process(&mut port)?;

        if controller.is_discovery_running() || last_query.elapsed() < query_interval {
            continue;
        }
        last_query = Instant::now();

        if !time_synced {
            let now = port.get_time().secs;
            info!(devices = known.borrow().len(), "Synchronizing device clocks to {}", now);
            controller.query_write_attribute(&mut port, Did::BROADCAST, keys::TIME, now, args.timeout_ms)?;
            time_synced = true;
            continue;
        }
        scheduler.issue(&mut controller, &mut port, &known.borrow(), args.timeout_ms)?;
    }

    controller.cancel_all(true);
    let monitor = controller.deinit();
    let stats = monitor.stats;
    info!(
        ok = stats.ok,
        errors = stats.errors,
        timeouts = stats.timeouts,
        cancelled = stats.cancelled,
        orphans = stats.orphans,
        "Controller summary"
    );
    let bus_stats = bus.stats();
    info!(
        sent = bus_stats.sent,
        delivered = bus_stats.delivered,
        dropped = bus_stats.dropped,
        overruns = bus_stats.overruns,
        "Bus summary"
    );
    for node in &nodes {
        let system = node.device.system();
        info!(
            did = %node.device.did(),
            received = system.received_total.get(),
            sent = system.sent_total.get(),
            telemetry = system.sent_telemetry.get(),
            uptime = system.uptime.get(),
            "Device summary"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thermostat_telemetry_layout() {
        let mut thermostat = Thermostat::new(-250);
        thermostat.relays = 0x03;
        thermostat.ticks = 0x0102;
        let mut buf = [0u8; MAX_PAYLOAD];
        let len = thermostat.telemetry(Endpoint::App, &mut buf).unwrap();
        assert_eq!(len, 5);
        assert_eq!(&buf[..len], &[0x06, 0xFF, 0x03, 0x02, 0x01]);

        let frame = Frame::telemetry_response(Did::new(1, 0), Endpoint::App, &buf[..len]).unwrap();
        assert_eq!(
            describe_telemetry(&frame).as_deref(),
            Some("-2.50 °C, relays 0x03, tick 258")
        );
    }

    #[test]
    fn test_thermostat_rejects_unknown_endpoint() {
        let mut thermostat = Thermostat::new(0);
        let mut buf = [0u8; MAX_PAYLOAD];
        assert_eq!(thermostat.telemetry(Endpoint::Ep2, &mut buf), Err(Error::InvalidEndpoint));
        assert_eq!(thermostat.command(Endpoint::Ep2, &[1]), Err(Error::InvalidEndpoint));
        assert_eq!(thermostat.command(Endpoint::App, &[]), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_setpoint_attribute() {
        let mut thermostat = Thermostat::new(0);
        thermostat.write_custom_attribute(SETPOINT_KEY, 2150).unwrap();
        assert_eq!(thermostat.read_custom_attribute(SETPOINT_KEY), Ok(2150));
        assert_eq!(
            thermostat.write_custom_attribute(SETPOINT_KEY, 70_000),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            thermostat.read_custom_attribute(AttributeKey::new(0xA, 1, 0)),
            Err(Error::NoSuchCustomAttribute)
        );
    }

    #[test]
    fn test_heating_model() {
        let mut thermostat = Thermostat::new(2000);
        thermostat.relays = 0x01;
        for _ in 0..40 {
            thermostat.step();
        }
        assert_eq!(thermostat.temperature, 2010);
    }

    #[test]
    fn test_bus_round_trip() {
        let bus = SimBus::new(7, 0.0);
        let mut node = Node::new(&bus, 9, 0);
        let mut port = bus.attach();
        let mut controller: Controller<Monitor, 4> = Controller::new(Monitor::new(false));

        controller
            .query_read_attribute(&mut port, Did::from_raw(9), keys::DID, QueryTimeout::Millis(1000))
            .unwrap();
        bus.deliver();
        node.poll().unwrap();
        bus.deliver();
        controller.process(&mut port).unwrap();

        assert_eq!(controller.handler().stats.ok, 1);
        assert_eq!(controller.pending_count(), 0);
        assert_eq!(bus.stats().sent, 2);
    }
}
