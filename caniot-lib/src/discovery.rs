//! # Discovery sweep
//!
//! Enumerates the devices present on the bus. An active sweep issues a
//! broadcast query through the controller and relays each distinct responding
//! device to the discovery callback. A passive sweep sends nothing and relays
//! the responses it happens to observe.

use crate::attribute::AttributeKey;
use crate::controller::{Controller, EventHandler, Handle, QueryTimeout};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::identifier::{Did, Endpoint, FrameType};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Send a broadcast query and relay its responses.
    Active,
    /// Only observe responses, send nothing.
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTarget {
    Telemetry(Endpoint),
    /// Active only.
    Attribute(AttributeKey),
    /// Any response. Passive only.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    pub target: DiscoveryTarget,
    /// Relay error responses too.
    pub admit_errors: bool,
    pub timeout: QueryTimeout,
}

impl DiscoveryConfig {
    pub fn active(target: DiscoveryTarget, timeout: impl Into<QueryTimeout>) -> Self {
        Self {
            mode: DiscoveryMode::Active,
            target,
            admit_errors: false,
            timeout: timeout.into(),
        }
    }

    pub fn passive(target: DiscoveryTarget, timeout: impl Into<QueryTimeout>) -> Self {
        Self {
            mode: DiscoveryMode::Passive,
            target,
            admit_errors: false,
            timeout: timeout.into(),
        }
    }

    pub fn with_errors(mut self, admit_errors: bool) -> Self {
        self.admit_errors = admit_errors;
        self
    }
}

/// Called once per discovered device; return `false` to stop the sweep.
pub type DiscoveryCallback = Box<dyn FnMut(Did, &Frame) -> bool>;

pub(crate) struct Discovery {
    config: DiscoveryConfig,
    callback: DiscoveryCallback,
    /// Broadcast query of an active sweep.
    handle: Option<Handle>,
    /// Devices already relayed by a passive sweep.
    seen: u64,
    /// Countdown of a passive sweep, `None` when it never expires.
    remaining_ms: Option<u32>,
}

impl Discovery {
    fn admits(&self, frame: &Frame) -> bool {
        if frame.id.is_error() {
            return self.config.admit_errors;
        }
        match self.config.target {
            DiscoveryTarget::Telemetry(endpoint) => {
                frame.id.frame_type == FrameType::Telemetry && frame.id.endpoint == endpoint
            }
            DiscoveryTarget::Attribute(key) => {
                frame.id.frame_type == FrameType::ReadAttribute && frame.attribute_key() == Some(key)
            }
            DiscoveryTarget::Any => true,
        }
    }

    /// Whether a passive sweep targets the query type of this error frame.
    fn error_matches_target(&self, frame: &Frame) -> bool {
        match self.config.target {
            DiscoveryTarget::Telemetry(endpoint) => {
                frame.id.frame_type == FrameType::Command && frame.id.endpoint == endpoint
            }
            DiscoveryTarget::Attribute(_) => frame.id.frame_type == FrameType::WriteAttribute,
            DiscoveryTarget::Any => true,
        }
    }
}

impl<H: EventHandler, const N: usize> Controller<H, N> {
    /// Start a discovery sweep. Only one sweep may run at a time.
    pub fn start_discovery<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        config: DiscoveryConfig,
        callback: DiscoveryCallback,
    ) -> Result<()> {
        if self.discovery.is_some() {
            return Err(Error::Busy);
        }
        if config.timeout == QueryTimeout::Untracked {
            return Err(Error::InvalidArgument);
        }

        let (handle, remaining_ms) = match config.mode {
            DiscoveryMode::Active => {
                let frame = match config.target {
                    DiscoveryTarget::Telemetry(endpoint) => Frame::telemetry_query(Did::BROADCAST, endpoint),
                    DiscoveryTarget::Attribute(key) => Frame::read_attribute(Did::BROADCAST, key),
                    DiscoveryTarget::Any => return Err(Error::NotSupported),
                };
                let handle = self
                    .query(driver, Did::BROADCAST, &frame, config.timeout)?
                    .ok_or(Error::InvalidArgument)?;
                (Some(handle), None)
            }
            DiscoveryMode::Passive => {
                if matches!(config.target, DiscoveryTarget::Attribute(_)) {
                    return Err(Error::NotSupported);
                }
                let remaining_ms = match config.timeout {
                    QueryTimeout::Millis(ms) => Some(ms),
                    _ => None,
                };
                (None, remaining_ms)
            }
        };

        info!(mode = ?config.mode, target = ?config.target, "Discovery started");
        self.discovery = Some(Discovery {
            config,
            callback,
            handle,
            seen: 0,
            remaining_ms,
        });
        Ok(())
    }

    /// Stop the running sweep, cancelling its broadcast query silently.
    pub fn stop_discovery(&mut self) -> Result<()> {
        let handle = self.discovery.as_ref().ok_or(Error::InvalidArgument)?.handle;
        match handle {
            // cancelling the owned query ends the sweep
            Some(handle) => self.cancel(handle, true),
            None => {
                self.end_discovery("stopped");
                Ok(())
            }
        }
    }

    pub fn is_discovery_running(&self) -> bool {
        self.discovery.is_some()
    }

    pub(crate) fn discovery_owns(&self, handle: Handle) -> bool {
        self.discovery.as_ref().and_then(|d| d.handle) == Some(handle)
    }

    pub(crate) fn end_discovery(&mut self, reason: &str) {
        if self.discovery.take().is_some() {
            info!("Discovery ended: {}", reason);
        }
    }

    /// Relay a first response to the active sweep's broadcast query.
    ///
    /// Returns `false` when the sweep should stop.
    pub(crate) fn discovery_forward(&mut self, frame: &Frame) -> bool {
        let Some(discovery) = self.discovery.as_mut() else {
            return false;
        };
        if !discovery.admits(frame) {
            return true;
        }
        (discovery.callback)(frame.did(), frame)
    }

    pub(crate) fn observe_passive(&mut self, frame: &Frame) {
        let Some(discovery) = self.discovery.as_mut() else {
            return;
        };
        if discovery.config.mode != DiscoveryMode::Passive {
            return;
        }
        if frame.id.is_error() && !discovery.error_matches_target(frame) {
            return;
        }
        if !discovery.admits(frame) {
            return;
        }

        let did = frame.did();
        if discovery.seen & did.bit() != 0 {
            return;
        }
        discovery.seen |= did.bit();

        if !(discovery.callback)(did, frame) {
            self.end_discovery("stopped by callback");
        }
    }

    pub(crate) fn advance_passive_discovery(&mut self, elapsed: u32) {
        let Some(discovery) = self.discovery.as_mut() else {
            return;
        };
        let Some(remaining) = discovery.remaining_ms.as_mut() else {
            return;
        };
        if elapsed >= *remaining {
            self.end_discovery("timed out");
        } else {
            *remaining -= elapsed;
        }
    }
}
