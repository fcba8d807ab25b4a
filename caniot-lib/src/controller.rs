//! # Controller query engine
//!
//! The controller tracks in-flight queries in a fixed arena of `N` slots.
//! Free slots form a LIFO free list; slots of queries with a finite timeout
//! form a singly linked timeout queue in which every entry stores its timeout
//! relative to the entry before it:
//!
//! ```text
//! timeouts 200, 500, 800 ms  ->  head -> [200] -> [300] -> [300]
//! ```
//!
//! Advancing time only walks the head of the queue, and the entries that
//! reach a delta of zero are exactly the queries that expired.
//!
//! At most one query may be pending per DID, the broadcast DID included. A
//! unicast query ends with its first matching response. A broadcast query
//! stays pending until it times out, is cancelled, or its handler asks to stop,
//! and reports every responding device once.

use crate::attribute::AttributeKey;
use crate::discovery::Discovery;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::identifier::{Did, Endpoint, FrameType};
use std::num::NonZeroU8;
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, trace};

pub const DEFAULT_PENDING_QUERIES: usize = 8;

/// Timeout value meaning "never expires".
pub const TIMEOUT_FOREVER: u32 = u32::MAX;

/// Identifies a pending query: 1-based index of its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Handle(NonZeroU8);

impl Handle {
    pub fn get(self) -> u8 {
        self.0.get()
    }

    pub fn new(raw: u8) -> Option<Self> {
        NonZeroU8::new(raw).map(Handle)
    }

    fn from_index(index: u8) -> Self {
        Handle(NonZeroU8::MIN.saturating_add(index))
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTimeout {
    /// Send the query without tracking its response.
    Untracked,
    Millis(u32),
    Forever,
}

impl From<u32> for QueryTimeout {
    fn from(ms: u32) -> Self {
        match ms {
            0 => QueryTimeout::Untracked,
            TIMEOUT_FOREVER => QueryTimeout::Forever,
            ms => QueryTimeout::Millis(ms),
        }
    }
}

impl From<Duration> for QueryTimeout {
    fn from(duration: Duration) -> Self {
        QueryTimeout::from(duration.as_millis().min(TIMEOUT_FOREVER as u128) as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventContext {
    /// Outcome of a query issued by this controller.
    #[strum(to_string = "query")]
    Query,
    /// Response matching no pending query.
    #[strum(to_string = "orphan")]
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventStatus {
    #[strum(to_string = "ok")]
    Ok,
    /// The device answered with an error frame.
    #[strum(to_string = "error")]
    Error,
    #[strum(to_string = "timeout")]
    Timeout,
    #[strum(to_string = "cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    pub context: EventContext,
    pub status: EventStatus,
    pub did: Did,
    pub handle: Option<Handle>,
    /// No further event will be reported for this handle.
    pub terminated: bool,
    pub response: Option<Frame>,
    /// Tag given when the query was issued, 0 otherwise.
    pub tag: u32,
}

impl Event {
    /// Error reported by the device, for events with status [`EventStatus::Error`].
    pub fn error(&self) -> Option<Error> {
        let (code, arg) = self.response.as_ref()?.error()?;
        Some(Error::from_wire(code, arg))
    }
}

/// Receives query outcomes and orphan responses.
///
/// For non-terminated broadcast events, returning `false` stops listening
/// and releases the query. The return value is ignored otherwise.
pub trait EventHandler {
    fn on_event(&mut self, event: &Event) -> bool;
}

impl<F> EventHandler for F
where
    F: FnMut(&Event) -> bool,
{
    fn on_event(&mut self, event: &Event) -> bool {
        self(event)
    }
}

/// What a response must carry to answer a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Correlation {
    Endpoint(Endpoint),
    Attribute(AttributeKey),
}

#[derive(Debug, Clone, Copy)]
enum TimeoutLink {
    Forever,
    /// Delay after the previous queue entry, next entry.
    Queued { delta: u32, next: Option<u8> },
}

#[derive(Debug, Clone, Copy)]
struct PendingQuery {
    did: Did,
    handle: Handle,
    query_type: FrameType,
    correlation: Correlation,
    /// Devices already reported for a broadcast query, one bit per DID.
    notified: u64,
    tag: u32,
    timeout: TimeoutLink,
}

impl PendingQuery {
    fn is_response_to(&self, frame: &Frame) -> bool {
        if !self.did.is_broadcast() && frame.did() != self.did {
            return false;
        }
        match self.correlation {
            Correlation::Endpoint(endpoint) => {
                matches!(frame.id.frame_type, FrameType::Telemetry | FrameType::Command)
                    && frame.id.endpoint == endpoint
            }
            Correlation::Attribute(key) => match frame.id.frame_type {
                FrameType::ReadAttribute => frame.attribute_key() == Some(key),
                FrameType::WriteAttribute => frame
                    .error()
                    .is_some_and(|(_, arg)| arg as u16 == key.raw()),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Free { next: Option<u8> },
    InUse(PendingQuery),
}

fn status_of(frame: &Frame) -> EventStatus {
    if frame.id.is_error() {
        EventStatus::Error
    } else {
        EventStatus::Ok
    }
}

pub struct Controller<H: EventHandler, const N: usize = DEFAULT_PENDING_QUERIES> {
    slots: [Slot; N],
    free_head: Option<u8>,
    timeout_head: Option<u8>,
    /// DIDs with a pending query, one bit per DID.
    pending: u64,
    handler: H,
    pub(crate) discovery: Option<Discovery>,
    last_poll_ms: Option<u64>,
}

impl<H: EventHandler, const N: usize> Controller<H, N> {
    pub fn new(handler: H) -> Self {
        const { assert!(N > 0 && N <= u8::MAX as usize, "pool capacity must be within 1..=255") };

        let slots = std::array::from_fn(|i| Slot::Free {
            next: (i + 1 < N).then(|| (i + 1) as u8),
        });
        Self {
            slots,
            free_head: Some(0),
            timeout_head: None,
            pending: 0,
            handler,
            discovery: None,
            last_poll_ms: None,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Number of slots on the free list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_head;
        while let Some(idx) = cur {
            count += 1;
            cur = match self.slots[idx as usize] {
                Slot::Free { next } => next,
                Slot::InUse(_) => None,
            };
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|slot| matches!(slot, Slot::InUse(_))).count()
    }

    pub fn is_query_pending(&self, handle: Handle) -> bool {
        self.pending_query(handle).is_some()
    }

    /// Whether a query is pending for `did`.
    pub fn is_did_pending(&self, did: Did) -> bool {
        self.pending & did.bit() != 0
    }

    /// Milliseconds left before `handle` times out; `None` when not pending
    /// or when it never expires.
    pub fn remaining_timeout(&self, handle: Handle) -> Option<u32> {
        self.pending_query(handle)?;
        let target = handle.index() as u8;
        let mut total: u32 = 0;
        let mut cur = self.timeout_head;
        while let Some(idx) = cur {
            let (delta, next) = self.link(idx)?;
            total = total.saturating_add(delta);
            if idx == target {
                return Some(total);
            }
            cur = next;
        }
        None
    }

    /// Milliseconds until the earliest timeout, if any query is queued.
    pub fn next_timeout(&self) -> Option<u32> {
        self.link(self.timeout_head?).map(|(delta, _)| delta)
    }

    pub fn query<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        did: Did,
        frame: &Frame,
        timeout: impl Into<QueryTimeout>,
    ) -> Result<Option<Handle>> {
        self.query_tagged(driver, did, frame, timeout, 0)
    }

    /// Send `frame` to `did` and track its response.
    ///
    /// Returns `None` for untracked queries. `tag` is echoed in every event of
    /// the query.
    pub fn query_tagged<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        did: Did,
        frame: &Frame,
        timeout: impl Into<QueryTimeout>,
        tag: u32,
    ) -> Result<Option<Handle>> {
        if !frame.id.is_query() {
            return Err(Error::InvalidArgument);
        }
        let mut frame = *frame;
        frame.id.did = did;

        let timeout = timeout.into();
        if timeout == QueryTimeout::Untracked {
            driver.send(&frame, 0)?;
            return Ok(None);
        }

        if self.is_did_pending(did) {
            return Err(Error::Busy);
        }

        let correlation = match frame.id.frame_type {
            FrameType::Command | FrameType::Telemetry => Correlation::Endpoint(frame.id.endpoint),
            FrameType::WriteAttribute | FrameType::ReadAttribute => {
                Correlation::Attribute(frame.attribute_key().ok_or(Error::InvalidArgument)?)
            }
        };

        let idx = self.alloc().ok_or(Error::PoolExhausted)?;
        if let Err(err) = driver.send(&frame, 0) {
            self.release(idx);
            return Err(err);
        }

        let handle = Handle::from_index(idx);
        self.slots[idx as usize] = Slot::InUse(PendingQuery {
            did,
            handle,
            query_type: frame.id.frame_type,
            correlation,
            notified: 0,
            tag,
            timeout: TimeoutLink::Forever,
        });
        if let QueryTimeout::Millis(ms) = timeout {
            self.schedule(idx, ms);
        }
        self.pending |= did.bit();

        debug!(%did, handle = handle.get(), ?timeout, "Query {}", frame);
        Ok(Some(handle))
    }

    pub fn query_telemetry<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        did: Did,
        endpoint: Endpoint,
        timeout: impl Into<QueryTimeout>,
    ) -> Result<Option<Handle>> {
        self.query(driver, did, &Frame::telemetry_query(did, endpoint), timeout)
    }

    pub fn query_command<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        did: Did,
        endpoint: Endpoint,
        payload: &[u8],
        timeout: impl Into<QueryTimeout>,
    ) -> Result<Option<Handle>> {
        let frame = Frame::command(did, endpoint, payload)?;
        self.query(driver, did, &frame, timeout)
    }

    pub fn query_read_attribute<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        did: Did,
        key: AttributeKey,
        timeout: impl Into<QueryTimeout>,
    ) -> Result<Option<Handle>> {
        self.query(driver, did, &Frame::read_attribute(did, key), timeout)
    }

    pub fn query_write_attribute<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
        did: Did,
        key: AttributeKey,
        value: u32,
        timeout: impl Into<QueryTimeout>,
    ) -> Result<Option<Handle>> {
        self.query(driver, did, &Frame::write_attribute(did, key, value), timeout)
    }

    /// Stop tracking `handle`. Unless `suppress` is set, the handler gets a
    /// cancelled event.
    pub fn cancel(&mut self, handle: Handle, suppress: bool) -> Result<()> {
        if self.pending_query(handle).is_none() {
            return Err(Error::NoSuchHandle);
        }
        let Some(pq) = self.finish(handle.index() as u8) else {
            return Err(Error::NoSuchHandle);
        };
        debug!(did = %pq.did, handle = handle.get(), "Query cancelled");

        if self.discovery_owns(handle) {
            self.end_discovery("query cancelled");
        } else if !suppress {
            self.notify(&Event {
                context: EventContext::Query,
                status: EventStatus::Cancelled,
                did: pq.did,
                handle: Some(handle),
                terminated: true,
                response: None,
                tag: pq.tag,
            });
        }
        Ok(())
    }

    pub fn cancel_all(&mut self, suppress: bool) {
        for idx in 0..N {
            if let Slot::InUse(pq) = self.slots[idx] {
                // the handle is known to be pending
                let _ = self.cancel(pq.handle, suppress);
            }
        }
    }

    /// Cancel every pending query, reporting each one, and hand back the event handler.
    pub fn deinit(mut self) -> H {
        self.cancel_all(false);
        self.handler
    }

    /// Feed a received frame (if any) and the time elapsed since the previous call.
    ///
    /// Expired queries are reported before returning.
    pub fn rx_frame(&mut self, time_passed_ms: u32, frame: Option<&Frame>) {
        if let Some(frame) = frame {
            if frame.id.is_response() {
                self.handle_response(frame);
            }
        }
        self.advance(time_passed_ms);
    }

    /// Drain the driver's receive queue and advance time from the driver clock.
    pub fn process<D: Driver + ?Sized>(&mut self, driver: &mut D) -> Result<()> {
        let now = driver.get_time().as_millis();
        let mut elapsed = match self.last_poll_ms {
            Some(last) => now.saturating_sub(last).min(u32::MAX as u64) as u32,
            None => 0,
        };
        self.last_poll_ms = Some(now);

        loop {
            match driver.recv() {
                Ok(Some(frame)) => {
                    self.rx_frame(elapsed, Some(&frame));
                    elapsed = 0;
                }
                Ok(None) => break,
                Err(err) => {
                    // the elapsed time is consumed either way
                    self.rx_frame(elapsed, None);
                    return Err(err);
                }
            }
        }
        self.rx_frame(elapsed, None);
        Ok(())
    }

    fn handle_response(&mut self, frame: &Frame) {
        self.observe_passive(frame);

        let did = frame.did();
        if !did.is_broadcast() && self.is_did_pending(did) {
            if let Some(idx) = self.find_pending(did) {
                if let Slot::InUse(pq) = self.slots[idx as usize] {
                    if pq.is_response_to(frame) {
                        self.finish(idx);
                        debug!(%did, handle = pq.handle.get(), "Response {}", frame);
                        self.notify(&Event {
                            context: EventContext::Query,
                            status: status_of(frame),
                            did,
                            handle: Some(pq.handle),
                            terminated: true,
                            response: Some(*frame),
                            tag: pq.tag,
                        });
                        return;
                    }
                }
            }
        }

        if self.is_did_pending(Did::BROADCAST) {
            if let Some(idx) = self.find_pending(Did::BROADCAST) {
                if let Slot::InUse(pq) = &mut self.slots[idx as usize] {
                    if pq.is_response_to(frame) {
                        if pq.notified & did.bit() != 0 {
                            trace!(%did, "Duplicate broadcast response dropped");
                            return;
                        }
                        pq.notified |= did.bit();
                        let pq = *pq;
                        self.broadcast_response(idx, pq, frame);
                        return;
                    }
                }
            }
        }

        debug!(%did, "Orphan response {}", frame);
        self.notify(&Event {
            context: EventContext::Orphan,
            status: status_of(frame),
            did,
            handle: None,
            terminated: true,
            response: Some(*frame),
            tag: 0,
        });
    }

    fn broadcast_response(&mut self, idx: u8, pq: PendingQuery, frame: &Frame) {
        let keep = if self.discovery_owns(pq.handle) {
            self.discovery_forward(frame)
        } else {
            self.notify(&Event {
                context: EventContext::Query,
                status: status_of(frame),
                did: frame.did(),
                handle: Some(pq.handle),
                terminated: false,
                response: Some(*frame),
                tag: pq.tag,
            })
        };

        if !keep {
            debug!(handle = pq.handle.get(), "Broadcast query stopped by callback");
            self.finish(idx);
            if self.discovery_owns(pq.handle) {
                self.end_discovery("stopped by callback");
            }
        }
    }

    fn advance(&mut self, elapsed: u32) {
        self.advance_passive_discovery(elapsed);

        let mut left = elapsed;
        let mut cur = self.timeout_head;
        while left > 0 {
            let Some(idx) = cur else { break };
            let Some((delta, next)) = self.link_mut(idx) else { break };
            if *delta <= left {
                left -= *delta;
                *delta = 0;
                cur = *next;
            } else {
                *delta -= left;
                left = 0;
            }
        }

        while let Some(head) = self.timeout_head {
            match self.link(head) {
                Some((0, _)) => {}
                _ => break,
            }
            let Some(pq) = self.finish(head) else { break };
            debug!(did = %pq.did, handle = pq.handle.get(), query = %pq.query_type, "Query timed out");

            if self.discovery_owns(pq.handle) {
                self.end_discovery("query timed out");
                continue;
            }
            self.notify(&Event {
                context: EventContext::Query,
                status: EventStatus::Timeout,
                did: pq.did,
                handle: Some(pq.handle),
                terminated: true,
                response: None,
                tag: pq.tag,
            });
        }
    }

    fn notify(&mut self, event: &Event) -> bool {
        self.handler.on_event(event)
    }

    fn pending_query(&self, handle: Handle) -> Option<&PendingQuery> {
        match self.slots.get(handle.index())? {
            Slot::InUse(pq) if pq.handle == handle => Some(pq),
            _ => None,
        }
    }

    fn find_pending(&self, did: Did) -> Option<u8> {
        self.slots.iter().position(|slot| matches!(slot, Slot::InUse(pq) if pq.did == did)).map(|idx| idx as u8)
    }

    fn alloc(&mut self) -> Option<u8> {
        let idx = self.free_head?;
        self.free_head = match self.slots[idx as usize] {
            Slot::Free { next } => next,
            Slot::InUse(_) => None,
        };
        trace!(idx, "Slot allocated");
        Some(idx)
    }

    fn release(&mut self, idx: u8) {
        self.slots[idx as usize] = Slot::Free { next: self.free_head };
        self.free_head = Some(idx);
    }

    /// Remove a query from the timeout queue and the pool.
    fn finish(&mut self, idx: u8) -> Option<PendingQuery> {
        let Slot::InUse(pq) = self.slots[idx as usize] else {
            return None;
        };
        self.unschedule(idx);
        self.release(idx);
        self.pending &= !pq.did.bit();
        Some(pq)
    }

    fn link(&self, idx: u8) -> Option<(u32, Option<u8>)> {
        match self.slots[idx as usize] {
            Slot::InUse(PendingQuery {
                timeout: TimeoutLink::Queued { delta, next },
                ..
            }) => Some((delta, next)),
            _ => None,
        }
    }

    fn link_mut(&mut self, idx: u8) -> Option<(&mut u32, &mut Option<u8>)> {
        match &mut self.slots[idx as usize] {
            Slot::InUse(PendingQuery {
                timeout: TimeoutLink::Queued { delta, next },
                ..
            }) => Some((delta, next)),
            _ => None,
        }
    }

    /// Insert slot `idx` in the timeout queue, `timeout` ms from now.
    fn schedule(&mut self, idx: u8, timeout: u32) {
        let mut remaining = timeout;
        let mut prev = None;
        let mut cur = self.timeout_head;
        while let Some(c) = cur {
            let Some((delta, next)) = self.link_mut(c) else { break };
            if remaining < *delta {
                *delta -= remaining;
                break;
            }
            remaining -= *delta;
            prev = Some(c);
            cur = *next;
        }

        if let Slot::InUse(pq) = &mut self.slots[idx as usize] {
            pq.timeout = TimeoutLink::Queued {
                delta: remaining,
                next: cur,
            };
        }
        match prev {
            None => self.timeout_head = Some(idx),
            Some(p) => {
                if let Some((_, next)) = self.link_mut(p) {
                    *next = Some(idx);
                }
            }
        }
        trace!(idx, timeout, "Query scheduled");
    }

    /// Unlink slot `idx` from the timeout queue, giving its delta to its successor.
    fn unschedule(&mut self, idx: u8) {
        let Some((delta, next)) = self.link(idx) else {
            return;
        };

        let mut prev = None;
        let mut cur = self.timeout_head;
        while let Some(c) = cur {
            if c == idx {
                break;
            }
            prev = Some(c);
            cur = self.link(c).and_then(|(_, next)| next);
        }
        if cur != Some(idx) {
            return;
        }

        if let Some(n) = next {
            if let Some((next_delta, _)) = self.link_mut(n) {
                *next_delta = next_delta.saturating_add(delta);
            }
        }
        match prev {
            None => self.timeout_head = next,
            Some(p) => {
                if let Some((_, prev_next)) = self.link_mut(p) {
                    *prev_next = next;
                }
            }
        }
        if let Slot::InUse(pq) = &mut self.slots[idx as usize] {
            pq.timeout = TimeoutLink::Forever;
        }
    }
}
