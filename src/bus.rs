//! In-memory CAN bus shared by the simulated nodes.
//!
//! Every node owns a [`Port`], the [`Driver`] it hands to the protocol engine.
//! A transmitted frame is held until its send delay elapsed, then copied into
//! the receive queue of every other node, like on a real CAN segment.

use caniot_lib::error::{Error, Result};
use caniot_lib::{Driver, Frame, Timestamp};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{trace, warn};

/// Frames a node can hold before the bus starts dropping them.
const RX_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
pub struct BusStats {
    pub sent: u64,
    pub delivered: u64,
    /// Frames lost to the configured drop rate.
    pub dropped: u64,
    /// Frames lost to full receive queues.
    pub overruns: u64,
}

#[derive(Debug)]
struct InFlight {
    from: usize,
    frame: Frame,
    deliver_at_ms: u64,
}

struct BusState {
    started: Instant,
    /// Wall clock at start, in milliseconds since the epoch.
    epoch_ms: u64,
    in_flight: Vec<InFlight>,
    inboxes: Vec<VecDeque<Frame>>,
    rng: ChaCha8Rng,
    drop_rate: f64,
    stats: BusStats,
}

impl BusState {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Clone)]
pub struct SimBus(Rc<RefCell<BusState>>);

impl SimBus {
    /// `drop_rate` is the probability, in `[0, 1]`, that a frame never arrives.
    pub fn new(seed: u64, drop_rate: f64) -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        SimBus(Rc::new(RefCell::new(BusState {
            started: Instant::now(),
            epoch_ms,
            in_flight: Vec::new(),
            inboxes: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            drop_rate,
            stats: BusStats::default(),
        })))
    }

    /// Connect a new node.
    pub fn attach(&self) -> Port {
        let mut state = self.0.borrow_mut();
        state.inboxes.push(VecDeque::with_capacity(RX_QUEUE_DEPTH));
        Port {
            bus: self.clone(),
            node: state.inboxes.len() - 1,
            clock_offset_ms: 0,
        }
    }

    /// Hand the frames whose delay elapsed to every other node.
    pub fn deliver(&self) {
        let mut state = self.0.borrow_mut();
        let now = state.elapsed_ms();

        let (mut due, pending): (Vec<_>, Vec<_>) = state
            .in_flight
            .drain(..)
            .partition(|f| f.deliver_at_ms <= now);
        state.in_flight = pending;
        due.sort_by_key(|f| f.deliver_at_ms);

        for InFlight { from, frame, .. } in due {
            let drop_rate = state.drop_rate;
            if drop_rate > 0.0 && state.rng.gen_bool(drop_rate) {
                trace!(from, "Frame lost: {}", frame);
                state.stats.dropped += 1;
                continue;
            }
            for node in 0..state.inboxes.len() {
                if node == from {
                    continue;
                }
                if state.inboxes[node].len() >= RX_QUEUE_DEPTH {
                    warn!(node, "Receive queue full, frame dropped");
                    state.stats.overruns += 1;
                    continue;
                }
                state.inboxes[node].push_back(frame);
                state.stats.delivered += 1;
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        self.0.borrow().stats
    }
}

/// A node's connection to the [`SimBus`], with the node's own clock.
pub struct Port {
    bus: SimBus,
    node: usize,
    clock_offset_ms: i64,
}

impl Port {
    /// Frames waiting in this node's receive queue.
    pub fn pending(&self) -> usize {
        self.bus.0.borrow().inboxes[self.node].len()
    }

    fn bus_clock_ms(&self) -> u64 {
        let state = self.bus.0.borrow();
        state.epoch_ms + state.elapsed_ms()
    }
}

impl Driver for Port {
    fn send(&mut self, frame: &Frame, delay_ms: u32) -> Result<()> {
        let mut state = self.bus.0.borrow_mut();
        let deliver_at_ms = state.elapsed_ms() + delay_ms as u64;
        trace!(node = self.node, delay_ms, "Tx {}", frame);
        state.in_flight.push(InFlight {
            from: self.node,
            frame: *frame,
            deliver_at_ms,
        });
        state.stats.sent += 1;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Frame>> {
        Ok(self.bus.0.borrow_mut().inboxes[self.node].pop_front())
    }

    fn get_time(&self) -> Timestamp {
        let ms = self.bus_clock_ms() as i64 + self.clock_offset_ms;
        Timestamp::from_millis(ms.max(0) as u64)
    }

    fn set_time(&mut self, secs: u32) -> Result<()> {
        let target = secs as i64 * 1000;
        let current = i64::try_from(self.bus_clock_ms()).map_err(|_| Error::Driver(-1))?;
        self.clock_offset_ms = target - current;
        trace!(node = self.node, offset_ms = self.clock_offset_ms, "Clock adjusted");
        Ok(())
    }

    fn entropy(&mut self, buf: &mut [u8]) {
        self.bus.0.borrow_mut().rng.fill_bytes(buf);
    }
}
