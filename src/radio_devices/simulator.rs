//! # Radio Device Simulator - Shared Medium and Geometric Ranging
//!
//! In-memory stand-in for a fleet of UWB transceivers, used for multi-node testing without
//! hardware.
//!
//! ## Architecture
//!
//! - **SimulatedMedium**: shared air interface. Knows every node's position, its armed
//!   transmitter or receiver and its MAC event chain.
//! - **SimulatedRadio**: [`SurveyRadio`] implementation of one node, arming the medium
//! - **SimulatedRanging**: [`RangingEngine`] implementation of one node, returning the
//!   Euclidean distance to every reachable peer
//!
//! ## Timing Model
//!
//! Delayed starts are recorded but not waited for. The test harness drives the medium with
//! [`SimulatedMedium::run_slot`] alongside the slot handlers of all nodes: after the nodes
//! had the chance to arm their radios, every armed receiver gets the frame it heard, or a
//! timeout when it heard nothing, heard a collision or rejected the frame. Every armed
//! transmitter gets a tx-complete.
//!
//! ## Impairments
//!
//! - Nodes further apart than the radio range never hear each other
//! - A seeded random loss rate drops frames and ranging answers
//! - The next start of a node's transmitter or receiver can be forced to fail
//! - A reset can be injected into a node's event chain at any time

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{Level, log};
use rand_core::RngCore;
use rand_core::SeedableRng;
use rand_wyrand::WyRand;

use super::{EventDispatcher, InterfaceId, MacInterface, RadioStartError, RangingEngine, RangingMode, SurveyRadio};
use crate::slot_mask::SlotMask;

/// Synchronisation header duration of the simulated PHY, in µs
pub const SIM_PREAMBLE_US: u32 = 130;

/// Length of a simulated ranging request frame, in bytes
pub const SIM_REQUEST_FRAME_LEN: usize = 16;

/// Margin the simulated ranging engine adds to listener timeouts, in µs
pub const SIM_RANGING_RX_TIMEOUT: u16 = 0x80;

/// Executor turns granted to the nodes before the medium delivers
const SETTLE_YIELDS: usize = 8;

#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Point { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct MediumConfiguration {
    /// Maximum distance at which two nodes hear each other
    pub radio_range: f32,
    /// Probability of losing a frame or a ranging answer, in percent
    pub loss_percent: u8,
    pub rng_seed: u64,
}

impl Default for MediumConfiguration {
    fn default() -> Self {
        MediumConfiguration {
            radio_range: f32::INFINITY,
            loss_percent: 0,
            rng_seed: 0x5EED,
        }
    }
}

/// Counters of the medium, for test assertions
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct MediumStats {
    pub frames_sent: u32,
    pub frames_delivered: u32,
    pub frames_lost: u32,
    pub collisions: u32,
    pub rx_timeouts: u32,
    pub ranging_requests: u32,
    pub ranging_listens: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Armed {
    Idle,
    Transmit,
    Receive,
}

struct SimulatedNode {
    position: Point,
    dispatcher: EventDispatcher,
    tx_buffer: Vec<u8>,
    frame_length: usize,
    armed: Armed,
    fail_next_start_tx: bool,
    fail_next_start_rx: bool,
    ranges: Vec<f32>,
    ranges_mask: SlotMask,
}

struct MediumState {
    nodes: Vec<SimulatedNode>,
    config: MediumConfiguration,
    rng: WyRand,
    stats: MediumStats,
}

impl MediumState {
    fn lost(&mut self) -> bool {
        self.config.loss_percent > 0 && (self.rng.next_u32() % 100) < self.config.loss_percent as u32
    }

    fn reachable(&self, from: usize, to: usize) -> bool {
        from != to && self.nodes[from].position.distance(&self.nodes[to].position) <= self.config.radio_range
    }
}

enum Delivery {
    Frame(Vec<u8>),
    Timeout,
    TxComplete,
}

/// Shared medium of a simulated fleet, node `i` holds slot id `i`
pub struct SimulatedMedium {
    state: Mutex<CriticalSectionRawMutex, RefCell<MediumState>>,
}

impl SimulatedMedium {
    pub fn new(positions: &[Point], config: MediumConfiguration) -> Arc<Self> {
        let nodes = positions
            .iter()
            .map(|position| SimulatedNode {
                position: *position,
                dispatcher: EventDispatcher::new(),
                tx_buffer: Vec::new(),
                frame_length: 0,
                armed: Armed::Idle,
                fail_next_start_tx: false,
                fail_next_start_rx: false,
                ranges: vec![0.0; positions.len()],
                ranges_mask: SlotMask::EMPTY,
            })
            .collect();
        Arc::new(SimulatedMedium {
            state: Mutex::new(RefCell::new(MediumState {
                nodes,
                config,
                rng: WyRand::seed_from_u64(config.rng_seed),
                stats: MediumStats::default(),
            })),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut MediumState) -> T) -> T {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }

    pub fn node_count(&self) -> usize {
        self.with(|state| state.nodes.len())
    }

    pub fn radio(self: &Arc<Self>, slot_id: u16) -> SimulatedRadio {
        SimulatedRadio {
            medium: self.clone(),
            node: slot_id as usize,
        }
    }

    pub fn ranging(self: &Arc<Self>, slot_id: u16) -> SimulatedRanging {
        SimulatedRanging {
            medium: self.clone(),
            node: slot_id as usize,
        }
    }

    pub fn stats(&self) -> MediumStats {
        self.with(|state| state.stats)
    }

    pub fn set_loss_percent(&self, loss_percent: u8) {
        self.with(|state| state.config.loss_percent = loss_percent.min(100));
    }

    pub fn move_node(&self, slot_id: u16, position: Point) {
        self.with(|state| {
            if let Some(node) = state.nodes.get_mut(slot_id as usize) {
                node.position = position;
            }
        });
    }

    /// The next `start_transmit` of the node fails
    pub fn fail_next_start_tx(&self, slot_id: u16) {
        self.with(|state| {
            if let Some(node) = state.nodes.get_mut(slot_id as usize) {
                node.fail_next_start_tx = true;
            }
        });
    }

    /// The next `start_receive` of the node fails
    pub fn fail_next_start_rx(&self, slot_id: u16) {
        self.with(|state| {
            if let Some(node) = state.nodes.get_mut(slot_id as usize) {
                node.fail_next_start_rx = true;
            }
        });
    }

    /// Disarms the node and walks its event chain with a reset
    pub fn inject_reset(&self, slot_id: u16) {
        let dispatcher = self.with(|state| {
            let node = state.nodes.get_mut(slot_id as usize)?;
            node.armed = Armed::Idle;
            Some(node.dispatcher.clone())
        });
        if let Some(dispatcher) = dispatcher {
            log!(Level::Debug, "[{}] Simulated radio reset", slot_id);
            dispatcher.reset();
        }
    }

    /// Lets the nodes arm their radios, then resolves the slot
    pub async fn run_slot(&self) {
        for _ in 0..SETTLE_YIELDS {
            yield_now().await;
        }
        for (node, dispatcher, delivery) in self.resolve() {
            match delivery {
                Delivery::Frame(frame) => {
                    if !dispatcher.rx_complete(&frame) {
                        log!(Level::Trace, "[{}] Simulated frame not consumed, timing out", node);
                        self.with(|state| state.stats.rx_timeouts += 1);
                        dispatcher.rx_timeout();
                    }
                }
                Delivery::Timeout => {
                    dispatcher.rx_timeout();
                }
                Delivery::TxComplete => {
                    dispatcher.tx_complete();
                }
            }
        }
    }

    /// Decides what every armed node observes. Sinks are called by the caller, outside the
    /// medium lock.
    fn resolve(&self) -> Vec<(usize, EventDispatcher, Delivery)> {
        self.with(|state| {
            let transmitters: Vec<usize> = (0..state.nodes.len()).filter(|&node| state.nodes[node].armed == Armed::Transmit).collect();
            let receivers: Vec<usize> = (0..state.nodes.len()).filter(|&node| state.nodes[node].armed == Armed::Receive).collect();
            state.stats.frames_sent += transmitters.len() as u32;

            let mut deliveries = Vec::with_capacity(transmitters.len() + receivers.len());
            for &receiver in &receivers {
                let mut heard = Vec::new();
                for &transmitter in &transmitters {
                    if !state.reachable(transmitter, receiver) {
                        continue;
                    }
                    if state.lost() {
                        state.stats.frames_lost += 1;
                        continue;
                    }
                    heard.push(transmitter);
                }
                let delivery = match heard.as_slice() {
                    [transmitter] => {
                        let node = &state.nodes[*transmitter];
                        state.stats.frames_delivered += 1;
                        Delivery::Frame(node.tx_buffer[..node.frame_length.min(node.tx_buffer.len())].to_vec())
                    }
                    [] => {
                        state.stats.rx_timeouts += 1;
                        Delivery::Timeout
                    }
                    _ => {
                        state.stats.collisions += 1;
                        state.stats.rx_timeouts += 1;
                        Delivery::Timeout
                    }
                };
                deliveries.push((receiver, state.nodes[receiver].dispatcher.clone(), delivery));
            }
            for &transmitter in &transmitters {
                deliveries.push((transmitter, state.nodes[transmitter].dispatcher.clone(), Delivery::TxComplete));
            }

            for node in state.nodes.iter_mut() {
                node.armed = Armed::Idle;
            }
            deliveries
        })
    }
}

/// Transceiver of one simulated node
pub struct SimulatedRadio {
    medium: Arc<SimulatedMedium>,
    node: usize,
}

impl SimulatedRadio {
    fn with_node<T>(&self, f: impl FnOnce(&mut SimulatedNode) -> T) -> Option<T> {
        self.medium.with(|state| state.nodes.get_mut(self.node).map(f))
    }
}

impl SurveyRadio for SimulatedRadio {
    fn write_transmit_buffer(&mut self, bytes: &[u8], offset: usize) {
        self.with_node(|node| {
            if node.tx_buffer.len() < offset + bytes.len() {
                node.tx_buffer.resize(offset + bytes.len(), 0);
            }
            node.tx_buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
        });
    }

    fn set_frame_control(&mut self, length: usize, _ranging: bool) {
        self.with_node(|node| node.frame_length = length);
    }

    fn start_transmit(&mut self, _delayed_start: u64) -> Result<(), RadioStartError> {
        let started = self.with_node(|node| {
            if core::mem::take(&mut node.fail_next_start_tx) {
                return false;
            }
            node.armed = Armed::Transmit;
            true
        });
        match started {
            Some(true) => Ok(()),
            _ => Err(RadioStartError::StartTx),
        }
    }

    fn start_receive(&mut self, _timeout: u16, _delayed_start: u64) -> Result<(), RadioStartError> {
        let started = self.with_node(|node| {
            if core::mem::take(&mut node.fail_next_start_rx) {
                return false;
            }
            node.armed = Armed::Receive;
            true
        });
        match started {
            Some(true) => Ok(()),
            _ => Err(RadioStartError::StartRx),
        }
    }

    /// Preamble plus payload at 6.8 Mbps
    fn frame_duration(&self, length: usize) -> u16 {
        let payload_us = (length as u32 * 80).div_ceil(68);
        u16::try_from(SIM_PREAMBLE_US + payload_us).unwrap_or(u16::MAX)
    }

    fn preamble_duration(&self) -> u32 {
        SIM_PREAMBLE_US
    }

    fn register_interface(&mut self, interface: MacInterface) {
        self.with_node(|node| node.dispatcher.register(interface));
    }

    fn remove_interface(&mut self, id: InterfaceId) {
        self.with_node(|node| node.dispatcher.remove(id));
    }
}

/// Ranging engine of one simulated node
pub struct SimulatedRanging {
    medium: Arc<SimulatedMedium>,
    node: usize,
}

impl RangingEngine for SimulatedRanging {
    async fn request(&mut self, _destination: u16, _delayed_start: u64, _mode: RangingMode, peers: SlotMask) {
        yield_now().await;
        let node = self.node;
        self.medium.with(|state| {
            state.stats.ranging_requests += 1;
            let mut mask = SlotMask::EMPTY;
            let mut ranges = Vec::new();
            for peer in peers.iter() {
                let peer = peer as usize;
                if peer >= state.nodes.len() || !state.reachable(node, peer) || state.lost() {
                    continue;
                }
                mask.set(peer as u16);
                ranges.push(state.nodes[node].position.distance(&state.nodes[peer].position));
            }
            if let Some(own) = state.nodes.get_mut(node) {
                own.ranges_mask = mask;
                own.ranges.clear();
                own.ranges.extend_from_slice(&ranges);
            }
        });
    }

    async fn listen(&mut self, _delayed_start: u64, _timeout: u16) {
        self.medium.with(|state| state.stats.ranging_listens += 1);
        yield_now().await;
    }

    fn ranges(&self, slot_id: u16, distances: &mut [f32]) -> SlotMask {
        self.medium.with(|state| {
            let Some(node) = state.nodes.get(slot_id as usize) else {
                return SlotMask::EMPTY;
            };
            for (slot, range) in distances.iter_mut().zip(node.ranges.iter()) {
                *slot = *range;
            }
            node.ranges_mask
        })
    }

    fn request_frame_len(&self) -> usize {
        SIM_REQUEST_FRAME_LEN
    }

    fn rx_timeout_delay(&self) -> u16 {
        SIM_RANGING_RX_TIMEOUT
    }
}
