//! # Survey Session - Ranging, Aggregation and Radio Event Handling
//!
//! A session owns the range matrix of one radio node and implements the four survey steps:
//!
//! - **request** (ranging slot, active): one-to-many ranging to every peer, result becomes
//!   this node's own row
//! - **listen** (ranging slot, passive): answers the active node's ranging request
//! - **broadcast** (broadcast slot, active): sends this node's row to all peers
//! - **receive** (broadcast slot, passive): waits for the active node's row and stores it
//!
//! ## Synchronisation
//!
//! `request` and `listen` block inside the ranging engine. `broadcast` and `receive` are
//! bracketed by the [`CompletionSync`] lock: they acquire it, arm the radio, and acquire it a
//! second time, which only succeeds once a radio event handler released it. The handlers
//! never release an available lock, which is how they tell expected completions from stray
//! events.
//!
//! ## Shared State
//!
//! Steps and handlers only take `&self`. Matrix, frame buffer, status and counters live in
//! a critical-section mutex so handlers running on another context observe a consistent
//! state. No handler allocates.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use log::{Level, log};

use crate::completion_sync::{CompletionSync, Release};
use crate::messages::broadcast_frame::{self, BROADCAST_ADDRESS, BroadcastFrame, FCNTL_IEEE_RANGE_16, SURVEY_BROADCAST_CODE, max_frame_len};
use crate::radio_devices::{EventDisposition, InterfaceId, MacInterface, RadioEventSink, RangingEngine, SharedEventSink, SurveyRadio};
use crate::range_matrix::RangeMatrix;
use crate::slot_mask::SlotMask;
use crate::{DeviceId, MAX_SURVEY_NODES, MIN_SURVEY_NODES, NodeIdentity, SurveyConfiguration, SurveyError, SurveyStats, SurveyStatus};

pub(crate) fn validate_node_count(node_count: u16) -> Result<(), SurveyError> {
    if (MIN_SURVEY_NODES..=MAX_SURVEY_NODES).contains(&(node_count as usize)) {
        Ok(())
    } else {
        Err(SurveyError::InvalidNodeCount(node_count))
    }
}

/// Matrix rows and broadcast scratch buffer, sized once for `node_count` nodes
///
/// Building a session from caller-provided storage marks it as not self-allocated: destroying
/// such a session only marks it uninitialized and keeps it available for re-creation.
pub struct SurveyStorage {
    matrix: RangeMatrix,
    frame: Vec<u8>,
}

impl SurveyStorage {
    pub fn try_new(node_count: u16) -> Result<Self, SurveyError> {
        validate_node_count(node_count)?;
        let matrix = RangeMatrix::try_new(node_count)?;
        let frame_len = max_frame_len(node_count);
        let mut frame = Vec::new();
        frame.try_reserve_exact(frame_len).map_err(|_| SurveyError::AllocationFailed)?;
        frame.resize(frame_len, 0);
        Ok(SurveyStorage { matrix, frame })
    }

    pub fn node_count(&self) -> u16 {
        self.matrix.node_count()
    }
}

struct SurveyState {
    config: SurveyConfiguration,
    matrix: RangeMatrix,
    frame: Vec<u8>,
    round_seq: u32,
    status: SurveyStatus,
    stats: SurveyStats,
}

enum PreparedBroadcast {
    Frame(usize),
    Empty,
    InvalidRow(usize),
}

/// Survey state machine of one radio node
pub struct SurveySession<R, E> {
    device: DeviceId,
    node_count: u16,
    identity: NodeIdentity,
    sync: CompletionSync,
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<SurveyState>>,
    radio: BlockingMutex<CriticalSectionRawMutex, RefCell<R>>,
    engine: AsyncMutex<CriticalSectionRawMutex, E>,
}

impl<R, E> SurveySession<R, E> {
    /// Wraps caller-owned storage. The session is not self-allocated.
    pub fn from_storage(
        device: DeviceId,
        storage: SurveyStorage,
        identity: NodeIdentity,
        config: SurveyConfiguration,
        radio: R,
        engine: E,
    ) -> Result<Self, SurveyError> {
        Self::build(device, storage, identity, config, radio, engine, false)
    }

    pub(crate) fn allocate(
        device: DeviceId,
        node_count: u16,
        identity: NodeIdentity,
        config: SurveyConfiguration,
        radio: R,
        engine: E,
    ) -> Result<Self, SurveyError> {
        let storage = SurveyStorage::try_new(node_count)?;
        Self::build(device, storage, identity, config, radio, engine, true)
    }

    fn build(
        device: DeviceId,
        storage: SurveyStorage,
        identity: NodeIdentity,
        config: SurveyConfiguration,
        radio: R,
        engine: E,
        self_allocated: bool,
    ) -> Result<Self, SurveyError> {
        let node_count = storage.node_count();
        if identity.slot_id >= node_count {
            return Err(SurveyError::SlotIdOutOfRange {
                slot_id: identity.slot_id,
                node_count,
            });
        }

        let SurveyStorage { matrix, mut frame } = storage;
        broadcast_frame::write_fixed_header(&mut frame, identity.short_address, identity.cell_id);

        Ok(SurveySession {
            device,
            node_count,
            identity,
            sync: CompletionSync::new(),
            state: BlockingMutex::new(RefCell::new(SurveyState {
                config,
                matrix,
                frame,
                round_seq: 0,
                status: SurveyStatus {
                    self_allocated,
                    ..Default::default()
                },
                stats: SurveyStats::default(),
            })),
            radio: BlockingMutex::new(RefCell::new(radio)),
            engine: AsyncMutex::new(engine),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn node_count(&self) -> u16 {
        self.node_count
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    pub fn status(&self) -> SurveyStatus {
        self.state.lock(|state| state.borrow().status)
    }

    pub fn stats(&self) -> SurveyStats {
        self.state.lock(|state| state.borrow().stats)
    }

    pub fn configuration(&self) -> SurveyConfiguration {
        self.state.lock(|state| state.borrow().config)
    }

    pub fn is_initialized(&self) -> bool {
        self.status().initialized
    }

    pub fn is_self_allocated(&self) -> bool {
        self.status().self_allocated
    }

    /// True when no broadcast or receive is waiting on the radio
    pub fn is_idle(&self) -> bool {
        self.sync.is_available()
    }

    pub fn round_seq(&self) -> u32 {
        self.state.lock(|state| state.borrow().round_seq)
    }

    /// Copy of the current matrix, rows that were not refreshed this round may be stale
    pub fn snapshot(&self) -> RangeMatrix {
        self.state.lock(|state| state.borrow().matrix.clone())
    }

    pub(crate) fn set_round_seq(&self, round_seq: u32) {
        self.state.lock(|state| state.borrow_mut().round_seq = round_seq);
    }

    pub(crate) fn apply_configuration(&self, config: SurveyConfiguration) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.config = config;
            state.status.initialized = true;
        });
    }

    pub(crate) fn mark_uninitialized(&self) {
        self.state.lock(|state| state.borrow_mut().status.initialized = false);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SurveyState) -> T) -> T {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
}

impl<R: SurveyRadio, E: RangingEngine> SurveySession<R, E> {
    pub(crate) fn register_handlers(self: &Arc<Self>)
    where
        R: Send + 'static,
        E: Send + 'static,
    {
        let sink: SharedEventSink = self.clone();
        self.radio.lock(|radio| {
            radio.borrow_mut().register_interface(MacInterface {
                id: InterfaceId::SURVEY,
                sink,
            })
        });
    }

    pub(crate) fn remove_handlers(&self) {
        self.radio.lock(|radio| radio.borrow_mut().remove_interface(InterfaceId::SURVEY));
    }

    pub(crate) fn preamble_duration(&self) -> u32 {
        self.radio.lock(|radio| radio.borrow().preamble_duration())
    }

    /// Ranges against every other node and stores the result as this node's own row
    pub async fn request(&self, dx_time: u64) -> SurveyStatus {
        let slot_id = self.identity.slot_id;
        let peers = SlotMask::all_except(self.node_count, slot_id);
        let mode = self.with_state(|state| {
            state.stats.requests += 1;
            state.status.begin_step();
            state.config.ranging_mode
        });
        log!(Level::Debug, "[{}] Survey request, peers: {:#b}", slot_id, peers.bits());

        let engine = {
            let mut engine = self.engine.lock().await;
            engine.request(BROADCAST_ADDRESS, dx_time, mode, peers).await;
            engine
        };

        let node_count = self.node_count;
        let answered = self.with_state(|state| {
            let row = state.matrix.row_mut(slot_id)?;
            let reported = engine.ranges(slot_id, row.distances_mut());
            // Higher slot ids pack last, so dropping them keeps the remaining distances aligned
            let mask = SlotMask::from_bits(reported.bits() & SlotMask::first(node_count).bits());
            if mask != reported {
                log!(Level::Trace, "[{}] Ranging reported peers beyond the survey: {:#b}", slot_id, reported.bits());
            }
            row.set_mask(mask);
            Some(mask)
        });
        drop(engine);

        if let Some(mask) = answered {
            log!(Level::Debug, "[{}] Survey request done, {} peers answered", slot_id, mask.count());
        }
        self.status()
    }

    /// Answers the active node's ranging request
    pub async fn listen(&self, dx_time: u64) -> SurveyStatus {
        self.with_state(|state| {
            state.stats.listens += 1;
            state.status.begin_step();
        });

        let mut engine = self.engine.lock().await;
        let frame_duration = self.radio.lock(|radio| radio.borrow().frame_duration(engine.request_frame_len()));
        let timeout = frame_duration.saturating_add(engine.rx_timeout_delay());
        log!(Level::Trace, "[{}] Survey listen, timeout: {}", self.identity.slot_id, timeout);
        engine.listen(dx_time, timeout).await;
        drop(engine);

        self.status()
    }

    /// Sends this node's own row to every peer
    pub async fn broadcast(&self, dx_time: u64) -> SurveyStatus {
        self.sync.acquire().await;
        let slot_id = self.identity.slot_id;
        let node_count = self.node_count;

        let prepared = self.with_state(|state| {
            state.stats.broadcasts += 1;
            state.status.begin_step();

            let Some(row) = state.matrix.row(slot_id) else {
                return PreparedBroadcast::Empty;
            };
            let mask = row.mask();
            let count = mask.count();
            state.status.empty = count == 0;
            if state.status.empty {
                return PreparedBroadcast::Empty;
            }
            if count >= node_count as usize {
                state.status.invalid_row = true;
                return PreparedBroadcast::InvalidRow(count);
            }
            match broadcast_frame::write_row(&mut state.frame, state.round_seq, slot_id, mask, row.distances()) {
                Some(length) => PreparedBroadcast::Frame(length),
                None => {
                    state.status.invalid_row = true;
                    PreparedBroadcast::InvalidRow(count)
                }
            }
        });

        let length = match prepared {
            PreparedBroadcast::Frame(length) => length,
            PreparedBroadcast::Empty => {
                log!(Level::Debug, "[{}] Survey row empty, broadcast skipped", slot_id);
                self.sync.release();
                return self.status();
            }
            PreparedBroadcast::InvalidRow(count) => {
                log!(Level::Error, "[{}] Survey row lists {} peers for {} nodes, broadcast skipped", slot_id, count, node_count);
                self.sync.release();
                return self.status();
            }
        };

        self.state.lock(|state| {
            let state = state.borrow();
            self.radio.lock(|radio| {
                let mut radio = radio.borrow_mut();
                radio.write_transmit_buffer(&state.frame[..length], 0);
                radio.set_frame_control(length, false);
            })
        });

        // Started outside the state lock: a radio may report completion synchronously
        let started = self.radio.lock(|radio| radio.borrow_mut().start_transmit(dx_time));
        match started {
            Ok(()) => {
                log!(Level::Debug, "[{}] Survey broadcast started, length: {}", slot_id, length);
                self.sync.acquire().await;
                self.sync.release();
            }
            Err(_) => {
                self.with_state(|state| {
                    state.status.start_tx_error = true;
                    state.stats.start_tx_errors += 1;
                });
                log!(Level::Warn, "[{}] Survey broadcast start tx error", slot_id);
                self.sync.release();
            }
        }
        self.status()
    }

    /// Waits for the active node's row and stores it
    pub async fn receive(&self, dx_time: u64) -> SurveyStatus {
        self.sync.acquire().await;
        let slot_id = self.identity.slot_id;

        let rx_timeout_delay = self.with_state(|state| {
            state.stats.receives += 1;
            state.status.begin_step();
            state.config.rx_timeout_delay
        });

        let started = self.radio.lock(|radio| {
            let mut radio = radio.borrow_mut();
            let timeout = radio.frame_duration(max_frame_len(self.node_count)).saturating_add(rx_timeout_delay);
            radio.start_receive(timeout, dx_time)
        });

        match started {
            Ok(()) => {
                self.sync.acquire().await;
                self.sync.release();
            }
            Err(_) => {
                self.with_state(|state| {
                    state.status.start_rx_error = true;
                    state.stats.start_rx_errors += 1;
                });
                log!(Level::Warn, "[{}] Survey receive start rx error", slot_id);
                self.sync.release();
            }
        }
        self.status()
    }
}

impl<R, E> SurveySession<R, E> {
    fn accept_broadcast(&self, frame: BroadcastFrame<'_>) -> EventDisposition {
        let slot_id = self.identity.slot_id;
        let node_count = self.node_count;
        self.with_state(|state| {
            if frame.cell_id() != self.identity.cell_id || frame.round_seq() != state.round_seq {
                log!(
                    Level::Trace,
                    "[{}] Survey frame for cell {} round {} ignored",
                    slot_id,
                    frame.cell_id(),
                    frame.round_seq()
                );
                return EventDisposition::NotMine;
            }
            if frame.len() > max_frame_len(node_count)
                || frame.slot_id() >= node_count
                || !frame.mask().fits(node_count)
                || !frame.carries_all_distances()
            {
                log!(
                    Level::Trace,
                    "[{}] Malformed survey frame from slot {}, length: {}",
                    slot_id,
                    frame.slot_id(),
                    frame.len()
                );
                return EventDisposition::Malformed;
            }
            let Some(row) = state.matrix.row_mut(frame.slot_id()) else {
                return EventDisposition::Malformed;
            };
            row.overwrite(frame.mask(), frame.distances());
            if self.sync.release() == Release::AlreadyAvailable {
                log!(Level::Trace, "[{}] Survey lock released concurrently", slot_id);
            }
            EventDisposition::Handled
        })
    }
}

impl<R, E> RadioEventSink for SurveySession<R, E> {
    fn on_rx_complete(&self, frame: &[u8]) -> EventDisposition {
        if BroadcastFrame::frame_control_of(frame) != Some(FCNTL_IEEE_RANGE_16) {
            return EventDisposition::NotMine;
        }

        if self.sync.is_available() {
            self.with_state(|state| state.stats.rx_unsolicited += 1);
            log!(Level::Trace, "[{}] Unsolicited inbound frame", self.identity.slot_id);
            return EventDisposition::NotMine;
        }

        let Some(frame) = BroadcastFrame::parse(frame) else {
            return EventDisposition::Malformed;
        };
        if frame.dst_address() != BROADCAST_ADDRESS || frame.code() != SURVEY_BROADCAST_CODE {
            return EventDisposition::NotMine;
        }

        let disposition = self.accept_broadcast(frame);
        if disposition == EventDisposition::Handled {
            log!(
                Level::Debug,
                "[{}] Survey row from slot {} accepted, {} ranges",
                self.identity.slot_id,
                frame.slot_id(),
                frame.mask().count()
            );
        }
        disposition
    }

    fn on_tx_complete(&self) -> EventDisposition {
        match self.sync.release() {
            Release::Released => EventDisposition::Handled,
            Release::AlreadyAvailable => EventDisposition::NotMine,
        }
    }

    fn on_rx_timeout(&self) -> EventDisposition {
        let released = self.with_state(|state| match self.sync.release() {
            Release::Released => {
                state.status.rx_timeout = true;
                state.stats.rx_timeouts += 1;
                true
            }
            Release::AlreadyAvailable => false,
        });
        if released {
            log!(Level::Warn, "[{}] Survey receive timeout", self.identity.slot_id);
            EventDisposition::Handled
        } else {
            EventDisposition::NotMine
        }
    }

    /// Releases a pending wait, but never consumes the reset: every interface in the chain
    /// has to observe it.
    fn on_reset(&self) -> EventDisposition {
        let released = self.with_state(|state| match self.sync.release() {
            Release::Released => {
                state.status.reset = true;
                state.stats.resets += 1;
                true
            }
            Release::AlreadyAvailable => false,
        });
        if released {
            log!(Level::Warn, "[{}] Survey wait aborted by radio reset", self.identity.slot_id);
        }
        EventDisposition::NotMine
    }
}
