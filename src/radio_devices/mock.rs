//! Scriptable radio and ranging engine for unit tests

use core::cell::RefCell;
use std::sync::Arc;

use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use super::{EventDispatcher, InterfaceId, MacInterface, RadioStartError, RangingEngine, RangingMode, SharedEventSink, SurveyRadio};
use crate::slot_mask::SlotMask;

#[derive(Default)]
pub(crate) struct RadioLog {
    pub(crate) tx_buffer: Vec<u8>,
    pub(crate) frame_control_len: Option<usize>,
    pub(crate) tx_starts: Vec<u64>,
    pub(crate) rx_starts: Vec<(u16, u64)>,
    pub(crate) fail_start_tx: bool,
    pub(crate) fail_start_rx: bool,
    pub(crate) dispatcher: EventDispatcher,
}

#[derive(Clone)]
pub(crate) struct MockRadio {
    pub(crate) log: Arc<Mutex<CriticalSectionRawMutex, RefCell<RadioLog>>>,
}

impl MockRadio {
    pub(crate) fn new() -> Self {
        MockRadio {
            log: Arc::new(Mutex::new(RefCell::new(RadioLog::default()))),
        }
    }

    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut RadioLog) -> T) -> T {
        self.log.lock(|log| f(&mut log.borrow_mut()))
    }

    pub(crate) fn sink(&self) -> SharedEventSink {
        self.with(|log| log.dispatcher.sink(InterfaceId::SURVEY)).expect("survey interface registered")
    }

    pub(crate) fn tx_start_count(&self) -> usize {
        self.with(|log| log.tx_starts.len())
    }

    pub(crate) fn rx_start_count(&self) -> usize {
        self.with(|log| log.rx_starts.len())
    }

    /// Yields until the session armed the radio `count` times in total
    pub(crate) async fn armed(&self, count: usize) {
        while self.tx_start_count() + self.rx_start_count() < count {
            yield_now().await;
        }
    }
}

/// Frame duration model: 1 µs per byte plus a fixed preamble
pub(crate) const MOCK_PREAMBLE_US: u32 = 130;

impl SurveyRadio for MockRadio {
    fn write_transmit_buffer(&mut self, bytes: &[u8], offset: usize) {
        self.with(|log| {
            log.tx_buffer.resize(offset + bytes.len(), 0);
            log.tx_buffer[offset..].copy_from_slice(bytes);
        })
    }

    fn set_frame_control(&mut self, length: usize, _ranging: bool) {
        self.with(|log| log.frame_control_len = Some(length))
    }

    fn start_transmit(&mut self, delayed_start: u64) -> Result<(), RadioStartError> {
        self.with(|log| {
            if log.fail_start_tx {
                return Err(RadioStartError::StartTx);
            }
            log.tx_starts.push(delayed_start);
            Ok(())
        })
    }

    fn start_receive(&mut self, timeout: u16, delayed_start: u64) -> Result<(), RadioStartError> {
        self.with(|log| {
            if log.fail_start_rx {
                return Err(RadioStartError::StartRx);
            }
            log.rx_starts.push((timeout, delayed_start));
            Ok(())
        })
    }

    fn frame_duration(&self, length: usize) -> u16 {
        MOCK_PREAMBLE_US as u16 + length as u16
    }

    fn preamble_duration(&self) -> u32 {
        MOCK_PREAMBLE_US
    }

    fn register_interface(&mut self, interface: MacInterface) {
        self.with(|log| log.dispatcher.register(interface))
    }

    fn remove_interface(&mut self, id: InterfaceId) {
        self.with(|log| log.dispatcher.remove(id))
    }
}

#[derive(Default)]
pub(crate) struct EngineLog {
    pub(crate) requests: Vec<(u16, u64, RangingMode, SlotMask)>,
    pub(crate) listens: Vec<(u64, u16)>,
    pub(crate) result_mask: SlotMask,
    pub(crate) result_distances: Vec<f32>,
}

#[derive(Clone)]
pub(crate) struct MockEngine {
    pub(crate) log: Arc<Mutex<CriticalSectionRawMutex, RefCell<EngineLog>>>,
}

pub(crate) const MOCK_REQUEST_FRAME_LEN: usize = 18;
pub(crate) const MOCK_ENGINE_RX_TIMEOUT: u16 = 50;

impl MockEngine {
    pub(crate) fn new() -> Self {
        MockEngine {
            log: Arc::new(Mutex::new(RefCell::new(EngineLog::default()))),
        }
    }

    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut EngineLog) -> T) -> T {
        self.log.lock(|log| f(&mut log.borrow_mut()))
    }

    /// Peers that answer the next request, with their packed distances
    pub(crate) fn answer_with(&self, mask: SlotMask, distances: &[f32]) {
        self.with(|log| {
            log.result_mask = mask;
            log.result_distances = distances.to_vec();
        })
    }
}

impl RangingEngine for MockEngine {
    async fn request(&mut self, destination: u16, delayed_start: u64, mode: RangingMode, peers: SlotMask) {
        self.with(|log| log.requests.push((destination, delayed_start, mode, peers)));
        yield_now().await;
    }

    async fn listen(&mut self, delayed_start: u64, timeout: u16) {
        self.with(|log| log.listens.push((delayed_start, timeout)));
        yield_now().await;
    }

    fn ranges(&self, _slot_id: u16, distances: &mut [f32]) -> SlotMask {
        self.with(|log| {
            for (slot, value) in distances.iter_mut().zip(log.result_distances.iter()) {
                *slot = *value;
            }
            log.result_mask
        })
    }

    fn request_frame_len(&self) -> usize {
        MOCK_REQUEST_FRAME_LEN
    }

    fn rx_timeout_delay(&self) -> u16 {
        MOCK_ENGINE_RX_TIMEOUT
    }
}
