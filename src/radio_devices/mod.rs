//! Radio device interfaces
//!
//! The survey drives two external collaborators through the traits in this module:
//!
//! - [`SurveyRadio`]: transceiver primitives (transmit buffer, frame control, delayed
//!   start of transmission and reception, frame timing) plus registration of MAC event sinks
//! - [`RangingEngine`]: one-to-many two-way ranging, which owns its own completion handshake
//!
//! Radio events flow the other way through [`RadioEventSink`]. A driver keeps an
//! [`EventDispatcher`] and walks the registered sinks in order for every event.
//!
//! Implementations:
//! - `simulator`: in-memory medium for multi-node testing without hardware

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::slot_mask::SlotMask;

#[cfg(feature = "radio-device-simulator")]
pub mod simulator;

#[cfg(all(test, feature = "std"))]
pub(crate) mod mock;

/// Failure to arm the transceiver. No completion event follows a failed start.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum RadioStartError {
    StartTx,
    StartRx,
}

/// Ranging exchange flavour requested from the ranging engine
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum RangingMode {
    /// Single-sided two-way ranging, one request answered by many responders
    SingleSidedNrng,
    /// Double-sided two-way ranging, one request answered by many responders
    DoubleSidedNrng,
}

/// What a sink did with a radio event
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum EventDisposition {
    /// The event belonged to this sink and was consumed
    Handled,
    /// The event is not addressed to this sink; the dispatcher keeps looking
    NotMine,
    /// The event looked like ours but failed validation and was dropped
    Malformed,
}

/// Identifier of a MAC interface in the dispatch chain
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct InterfaceId(pub u16);

impl InterfaceId {
    pub const SURVEY: InterfaceId = InterfaceId(0x0700);
}

/// Receiver of asynchronous radio events
///
/// Handlers may run on a different execution context than the survey steps (interrupt,
/// radio task or another thread). They must not block and must not call back into the radio.
pub trait RadioEventSink {
    fn on_rx_complete(&self, frame: &[u8]) -> EventDisposition;
    fn on_tx_complete(&self) -> EventDisposition;
    fn on_rx_timeout(&self) -> EventDisposition;
    fn on_reset(&self) -> EventDisposition;
}

pub type SharedEventSink = Arc<dyn RadioEventSink + Send + Sync>;

/// One entry of the dispatch chain
#[derive(Clone)]
pub struct MacInterface {
    pub id: InterfaceId,
    pub sink: SharedEventSink,
}

/// Ordered chain of registered MAC interfaces
///
/// Registering an id that is already present replaces the earlier entry in place, so a
/// component may register repeatedly without duplicating its handlers.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    interfaces: Vec<MacInterface>,
}

impl EventDispatcher {
    pub const fn new() -> Self {
        EventDispatcher { interfaces: Vec::new() }
    }

    pub fn register(&mut self, interface: MacInterface) {
        match self.interfaces.iter_mut().find(|existing| existing.id == interface.id) {
            Some(existing) => *existing = interface,
            None => self.interfaces.push(interface),
        }
    }

    pub fn remove(&mut self, id: InterfaceId) {
        self.interfaces.retain(|existing| existing.id != id);
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    pub fn contains(&self, id: InterfaceId) -> bool {
        self.interfaces.iter().any(|existing| existing.id == id)
    }

    /// Sink registered under `id`
    pub fn sink(&self, id: InterfaceId) -> Option<SharedEventSink> {
        self.interfaces.iter().find(|existing| existing.id == id).map(|existing| existing.sink.clone())
    }

    fn dispatch(&self, event: impl Fn(&dyn RadioEventSink) -> EventDisposition) -> bool {
        self.interfaces.iter().any(|interface| event(interface.sink.as_ref()) == EventDisposition::Handled)
    }

    /// Returns true when some interface consumed the frame
    pub fn rx_complete(&self, frame: &[u8]) -> bool {
        self.dispatch(|sink| sink.on_rx_complete(frame))
    }

    pub fn tx_complete(&self) -> bool {
        self.dispatch(|sink| sink.on_tx_complete())
    }

    pub fn rx_timeout(&self) -> bool {
        self.dispatch(|sink| sink.on_rx_timeout())
    }

    pub fn reset(&self) -> bool {
        self.dispatch(|sink| sink.on_reset())
    }
}

/// Transceiver primitives used by the aggregation phase
///
/// Times are in device time units (1/65536 µs). Durations are in device microseconds.
pub trait SurveyRadio {
    /// Copies `bytes` into the transmit buffer at `offset`
    fn write_transmit_buffer(&mut self, bytes: &[u8], offset: usize);

    /// Programs the frame length of the next transmission
    fn set_frame_control(&mut self, length: usize, ranging: bool);

    /// Starts the prepared transmission at `delayed_start`. A completion is reported
    /// through `on_tx_complete` only when this returns `Ok`.
    fn start_transmit(&mut self, delayed_start: u64) -> Result<(), RadioStartError>;

    /// Starts reception at `delayed_start` with a receive timeout of `timeout` µs. Exactly one
    /// of rx-complete, rx-timeout or reset follows an `Ok`.
    fn start_receive(&mut self, timeout: u16, delayed_start: u64) -> Result<(), RadioStartError>;

    /// Air time of a frame of `length` bytes, in µs
    fn frame_duration(&self, length: usize) -> u16;

    /// Synchronisation header (preamble + SFD) duration in µs, rounded up
    fn preamble_duration(&self) -> u32;

    fn register_interface(&mut self, interface: MacInterface);

    fn remove_interface(&mut self, id: InterfaceId);
}

/// One-to-many ranging service used by the ranging phase
///
/// Both async calls return only after the exchange finished or timed out inside the engine.
pub trait RangingEngine {
    /// Sends one ranging request to `destination` at `delayed_start` addressed to `peers`
    async fn request(&mut self, destination: u16, delayed_start: u64, mode: RangingMode, peers: SlotMask);

    /// Answers one ranging request, giving up after `timeout` µs
    async fn listen(&mut self, delayed_start: u64, timeout: u16);

    /// Writes the packed ranges gathered for `slot_id` into `distances` (ascending peer
    /// order) and returns which peers answered
    fn ranges(&self, slot_id: u16, distances: &mut [f32]) -> SlotMask;

    /// Length of a ranging request frame, in bytes
    fn request_frame_len(&self) -> usize;

    /// Margin added to the listener's receive timeout, in µs
    fn rx_timeout_delay(&self) -> u16;
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct CountingSink {
        disposition: EventDisposition,
        calls: AtomicU32,
    }

    impl CountingSink {
        fn new(disposition: EventDisposition) -> Arc<Self> {
            Arc::new(CountingSink {
                disposition,
                calls: AtomicU32::new(0),
            })
        }

        fn hit(&self) -> EventDisposition {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.disposition
        }
    }

    impl RadioEventSink for CountingSink {
        fn on_rx_complete(&self, _frame: &[u8]) -> EventDisposition {
            self.hit()
        }
        fn on_tx_complete(&self) -> EventDisposition {
            self.hit()
        }
        fn on_rx_timeout(&self) -> EventDisposition {
            self.hit()
        }
        fn on_reset(&self) -> EventDisposition {
            self.hit()
        }
    }

    #[test]
    fn dispatch_stops_at_first_handler() {
        let first = CountingSink::new(EventDisposition::Malformed);
        let second = CountingSink::new(EventDisposition::Handled);
        let third = CountingSink::new(EventDisposition::Handled);

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(MacInterface { id: InterfaceId(1), sink: first.clone() });
        dispatcher.register(MacInterface { id: InterfaceId(2), sink: second.clone() });
        dispatcher.register(MacInterface { id: InterfaceId(3), sink: third.clone() });

        assert!(dispatcher.rx_complete(&[0u8; 4]));
        assert_eq!(first.calls.load(Ordering::Relaxed), 1);
        assert_eq!(second.calls.load(Ordering::Relaxed), 1);
        assert_eq!(third.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn re_registration_replaces_in_place() {
        let old = CountingSink::new(EventDisposition::NotMine);
        let new = CountingSink::new(EventDisposition::Handled);

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(MacInterface { id: InterfaceId::SURVEY, sink: old.clone() });
        dispatcher.register(MacInterface { id: InterfaceId::SURVEY, sink: new.clone() });
        assert_eq!(dispatcher.len(), 1);

        assert!(dispatcher.tx_complete());
        assert_eq!(old.calls.load(Ordering::Relaxed), 0);
        assert_eq!(new.calls.load(Ordering::Relaxed), 1);

        dispatcher.remove(InterfaceId::SURVEY);
        assert!(dispatcher.is_empty());
        assert!(!dispatcher.reset());
    }
}
