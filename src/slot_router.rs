//! # Slot Role Router
//!
//! Entry point for the TDMA slot scheduler. Every round carries one ranging slot and one
//! broadcast slot per survey; the router picks this node's role for each of them:
//!
//! | Slot      | `round_index % N == slot_id` | otherwise  |
//! |-----------|------------------------------|------------|
//! | ranging   | Requester                    | Listener   |
//! | broadcast | Broadcaster                  | Receiver   |
//!
//! Over any `N` consecutive rounds each node is active exactly once.
//!
//! ## Deadlines
//!
//! The slot start is `epoch + slot_position * slot_period / total_slots` in device time
//! units (1/65536 µs), the offset optionally corrected by a [`ClockSkew`]. The active party
//! starts exactly there. Passive parties are armed one preamble earlier so they are
//! listening before the first symbol is on air. Both deadlines are truncated to the
//! delayed-start resolution of the radio.

use alloc::sync::Arc;

use log::{Level, log};

use crate::radio_devices::{RangingEngine, SurveyRadio};
use crate::registry::SurveyRegistry;
use crate::{DeviceId, SurveyStatus};

/// Delayed-start resolution of the transceiver: the low 9 bits are ignored
const DELAYED_START_MASK: u64 = 0xFFFF_FFFF_FE00;

#[cfg(feature = "survey-verbose")]
pub const SURVEY_COMPLETE_QUEUE_SIZE: usize = 4;
#[cfg(feature = "survey-verbose")]
pub type SurveyCompleteQueue = embassy_sync::channel::Channel<embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex, SurveyComplete, SURVEY_COMPLETE_QUEUE_SIZE>;
#[cfg(feature = "survey-verbose")]
pub type SurveyCompleteQueueReceiver =
    embassy_sync::channel::Receiver<'static, embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex, SurveyComplete, SURVEY_COMPLETE_QUEUE_SIZE>;
#[cfg(feature = "survey-verbose")]
pub type SurveyCompleteQueueSender =
    embassy_sync::channel::Sender<'static, embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex, SurveyComplete, SURVEY_COMPLETE_QUEUE_SIZE>;

/// Notification queued after the last broadcast slot of a round
#[cfg(feature = "survey-verbose")]
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct SurveyComplete {
    pub device: DeviceId,
    pub round_seq: u32,
}

/// Slot event payload delivered by the slot scheduler
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct SlotEvent {
    /// Network-wide round counter
    pub round_index: u32,
    /// Position of this slot inside the round
    pub slot_position: u16,
    /// Round period, in µs
    pub slot_period: u32,
    /// Number of slots per round
    pub total_slots: u16,
    /// Start of the round, in device time units
    pub round_epoch: u64,
}

/// Clock sync correction applied to the slot offset
pub trait ClockSkew {
    /// Converts an interval of the reference clock into local device time
    fn adjust(&self, interval: u64) -> u64;
}

#[derive(Clone, Copy, Default)]
pub struct NoClockSkew;

impl ClockSkew for NoClockSkew {
    fn adjust(&self, interval: u64) -> u64 {
        interval
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum SlotRole {
    Requester,
    Listener,
    Broadcaster,
    Receiver,
}

/// What the router did in one slot
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct SlotOutcome {
    pub role: SlotRole,
    /// Delayed start handed to the radio or ranging engine
    pub deadline: u64,
    pub status: SurveyStatus,
}

/// Survey round counter: the round index without its low `mask_bits` bits
pub(crate) fn round_sequence(round_index: u32, mask_bits: u8) -> u32 {
    round_index.checked_shr(mask_bits as u32).unwrap_or(0)
}

pub(crate) fn is_active(round_index: u32, node_count: u16, slot_id: u16) -> bool {
    node_count != 0 && round_index % node_count as u32 == slot_id as u32
}

pub(crate) fn active_deadline(slot_start: u64) -> u64 {
    slot_start & DELAYED_START_MASK
}

pub(crate) fn passive_deadline(slot_start: u64, preamble_us: u32) -> u64 {
    slot_start.saturating_sub((preamble_us as u64) << 16) & DELAYED_START_MASK
}

/// Routes slot scheduler events to the survey session of one device
pub struct SlotRouter<R, E, C = NoClockSkew> {
    registry: Arc<SurveyRegistry<R, E>>,
    device: DeviceId,
    clock: C,
    #[cfg(feature = "survey-verbose")]
    complete_sender: Option<SurveyCompleteQueueSender>,
}

impl<R, E> SlotRouter<R, E, NoClockSkew> {
    pub fn new(registry: Arc<SurveyRegistry<R, E>>, device: DeviceId) -> Self {
        Self::with_clock(registry, device, NoClockSkew)
    }
}

impl<R, E, C: ClockSkew> SlotRouter<R, E, C> {
    pub fn with_clock(registry: Arc<SurveyRegistry<R, E>>, device: DeviceId, clock: C) -> Self {
        SlotRouter {
            registry,
            device,
            clock,
            #[cfg(feature = "survey-verbose")]
            complete_sender: None,
        }
    }

    /// Queues a [`SurveyComplete`] notification after the last broadcaster of every round
    #[cfg(feature = "survey-verbose")]
    pub fn notify_completion(mut self, sender: SurveyCompleteQueueSender) -> Self {
        self.complete_sender = Some(sender);
        self
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Start of the slot described by `event`, in device time units
    pub fn slot_start(&self, event: &SlotEvent) -> u64 {
        let offset = ((event.slot_period as u64) << 16)
            .saturating_mul(event.slot_position as u64)
            .checked_div(event.total_slots as u64)
            .unwrap_or(0);
        event.round_epoch.wrapping_add(self.clock.adjust(offset))
    }
}

impl<R, E, C> SlotRouter<R, E, C>
where
    R: SurveyRadio,
    E: RangingEngine,
    C: ClockSkew,
{
    /// Runs this node's part of a ranging slot
    ///
    /// Returns `None` when the device has no initialized session.
    pub async fn on_ranging_slot(&self, event: &SlotEvent) -> Option<SlotOutcome> {
        let session = self.registry.get(self.device)?;
        if !session.is_initialized() {
            log!(Level::Trace, "Ranging slot skipped, survey on device {} not initialized", self.device);
            return None;
        }
        let slot_id = session.identity().slot_id;
        session.set_round_seq(round_sequence(event.round_index, session.configuration().round_mask_bits));

        let slot_start = self.slot_start(event);
        let outcome = if is_active(event.round_index, session.node_count(), slot_id) {
            let deadline = active_deadline(slot_start);
            log!(Level::Debug, "[{}] Round {}: ranging requester, deadline: {:#x}", slot_id, event.round_index, deadline);
            SlotOutcome {
                role: SlotRole::Requester,
                deadline,
                status: session.request(deadline).await,
            }
        } else {
            let deadline = passive_deadline(slot_start, session.preamble_duration());
            log!(Level::Debug, "[{}] Round {}: ranging listener, deadline: {:#x}", slot_id, event.round_index, deadline);
            SlotOutcome {
                role: SlotRole::Listener,
                deadline,
                status: session.listen(deadline).await,
            }
        };
        Some(outcome)
    }

    /// Runs this node's part of a broadcast slot
    ///
    /// Returns `None` when the device has no initialized session.
    pub async fn on_broadcast_slot(&self, event: &SlotEvent) -> Option<SlotOutcome> {
        let session = self.registry.get(self.device)?;
        if !session.is_initialized() {
            log!(Level::Trace, "Broadcast slot skipped, survey on device {} not initialized", self.device);
            return None;
        }
        let slot_id = session.identity().slot_id;
        let node_count = session.node_count();
        session.set_round_seq(round_sequence(event.round_index, session.configuration().round_mask_bits));

        let slot_start = self.slot_start(event);
        let outcome = if is_active(event.round_index, node_count, slot_id) {
            let deadline = active_deadline(slot_start);
            log!(Level::Debug, "[{}] Round {}: broadcaster, deadline: {:#x}", slot_id, event.round_index, deadline);
            SlotOutcome {
                role: SlotRole::Broadcaster,
                deadline,
                status: session.broadcast(deadline).await,
            }
        } else {
            let deadline = passive_deadline(slot_start, session.preamble_duration());
            log!(Level::Debug, "[{}] Round {}: receiver, deadline: {:#x}", slot_id, event.round_index, deadline);
            SlotOutcome {
                role: SlotRole::Receiver,
                deadline,
                status: session.receive(deadline).await,
            }
        };

        #[cfg(feature = "survey-verbose")]
        self.queue_completion(event.round_index, node_count, slot_id, session.round_seq());

        Some(outcome)
    }

    #[cfg(feature = "survey-verbose")]
    fn queue_completion(&self, round_index: u32, node_count: u16, slot_id: u16, round_seq: u32) {
        if round_index % node_count as u32 != node_count as u32 - 1 {
            return;
        }
        let Some(sender) = &self.complete_sender else {
            return;
        };
        let complete = SurveyComplete {
            device: self.device,
            round_seq,
        };
        if sender.try_send(complete).is_err() {
            log!(Level::Warn, "[{}] Survey complete queue full, notification dropped", slot_id);
        }
    }
}
