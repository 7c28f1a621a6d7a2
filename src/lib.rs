//! # MoonBlokz Survey Library
//!
//! Automatic site survey for a fleet of time-synchronised radio nodes. Over `N` rounds
//! every node takes the active role once: in its ranging slot it ranges against all peers,
//! in its broadcast slot it sends the resulting row to everyone. After a full cycle each
//! node holds the complete N×N range matrix.
//!
//! ## Architecture
//!
//! - [`SlotRouter`]: invoked by the TDMA slot scheduler, picks the role for this node
//! - [`SurveySession`]: the four survey steps plus the radio event handlers
//! - [`CompletionSync`]: binary lock that pairs blocking steps with radio completions
//! - [`RangeMatrix`]: one row per node, packed distances in ascending peer order
//! - [`SurveyRegistry`]: sessions keyed by device id
//!
//! The radio transceiver and the ranging engine are external and reached through the
//! [`SurveyRadio`] and [`RangingEngine`] traits.

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)] // Survey steps run on a single executor, Send futures are not required

extern crate alloc;

pub mod completion_sync;
pub mod messages;
pub mod radio_devices;
pub mod range_matrix;
mod registry;
mod session;
pub mod slot_mask;
mod slot_router;

pub use completion_sync::{CompletionSync, Release};
pub use messages::BroadcastFrame;
pub use radio_devices::{
    EventDispatcher, EventDisposition, InterfaceId, MacInterface, RadioEventSink, RadioStartError, RangingEngine, RangingMode, SharedEventSink,
    SurveyRadio,
};
pub use range_matrix::{RangeMatrix, RangeRow};
pub use registry::SurveyRegistry;
pub use session::{SurveySession, SurveyStorage};
pub use slot_mask::SlotMask;
#[cfg(feature = "survey-verbose")]
pub use slot_router::{SURVEY_COMPLETE_QUEUE_SIZE, SurveyComplete, SurveyCompleteQueue, SurveyCompleteQueueReceiver, SurveyCompleteQueueSender};
pub use slot_router::{ClockSkew, NoClockSkew, SlotEvent, SlotOutcome, SlotRole, SlotRouter};

/// The range mask is 32 bits wide on the wire
pub const MAX_SURVEY_NODES: usize = 32;
pub const MIN_SURVEY_NODES: usize = 2;

/// Default receive timeout margin for the broadcast receiver, in µs
pub const DEFAULT_RX_TIMEOUT_DELAY: u16 = 0x100;

/// Identifier of the radio device a session is bound to
pub type DeviceId = u32;

/// Addressing of the local node, fixed for the lifetime of a session
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct NodeIdentity {
    /// 16-bit MAC short address, written as the source of every broadcast
    pub short_address: u16,
    /// Position of this node in the survey rotation and index of its own row
    pub slot_id: u16,
    /// Network id, frames from other cells are ignored
    pub cell_id: u16,
}

/// Runtime configuration, re-applied on every session (re)creation
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct SurveyConfiguration {
    /// Margin added to the frame-sized receive timeout of the broadcast receiver, in µs
    pub rx_timeout_delay: u16,
    /// Low bits of the network round index that belong to the enclosing schedule. The
    /// survey round sequence is the index shifted right by this amount.
    pub round_mask_bits: u8,
    pub ranging_mode: RangingMode,
}

impl SurveyConfiguration {
    pub const fn new(rx_timeout_delay: u16, round_mask_bits: u8, ranging_mode: RangingMode) -> Self {
        Self {
            rx_timeout_delay,
            round_mask_bits,
            ranging_mode,
        }
    }
}

impl Default for SurveyConfiguration {
    fn default() -> Self {
        Self::new(DEFAULT_RX_TIMEOUT_DELAY, 0, RangingMode::SingleSidedNrng)
    }
}

/// Session status flags, returned by every survey step
///
/// `initialized` and `self_allocated` describe the session. The remaining flags describe
/// the last step only and are cleared when the next step starts.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct SurveyStatus {
    pub initialized: bool,
    pub self_allocated: bool,
    /// The broadcaster had no ranges to send and skipped transmission
    pub empty: bool,
    /// The broadcaster's own row announced more peers than the survey has
    pub invalid_row: bool,
    pub start_tx_error: bool,
    pub start_rx_error: bool,
    /// The wait ended with a receive timeout
    pub rx_timeout: bool,
    /// The wait was aborted by a radio reset
    pub reset: bool,
}

impl SurveyStatus {
    /// True when the last step completed without any failure flag. An empty row skips the
    /// broadcast but is not a failure.
    pub fn is_ok(&self) -> bool {
        !(self.invalid_row || self.start_tx_error || self.start_rx_error || self.rx_timeout || self.reset)
    }

    pub(crate) fn begin_step(&mut self) {
        self.empty = false;
        self.invalid_row = false;
        self.start_tx_error = false;
        self.start_rx_error = false;
        self.rx_timeout = false;
        self.reset = false;
    }
}

/// Per-session counters
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct SurveyStats {
    pub requests: u32,
    pub listens: u32,
    pub rx_unsolicited: u32,
    pub start_tx_errors: u32,
    pub start_rx_errors: u32,
    pub broadcasts: u32,
    pub receives: u32,
    pub rx_timeouts: u32,
    pub resets: u32,
}

/// Errors raised while creating or attaching a session
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum SurveyError {
    /// Node count outside `MIN_SURVEY_NODES..=MAX_SURVEY_NODES`
    InvalidNodeCount(u16),
    /// The node's own slot id does not index a row of the matrix
    SlotIdOutOfRange { slot_id: u16, node_count: u16 },
    /// A session already exists for the device with a different node count
    NodeCountMismatch { existing: u16, requested: u16 },
    /// A session already exists for the device with another slot id, cell id or address
    IdentityMismatch { existing: NodeIdentity, requested: NodeIdentity },
    /// Another session is already bound to the device
    DeviceInUse(DeviceId),
    AllocationFailed,
}

impl core::fmt::Display for SurveyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SurveyError::InvalidNodeCount(count) => {
                write!(f, "invalid node count {} (expected {}..={})", count, MIN_SURVEY_NODES, MAX_SURVEY_NODES)
            }
            SurveyError::SlotIdOutOfRange { slot_id, node_count } => {
                write!(f, "slot id {} out of range for {} nodes", slot_id, node_count)
            }
            SurveyError::NodeCountMismatch { existing, requested } => {
                write!(f, "survey already initialized with {} nodes, requested {}", existing, requested)
            }
            SurveyError::IdentityMismatch { existing, requested } => write!(
                f,
                "survey already initialized as slot {} in cell {} (address {:#06x}), requested slot {} in cell {} (address {:#06x})",
                existing.slot_id, existing.cell_id, existing.short_address, requested.slot_id, requested.cell_id, requested.short_address
            ),
            SurveyError::DeviceInUse(device) => write!(f, "device {} already has a survey session", device),
            SurveyError::AllocationFailed => write!(f, "survey storage allocation failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SurveyError {}
