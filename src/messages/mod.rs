//! # Messages Module
//!
//! Wire formats exchanged by survey nodes. Ranging request/response frames belong to the
//! ranging engine; the only frame this crate owns is the aggregation-phase broadcast that
//! carries one node's range row to every peer.

pub mod broadcast_frame;

pub use broadcast_frame::{
    BROADCAST_ADDRESS, BROADCAST_HEADER_SIZE, BroadcastFrame, DISTANCE_SIZE, FCNTL_IEEE_RANGE_16, SURVEY_BROADCAST_CODE, SURVEY_PAN_ID,
    max_frame_len,
};
