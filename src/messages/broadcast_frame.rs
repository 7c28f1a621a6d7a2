//! # Survey Broadcast Frame
//!
//! Wire format for distributing one node's range row to every peer.
//!
//! ## Frame Structure
//!
//! All integers are little-endian:
//! - Bytes 0-1: Protocol (PAN) id, always [`SURVEY_PAN_ID`]
//! - Bytes 2-3: Frame control, always [`FCNTL_IEEE_RANGE_16`]
//! - Bytes 4-5: Destination address, always [`BROADCAST_ADDRESS`]
//! - Bytes 6-7: Sender short address
//! - Byte 8: Frame code, always [`SURVEY_BROADCAST_CODE`]
//! - Bytes 9-10: Cell id
//! - Bytes 11-14: Round sequence number
//! - Bytes 15-16: Sender slot id
//! - Bytes 17-20: Range mask
//! - Bytes 21..: `popcount(mask)` packed `f32` distances in ascending peer order
//!
//! The header is written once at session creation; the broadcaster only refreshes the
//! round, slot and mask fields and the distance tail before each transmission.

use crate::slot_mask::SlotMask;

/// Network identifier carried in every survey frame
pub const SURVEY_PAN_ID: u16 = 0xDECA;
/// IEEE 802.15.4 data frame, 16-bit addressing, used for ranging traffic
pub const FCNTL_IEEE_RANGE_16: u16 = 0x8841;
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;
pub const SURVEY_BROADCAST_CODE: u8 = 0x31;

pub const BROADCAST_HEADER_SIZE: usize = 21;
pub const DISTANCE_SIZE: usize = core::mem::size_of::<f32>();

const PAN_ID_OFFSET: usize = 0;
const FCTRL_OFFSET: usize = 2;
const DST_OFFSET: usize = 4;
const SRC_OFFSET: usize = 6;
const CODE_OFFSET: usize = 8;
const CELL_ID_OFFSET: usize = 9;
const SEQ_OFFSET: usize = 11;
const SLOT_ID_OFFSET: usize = 15;
const MASK_OFFSET: usize = 17;

/// Largest valid frame for a survey of `node_count` nodes
pub const fn max_frame_len(node_count: u16) -> usize {
    BROADCAST_HEADER_SIZE + node_count as usize * DISTANCE_SIZE
}

/// Length of a frame carrying `distance_count` packed distances
pub const fn frame_len(distance_count: usize) -> usize {
    BROADCAST_HEADER_SIZE + distance_count * DISTANCE_SIZE
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

/// Writes the fixed part of the header. `buffer` must hold at least the header.
pub(crate) fn write_fixed_header(buffer: &mut [u8], src_address: u16, cell_id: u16) {
    buffer[PAN_ID_OFFSET..PAN_ID_OFFSET + 2].copy_from_slice(&SURVEY_PAN_ID.to_le_bytes());
    buffer[FCTRL_OFFSET..FCTRL_OFFSET + 2].copy_from_slice(&FCNTL_IEEE_RANGE_16.to_le_bytes());
    buffer[DST_OFFSET..DST_OFFSET + 2].copy_from_slice(&BROADCAST_ADDRESS.to_le_bytes());
    buffer[SRC_OFFSET..SRC_OFFSET + 2].copy_from_slice(&src_address.to_le_bytes());
    buffer[CODE_OFFSET] = SURVEY_BROADCAST_CODE;
    buffer[CELL_ID_OFFSET..CELL_ID_OFFSET + 2].copy_from_slice(&cell_id.to_le_bytes());
}

/// Fills the per-round fields and the distance tail of a frame whose fixed header is
/// already in place.
///
/// # Returns
/// The frame length, or `None` if `buffer` cannot hold `distances`
pub(crate) fn write_row(buffer: &mut [u8], round_seq: u32, slot_id: u16, mask: SlotMask, distances: &[f32]) -> Option<usize> {
    let length = frame_len(distances.len());
    if buffer.len() < length {
        return None;
    }
    buffer[SEQ_OFFSET..SEQ_OFFSET + 4].copy_from_slice(&round_seq.to_le_bytes());
    buffer[SLOT_ID_OFFSET..SLOT_ID_OFFSET + 2].copy_from_slice(&slot_id.to_le_bytes());
    buffer[MASK_OFFSET..MASK_OFFSET + 4].copy_from_slice(&mask.bits().to_le_bytes());
    for (chunk, distance) in buffer[BROADCAST_HEADER_SIZE..length].chunks_exact_mut(DISTANCE_SIZE).zip(distances) {
        chunk.copy_from_slice(&distance.to_le_bytes());
    }
    Some(length)
}

/// Borrowed view over a received survey frame
///
/// Parsing only checks that the header is present; every other check is left to the
/// receiver so each rejection can be classified separately.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct BroadcastFrame<'a> {
    bytes: &'a [u8],
}

impl<'a> BroadcastFrame<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < BROADCAST_HEADER_SIZE {
            return None;
        }
        Some(BroadcastFrame { bytes })
    }

    /// Frame control of a raw frame, read before any other validation
    pub fn frame_control_of(bytes: &[u8]) -> Option<u16> {
        if bytes.len() < FCTRL_OFFSET + 2 {
            return None;
        }
        Some(read_u16(bytes, FCTRL_OFFSET))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn pan_id(&self) -> u16 {
        read_u16(self.bytes, PAN_ID_OFFSET)
    }

    pub fn frame_control(&self) -> u16 {
        read_u16(self.bytes, FCTRL_OFFSET)
    }

    pub fn dst_address(&self) -> u16 {
        read_u16(self.bytes, DST_OFFSET)
    }

    pub fn src_address(&self) -> u16 {
        read_u16(self.bytes, SRC_OFFSET)
    }

    pub fn code(&self) -> u8 {
        self.bytes[CODE_OFFSET]
    }

    pub fn cell_id(&self) -> u16 {
        read_u16(self.bytes, CELL_ID_OFFSET)
    }

    pub fn round_seq(&self) -> u32 {
        read_u32(self.bytes, SEQ_OFFSET)
    }

    pub fn slot_id(&self) -> u16 {
        read_u16(self.bytes, SLOT_ID_OFFSET)
    }

    pub fn mask(&self) -> SlotMask {
        SlotMask::from_bits(read_u32(self.bytes, MASK_OFFSET))
    }

    /// True when the payload holds every distance the mask announces
    pub fn carries_all_distances(&self) -> bool {
        self.bytes.len() >= frame_len(self.mask().count())
    }

    /// Packed distances announced by the mask, truncated to what the payload holds
    pub fn distances(self) -> impl Iterator<Item = f32> + 'a {
        let count = self.mask().count();
        self.bytes[BROADCAST_HEADER_SIZE..]
            .chunks_exact(DISTANCE_SIZE)
            .take(count)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn encode(node_count: u16, round_seq: u32, slot_id: u16, mask: SlotMask, distances: &[f32]) -> Vec<u8> {
        let mut buffer = vec![0u8; max_frame_len(node_count)];
        write_fixed_header(&mut buffer, 0x1234, 7);
        let length = write_row(&mut buffer, round_seq, slot_id, mask, distances).unwrap();
        buffer.truncate(length);
        buffer
    }

    #[test]
    fn header_fields_round_trip() {
        let bytes = encode(4, 0xA1B2_C3D4, 2, SlotMask::from_bits(0b0101), &[1.5, 2.5]);
        assert_eq!(bytes.len(), BROADCAST_HEADER_SIZE + 8);

        let frame = BroadcastFrame::parse(&bytes).unwrap();
        assert_eq!(frame.pan_id(), SURVEY_PAN_ID);
        assert_eq!(frame.frame_control(), FCNTL_IEEE_RANGE_16);
        assert_eq!(frame.dst_address(), BROADCAST_ADDRESS);
        assert_eq!(frame.src_address(), 0x1234);
        assert_eq!(frame.code(), SURVEY_BROADCAST_CODE);
        assert_eq!(frame.cell_id(), 7);
        assert_eq!(frame.round_seq(), 0xA1B2_C3D4);
        assert_eq!(frame.slot_id(), 2);
        assert_eq!(frame.mask().bits(), 0b0101);
        assert!(frame.carries_all_distances());
        assert_eq!(frame.distances().collect::<Vec<_>>(), vec![1.5, 2.5]);
    }

    #[test]
    fn every_mask_of_a_small_survey_survives_encoding() {
        let node_count = 5u16;
        for bits in 0..(1u32 << node_count) {
            let mask = SlotMask::from_bits(bits);
            let distances: Vec<f32> = mask.iter().map(|peer| peer as f32 * 1.25 + 0.5).collect();
            let bytes = encode(node_count, bits, 0, mask, &distances);
            let frame = BroadcastFrame::parse(&bytes).unwrap();
            assert_eq!(frame.mask(), mask);
            assert_eq!(frame.distances().collect::<Vec<_>>(), distances);
        }
    }

    #[test]
    fn truncated_frames_are_detected() {
        assert!(BroadcastFrame::parse(&[0u8; BROADCAST_HEADER_SIZE - 1]).is_none());

        let mut bytes = encode(4, 1, 0, SlotMask::from_bits(0b1110), &[1.0, 2.0, 3.0]);
        bytes.truncate(bytes.len() - DISTANCE_SIZE);
        let frame = BroadcastFrame::parse(&bytes).unwrap();
        assert!(!frame.carries_all_distances());
        assert_eq!(frame.distances().count(), 2);
    }

    #[test]
    fn write_row_rejects_small_buffers() {
        let mut buffer = [0u8; BROADCAST_HEADER_SIZE + 4];
        assert_eq!(write_row(&mut buffer, 0, 0, SlotMask::from_bits(0b11), &[1.0, 2.0]), None);
        assert_eq!(write_row(&mut buffer, 0, 0, SlotMask::from_bits(0b1), &[1.0]), Some(BROADCAST_HEADER_SIZE + 4));
    }

    #[test]
    fn frame_control_is_readable_from_short_buffers() {
        assert_eq!(BroadcastFrame::frame_control_of(&[0xCA, 0xDE, 0x41, 0x88]), Some(FCNTL_IEEE_RANGE_16));
        assert_eq!(BroadcastFrame::frame_control_of(&[0xCA, 0xDE, 0x41]), None);
    }
}
