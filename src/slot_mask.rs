//! Fixed-width peer bitset used for range masks and ranging requests.
//!
//! Bit `i` refers to the node holding slot id `i`. The mask travels on the wire as a
//! little-endian `u32`, which bounds a survey to [`MAX_SURVEY_NODES`] nodes.

use crate::MAX_SURVEY_NODES;

/// Bitset over slot ids `0..MAX_SURVEY_NODES`
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct SlotMask(u32);

impl SlotMask {
    pub const EMPTY: SlotMask = SlotMask(0);

    pub const fn from_bits(bits: u32) -> Self {
        SlotMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Mask with the lowest `node_count` bits set
    pub const fn first(node_count: u16) -> Self {
        if node_count as usize >= MAX_SURVEY_NODES {
            SlotMask(u32::MAX)
        } else {
            SlotMask((1u32 << node_count) - 1)
        }
    }

    /// Every slot id below `node_count` except `slot_id`
    pub const fn all_except(node_count: u16, slot_id: u16) -> Self {
        Self::first(node_count).without(slot_id)
    }

    pub const fn with(self, slot_id: u16) -> Self {
        if (slot_id as usize) < MAX_SURVEY_NODES {
            SlotMask(self.0 | (1u32 << slot_id))
        } else {
            self
        }
    }

    pub const fn without(self, slot_id: u16) -> Self {
        if (slot_id as usize) < MAX_SURVEY_NODES {
            SlotMask(self.0 & !(1u32 << slot_id))
        } else {
            self
        }
    }

    pub fn set(&mut self, slot_id: u16) {
        *self = self.with(slot_id);
    }

    pub fn clear(&mut self, slot_id: u16) {
        *self = self.without(slot_id);
    }

    pub const fn contains(self, slot_id: u16) -> bool {
        (slot_id as usize) < MAX_SURVEY_NODES && self.0 & (1u32 << slot_id) != 0
    }

    /// Population count
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when no bit at or above `node_count` is set
    pub const fn fits(self, node_count: u16) -> bool {
        self.0 & !Self::first(node_count).0 == 0
    }

    /// Position of `slot_id` among the set bits, which is the index of its packed distance
    pub const fn rank(self, slot_id: u16) -> Option<usize> {
        if !self.contains(slot_id) {
            return None;
        }
        let below = self.0 & ((1u32 << slot_id) - 1);
        Some(below.count_ones() as usize)
    }

    /// Set slot ids in ascending order
    pub fn iter(self) -> SlotMaskIter {
        SlotMaskIter { remaining: self.0 }
    }
}

pub struct SlotMaskIter {
    remaining: u32,
}

impl Iterator for SlotMaskIter {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.remaining == 0 {
            return None;
        }
        let slot_id = self.remaining.trailing_zeros() as u16;
        self.remaining &= self.remaining - 1;
        Some(slot_id)
    }
}
