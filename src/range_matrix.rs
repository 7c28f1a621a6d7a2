//! # Range Matrix - Per-Node Survey Rows
//!
//! The range matrix holds one [`RangeRow`] per node of the survey, indexed by that node's
//! slot id. A row describes the distances *measured by* that node to its peers.
//!
//! ## Row Layout
//!
//! - `mask`: bit `i` set iff a valid range to peer `i` is present
//! - `distances`: packed values in ascending peer order; only the first
//!   `mask.count()` entries are meaningful
//!
//! The packed layout is the same one used on the wire, so a row can be copied into a
//! broadcast frame and back without reordering.
//!
//! ## Allocation
//!
//! All storage is reserved once, when the matrix is created, sized for `node_count` peers.
//! Row writes never allocate, which keeps the radio event path allocation free.

use alloc::vec::Vec;

use crate::SurveyError;
use crate::slot_mask::SlotMask;

/// Distances measured by one node to its peers
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RangeRow {
    mask: SlotMask,
    distances: Vec<f32>,
}

impl RangeRow {
    fn try_new(node_count: u16) -> Result<Self, SurveyError> {
        let mut distances = Vec::new();
        distances
            .try_reserve_exact(node_count as usize)
            .map_err(|_| SurveyError::AllocationFailed)?;
        distances.resize(node_count as usize, 0.0);
        Ok(RangeRow {
            mask: SlotMask::EMPTY,
            distances,
        })
    }

    pub fn mask(&self) -> SlotMask {
        self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// Packed distances, one per set bit of the mask
    pub fn distances(&self) -> &[f32] {
        &self.distances[..self.mask.count().min(self.distances.len())]
    }

    /// Distance to `peer`, if this row holds a valid range to it
    pub fn distance_to(&self, peer: u16) -> Option<f32> {
        self.mask.rank(peer).and_then(|index| self.distances.get(index).copied())
    }

    /// `(peer, distance)` pairs in ascending peer order
    pub fn iter(&self) -> impl Iterator<Item = (u16, f32)> + '_ {
        self.mask.iter().zip(self.distances.iter().copied())
    }

    /// Replaces the whole row. Values beyond the row capacity are dropped and unused
    /// trailing entries are zeroed so nothing from an earlier round survives.
    pub(crate) fn overwrite(&mut self, mask: SlotMask, values: impl IntoIterator<Item = f32>) {
        self.mask = mask;
        let mut written = 0;
        for (slot, value) in self.distances.iter_mut().zip(values) {
            *slot = value;
            written += 1;
        }
        self.distances[written..].fill(0.0);
    }

    /// Scratch access for ranging engines that fill packed results in place
    pub(crate) fn distances_mut(&mut self) -> &mut [f32] {
        &mut self.distances
    }

    pub(crate) fn set_mask(&mut self, mask: SlotMask) {
        self.mask = mask;
        let count = mask.count().min(self.distances.len());
        self.distances[count..].fill(0.0);
    }
}

/// N×N survey result: one row per node, indexed by slot id
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RangeMatrix {
    rows: Vec<RangeRow>,
}

impl RangeMatrix {
    /// Allocates `node_count` zero-filled rows
    pub fn try_new(node_count: u16) -> Result<Self, SurveyError> {
        let mut rows = Vec::new();
        rows.try_reserve_exact(node_count as usize)
            .map_err(|_| SurveyError::AllocationFailed)?;
        for _ in 0..node_count {
            rows.push(RangeRow::try_new(node_count)?);
        }
        Ok(RangeMatrix { rows })
    }

    pub fn node_count(&self) -> u16 {
        self.rows.len() as u16
    }

    pub fn row(&self, slot_id: u16) -> Option<&RangeRow> {
        self.rows.get(slot_id as usize)
    }

    pub(crate) fn row_mut(&mut self, slot_id: u16) -> Option<&mut RangeRow> {
        self.rows.get_mut(slot_id as usize)
    }

    pub fn rows(&self) -> impl Iterator<Item = &RangeRow> {
        self.rows.iter()
    }

    /// Distance measured by `from` to `to`
    pub fn distance(&self, from: u16, to: u16) -> Option<f32> {
        self.row(from).and_then(|row| row.distance_to(to))
    }

    /// Number of rows holding at least one range
    pub fn populated_rows(&self) -> usize {
        self.rows.iter().filter(|row| !row.is_empty()).count()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn new_matrix_has_one_empty_row_per_node() {
        for node_count in 2..=8u16 {
            let matrix = RangeMatrix::try_new(node_count).unwrap();
            assert_eq!(matrix.node_count(), node_count);
            assert_eq!(matrix.rows().count(), node_count as usize);
            assert!(matrix.rows().all(|row| row.mask().is_empty() && row.distances().is_empty()));
            assert_eq!(matrix.populated_rows(), 0);
        }
    }

    #[test]
    fn overwrite_replaces_previous_round() {
        let mut matrix = RangeMatrix::try_new(4).unwrap();
        let row = matrix.row_mut(2).unwrap();
        row.overwrite(SlotMask::from_bits(0b1011), [1.0, 2.0, 3.0]);
        assert_eq!(row.distances(), &[1.0, 2.0, 3.0]);

        row.overwrite(SlotMask::from_bits(0b0001), [7.5]);
        assert_eq!(row.distances(), &[7.5]);
        assert_eq!(row.distance_to(0), Some(7.5));
        assert_eq!(row.distance_to(1), None);
        assert_eq!(row.distance_to(3), None);
    }

    #[test]
    fn distance_lookup_uses_packed_order() {
        let mut matrix = RangeMatrix::try_new(4).unwrap();
        matrix.row_mut(1).unwrap().overwrite(SlotMask::from_bits(0b1101), [10.0, 20.0, 30.0]);
        assert_eq!(matrix.distance(1, 0), Some(10.0));
        assert_eq!(matrix.distance(1, 2), Some(20.0));
        assert_eq!(matrix.distance(1, 3), Some(30.0));
        assert_eq!(matrix.distance(1, 1), None);
        assert_eq!(matrix.distance(9, 0), None);
        let pairs: Vec<_> = matrix.row(1).unwrap().iter().collect();
        assert_eq!(pairs, vec![(0, 10.0), (2, 20.0), (3, 30.0)]);
    }
}
