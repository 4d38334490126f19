//! The per-query read state machine.
//!
//! Tracks the partition cursor, the per-fragment `(tile, cell)` positions,
//! the overflow/unsplittable flags and the slabs preserved across
//! incomplete iterations. Positions never move backwards: across two
//! successive non-overflow iterations either some fragment cursor or the
//! partition cursor strictly advances.

use anyhow::Result;

use crate::partitioner::{PartitionerStatus, SubarrayPartitioner};
use crate::result_tile::{ResultCellSlab, ResultTileArena};

/// Mutable state of one read query.
#[derive(Debug)]
pub struct ReadState {
	pub partitioner: SubarrayPartitioner,
	/// Per fragment: the highest `(tile index, cell position)` copied out.
	frag_cursors: Vec<(u64, u64)>,
	pub overflowed: bool,
	pub unsplittable: bool,
	pub initialized: bool,
	/// Slabs not yet copied because of an overflow; consumed first on the
	/// next iteration.
	pub pending_slabs: Vec<ResultCellSlab>,
	/// Cells of the current dense partition whose coordinates were already
	/// synthesized.
	pub dense_coords_done: u64,
}

impl ReadState {
	pub fn new(partitioner: SubarrayPartitioner, fragment_num: usize) -> Self {
		Self {
			partitioner,
			frag_cursors: vec![(0, 0); fragment_num],
			overflowed: false,
			unsplittable: false,
			initialized: true,
			pending_slabs: Vec::new(),
			dense_coords_done: 0,
		}
	}

	/// Advances the partition cursor and resets the per-partition resume
	/// cursors.
	pub fn next(&mut self) -> Result<PartitionerStatus> {
		let status = self.partitioner.next()?;
		if status == PartitionerStatus::Unsplittable {
			self.unsplittable = true;
		}
		self.dense_coords_done = 0;
		Ok(status)
	}

	/// Splits the current partition after an overflow; flags unsplittable
	/// when no split is possible.
	pub fn split_current(&mut self) -> Result<()> {
		if !self.partitioner.split_current()? {
			self.unsplittable = true;
		}
		Ok(())
	}

	pub fn done(&self) -> bool {
		self.partitioner.done() && self.pending_slabs.is_empty()
	}

	pub fn frag_cursor(&self, frag_idx: usize) -> (u64, u64) {
		self.frag_cursors[frag_idx]
	}

	/// Records the copied slabs; fragment cursors only move forward.
	pub fn record_progress(&mut self, arena: &ResultTileArena, copied: &[ResultCellSlab]) {
		for slab in copied {
			let id = match slab.tile {
				Some(id) => id,
				None => continue,
			};
			let tile = arena.get(id);
			let position = (tile.tile_idx, slab.start + slab.length);
			let cursor = &mut self.frag_cursors[tile.frag_idx];
			if position > *cursor {
				*cursor = position;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::partitioner::ResultBudget;
	use crate::subarray::Subarray;
	use latticedb_core::{
		ArraySchema, ArrayType, Attribute, CellOrder, Datatype, Dimension, Domain, Layout,
		TileOrder, TypedRange,
	};
	use std::sync::Arc;

	fn state() -> ReadState {
		let dim = Dimension::new(
			"d",
			Datatype::Int32,
			TypedRange::from_typed(Datatype::Int32, 1, 100).unwrap(),
			Some(10i32.to_le_bytes().to_vec()),
		)
		.unwrap();
		let domain = Domain::new(vec![dim], TileOrder::RowMajor, CellOrder::RowMajor).unwrap();
		let schema = Arc::new(
			ArraySchema::new(
				ArrayType::Sparse,
				domain,
				vec![Attribute::new("a", Datatype::Int32).unwrap()],
			)
			.unwrap(),
		);
		let mut subarray = Subarray::new(schema, Layout::RowMajor);
		subarray
			.add_range(0, TypedRange::from_typed(Datatype::Int32, 1, 100).unwrap())
			.unwrap();
		let mut partitioner =
			SubarrayPartitioner::new(subarray, Vec::new(), u64::MAX, u64::MAX, u64::MAX);
		partitioner.set_result_budget(
			"a",
			ResultBudget {
				fixed: u64::MAX,
				var: u64::MAX,
				validity: u64::MAX,
			},
		);
		ReadState::new(partitioner, 2)
	}

	#[test]
	fn test_cursors_are_monotonic() {
		let mut state = state();
		let mut arena = ResultTileArena::new();
		let early = arena.insert(0, 1, 10);
		let late = arena.insert(0, 3, 10);

		state.record_progress(&arena, &[ResultCellSlab::new(late, 0, 5)]);
		assert_eq!(state.frag_cursor(0), (3, 5));
		// An older slab cannot move the cursor backwards.
		state.record_progress(&arena, &[ResultCellSlab::new(early, 0, 10)]);
		assert_eq!(state.frag_cursor(0), (3, 5));
		// Fill slabs do not touch fragment cursors.
		state.record_progress(&arena, &[ResultCellSlab::fill(100)]);
		assert_eq!(state.frag_cursor(0), (3, 5));
		assert_eq!(state.frag_cursor(1), (0, 0));
	}

	#[test]
	fn test_done_requires_drained_pending() -> Result<()> {
		let mut state = state();
		assert!(!state.done());
		assert_eq!(state.next()?, PartitionerStatus::Ready);
		assert_eq!(state.next()?, PartitionerStatus::Done);
		assert!(state.done());
		state.pending_slabs.push(ResultCellSlab::fill(1));
		assert!(!state.done());
		Ok(())
	}

	#[test]
	fn test_unsplittable_flag_on_failed_split() -> Result<()> {
		let mut state = state();
		state.next()?;
		// The full domain can be split many times before this flags.
		state.split_current()?;
		assert!(!state.unsplittable);
		Ok(())
	}
}
