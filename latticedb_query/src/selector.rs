//! Sparse result-tile selection.
//!
//! Turns the subarray's tile overlap into the candidate result tiles of each
//! flat range, deduplicated through the arena and accounted against the
//! tile-ranges memory budget.

use anyhow::Result;
use latticedb_core::{MemoryKind, MemoryTracker, NDRange};
use latticedb_storage::FragmentMetadata;
use std::sync::Arc;

use crate::result_tile::{ResultTileArena, ResultTileId};
use crate::subarray::TileOverlap;

/// The candidate tiles of one sparse read iteration.
#[derive(Debug, Default)]
pub struct SelectedTiles {
	/// Per flat range: `(tile, fully_covered)` pairs in fragment order.
	pub per_range: Vec<Vec<(ResultTileId, bool)>>,
	/// Per flat range: `true` when a single fragment contributes.
	pub single_fragment: Vec<bool>,
	/// All distinct selected tiles, in insertion order.
	pub tile_ids: Vec<ResultTileId>,
}

/// Selects the sparse result tiles for every flat range. Returns `Ok(None)`
/// when the tile-ranges budget rejects the overlap bookkeeping.
pub fn select_sparse_result_tiles(
	fragments: &[Arc<FragmentMetadata>],
	overlaps: &[Option<Vec<TileOverlap>>],
	range_num: u64,
	arena: &mut ResultTileArena,
	memory: &MemoryTracker,
) -> Result<Option<SelectedTiles>> {
	let mut selected = SelectedTiles {
		per_range: vec![Vec::new(); range_num as usize],
		single_fragment: vec![true; range_num as usize],
		tile_ids: Vec::new(),
	};
	let mut first_fragment: Vec<Option<usize>> = vec![None; range_num as usize];
	let mut reserved = 0u64;

	for (frag_idx, fragment) in fragments.iter().enumerate() {
		let frag_overlaps = match &overlaps[frag_idx] {
			Some(o) => o,
			None => continue, // dense fragment
		};
		for (r, overlap) in frag_overlaps.iter().enumerate() {
			let bookkeeping = (overlap.tile_ranges.len() + overlap.partial.len()) as u64 * 16;
			if bookkeeping > 0 && !memory.try_reserve(MemoryKind::TileRanges, bookkeeping) {
				log::debug!("tile-range bookkeeping exceeds the memory budget");
				memory.release(MemoryKind::TileRanges, reserved);
				return Ok(None);
			}
			reserved += bookkeeping;

			let mut record = |tile_idx: u64, full: bool, selected: &mut SelectedTiles| {
				let cell_num = fragment.cell_count(tile_idx);
				let known = arena.lookup(frag_idx, tile_idx).is_some();
				let id = arena.insert(frag_idx, tile_idx, cell_num);
				if !known {
					selected.tile_ids.push(id);
				}
				selected.per_range[r].push((id, full));
				match first_fragment[r] {
					Some(first) if first != frag_idx => selected.single_fragment[r] = false,
					Some(_) => {}
					None => first_fragment[r] = Some(frag_idx),
				}
			};

			for &(first, last) in &overlap.tile_ranges {
				for t in first..=last {
					record(t, true, &mut selected);
				}
			}
			for &(t, _) in &overlap.partial {
				record(t, false, &mut selected);
			}
		}
	}
	Ok(Some(selected))
}

/// `true` when the tile's MBR is fully covered by the non-empty domain of a
/// dense fragment more recent than `frag_idx`; such a tile contributes
/// nothing.
pub fn sparse_tile_overwritten(
	fragments: &[Arc<FragmentMetadata>],
	frag_idx: usize,
	mbr: &NDRange,
) -> bool {
	fragments.iter().skip(frag_idx + 1).filter(|f| f.dense).any(|newer| {
		mbr
			.iter()
			.zip(newer.non_empty_domain.iter())
			.all(|(m, ned)| ned.intersection(m).as_ref() == Some(m))
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use latticedb_core::{Datatype, TypedRange};
	use std::path::PathBuf;

	fn int_range(lo: i32, hi: i32) -> TypedRange {
		TypedRange::from_typed(Datatype::Int32, lo, hi).unwrap()
	}

	fn sparse_fragment(idx: u64, mbrs: Vec<NDRange>) -> Arc<FragmentMetadata> {
		let ned = mbrs[0].clone();
		Arc::new(FragmentMetadata::new(
			latticedb_storage::format_fragment_name(idx, idx, idx, 5),
			PathBuf::from("/tmp"),
			5,
			false,
			(idx, idx),
			vec![10; mbrs.len()],
			ned,
			mbrs,
			Vec::new(),
		))
	}

	#[test]
	fn test_selection_and_dedup() -> Result<()> {
		let fragments = vec![sparse_fragment(1, vec![vec![int_range(1, 10)], vec![int_range(11, 20)]])];
		let overlaps = vec![Some(vec![
			TileOverlap {
				tile_ranges: vec![(0, 1)],
				partial: vec![],
			},
			TileOverlap {
				tile_ranges: vec![],
				partial: vec![(1, 0.5)],
			},
		])];
		let memory = MemoryTracker::new(1 << 20);
		let mut arena = ResultTileArena::new();
		let selected =
			select_sparse_result_tiles(&fragments, &overlaps, 2, &mut arena, &memory)?.unwrap();

		assert_eq!(selected.tile_ids.len(), 2, "tile 1 is shared between ranges");
		assert_eq!(selected.per_range[0].len(), 2);
		assert_eq!(selected.per_range[1], vec![(selected.tile_ids[1], false)]);
		assert!(selected.single_fragment[0]);
		Ok(())
	}

	#[test]
	fn test_budget_rejection() -> Result<()> {
		let fragments = vec![sparse_fragment(1, vec![vec![int_range(1, 10)]])];
		let overlaps = vec![Some(vec![TileOverlap {
			tile_ranges: vec![(0, 0)],
			partial: vec![],
		}])];
		let memory = MemoryTracker::new(1);
		let mut arena = ResultTileArena::new();
		let selected = select_sparse_result_tiles(&fragments, &overlaps, 1, &mut arena, &memory)?;
		assert!(selected.is_none());
		Ok(())
	}

	fn dense_fragment(idx: u64, lo: i32, hi: i32) -> Arc<FragmentMetadata> {
		Arc::new(FragmentMetadata::new(
			latticedb_storage::format_fragment_name(idx, idx, idx, 5),
			PathBuf::from("/tmp"),
			5,
			true,
			(idx, idx),
			vec![10],
			vec![int_range(lo, hi)],
			Vec::new(),
			Vec::new(),
		))
	}

	#[test]
	fn test_sparse_tile_overwritten() {
		let old = sparse_fragment(1, vec![vec![int_range(5, 10)]]);
		let newer_dense = dense_fragment(2, 1, 20);
		let fragments = vec![old, newer_dense];
		assert!(sparse_tile_overwritten(&fragments, 0, &vec![int_range(5, 10)]));
		assert!(!sparse_tile_overwritten(&fragments, 1, &vec![int_range(5, 10)]));

		// A newer sparse fragment's bounding box does not overwrite.
		let newer_sparse = sparse_fragment(2, vec![vec![int_range(1, 20)]]);
		let fragments = vec![sparse_fragment(1, vec![vec![int_range(5, 10)]]), newer_sparse];
		assert!(!sparse_tile_overwritten(&fragments, 0, &vec![int_range(5, 10)]));

		// A narrower dense fragment does not cover the whole tile.
		let fragments = vec![
			sparse_fragment(1, vec![vec![int_range(5, 10)]]),
			dense_fragment(2, 6, 9),
		];
		assert!(!sparse_tile_overwritten(&fragments, 0, &vec![int_range(5, 10)]));
	}
}
