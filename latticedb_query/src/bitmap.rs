//! Per-tile result bitmaps: range intersection and overwrite visibility.

use anyhow::Result;
use latticedb_core::{CellOrder, TypedRange};
use latticedb_storage::{CoordTileView, FragmentMetadata};
use std::sync::Arc;

/// Computes the mask of one resolved flat range (`None` entries are
/// unconstrained dimensions).
///
/// Dimensions are visited in cell order (reversed for col-major), narrowing
/// the mask one dimension at a time.
pub fn compute_range_bitmap(
	view: &CoordTileView,
	nd: &[Option<TypedRange>],
	cell_order: CellOrder,
) -> Result<Vec<u8>> {
	let cell_num = view.cell_num();
	let dim_num = view.dim_num();
	let mut mask = vec![1u8; cell_num as usize];
	for i in 0..dim_num {
		let d = if cell_order == CellOrder::ColMajor { dim_num - i - 1 } else { i };
		let range = match &nd[d] {
			Some(range) => range,
			None => continue,
		};
		for cell in 0..cell_num {
			if mask[cell as usize] != 0 && !range.contains(view.coord(cell, d)?) {
				mask[cell as usize] = 0;
			}
		}
	}
	Ok(mask)
}

/// Computes the mask over every range of every dimension: a cell passes a
/// dimension when any of its ranges contains the coordinate.
pub fn compute_mask_bitmap(
	view: &CoordTileView,
	ranges_per_dim: &[Vec<Option<TypedRange>>],
	cell_order: CellOrder,
) -> Result<Vec<u8>> {
	let cell_num = view.cell_num();
	let dim_num = view.dim_num();
	let mut mask = vec![1u8; cell_num as usize];
	for i in 0..dim_num {
		let d = if cell_order == CellOrder::ColMajor { dim_num - i - 1 } else { i };
		if ranges_per_dim[d].iter().any(Option::is_none) {
			continue;
		}
		for cell in 0..cell_num {
			if mask[cell as usize] == 0 {
				continue;
			}
			let coord = view.coord(cell, d)?;
			let contained = ranges_per_dim[d]
				.iter()
				.flatten()
				.any(|range| range.contains(coord));
			if !contained {
				mask[cell as usize] = 0;
			}
		}
	}
	Ok(mask)
}

/// Computes per-cell counts over every range (for duplicate-materializing
/// reads with overlapping ranges): the count is the product over dimensions
/// of the number of containing ranges, saturating at `u8::MAX`.
pub fn compute_count_bitmap(
	view: &CoordTileView,
	ranges_per_dim: &[Vec<Option<TypedRange>>],
) -> Result<Vec<u8>> {
	let cell_num = view.cell_num();
	let dim_num = view.dim_num();
	let mut counts = vec![1u64; cell_num as usize];
	for d in 0..dim_num {
		if ranges_per_dim[d].iter().any(Option::is_none) {
			continue;
		}
		for cell in 0..cell_num {
			if counts[cell as usize] == 0 {
				continue;
			}
			let coord = view.coord(cell, d)?;
			let containing = ranges_per_dim[d]
				.iter()
				.flatten()
				.filter(|range| range.contains(coord))
				.count() as u64;
			counts[cell as usize] *= containing;
		}
	}
	Ok(counts.into_iter().map(|c| c.min(u8::MAX as u64) as u8).collect())
}

/// Removes cells overwritten by more recent dense fragments: a cell is
/// dropped when any dense fragment newer than `frag_idx` has a non-empty
/// domain covering it (dense fragments materialize their whole domain;
/// sparse coexistence is resolved later by the merge's recency rule). Used
/// for sparse tiles of dense arrays.
pub fn apply_overwritten(
	view: &CoordTileView,
	frag_idx: usize,
	fragments: &[Arc<FragmentMetadata>],
	mask: &mut [u8],
) -> Result<()> {
	let newer: Vec<&Arc<FragmentMetadata>> = fragments
		.iter()
		.skip(frag_idx + 1)
		.filter(|f| f.dense)
		.collect();
	if newer.is_empty() {
		return Ok(());
	}
	let dim_num = view.dim_num();
	for cell in 0..view.cell_num() {
		if mask[cell as usize] == 0 {
			continue;
		}
		for fragment in &newer {
			let mut covered = true;
			for d in 0..dim_num {
				if !fragment.non_empty_domain[d].contains(view.coord(cell, d)?) {
					covered = false;
					break;
				}
			}
			if covered {
				mask[cell as usize] = 0;
				break;
			}
		}
	}
	Ok(())
}
