//! The dense cell-slab iterator.
//!
//! Walks a dense partition in its layout, one fast-dimension segment at a
//! time, and resolves every run against the result space tiles: a run comes
//! from the most recent contributing dense fragment, from a sparse result
//! cell, or from nowhere (a fill run). State is an explicit flat-range
//! cursor, row odometer and fast-dimension cursor, so the iterator is
//! plainly resumable.

use anyhow::{Context, Result, bail};
use latticedb_core::{ArraySchema, CellOrder, Domain, Layout, value_to_i128};
use std::collections::{BTreeMap, VecDeque};

use crate::result_tile::{ResultCellSlab, ResultCoords, ResultTileArena, ResultTileId};
use crate::space_tiles::ResultSpaceTile;
use crate::subarray::Subarray;

/// One surviving sparse result cell of a dense read, with decoded
/// coordinates.
#[derive(Debug, Clone)]
pub struct SparseCell {
	pub coords: Vec<i128>,
	pub tile: ResultTileId,
	pub pos: u64,
}

/// Decodes sparse result coordinates into `i128` cells (dense domains are
/// integral).
pub fn decode_sparse_cells(
	arena: &ResultTileArena,
	schema: &ArraySchema,
	coords: &[ResultCoords],
) -> Result<Vec<SparseCell>> {
	let domain = schema.domain();
	let mut cells = Vec::with_capacity(coords.len());
	for rc in coords.iter().filter(|rc| rc.valid) {
		let tile = arena.get(rc.tile);
		let view = tile.coords_view(schema)?;
		let mut decoded = Vec::with_capacity(domain.dim_num());
		for d in 0..domain.dim_num() {
			decoded.push(value_to_i128(
				domain.dimension(d).datatype(),
				view.coord(rc.pos, d)?,
			)?);
		}
		cells.push(SparseCell {
			coords: decoded,
			tile: rc.tile,
			pos: rc.pos,
		});
	}
	Ok(cells)
}

/// Lazily emits the result cell slabs of one dense partition.
pub struct DenseCellSlabIter<'a> {
	domain: &'a Domain,
	space_tiles: &'a BTreeMap<Vec<u64>, ResultSpaceTile>,
	sparse_cells: &'a [SparseCell],
	sparse_pos: usize,
	layout: Layout,
	fast_dim: usize,
	contiguous: bool,
	/// Per flat range, per dimension: inclusive `i128` bounds.
	flat_ranges: Vec<Vec<(i128, i128)>>,
	flat_idx: usize,
	row: Vec<i128>,
	row_active: bool,
	cursor: i128,
	pending: VecDeque<ResultCellSlab>,
	done: bool,
}

impl<'a> DenseCellSlabIter<'a> {
	pub fn new(
		partition: &Subarray,
		schema: &'a ArraySchema,
		space_tiles: &'a BTreeMap<Vec<u64>, ResultSpaceTile>,
		sparse_cells: &'a [SparseCell],
		sparse_pos: usize,
	) -> Result<Self> {
		let domain = schema.domain();
		let layout = match partition.layout() {
			Layout::RowMajor | Layout::GlobalOrder => Layout::RowMajor,
			Layout::ColMajor => Layout::ColMajor,
			Layout::Unordered => bail!("dense reads do not support the unordered layout"),
		};
		let dim_num = domain.dim_num();
		let fast_dim = if layout == Layout::ColMajor { 0 } else { dim_num - 1 };
		let cell_order = domain.cell_order();
		let contiguous = dim_num == 1
			|| (layout == Layout::RowMajor && cell_order == CellOrder::RowMajor)
			|| (layout == Layout::ColMajor && cell_order == CellOrder::ColMajor);

		let mut flat_ranges = Vec::with_capacity(partition.flat_range_num() as usize);
		for flat in 0..partition.flat_range_num() {
			let nd = partition.flat_range(flat)?;
			let mut bounds = Vec::with_capacity(dim_num);
			for (d, range) in nd.into_iter().enumerate() {
				let range = range.context("dense subarrays have bounded dimensions")?;
				let datatype = domain.dimension(d).datatype();
				bounds.push((
					value_to_i128(datatype, range.start_bytes())?,
					value_to_i128(datatype, range.end_bytes())?,
				));
			}
			flat_ranges.push(bounds);
		}

		Ok(Self {
			domain,
			space_tiles,
			sparse_cells,
			sparse_pos,
			layout,
			fast_dim,
			contiguous,
			flat_ranges,
			flat_idx: 0,
			row: vec![0; dim_num],
			row_active: false,
			cursor: 0,
			pending: VecDeque::new(),
			done: false,
		})
	}

	/// The sparse-cell cursor after iteration; successive partitions resume
	/// from here.
	pub fn sparse_pos(&self) -> usize {
		self.sparse_pos
	}

	/// The non-fast dimensions in odometer order, innermost first.
	fn odometer_dims(&self) -> Vec<usize> {
		let dim_num = self.domain.dim_num();
		match self.layout {
			Layout::ColMajor => (1..dim_num).collect(),
			_ => (0..dim_num.saturating_sub(1)).rev().collect(),
		}
	}

	fn start_flat_range(&mut self) -> bool {
		while self.flat_idx < self.flat_ranges.len() {
			let bounds = &self.flat_ranges[self.flat_idx];
			if bounds.iter().all(|(lo, hi)| lo <= hi) {
				self.row = bounds.iter().map(|(lo, _)| *lo).collect();
				self.cursor = bounds[self.fast_dim].0;
				self.row_active = true;
				return true;
			}
			self.flat_idx += 1;
		}
		self.done = true;
		false
	}

	/// Advances the row odometer; `false` when the flat range is exhausted.
	fn advance_row(&mut self) -> bool {
		let bounds = self.flat_ranges[self.flat_idx].clone();
		for d in self.odometer_dims() {
			if self.row[d] < bounds[d].1 {
				self.row[d] += 1;
				self.cursor = bounds[self.fast_dim].0;
				return true;
			}
			self.row[d] = bounds[d].0;
		}
		false
	}

	/// Produces the slabs of the next fast-dimension segment.
	fn produce_segment(&mut self) -> Result<()> {
		let bounds = &self.flat_ranges[self.flat_idx];
		let fast_hi_range = bounds[self.fast_dim].1;

		// Clip the segment at the fast dimension's tile boundary.
		let extent = self.domain.dimension(self.fast_dim).tile_extent_i128()?;
		let tile_idx = self.domain.tile_index(self.fast_dim, self.cursor)?;
		let tile_end = self.domain.tile_start(self.fast_dim, tile_idx)? + extent - 1;
		let seg_hi = fast_hi_range.min(tile_end);

		let mut tile_coords = Vec::with_capacity(self.row.len());
		for d in 0..self.row.len() {
			let v = if d == self.fast_dim { self.cursor } else { self.row[d] };
			tile_coords.push(self.domain.tile_index(d, v)?);
		}
		let space_tiles = self.space_tiles;
		let space_tile = space_tiles
			.get(&tile_coords)
			.context("partition touches a tile without a result space tile")?;
		let sparse_cells = self.sparse_cells;

		let seg_lo = self.cursor;
		let mut cur = seg_lo;
		while cur <= seg_hi {
			// A sparse cell inside the remaining run interrupts it; the
			// stream is sorted in the iteration order, so only its front
			// can fall here.
			let mut interrupt: Option<&SparseCell> = None;
			if let Some(sc) = sparse_cells.get(self.sparse_pos) {
				let row_matches = sc
					.coords
					.iter()
					.enumerate()
					.all(|(d, &v)| d == self.fast_dim || v == self.row[d]);
				if row_matches && sc.coords[self.fast_dim] >= cur && sc.coords[self.fast_dim] <= seg_hi {
					interrupt = Some(sc);
				}
			}

			let run_end = interrupt.map_or(seg_hi, |sc| (sc.coords[self.fast_dim] - 1).min(seg_hi));
			if cur <= run_end {
				self.resolve_dense_run(space_tile, &tile_coords, cur, run_end)?;
			}
			match interrupt {
				Some(sc) => {
					self.pending.push_back(ResultCellSlab::new(sc.tile, sc.pos, 1));
					cur = sc.coords[self.fast_dim] + 1;
					self.sparse_pos += 1;
				}
				None => cur = seg_hi + 1,
			}
		}

		// Next segment, or next row, or next flat range.
		if seg_hi < fast_hi_range {
			self.cursor = seg_hi + 1;
		} else if !self.advance_row() {
			self.flat_idx += 1;
			self.row_active = false;
		}
		Ok(())
	}

	/// Resolves `[x, y]` on the fast dimension against the space tile's
	/// contributor list, newest fragment first.
	fn resolve_dense_run(
		&mut self,
		space_tile: &ResultSpaceTile,
		tile_coords: &[u64],
		x: i128,
		y: i128,
	) -> Result<()> {
		let fast = self.fast_dim;
		let mut cur = x;
		while cur <= y {
			let mut chosen: Option<(ResultTileId, i128)> = None;
			let mut boundary = y + 1;
			for frag in &space_tile.frags {
				let mut row_matches = true;
				let mut fast_lo = 0i128;
				let mut fast_hi = 0i128;
				for (d, range) in frag.slice.iter().enumerate() {
					let datatype = self.domain.dimension(d).datatype();
					let lo = value_to_i128(datatype, range.start_bytes())?;
					let hi = value_to_i128(datatype, range.end_bytes())?;
					if d == fast {
						fast_lo = lo;
						fast_hi = hi;
					} else if self.row[d] < lo || self.row[d] > hi {
						row_matches = false;
						break;
					}
				}
				if !row_matches {
					continue;
				}
				if fast_lo <= cur && cur <= fast_hi {
					// Clip at the start of any newer contributor scanned
					// above.
					chosen = Some((frag.tile, y.min(fast_hi).min(boundary - 1)));
					break;
				}
				if fast_lo > cur {
					boundary = boundary.min(fast_lo);
				}
			}

			match chosen {
				Some((tile, end)) => {
					self.emit_fragment_run(tile, tile_coords, cur, end)?;
					cur = end + 1;
				}
				None => {
					self.pending.push_back(ResultCellSlab::fill((boundary - cur) as u64));
					cur = boundary;
				}
			}
		}
		Ok(())
	}

	fn emit_fragment_run(
		&mut self,
		tile: ResultTileId,
		tile_coords: &[u64],
		x: i128,
		y: i128,
	) -> Result<()> {
		let fast = self.fast_dim;
		let mut cell = self.row.clone();
		if self.contiguous {
			cell[fast] = x;
			let pos = self.domain.cell_pos_in_tile(&cell, tile_coords)?;
			self
				.pending
				.push_back(ResultCellSlab::new(tile, pos, (y - x + 1) as u64));
		} else {
			// The stored order differs from the iteration order; emit one
			// cell at a time so slabs stay contiguous in the source tile.
			for v in x..=y {
				cell[fast] = v;
				let pos = self.domain.cell_pos_in_tile(&cell, tile_coords)?;
				self.pending.push_back(ResultCellSlab::new(tile, pos, 1));
			}
		}
		Ok(())
	}
}

impl Iterator for DenseCellSlabIter<'_> {
	type Item = Result<ResultCellSlab>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			if let Some(slab) = self.pending.pop_front() {
				return Some(Ok(slab));
			}
			if self.done {
				return None;
			}
			if !self.row_active && !self.start_flat_range() {
				return None;
			}
			if let Err(error) = self.produce_segment() {
				self.done = true;
				return Some(Err(error));
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::space_tiles::compute_result_space_tiles;
	use latticedb_core::{
		ArrayType, Attribute, Datatype, Dimension, TileOrder, TypedRange,
	};
	use latticedb_storage::FragmentMetadata;
	use std::path::PathBuf;
	use std::sync::Arc;

	fn int_range(lo: i32, hi: i32) -> TypedRange {
		TypedRange::from_typed(Datatype::Int32, lo, hi).unwrap()
	}

	fn schema_1d() -> Arc<ArraySchema> {
		let dim = Dimension::new(
			"d",
			Datatype::Int32,
			int_range(1, 100),
			Some(10i32.to_le_bytes().to_vec()),
		)
		.unwrap();
		let domain = Domain::new(vec![dim], TileOrder::RowMajor, CellOrder::RowMajor).unwrap();
		Arc::new(
			ArraySchema::new(
				ArrayType::Dense,
				domain,
				vec![Attribute::new("a", Datatype::Int32).unwrap()],
			)
			.unwrap(),
		)
	}

	fn dense_fragment(idx: u64, lo: i32, hi: i32) -> Arc<FragmentMetadata> {
		let tiles = ((hi - lo + 1) / 10) as usize;
		Arc::new(FragmentMetadata::new(
			latticedb_storage::format_fragment_name(idx, idx, idx, 5),
			PathBuf::from("/tmp"),
			5,
			true,
			(idx, idx),
			vec![10; tiles],
			vec![int_range(lo, hi)],
			Vec::new(),
			Vec::new(),
		))
	}

	fn collect(iter: DenseCellSlabIter) -> Vec<ResultCellSlab> {
		iter.map(|s| s.unwrap()).collect()
	}

	#[test]
	fn test_fragment_then_fill() -> Result<()> {
		let schema = schema_1d();
		let fragments = vec![dense_fragment(1, 1, 20)];
		let mut subarray = Subarray::new(schema.clone(), Layout::RowMajor);
		subarray.add_range(0, int_range(5, 25))?;

		let mut arena = ResultTileArena::new();
		let tiles = compute_result_space_tiles(
			&schema,
			&fragments,
			&subarray.tile_coords()?,
			&mut arena,
		)?;
		let iter = DenseCellSlabIter::new(&subarray, &schema, &tiles, &[], 0)?;
		let slabs = collect(iter);

		let t0 = arena.lookup(0, 0).unwrap();
		let t1 = arena.lookup(0, 1).unwrap();
		assert_eq!(
			slabs,
			vec![
				ResultCellSlab::new(t0, 4, 6),
				ResultCellSlab::new(t1, 0, 10),
				ResultCellSlab::fill(5),
			]
		);
		Ok(())
	}

	#[test]
	fn test_newer_fragment_interrupts_older_run() -> Result<()> {
		let schema = schema_1d();
		// The newer fragment covers the second half of tile 0.
		let fragments = vec![dense_fragment(1, 1, 10), dense_fragment(2, 1, 10)];
		let mut subarray = Subarray::new(schema.clone(), Layout::RowMajor);
		subarray.add_range(0, int_range(1, 10))?;

		let mut arena = ResultTileArena::new();
		let tiles = compute_result_space_tiles(
			&schema,
			&fragments,
			&subarray.tile_coords()?,
			&mut arena,
		)?;
		// The newer fragment fully covers tile 0, so the older is pruned
		// and the whole tile reads from fragment 1.
		let iter = DenseCellSlabIter::new(&subarray, &schema, &tiles, &[], 0)?;
		let slabs = collect(iter);
		assert_eq!(slabs.len(), 1);
		assert_eq!(arena.get(slabs[0].tile.unwrap()).frag_idx, 1);
		assert_eq!(slabs[0].length, 10);
		Ok(())
	}

	#[test]
	fn test_sparse_cell_interrupts_run() -> Result<()> {
		let schema = schema_1d();
		let fragments = vec![dense_fragment(1, 11, 20)];
		let mut subarray = Subarray::new(schema.clone(), Layout::RowMajor);
		subarray.add_range(0, int_range(11, 20))?;

		let mut arena = ResultTileArena::new();
		let tiles = compute_result_space_tiles(
			&schema,
			&fragments,
			&subarray.tile_coords()?,
			&mut arena,
		)?;
		let sparse_tile = arena.insert(7, 0, 4);
		let sparse = vec![SparseCell {
			coords: vec![15],
			tile: sparse_tile,
			pos: 3,
		}];

		let iter = DenseCellSlabIter::new(&subarray, &schema, &tiles, &sparse, 0)?;
		let slabs = collect(iter);
		let dense_tile = arena.lookup(0, 0).unwrap();
		assert_eq!(
			slabs,
			vec![
				ResultCellSlab::new(dense_tile, 0, 4),
				ResultCellSlab::new(sparse_tile, 3, 1),
				ResultCellSlab::new(dense_tile, 5, 5),
			]
		);
		Ok(())
	}

	#[test]
	fn test_no_fragments_yields_fill() -> Result<()> {
		let schema = schema_1d();
		let mut subarray = Subarray::new(schema.clone(), Layout::RowMajor);
		subarray.add_range(0, int_range(8, 12))?;

		let mut arena = ResultTileArena::new();
		let tiles =
			compute_result_space_tiles(&schema, &[], &subarray.tile_coords()?, &mut arena)?;
		let iter = DenseCellSlabIter::new(&subarray, &schema, &tiles, &[], 0)?;
		let slabs = collect(iter);
		// One fill run per crossed tile.
		assert_eq!(slabs, vec![ResultCellSlab::fill(3), ResultCellSlab::fill(2)]);
		Ok(())
	}
}
