//! Ordering of result coordinates and the N-way merge of per-fragment
//! streams into result cell slabs.
//!
//! All layout comparators reduce a cell to an [`OrderKey`]: a vector of
//! order parts (integral, float, byte-string, tile position or Hilbert
//! index) that compares with plain `Ord`. Ties across fragments always
//! resolve newest fragment first.

use anyhow::{Context, Result};
use latticedb_core::{
	ArraySchema, CellOrder, Datatype, Layout, PhysicalValue, TileOrder, dispatch_physical,
	hilbert_index, value_to_i128,
};
use latticedb_storage::CoordTileView;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::result_tile::{ResultCellSlab, ResultCoords, ResultTileArena, ResultTileId};

/// One component of an ordering key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderPart {
	Tile(u64),
	Hilbert(u64),
	Int(i128),
	/// IEEE float mapped to its total-order bit pattern.
	Float(u64),
	Bytes(Vec<u8>),
}

/// A comparable key capturing a cell's position in the active output order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey(Vec<OrderPart>);

fn float_order_bits(bits: u64, sign_shift: u32) -> u64 {
	if bits >> sign_shift != 0 {
		!bits
	} else {
		bits | (1u64 << sign_shift)
	}
}

fn coord_part(datatype: Datatype, coord: &[u8]) -> OrderPart {
	if datatype.is_integral() {
		return OrderPart::Int(value_to_i128(datatype, coord).unwrap_or(i128::MIN));
	}
	dispatch_physical!(
		datatype.physical(),
		T => {
			let value = T::read_le(coord);
			match datatype {
				Datatype::Float32 => {
					OrderPart::Float(float_order_bits(u64::from((value.to_f64_lossy() as f32).to_bits()), 31))
				}
				Datatype::Float64 => OrderPart::Float(float_order_bits(value.to_f64_lossy().to_bits(), 63)),
				_ => OrderPart::Bytes(coord.to_vec()),
			}
		},
		OrderPart::Bytes(coord.to_vec())
	)
}

/// Builds the ordering key of one cell under `layout`.
pub fn cell_order_key(
	schema: &ArraySchema,
	view: &CoordTileView,
	cell: u64,
	layout: Layout,
) -> Result<OrderKey> {
	let domain = schema.domain();
	let dim_num = domain.dim_num();
	let mut parts = Vec::new();

	let coord_parts = |parts: &mut Vec<OrderPart>, reversed: bool| -> Result<()> {
		for i in 0..dim_num {
			let d = if reversed { dim_num - i - 1 } else { i };
			let coord = view.coord(cell, d)?;
			parts.push(coord_part(domain.dimension(d).datatype(), coord));
		}
		Ok(())
	};

	match layout {
		Layout::RowMajor => coord_parts(&mut parts, false)?,
		Layout::ColMajor => coord_parts(&mut parts, true)?,
		Layout::GlobalOrder => {
			// Tile position first, in tile order.
			for i in 0..dim_num {
				let d = match domain.tile_order() {
					TileOrder::RowMajor => i,
					TileOrder::ColMajor => dim_num - i - 1,
				};
				let dim = domain.dimension(d);
				if dim.is_string() || dim.tile_extent_bytes().is_none() {
					continue;
				}
				let value = value_to_i128(dim.datatype(), view.coord(cell, d)?)?;
				parts.push(OrderPart::Tile(domain.tile_index(d, value)?));
			}
			// Then the cell order within the tile.
			match domain.cell_order() {
				CellOrder::Hilbert => {
					let mut coords = Vec::with_capacity(dim_num);
					for d in 0..dim_num {
						coords.push(view.coord(cell, d)?);
					}
					parts.push(OrderPart::Hilbert(hilbert_index(domain, &coords)?));
				}
				CellOrder::RowMajor => coord_parts(&mut parts, false)?,
				CellOrder::ColMajor => coord_parts(&mut parts, true)?,
			}
		}
		Layout::Unordered => {
			anyhow::bail!("unordered layout has no ordering key")
		}
	}
	Ok(OrderKey(parts))
}

/// Sorts result coordinates into `layout` order, ties newest fragment
/// first; optionally drops all but the newest of coordinate-equal runs.
pub fn sort_and_dedup_result_coords(
	arena: &ResultTileArena,
	schema: &ArraySchema,
	coords: &mut Vec<ResultCoords>,
	layout: Layout,
	dedup: bool,
) -> Result<()> {
	let mut keyed: Vec<(OrderKey, usize, ResultCoords)> = Vec::with_capacity(coords.len());
	for rc in coords.iter().filter(|rc| rc.valid) {
		let tile = arena.get(rc.tile);
		let view = tile.coords_view(schema)?;
		keyed.push((cell_order_key(schema, &view, rc.pos, layout)?, tile.frag_idx, *rc));
	}
	keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
	if dedup {
		keyed.dedup_by(|next, kept| next.0 == kept.0);
	}
	*coords = keyed.into_iter().map(|(_, _, rc)| rc).collect();
	Ok(())
}

/// Collapses sorted result coordinates into maximal contiguous slabs.
pub fn coords_to_slabs(coords: &[ResultCoords]) -> Vec<ResultCellSlab> {
	let mut slabs: Vec<ResultCellSlab> = Vec::new();
	for rc in coords.iter().filter(|rc| rc.valid) {
		if let Some(last) = slabs.last_mut() {
			if last.tile == Some(rc.tile) && last.start + last.length == rc.pos {
				last.length += 1;
				continue;
			}
		}
		slabs.push(ResultCellSlab::new(rc.tile, rc.pos, 1));
	}
	slabs
}

struct HeapItem {
	key: OrderKey,
	frag_idx: usize,
	stream: usize,
	tile: ResultTileId,
	pos: u64,
}

impl PartialEq for HeapItem {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key && self.frag_idx == other.frag_idx
	}
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for HeapItem {
	fn cmp(&self, other: &Self) -> Ordering {
		// Smaller key first; on ties the newer fragment wins.
		self
			.key
			.cmp(&other.key)
			.then_with(|| other.frag_idx.cmp(&self.frag_idx))
	}
}

/// Per-fragment cursor over the selected result tiles, skipping cells the
/// bitmap excluded.
struct FragmentStream<'a> {
	arena: &'a ResultTileArena,
	schema: &'a ArraySchema,
	layout: Layout,
	frag_idx: usize,
	tiles: Vec<ResultTileId>,
	tile_cursor: usize,
	cell_cursor: u64,
}

impl<'a> FragmentStream<'a> {
	fn next_item(&mut self, stream: usize) -> Result<Option<HeapItem>> {
		while self.tile_cursor < self.tiles.len() {
			let id = self.tiles[self.tile_cursor];
			let tile = self.arena.get(id);
			while self.cell_cursor < tile.cell_num {
				let pos = self.cell_cursor;
				self.cell_cursor += 1;
				if !tile.bitmap.passes(pos) {
					continue;
				}
				let view = tile.coords_view(self.schema)?;
				let key = cell_order_key(self.schema, &view, pos, self.layout)?;
				return Ok(Some(HeapItem {
					key,
					frag_idx: self.frag_idx,
					stream,
					tile: id,
					pos,
				}));
			}
			self.tile_cursor += 1;
			self.cell_cursor = 0;
		}
		Ok(None)
	}
}

/// N-way merge of per-fragment streams into slabs in `layout` order.
///
/// With duplicates allowed, coordinate ties across fragments all survive,
/// newest fragment first; otherwise only the newest fragment's cell does.
pub fn merge_result_cell_slabs(
	arena: &ResultTileArena,
	schema: &ArraySchema,
	layout: Layout,
	per_fragment_tiles: Vec<(usize, Vec<ResultTileId>)>,
	allows_dups: bool,
) -> Result<Vec<ResultCellSlab>> {
	let mut streams: Vec<FragmentStream> = per_fragment_tiles
		.into_iter()
		.map(|(frag_idx, tiles)| FragmentStream {
			arena,
			schema,
			layout,
			frag_idx,
			tiles,
			tile_cursor: 0,
			cell_cursor: 0,
		})
		.collect();

	let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::new();
	for stream in 0..streams.len() {
		if let Some(item) = streams[stream].next_item(stream)? {
			heap.push(Reverse(item));
		}
	}

	let mut slabs: Vec<ResultCellSlab> = Vec::new();
	let mut emit = |tile: ResultTileId, pos: u64, slabs: &mut Vec<ResultCellSlab>| {
		if let Some(last) = slabs.last_mut() {
			if last.tile == Some(tile) && last.start + last.length == pos {
				last.length += 1;
				return;
			}
		}
		slabs.push(ResultCellSlab::new(tile, pos, 1));
	};

	while let Some(Reverse(item)) = heap.pop() {
		// Collect the whole coordinate-tie group; the heap orders ties
		// newest fragment first.
		let mut group = vec![item];
		while let Some(Reverse(top)) = heap.peek() {
			if top.key != group[0].key {
				break;
			}
			let Reverse(tied) = heap.pop().context("heap peek/pop mismatch")?;
			group.push(tied);
		}
		for tied in &group {
			if let Some(next) = streams[tied.stream].next_item(tied.stream)? {
				heap.push(Reverse(next));
			}
		}

		if !allows_dups {
			// Only the newest fragment's cell survives.
			let newest = &group[0];
			emit(newest.tile, newest.pos, &mut slabs);
			continue;
		}
		// With duplicates, every tied cell is emitted. The global-order
		// merge walks ties newest first; row/col layouts keep the
		// fragment-ascending order of the legacy stable sort.
		if layout != Layout::GlobalOrder {
			group.reverse();
		}
		for tied in &group {
			emit(tied.tile, tied.pos, &mut slabs);
		}
	}
	Ok(slabs)
}

/// Unordered layout: concatenate the streams without sorting. With count
/// bitmaps, a cell appears once per containing range.
pub fn concat_result_cell_slabs(
	arena: &ResultTileArena,
	per_fragment_tiles: &[(usize, Vec<ResultTileId>)],
) -> Vec<ResultCellSlab> {
	let mut slabs: Vec<ResultCellSlab> = Vec::new();
	for (_, tiles) in per_fragment_tiles {
		for &id in tiles {
			let tile = arena.get(id);
			for pos in 0..tile.cell_num {
				let count = tile.bitmap.count(pos);
				if count == 0 {
					continue;
				}
				for _ in 0..count {
					if count == 1 {
						if let Some(last) = slabs.last_mut() {
							if last.tile == Some(id) && last.start + last.length == pos {
								last.length += 1;
								continue;
							}
						}
					}
					slabs.push(ResultCellSlab::new(id, pos, 1));
				}
			}
		}
	}
	slabs
}
