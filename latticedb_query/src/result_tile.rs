//! Result tiles, their arena, result coordinates and result cell slabs.
//!
//! Result tiles live in an arena with stable indices; slabs and coordinates
//! refer to tiles by [`ResultTileId`], never by pointer. A per-tile
//! reference count releases the loaded payloads once the last slab
//! referring to a tile has been copied out.

use anyhow::{Context, Result};
use latticedb_core::ArraySchema;
use latticedb_storage::{CoordTileView, Tile};
use std::collections::HashMap;

/// Stable index of a result tile within its arena.
pub type ResultTileId = usize;

/// Per-cell inclusion state of a result tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bitmap {
	/// Every cell is a result.
	All,
	/// One byte per cell; non-zero means the cell is a result.
	Mask(Vec<u8>),
	/// One count per cell; used when overlapping ranges must materialize
	/// duplicates.
	Counts(Vec<u8>),
}

impl Bitmap {
	pub fn passes(&self, cell: u64) -> bool {
		self.count(cell) > 0
	}

	/// How many times the cell appears in the result.
	pub fn count(&self, cell: u64) -> u64 {
		match self {
			Bitmap::All => 1,
			Bitmap::Mask(mask) => u64::from(mask[cell as usize] != 0),
			Bitmap::Counts(counts) => u64::from(counts[cell as usize]),
		}
	}

	/// Total result cells over a tile of `cell_num` cells.
	pub fn result_num(&self, cell_num: u64) -> u64 {
		match self {
			Bitmap::All => cell_num,
			_ => (0..cell_num).map(|c| self.count(c)).sum(),
		}
	}
}

/// A per-query handle to one physical tile, with its loaded payloads.
#[derive(Debug)]
pub struct ResultTile {
	pub frag_idx: usize,
	pub tile_idx: u64,
	pub cell_num: u64,
	/// One zipped tile, or one tile per dimension. Empty for dense-fragment
	/// tiles, whose coordinates are implicit.
	pub coord_tiles: Vec<Tile>,
	pub zipped: bool,
	pub attr_tiles: HashMap<String, Tile>,
	pub bitmap: Bitmap,
	refs: usize,
}

impl ResultTile {
	/// A uniform view over the coordinate tiles.
	pub fn coords_view(&self, schema: &ArraySchema) -> Result<CoordTileView<'_>> {
		anyhow::ensure!(!self.coord_tiles.is_empty(), "coordinate tiles are not loaded");
		if self.zipped {
			let coord_size = schema.domain().dimension(0).coord_size()?;
			CoordTileView::new_zipped(&self.coord_tiles[0], schema.dim_num(), coord_size)
		} else {
			let mut sizes = Vec::with_capacity(schema.dim_num());
			for dim in schema.domain().dimensions() {
				sizes.push(if dim.is_string() { 0 } else { dim.coord_size()? });
			}
			CoordTileView::new_unzipped(self.coord_tiles.iter().collect(), sizes)
		}
	}

	pub fn attr_tile(&self, name: &str) -> Result<&Tile> {
		self
			.attr_tiles
			.get(name)
			.with_context(|| format!("attribute tile {name} is not loaded"))
	}

	/// Resident bytes of all loaded payloads.
	pub fn loaded_bytes(&self) -> u64 {
		self.coord_tiles.iter().map(Tile::mem_size).sum::<u64>()
			+ self.attr_tiles.values().map(Tile::mem_size).sum::<u64>()
	}
}

/// A cursor addressing one cell of one result tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCoords {
	pub tile: ResultTileId,
	pub pos: u64,
	pub valid: bool,
}

impl ResultCoords {
	pub fn new(tile: ResultTileId, pos: u64) -> Self {
		Self {
			tile,
			pos,
			valid: true,
		}
	}

	pub fn invalidate(&mut self) {
		self.valid = false;
	}
}

/// A contiguous run of cells to copy verbatim; `tile = None` marks a dense
/// fill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCellSlab {
	pub tile: Option<ResultTileId>,
	pub start: u64,
	pub length: u64,
}

impl ResultCellSlab {
	pub fn new(tile: ResultTileId, start: u64, length: u64) -> Self {
		Self {
			tile: Some(tile),
			start,
			length,
		}
	}

	pub fn fill(length: u64) -> Self {
		Self {
			tile: None,
			start: 0,
			length,
		}
	}
}

/// Arena of result tiles with stable indices and (fragment, tile) dedup.
#[derive(Debug, Default)]
pub struct ResultTileArena {
	tiles: Vec<ResultTile>,
	index: HashMap<(usize, u64), ResultTileId>,
}

impl ResultTileArena {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts (or finds) the result tile of `(frag_idx, tile_idx)`.
	pub fn insert(&mut self, frag_idx: usize, tile_idx: u64, cell_num: u64) -> ResultTileId {
		if let Some(&id) = self.index.get(&(frag_idx, tile_idx)) {
			return id;
		}
		let id = self.tiles.len();
		self.tiles.push(ResultTile {
			frag_idx,
			tile_idx,
			cell_num,
			coord_tiles: Vec::new(),
			zipped: false,
			attr_tiles: HashMap::new(),
			bitmap: Bitmap::All,
			refs: 0,
		});
		self.index.insert((frag_idx, tile_idx), id);
		id
	}

	pub fn lookup(&self, frag_idx: usize, tile_idx: u64) -> Option<ResultTileId> {
		self.index.get(&(frag_idx, tile_idx)).copied()
	}

	pub fn get(&self, id: ResultTileId) -> &ResultTile {
		&self.tiles[id]
	}

	pub fn get_mut(&mut self, id: ResultTileId) -> &mut ResultTile {
		&mut self.tiles[id]
	}

	pub fn ids(&self) -> impl Iterator<Item = ResultTileId> + '_ {
		0..self.tiles.len()
	}

	pub fn len(&self) -> usize {
		self.tiles.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tiles.is_empty()
	}

	/// Registers a slab reference on its tile.
	pub fn add_ref(&mut self, id: ResultTileId) {
		self.tiles[id].refs += 1;
	}

	/// Drops a slab reference; when it was the last one, frees the loaded
	/// payloads and returns the bytes released.
	pub fn release_ref(&mut self, id: ResultTileId) -> u64 {
		let tile = &mut self.tiles[id];
		debug_assert!(tile.refs > 0, "release without reference");
		tile.refs = tile.refs.saturating_sub(1);
		if tile.refs == 0 {
			let bytes = tile.loaded_bytes();
			tile.coord_tiles.clear();
			tile.attr_tiles.clear();
			bytes
		} else {
			0
		}
	}

	/// Frees every loaded payload and returns the bytes released.
	pub fn clear(&mut self) -> u64 {
		let bytes: u64 = self.tiles.iter().map(ResultTile::loaded_bytes).sum();
		self.tiles.clear();
		self.index.clear();
		bytes
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use latticedb_core::Blob;

	#[test]
	fn test_bitmap_counts() {
		assert_eq!(Bitmap::All.result_num(5), 5);
		let mask = Bitmap::Mask(vec![1, 0, 1]);
		assert!(mask.passes(0));
		assert!(!mask.passes(1));
		assert_eq!(mask.result_num(3), 2);
		let counts = Bitmap::Counts(vec![2, 0, 3]);
		assert_eq!(counts.count(2), 3);
		assert_eq!(counts.result_num(3), 5);
	}

	#[test]
	fn test_arena_dedup_and_refs() {
		let mut arena = ResultTileArena::new();
		let a = arena.insert(0, 7, 100);
		let b = arena.insert(0, 7, 100);
		assert_eq!(a, b);
		assert_eq!(arena.len(), 1);
		assert_eq!(arena.lookup(0, 7), Some(a));
		assert_eq!(arena.lookup(1, 7), None);

		arena.get_mut(a).attr_tiles.insert(
			"x".to_string(),
			Tile::new_fixed(2, Blob::from(vec![0u8; 8])),
		);
		arena.add_ref(a);
		arena.add_ref(a);
		assert_eq!(arena.release_ref(a), 0);
		assert_eq!(arena.release_ref(a), 8);
		assert!(arena.get(a).attr_tiles.is_empty());
	}

	#[test]
	fn test_slab_constructors() {
		let slab = ResultCellSlab::new(3, 10, 5);
		assert_eq!(slab.tile, Some(3));
		let fill = ResultCellSlab::fill(7);
		assert_eq!(fill.tile, None);
		assert_eq!(fill.length, 7);
	}
}
