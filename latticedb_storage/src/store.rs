//! The tile store: budgeted reading and unfiltering of field tiles.
//!
//! Given `(fragment, tile index, field name)`, the store produces the logical
//! [`Tile`]. All reads go through the byte-range VFS and honor the query's
//! memory tracker: a read that would exceed the budget is rejected (`Ok(None)`)
//! and reserves nothing, so the caller can split its partition and retry.

use anyhow::{Context, Result};
use futures::{StreamExt, stream};
use latticedb_core::{
	ArraySchema, Blob, COORDS_FIELD, ConcurrencyLimits, FieldRef, FilterList, LimitedCache,
	MemoryKind, MemoryTracker,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::filter::FilterPipeline;
use crate::fragment::FragmentMetadata;
use crate::io::{DataReaderFile, DataReaderTrait};
use crate::tile::Tile;

/// Upper bound on the resident parsed var-offsets tables.
const OFFSETS_CACHE_BYTES: u64 = 4 << 20;

/// Byte-range access to the tiles of an open array.
pub struct TileStore {
	schema: Arc<ArraySchema>,
	fragments: Vec<Arc<FragmentMetadata>>,
	memory: Arc<MemoryTracker>,
	limits: ConcurrencyLimits,
	readers: Mutex<HashMap<PathBuf, Arc<dyn DataReaderTrait>>>,
	loaded_offsets: Mutex<HashSet<(usize, String)>>,
	/// Parsed per-cell offsets of var-sized tiles; re-reads after a
	/// partition split skip the offsets component entirely.
	offsets_cache: LimitedCache<(usize, String, u64), Vec<u64>>,
}

impl TileStore {
	pub fn new(
		schema: Arc<ArraySchema>,
		fragments: Vec<Arc<FragmentMetadata>>,
		memory: Arc<MemoryTracker>,
	) -> Self {
		Self {
			schema,
			fragments,
			memory,
			limits: ConcurrencyLimits::default(),
			readers: Mutex::new(HashMap::new()),
			loaded_offsets: Mutex::new(HashSet::new()),
			offsets_cache: LimitedCache::with_maximum_weight(OFFSETS_CACHE_BYTES),
		}
	}

	pub fn schema(&self) -> &Arc<ArraySchema> {
		&self.schema
	}

	pub fn fragments(&self) -> &[Arc<FragmentMetadata>] {
		&self.fragments
	}

	pub fn fragment(&self, idx: usize) -> &Arc<FragmentMetadata> {
		&self.fragments[idx]
	}

	pub fn memory(&self) -> &Arc<MemoryTracker> {
		&self.memory
	}

	/// The field names holding coordinates in the given fragment: the zipped
	/// pseudo-field for pre-version-5 fragments, one field per dimension
	/// afterwards.
	pub fn coordinate_fields(&self, frag_idx: usize) -> Vec<String> {
		if self.fragments[frag_idx].has_zipped_coords() {
			vec![COORDS_FIELD.to_string()]
		} else {
			self
				.schema
				.domain()
				.dimensions()
				.iter()
				.map(|d| d.name().to_string())
				.collect()
		}
	}

	/// Accounts the per-tile offset tables of the named fields for the given
	/// fragments against the memory budget. Dimension names are ignored for
	/// zipped-coordinate fragments and the zipped pseudo-field for unzipped
	/// ones. Returns `false` when the budget is exhausted.
	pub fn load_tile_offsets(&self, fragment_indexes: &[usize], field_names: &[&str]) -> Result<bool> {
		let mut loaded = self.loaded_offsets.lock().unwrap();
		for &f in fragment_indexes {
			let fragment = &self.fragments[f];
			for name in field_names {
				let relevant = if *name == COORDS_FIELD {
					fragment.has_zipped_coords()
				} else if self.schema.is_dim(name) {
					!fragment.has_zipped_coords()
				} else {
					true
				};
				if !relevant {
					continue;
				}
				let field = match fragment.field(name) {
					Some(field) => field,
					None => continue,
				};
				let key = (f, (*name).to_string());
				if loaded.contains(&key) {
					continue;
				}
				let components =
					1 + u64::from(field.var.is_some()) + u64::from(field.validity.is_some());
				let bytes = field.primary.offsets.len() as u64 * 16 * components;
				if !self.memory.try_reserve(MemoryKind::Offsets, bytes) {
					log::debug!("offset table of {name} in fragment {f} exceeds the memory budget");
					return Ok(false);
				}
				loaded.insert(key);
			}
		}
		Ok(true)
	}

	fn reader_for(&self, path: PathBuf) -> Result<Arc<dyn DataReaderTrait>> {
		let mut readers = self.readers.lock().unwrap();
		if let Some(reader) = readers.get(&path) {
			return Ok(reader.clone());
		}
		let reader: Arc<dyn DataReaderTrait> =
			Arc::from(DataReaderFile::open(&path)? as Box<dyn DataReaderTrait>);
		readers.insert(path, reader.clone());
		Ok(reader)
	}

	fn pipeline_for(&self, name: &str) -> FilterPipeline {
		let filters = match self.schema.field(name) {
			Some(FieldRef::Dimension(_, dim)) => dim.filters().clone(),
			Some(FieldRef::Attribute(attr)) => attr.filters().clone(),
			Some(FieldRef::Coords) => self.schema.domain().dimension(0).filters().clone(),
			None => FilterList::none(),
		};
		FilterPipeline::new(filters)
	}

	async fn read_component(
		&self,
		frag_idx: usize,
		file: String,
		range: latticedb_core::ByteRange,
		pipeline: &FilterPipeline,
	) -> Result<Blob> {
		let path = self.fragments[frag_idx].path.join(&file);
		let reader = self.reader_for(path)?;
		let framed = reader
			.read_range(&range)
			.await
			.with_context(|| format!("I/O error reading {file} of fragment {frag_idx}"))?;
		pipeline
			.unfilter(&framed)
			.with_context(|| format!("filter pipeline rejected a tile of {file} in fragment {frag_idx}"))
	}

	/// Reads and unfilters one field tile, reserving its resident size under
	/// `kind`. Returns `Ok(None)` without any reservation when the memory
	/// budget would be exceeded; the caller owns the reservation otherwise
	/// and must release `tile.mem_size()` when done with the tile.
	pub async fn read_field_tile(
		&self,
		frag_idx: usize,
		field_name: &str,
		tile_idx: u64,
		kind: MemoryKind,
	) -> Result<Option<Tile>> {
		let fragment = &self.fragments[frag_idx];
		let field = fragment
			.field(field_name)
			.with_context(|| format!("fragment {} has no field {field_name}", fragment.name))?;

		// Reserve the on-disk size first; it bounds what the read itself
		// keeps in flight.
		let disk_size = field.tile_disk_size(tile_idx);
		if !self.memory.try_reserve(kind, disk_size) {
			return Ok(None);
		}

		let result = self.read_field_tile_inner(frag_idx, field, tile_idx).await;
		self.memory.release(kind, disk_size);
		let tile = result?;

		let mem_size = tile.mem_size();
		if !self.memory.try_reserve(kind, mem_size) {
			return Ok(None);
		}
		Ok(Some(tile))
	}

	async fn read_field_tile_inner(
		&self,
		frag_idx: usize,
		field: &crate::fragment::FieldMeta,
		tile_idx: u64,
	) -> Result<Tile> {
		let fragment = &self.fragments[frag_idx];
		let cell_num = fragment.cell_count(tile_idx);
		let pipeline = self.pipeline_for(&field.name);

		let mut tile = if let Some(var_addresses) = &field.var {
			let key = (frag_idx, field.name.clone(), tile_idx);
			let offsets = match self.offsets_cache.get(&key) {
				Some(offsets) => offsets,
				None => {
					let primary = self
						.read_component(
							frag_idx,
							field.primary_file(),
							field.primary.tile_range(tile_idx),
							&pipeline,
						)
						.await?;
					let offsets = parse_offsets(&primary, cell_num)?;
					self.offsets_cache.add(key, offsets.clone());
					offsets
				}
			};
			let var = self
				.read_component(frag_idx, field.var_file(), var_addresses.tile_range(tile_idx), &pipeline)
				.await?;
			Tile::new_var(offsets, var)
		} else {
			let primary = self
				.read_component(
					frag_idx,
					field.primary_file(),
					field.primary.tile_range(tile_idx),
					&pipeline,
				)
				.await?;
			Tile::new_fixed(cell_num, primary)
		};

		if let Some(validity_addresses) = &field.validity {
			let validity = self
				.read_component(
					frag_idx,
					field.validity_file(),
					validity_addresses.tile_range(tile_idx),
					&FilterPipeline::default(),
				)
				.await?;
			tile = tile.with_validity(validity)?;
		}
		Ok(tile)
	}

	/// Reads the coordinate tiles of the requested `(fragment, tile)` pairs
	/// with bounded I/O fan-out. The result holds one tile per coordinate
	/// field (a single zipped tile, or one per dimension), in request order.
	/// Returns `Ok(None)` when the coords budget rejects any tile; all
	/// reservations are rolled back in that case.
	pub async fn read_coordinate_tiles(
		&self,
		requests: &[(usize, u64)],
	) -> Result<Option<Vec<Vec<Tile>>>> {
		let results: Vec<Result<Option<Vec<Tile>>>> = stream::iter(requests.iter().copied())
			.map(|(frag_idx, tile_idx)| async move {
				let mut tiles = Vec::new();
				for field_name in self.coordinate_fields(frag_idx) {
					match self
						.read_field_tile(frag_idx, &field_name, tile_idx, MemoryKind::Coords)
						.await?
					{
						Some(tile) => tiles.push(tile),
						None => {
							for tile in &tiles {
								self.memory.release(MemoryKind::Coords, tile.mem_size());
							}
							return Ok(None);
						}
					}
				}
				Ok(Some(tiles))
			})
			.buffered(self.limits.io_bound)
			.collect()
			.await;

		let mut out = Vec::with_capacity(requests.len());
		let mut rejected = false;
		for result in results {
			match result? {
				Some(tiles) => out.push(tiles),
				None => rejected = true,
			}
		}
		if rejected {
			for tiles in &out {
				for tile in tiles {
					self.memory.release(MemoryKind::Coords, tile.mem_size());
				}
			}
			return Ok(None);
		}
		Ok(Some(out))
	}

	/// Reads one attribute's tiles for the requested `(fragment, tile)`
	/// pairs, in request order, under the given accounting kind. All
	/// reservations roll back when any tile is rejected by the budget.
	pub async fn read_attribute_tiles(
		&self,
		field_name: &str,
		requests: &[(usize, u64)],
		kind: MemoryKind,
	) -> Result<Option<Vec<Tile>>> {
		let results: Vec<Result<Option<Tile>>> = stream::iter(requests.iter().copied())
			.map(|(frag_idx, tile_idx)| async move {
				self.read_field_tile(frag_idx, field_name, tile_idx, kind).await
			})
			.buffered(self.limits.io_bound)
			.collect()
			.await;

		let mut out = Vec::with_capacity(requests.len());
		let mut rejected = false;
		for result in results {
			match result? {
				Some(tile) => out.push(tile),
				None => rejected = true,
			}
		}
		if rejected {
			for tile in &out {
				self.memory.release(kind, tile.mem_size());
			}
			return Ok(None);
		}
		Ok(Some(out))
	}

	/// Releases the reservation of a tile obtained from this store.
	pub fn release_tile(&self, kind: MemoryKind, tile: &Tile) {
		self.memory.release(kind, tile.mem_size());
	}
}

/// Parses a primary var-field component (per-cell `u64` start offsets).
fn parse_offsets(blob: &Blob, cell_num: u64) -> Result<Vec<u64>> {
	let bytes = blob.as_slice();
	anyhow::ensure!(
		bytes.len() as u64 == cell_num * 8,
		"offsets tile holds {} bytes, expected {} cells",
		bytes.len(),
		cell_num
	);
	let mut offsets = Vec::with_capacity(cell_num as usize);
	for i in 0..cell_num as usize {
		offsets.push(u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap()));
	}
	Ok(offsets)
}

impl std::fmt::Debug for TileStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TileStore")
			.field("fragments", &self.fragments.len())
			.field("memory_used", &self.memory.used())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_offsets() -> Result<()> {
		let mut bytes = Vec::new();
		for v in [0u64, 5, 9] {
			bytes.extend_from_slice(&v.to_le_bytes());
		}
		assert_eq!(parse_offsets(&Blob::from(bytes.clone()), 3)?, vec![0, 5, 9]);
		assert!(parse_offsets(&Blob::from(bytes), 4).is_err());
		Ok(())
	}
}
