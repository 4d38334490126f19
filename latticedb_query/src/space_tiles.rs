//! Dense result-space-tile planning.
//!
//! For every array tile the subarray touches, the planner records which
//! dense fragments contribute, newest first, omitting fragments whose slice
//! of the tile is fully covered by a more recent contributor.

use anyhow::{Result, ensure};
use latticedb_core::{ArraySchema, Domain, NDRange, value_to_i128};
use latticedb_storage::FragmentMetadata;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::result_tile::{ResultTileArena, ResultTileId};

/// The tile grid covered by a (fragment or array) domain slice.
#[derive(Debug, Clone)]
pub struct TileDomain {
	frag_idx: Option<usize>,
	tile_lo: Vec<u64>,
	tile_hi: Vec<u64>,
	slice: NDRange,
}

impl TileDomain {
	/// `frag_idx` is `None` for the array domain itself.
	pub fn new(domain: &Domain, slice: &NDRange, frag_idx: Option<usize>) -> Result<Self> {
		ensure!(slice.len() == domain.dim_num(), "slice arity mismatch");
		let mut tile_lo = Vec::with_capacity(slice.len());
		let mut tile_hi = Vec::with_capacity(slice.len());
		for (d, range) in slice.iter().enumerate() {
			let datatype = domain.dimension(d).datatype();
			tile_lo.push(domain.tile_index(d, value_to_i128(datatype, range.start_bytes())?)?);
			tile_hi.push(domain.tile_index(d, value_to_i128(datatype, range.end_bytes())?)?);
		}
		Ok(Self {
			frag_idx,
			tile_lo,
			tile_hi,
			slice: slice.clone(),
		})
	}

	pub fn frag_idx(&self) -> Option<usize> {
		self.frag_idx
	}

	pub fn contains_tile(&self, tile_coords: &[u64]) -> bool {
		tile_coords
			.iter()
			.enumerate()
			.all(|(d, &t)| t >= self.tile_lo[d] && t <= self.tile_hi[d])
	}

	/// The fragment-local position of an array tile within this grid,
	/// flattened in tile order.
	pub fn tile_pos(&self, domain: &Domain, tile_coords: &[u64]) -> u64 {
		let rel: Vec<u64> = tile_coords
			.iter()
			.enumerate()
			.map(|(d, &t)| t - self.tile_lo[d])
			.collect();
		let tiles_per_dim: Vec<u64> = (0..rel.len())
			.map(|d| self.tile_hi[d] - self.tile_lo[d] + 1)
			.collect();
		domain.flatten_tile_coords(&rel, &tiles_per_dim)
	}

	/// The part of this domain's slice that falls inside one array tile.
	pub fn tile_slice(&self, domain: &Domain, tile_coords: &[u64]) -> Result<NDRange> {
		let tile_nd = domain.tile_ndrange(tile_coords)?;
		let mut out = Vec::with_capacity(tile_nd.len());
		for d in 0..tile_nd.len() {
			out.push(
				self.slice[d]
					.intersection(&tile_nd[d])
					.ok_or_else(|| anyhow::anyhow!("tile does not intersect the domain slice"))?,
			);
		}
		Ok(out)
	}

	/// `true` when, within the given tile, this domain's slice fully covers
	/// `other`'s slice.
	pub fn covers(&self, domain: &Domain, tile_coords: &[u64], other: &TileDomain) -> Result<bool> {
		let mine = self.tile_slice(domain, tile_coords)?;
		let theirs = other.tile_slice(domain, tile_coords)?;
		Ok(mine.iter().zip(theirs.iter()).all(|(a, b)| {
			a.intersection(b).as_ref() == Some(b)
		}))
	}
}

/// One contributing fragment of a result space tile.
#[derive(Debug, Clone)]
pub struct SpaceTileFragment {
	pub frag_idx: usize,
	/// The fragment's domain slice within this tile.
	pub slice: NDRange,
	pub tile: ResultTileId,
}

/// One array tile of a dense read with its contributor list, newest first.
#[derive(Debug, Clone)]
pub struct ResultSpaceTile {
	pub tile_coords: Vec<u64>,
	pub start_coords: Vec<i128>,
	pub frags: Vec<SpaceTileFragment>,
}

/// Computes the result space tiles of a dense read.
///
/// Fragments are walked newest to oldest; a fragment fully covered (in this
/// tile) by an already accepted, newer fragment is omitted.
pub fn compute_result_space_tiles(
	schema: &ArraySchema,
	fragments: &[Arc<FragmentMetadata>],
	tile_coords_list: &[Vec<u64>],
	arena: &mut ResultTileArena,
) -> Result<BTreeMap<Vec<u64>, ResultSpaceTile>> {
	let domain = schema.domain();
	let cells_per_tile = domain.cells_per_tile()?;

	// Tile domains of the dense fragments, newest first.
	let mut frag_tile_domains = Vec::new();
	for (idx, fragment) in fragments.iter().enumerate().rev() {
		if fragment.dense {
			frag_tile_domains.push(TileDomain::new(domain, &fragment.non_empty_domain, Some(idx))?);
		}
	}

	let mut result = BTreeMap::new();
	for tile_coords in tile_coords_list {
		let mut start_coords = Vec::with_capacity(tile_coords.len());
		for (d, &t) in tile_coords.iter().enumerate() {
			start_coords.push(domain.tile_start(d, t)?);
		}
		let mut space_tile = ResultSpaceTile {
			tile_coords: tile_coords.clone(),
			start_coords,
			frags: Vec::new(),
		};

		for (i, ftd) in frag_tile_domains.iter().enumerate() {
			if !ftd.contains_tile(tile_coords) {
				continue;
			}
			let mut covered = false;
			for newer in &frag_tile_domains[..i] {
				if newer.contains_tile(tile_coords) && newer.covers(domain, tile_coords, ftd)? {
					covered = true;
					break;
				}
			}
			if covered {
				continue;
			}
			let frag_idx = ftd.frag_idx().unwrap();
			let tile_idx = ftd.tile_pos(domain, tile_coords);
			let tile = arena.insert(frag_idx, tile_idx, cells_per_tile);
			space_tile.frags.push(SpaceTileFragment {
				frag_idx,
				slice: ftd.tile_slice(domain, tile_coords)?,
				tile,
			});
		}

		result.insert(tile_coords.clone(), space_tile);
	}
	Ok(result)
}
