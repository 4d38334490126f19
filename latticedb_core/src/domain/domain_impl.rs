//! The ordered set of dimensions plus tile/cell orders, and the dense tile
//! arithmetic built on top of it.
//!
//! Dense arithmetic is carried out in `i128`, which covers every integral
//! dimension type in a single code path.

use anyhow::{Context, Result, ensure};
use itertools::Itertools;

use super::{CellOrder, Dimension, TileOrder};
use crate::types::NDRange;

/// An ordered sequence of dimensions with a tile order and a cell order.
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
	dimensions: Vec<Dimension>,
	tile_order: TileOrder,
	cell_order: CellOrder,
}

impl Domain {
	pub fn new(dimensions: Vec<Dimension>, tile_order: TileOrder, cell_order: CellOrder) -> Result<Self> {
		ensure!(!dimensions.is_empty(), "a domain needs at least one dimension");
		ensure!(
			dimensions.iter().map(Dimension::name).all_unique(),
			"dimension names must be unique"
		);
		if cell_order == CellOrder::Hilbert {
			ensure!(
				dimensions.len() <= 16,
				"hilbert cell order supports at most 16 dimensions"
			);
		}
		Ok(Self {
			dimensions,
			tile_order,
			cell_order,
		})
	}

	pub fn dim_num(&self) -> usize {
		self.dimensions.len()
	}

	pub fn dimension(&self, idx: usize) -> &Dimension {
		&self.dimensions[idx]
	}

	pub fn dimensions(&self) -> &[Dimension] {
		&self.dimensions
	}

	pub fn dimension_by_name(&self, name: &str) -> Option<(usize, &Dimension)> {
		self
			.dimensions
			.iter()
			.enumerate()
			.find(|(_, d)| d.name() == name)
	}

	pub fn tile_order(&self) -> TileOrder {
		self.tile_order
	}

	pub fn cell_order(&self) -> CellOrder {
		self.cell_order
	}

	/// Fails unless every dimension is integral with a tile extent, which is
	/// what dense reads require.
	pub fn ensure_dense_compatible(&self) -> Result<()> {
		for dim in &self.dimensions {
			ensure!(
				dim.datatype().is_integral(),
				"dense domains require integral dimensions; {} is {}",
				dim.name(),
				dim.datatype()
			);
			ensure!(
				dim.tile_extent_bytes().is_some(),
				"dense domains require a tile extent on every dimension; {} has none",
				dim.name()
			);
		}
		Ok(())
	}

	/// The tile index of `value` on dimension `d`, counted from the domain
	/// start.
	pub fn tile_index(&self, d: usize, value: i128) -> Result<u64> {
		let dim = &self.dimensions[d];
		let (lo, _) = dim.domain_i128()?;
		let extent = dim.tile_extent_i128()?;
		ensure!(value >= lo, "coordinate below the domain of {}", dim.name());
		Ok(((value - lo) / extent) as u64)
	}

	/// The first coordinate value of tile `tile_idx` on dimension `d`.
	pub fn tile_start(&self, d: usize, tile_idx: u64) -> Result<i128> {
		let dim = &self.dimensions[d];
		let (lo, _) = dim.domain_i128()?;
		let extent = dim.tile_extent_i128()?;
		Ok(lo + i128::from(tile_idx) * extent)
	}

	/// Number of tiles along dimension `d` over the whole domain.
	pub fn tile_count(&self, d: usize) -> Result<u64> {
		let dim = &self.dimensions[d];
		let (lo, hi) = dim.domain_i128()?;
		let extent = dim.tile_extent_i128()?;
		Ok((((hi - lo) / extent) + 1) as u64)
	}

	/// Number of cells in one full space tile.
	pub fn cells_per_tile(&self) -> Result<u64> {
		let mut cells: u64 = 1;
		for d in 0..self.dim_num() {
			let extent = self.dimensions[d].tile_extent_i128()?;
			cells = cells
				.checked_mul(extent as u64)
				.context("tile cell count overflows u64")?;
		}
		Ok(cells)
	}

	/// Per-dimension tile coordinates of a cell.
	pub fn tile_coords_of(&self, cell: &[i128]) -> Result<Vec<u64>> {
		ensure!(cell.len() == self.dim_num(), "coordinate arity mismatch");
		(0..self.dim_num()).map(|d| self.tile_index(d, cell[d])).collect()
	}

	/// Flattens per-dimension tile coordinates into a single tile position
	/// within a grid of `tiles_per_dim` tiles, honoring the tile order.
	pub fn flatten_tile_coords(&self, tile_coords: &[u64], tiles_per_dim: &[u64]) -> u64 {
		let dim_num = self.dim_num();
		let mut pos = 0u64;
		match self.tile_order {
			TileOrder::RowMajor => {
				for d in 0..dim_num {
					pos = pos * tiles_per_dim[d] + tile_coords[d];
				}
			}
			TileOrder::ColMajor => {
				for d in (0..dim_num).rev() {
					pos = pos * tiles_per_dim[d] + tile_coords[d];
				}
			}
		}
		pos
	}

	/// The position of a cell inside its space tile, honoring the cell order.
	/// Hilbert order never applies inside dense tiles.
	pub fn cell_pos_in_tile(&self, cell: &[i128], tile_coords: &[u64]) -> Result<u64> {
		ensure!(
			self.cell_order != CellOrder::Hilbert,
			"hilbert order does not define in-tile positions"
		);
		let dim_num = self.dim_num();
		let mut pos = 0u64;
		match self.cell_order {
			CellOrder::RowMajor => {
				for d in 0..dim_num {
					let extent = self.dimensions[d].tile_extent_i128()?;
					let start = self.tile_start(d, tile_coords[d])?;
					pos = pos * extent as u64 + (cell[d] - start) as u64;
				}
			}
			CellOrder::ColMajor => {
				for d in (0..dim_num).rev() {
					let extent = self.dimensions[d].tile_extent_i128()?;
					let start = self.tile_start(d, tile_coords[d])?;
					pos = pos * extent as u64 + (cell[d] - start) as u64;
				}
			}
			CellOrder::Hilbert => unreachable!(),
		}
		Ok(pos)
	}

	/// The space tile of `tile_coords` as an [`NDRange`], clipped to the
	/// domain.
	pub fn tile_ndrange(&self, tile_coords: &[u64]) -> Result<NDRange> {
		let mut ranges = Vec::with_capacity(self.dim_num());
		for d in 0..self.dim_num() {
			let dim = &self.dimensions[d];
			let (_, hi) = dim.domain_i128()?;
			let extent = dim.tile_extent_i128()?;
			let start = self.tile_start(d, tile_coords[d])?;
			let end = (start + extent - 1).min(hi);
			ranges.push(crate::types::TypedRange::from_bytes(
				dim.datatype(),
				&crate::types::i128_to_value(dim.datatype(), start)?,
				&crate::types::i128_to_value(dim.datatype(), end)?,
			)?);
		}
		Ok(ranges)
	}
}
