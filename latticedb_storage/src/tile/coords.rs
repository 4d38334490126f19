//! A uniform view over zipped and unzipped coordinate tiles.
//!
//! Fragments before format version 5 zip all dimension values of a cell into
//! one interleaved tile; newer fragments store one tile per dimension. All
//! downstream code goes through `coord(cell, dim)` and never cares which
//! layout it is looking at.

use anyhow::{Result, ensure};

use super::Tile;

/// Read access to one tile's coordinates.
#[derive(Debug)]
pub enum CoordTileView<'a> {
	/// One tile holding all dimension values interleaved per cell.
	Zipped {
		dim_num: usize,
		coord_size: usize,
		tile: &'a Tile,
	},
	/// One tile per dimension; string dimensions are var-sized tiles.
	Unzipped { dims: Vec<&'a Tile>, coord_sizes: Vec<usize> },
}

impl<'a> CoordTileView<'a> {
	pub fn new_zipped(tile: &'a Tile, dim_num: usize, coord_size: usize) -> Result<Self> {
		ensure!(dim_num > 0, "zipped view needs at least one dimension");
		ensure!(
			tile.fixed_data().len() == tile.cell_num() * (dim_num * coord_size) as u64,
			"zipped coordinate tile has the wrong size"
		);
		Ok(Self::Zipped {
			dim_num,
			coord_size,
			tile,
		})
	}

	pub fn new_unzipped(dims: Vec<&'a Tile>, coord_sizes: Vec<usize>) -> Result<Self> {
		ensure!(!dims.is_empty(), "unzipped view needs at least one dimension");
		ensure!(dims.len() == coord_sizes.len(), "one coordinate size per dimension");
		let cell_num = dims[0].cell_num();
		ensure!(
			dims.iter().all(|t| t.cell_num() == cell_num),
			"all dimension tiles must hold the same cell count"
		);
		Ok(Self::Unzipped { dims, coord_sizes })
	}

	pub fn cell_num(&self) -> u64 {
		match self {
			Self::Zipped { tile, .. } => tile.cell_num(),
			Self::Unzipped { dims, .. } => dims[0].cell_num(),
		}
	}

	pub fn dim_num(&self) -> usize {
		match self {
			Self::Zipped { dim_num, .. } => *dim_num,
			Self::Unzipped { dims, .. } => dims.len(),
		}
	}

	/// The raw value of dimension `dim` at `cell`; var-sized (string)
	/// dimensions return their var payload slice.
	pub fn coord(&self, cell: u64, dim: usize) -> Result<&'a [u8]> {
		match self {
			Self::Zipped {
				dim_num,
				coord_size,
				tile,
			} => {
				let stride = dim_num * coord_size;
				let start = cell as usize * stride + dim * coord_size;
				Ok(&tile.fixed_data().as_slice()[start..start + coord_size])
			}
			Self::Unzipped { dims, coord_sizes } => {
				let tile = dims[dim];
				if tile.is_var_sized() {
					tile.var_value(cell)
				} else {
					Ok(tile.fixed_value(cell, coord_sizes[dim] as u64))
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use latticedb_core::Blob;

	#[test]
	fn test_zipped_view() -> Result<()> {
		// Two cells of (d1, d2) as i32 pairs: (1, 2), (3, 4).
		let mut data = Vec::new();
		for v in [1i32, 2, 3, 4] {
			data.extend_from_slice(&v.to_le_bytes());
		}
		let tile = Tile::new_fixed(2, Blob::from(data));
		let view = CoordTileView::new_zipped(&tile, 2, 4)?;
		assert_eq!(view.cell_num(), 2);
		assert_eq!(view.dim_num(), 2);
		assert_eq!(view.coord(0, 1)?, &2i32.to_le_bytes());
		assert_eq!(view.coord(1, 0)?, &3i32.to_le_bytes());
		Ok(())
	}

	#[test]
	fn test_zipped_size_checked() {
		let tile = Tile::new_fixed(2, Blob::from(vec![0u8; 10]));
		assert!(CoordTileView::new_zipped(&tile, 2, 4).is_err());
	}

	#[test]
	fn test_unzipped_view_with_strings() -> Result<()> {
		let d1 = Tile::new_fixed(2, Blob::from([5i32.to_le_bytes(), 6i32.to_le_bytes()].concat()));
		let d2 = Tile::new_var(vec![0, 2], Blob::from(b"abxyz".as_slice()));
		let view = CoordTileView::new_unzipped(vec![&d1, &d2], vec![4, 0])?;
		assert_eq!(view.coord(0, 0)?, &5i32.to_le_bytes());
		assert_eq!(view.coord(0, 1)?, b"ab");
		assert_eq!(view.coord(1, 1)?, b"xyz");
		Ok(())
	}

	#[test]
	fn test_unzipped_cell_count_mismatch() {
		let d1 = Tile::new_fixed(2, Blob::from(vec![0u8; 8]));
		let d2 = Tile::new_fixed(3, Blob::from(vec![0u8; 12]));
		assert!(CoordTileView::new_unzipped(vec![&d1, &d2], vec![4, 4]).is_err());
	}
}
