//! The logical tile: one field's unfiltered payload for a fixed number of
//! cells.

use anyhow::{Result, ensure};
use latticedb_core::Blob;

/// One field of one fragment tile after unfiltering.
///
/// Fixed-size fields carry their values in `fixed`. Var-sized fields carry
/// per-cell start offsets plus the var payload; the size of cell `i` is
/// `offsets[i + 1] - offsets[i]`, and for the last cell the var payload size
/// minus its start offset. Nullable fields add one validity byte per cell
/// (zero means null).
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
	cell_num: u64,
	fixed: Blob,
	offsets: Option<Vec<u64>>,
	var: Option<Blob>,
	validity: Option<Blob>,
}

impl Tile {
	/// Creates a fixed-size tile; `fixed` must hold `cell_num` whole cells.
	pub fn new_fixed(cell_num: u64, fixed: Blob) -> Self {
		Self {
			cell_num,
			fixed,
			offsets: None,
			var: None,
			validity: None,
		}
	}

	/// Creates a var-sized tile from per-cell offsets and the var payload.
	pub fn new_var(offsets: Vec<u64>, var: Blob) -> Self {
		Self {
			cell_num: offsets.len() as u64,
			fixed: Blob::new_empty(),
			offsets: Some(offsets),
			var: Some(var),
			validity: None,
		}
	}

	pub fn with_validity(mut self, validity: Blob) -> Result<Self> {
		ensure!(
			validity.len() == self.cell_num,
			"validity must hold one byte per cell"
		);
		self.validity = Some(validity);
		Ok(self)
	}

	pub fn cell_num(&self) -> u64 {
		self.cell_num
	}

	pub fn is_var_sized(&self) -> bool {
		self.offsets.is_some()
	}

	pub fn fixed_data(&self) -> &Blob {
		&self.fixed
	}

	pub fn offsets(&self) -> Option<&[u64]> {
		self.offsets.as_deref()
	}

	pub fn var_data(&self) -> Option<&Blob> {
		self.var.as_ref()
	}

	pub fn validity(&self) -> Option<&Blob> {
		self.validity.as_ref()
	}

	/// `true` when the cell is valid (or the tile has no validity vector).
	pub fn cell_valid(&self, cell: u64) -> bool {
		match &self.validity {
			Some(validity) => validity.as_slice()[cell as usize] != 0,
			None => true,
		}
	}

	/// The fixed-size value of one cell.
	pub fn fixed_value(&self, cell: u64, cell_size: u64) -> &[u8] {
		let start = (cell * cell_size) as usize;
		&self.fixed.as_slice()[start..start + cell_size as usize]
	}

	/// Start offset and byte length of one var-sized cell value.
	pub fn var_value_range(&self, cell: u64) -> Result<(u64, u64)> {
		let offsets = self
			.offsets
			.as_ref()
			.ok_or_else(|| anyhow::anyhow!("tile is not var-sized"))?;
		let var_len = self.var.as_ref().map_or(0, Blob::len);
		let i = cell as usize;
		ensure!(i < offsets.len(), "cell {cell} out of range");
		let start = offsets[i];
		let end = if i + 1 < offsets.len() { offsets[i + 1] } else { var_len };
		ensure!(start <= end && end <= var_len, "corrupt var offsets in tile");
		Ok((start, end - start))
	}

	/// The var-sized value of one cell.
	pub fn var_value(&self, cell: u64) -> Result<&[u8]> {
		let (start, len) = self.var_value_range(cell)?;
		let var = self.var.as_ref().unwrap();
		Ok(&var.as_slice()[start as usize..(start + len) as usize])
	}

	/// Resident byte size, used for memory accounting.
	pub fn mem_size(&self) -> u64 {
		self.fixed.len()
			+ self.offsets.as_ref().map_or(0, |o| o.len() as u64 * 8)
			+ self.var.as_ref().map_or(0, Blob::len)
			+ self.validity.as_ref().map_or(0, Blob::len)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fixed_tile() {
		let tile = Tile::new_fixed(3, Blob::from(vec![1u8, 0, 2, 0, 3, 0]));
		assert_eq!(tile.cell_num(), 3);
		assert!(!tile.is_var_sized());
		assert_eq!(tile.fixed_value(1, 2), &[2, 0]);
	}

	#[test]
	fn test_var_tile_sizes() -> Result<()> {
		// Values: "aa", "", "bcd"
		let tile = Tile::new_var(vec![0, 2, 2], Blob::from(b"aabcd".as_slice()));
		assert!(tile.is_var_sized());
		assert_eq!(tile.var_value(0)?, b"aa");
		assert_eq!(tile.var_value(1)?, b"");
		assert_eq!(tile.var_value(2)?, b"bcd");
		assert_eq!(tile.var_value_range(2)?, (2, 3));
		assert!(tile.var_value(3).is_err());
		Ok(())
	}

	#[test]
	fn test_validity() -> Result<()> {
		let tile = Tile::new_fixed(2, Blob::from(vec![1u8, 2]))
			.with_validity(Blob::from(vec![1u8, 0]))?;
		assert!(tile.cell_valid(0));
		assert!(!tile.cell_valid(1));
		assert!(
			Tile::new_fixed(2, Blob::new_empty())
				.with_validity(Blob::from(vec![1u8]))
				.is_err()
		);
		Ok(())
	}

	#[test]
	fn test_mem_size() {
		let tile = Tile::new_var(vec![0, 2], Blob::from(b"abcd".as_slice()));
		assert_eq!(tile.mem_size(), 16 + 4);
	}
}
