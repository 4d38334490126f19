//! Layout enumerations: result orders, cell orders, tile orders.

use std::fmt;

/// The order in which a query emits its result cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
	RowMajor,
	ColMajor,
	/// The domain-defined global order (tile order, then cell order in tile).
	GlobalOrder,
	/// No ordering guarantee; cheapest to produce.
	Unordered,
}

/// The order of cells inside one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellOrder {
	RowMajor,
	ColMajor,
	/// Hilbert space-filling-curve order over integer-mapped coordinates.
	Hilbert,
}

/// The order of tiles inside the array domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileOrder {
	RowMajor,
	ColMajor,
}

/// Dense arrays materialize every coordinate of the domain, sparse arrays
/// only the written ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayType {
	Dense,
	Sparse,
}

impl fmt::Display for Layout {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Layout::RowMajor => "row-major",
			Layout::ColMajor => "col-major",
			Layout::GlobalOrder => "global-order",
			Layout::Unordered => "unordered",
		};
		f.write_str(s)
	}
}

impl fmt::Display for ArrayType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ArrayType::Dense => f.write_str("dense"),
			ArrayType::Sparse => f.write_str("sparse"),
		}
	}
}
