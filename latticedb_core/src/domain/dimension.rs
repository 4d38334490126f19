//! A named coordinate axis of the array domain.

use anyhow::{Context, Result, ensure};

use super::FilterList;
use crate::dispatch_physical;
use crate::types::{Datatype, PhysicalValue, TypedRange, value_to_i128};

/// A dimension: name, datatype, bounded domain (except for strings), and an
/// optional tile extent.
///
/// Invariants: numeric dimensions carry a domain with `lo <= hi`; string
/// dimensions are `StringAscii`, unbounded, and have no tile extent.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
	name: String,
	datatype: Datatype,
	domain: Option<TypedRange>,
	tile_extent: Option<Vec<u8>>,
	filters: FilterList,
}

impl Dimension {
	/// Creates a numeric (or calendar/clock) dimension.
	pub fn new(
		name: &str,
		datatype: Datatype,
		domain: TypedRange,
		tile_extent: Option<Vec<u8>>,
	) -> Result<Self> {
		ensure!(!name.is_empty(), "dimension name must not be empty");
		ensure!(
			!datatype.is_string(),
			"string dimensions must be created with Dimension::new_string"
		);
		ensure!(
			domain.datatype() == datatype,
			"domain datatype {} does not match dimension datatype {datatype}",
			domain.datatype()
		);
		if let Some(extent) = &tile_extent {
			let size = datatype.fixed_value_size()?;
			ensure!(
				extent.len() == size,
				"tile extent for {datatype} must be {size} bytes"
			);
			if datatype.is_integral() {
				let e = value_to_i128(datatype, extent)?;
				ensure!(e > 0, "tile extent must be positive");
			}
		}
		Ok(Self {
			name: name.to_string(),
			datatype,
			domain: Some(domain),
			tile_extent,
			filters: FilterList::none(),
		})
	}

	/// Creates an unbounded ASCII string dimension.
	pub fn new_string(name: &str) -> Result<Self> {
		ensure!(!name.is_empty(), "dimension name must not be empty");
		Ok(Self {
			name: name.to_string(),
			datatype: Datatype::StringAscii,
			domain: None,
			tile_extent: None,
			filters: FilterList::none(),
		})
	}

	pub fn with_filters(mut self, filters: FilterList) -> Self {
		self.filters = filters;
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn datatype(&self) -> Datatype {
		self.datatype
	}

	pub fn filters(&self) -> &FilterList {
		&self.filters
	}

	/// The dimension's domain; `None` for unbounded string dimensions.
	pub fn domain(&self) -> Option<&TypedRange> {
		self.domain.as_ref()
	}

	pub fn tile_extent_bytes(&self) -> Option<&[u8]> {
		self.tile_extent.as_deref()
	}

	pub fn is_string(&self) -> bool {
		self.datatype.is_string()
	}

	/// Size of one coordinate value; fails for string dimensions.
	pub fn coord_size(&self) -> Result<usize> {
		self
			.datatype
			.fixed_value_size()
			.with_context(|| format!("dimension {} has no fixed coordinate size", self.name))
	}

	/// The tile extent as `i128`; fails when none is defined.
	pub fn tile_extent_i128(&self) -> Result<i128> {
		let extent = self
			.tile_extent
			.as_ref()
			.with_context(|| format!("dimension {} has no tile extent", self.name))?;
		value_to_i128(self.datatype, extent)
	}

	/// The domain bounds as `i128`; fails for string or float dimensions.
	pub fn domain_i128(&self) -> Result<(i128, i128)> {
		let domain = self
			.domain
			.as_ref()
			.with_context(|| format!("dimension {} is unbounded", self.name))?;
		Ok((
			value_to_i128(self.datatype, domain.start_bytes())?,
			value_to_i128(self.datatype, domain.end_bytes())?,
		))
	}

	/// Maps a coordinate into `[0, 2^bits)` for Hilbert bucketing.
	///
	/// Numeric coordinates are normalized linearly over the dimension domain;
	/// string coordinates use their first eight bytes, big-endian.
	pub fn map_to_uint64(&self, coord: &[u8], bits: u32) -> u64 {
		let buckets = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
		if self.datatype.is_string() {
			let mut prefix = [0u8; 8];
			let n = coord.len().min(8);
			prefix[..n].copy_from_slice(&coord[..n]);
			let raw = u64::from_be_bytes(prefix);
			return ((raw as f64) / (u64::MAX as f64) * (buckets as f64)) as u64;
		}
		let domain = match &self.domain {
			Some(d) => d,
			None => return 0,
		};
		dispatch_physical!(
			self.datatype.physical(),
			T => {
				let (lo, hi) = domain.typed::<T>();
				let value = T::read_le(coord);
				let span = hi.to_f64_lossy() - lo.to_f64_lossy();
				if span <= 0.0 {
					0
				} else {
					let norm = (value.to_f64_lossy() - lo.to_f64_lossy()) / span;
					(norm.clamp(0.0, 1.0) * (buckets as f64)) as u64
				}
			},
			0
		)
	}

	/// The full domain as a range; fails for unbounded dimensions.
	pub fn full_range(&self) -> Result<TypedRange> {
		self
			.domain
			.clone()
			.with_context(|| format!("dimension {} is unbounded", self.name))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dim() -> Dimension {
		Dimension::new(
			"d",
			Datatype::Int32,
			TypedRange::from_typed(Datatype::Int32, 1, 100).unwrap(),
			Some(10i32.to_le_bytes().to_vec()),
		)
		.unwrap()
	}

	#[test]
	fn test_numeric_dimension() {
		let d = dim();
		assert_eq!(d.coord_size().unwrap(), 4);
		assert_eq!(d.tile_extent_i128().unwrap(), 10);
		assert_eq!(d.domain_i128().unwrap(), (1, 100));
		assert!(!d.is_string());
	}

	#[test]
	fn test_string_dimension() {
		let d = Dimension::new_string("s").unwrap();
		assert!(d.is_string());
		assert!(d.domain().is_none());
		assert!(d.tile_extent_bytes().is_none());
		assert!(d.coord_size().is_err());
	}

	#[test]
	fn test_invalid_extent() {
		let result = Dimension::new(
			"d",
			Datatype::Int32,
			TypedRange::from_typed(Datatype::Int32, 1, 100).unwrap(),
			Some(0i32.to_le_bytes().to_vec()),
		);
		assert!(result.is_err());
	}

	#[test]
	fn test_map_to_uint64_monotone() {
		let d = dim();
		let a = d.map_to_uint64(&1i32.to_le_bytes(), 16);
		let b = d.map_to_uint64(&50i32.to_le_bytes(), 16);
		let c = d.map_to_uint64(&100i32.to_le_bytes(), 16);
		assert!(a < b && b < c);
		assert_eq!(a, 0);
		assert_eq!(c, (1 << 16) - 1);
	}
}
