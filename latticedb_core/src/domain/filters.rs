//! Filter pipeline descriptors attached to dimensions and attributes.
//!
//! The schema only names the filters; applying and reversing them is the
//! storage layer's job.

use anyhow::{Result, bail};

/// A single tile filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
	Gzip,
	Brotli,
	Zstd,
}

impl FilterKind {
	/// Stable on-disk code of the filter.
	pub fn code(&self) -> u8 {
		match self {
			FilterKind::Gzip => 1,
			FilterKind::Brotli => 2,
			FilterKind::Zstd => 3,
		}
	}

	pub fn from_code(code: u8) -> Result<Self> {
		Ok(match code {
			1 => FilterKind::Gzip,
			2 => FilterKind::Brotli,
			3 => FilterKind::Zstd,
			_ => bail!("unknown filter code {code}"),
		})
	}
}

/// The ordered list of filters applied to a field's tiles on write; reading
/// reverses the list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterList(pub Vec<FilterKind>);

impl FilterList {
	pub fn none() -> Self {
		Self(Vec::new())
	}

	pub fn new(filters: Vec<FilterKind>) -> Self {
		Self(filters)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> std::slice::Iter<'_, FilterKind> {
		self.0.iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_code_roundtrip() {
		for kind in [FilterKind::Gzip, FilterKind::Brotli, FilterKind::Zstd] {
			assert_eq!(FilterKind::from_code(kind.code()).unwrap(), kind);
		}
		assert!(FilterKind::from_code(99).is_err());
	}
}
