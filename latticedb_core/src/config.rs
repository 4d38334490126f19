//! The engine's configuration surface.
//!
//! The recognized options are exactly the ones below; nothing else affects
//! the read core.

use anyhow::{Result, ensure};

/// How var-sized offsets are reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetsMode {
	/// Offsets count bytes into the var buffer (default).
	Bytes,
	/// Offsets count elements of the field's datatype.
	Elements,
}

/// Width of the offsets the caller's offsets buffers hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetsBits {
	Bits32,
	Bits64,
}

impl OffsetsBits {
	pub fn byte_width(self) -> u64 {
		match self {
			OffsetsBits::Bits32 => 4,
			OffsetsBits::Bits64 => 8,
		}
	}
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
	/// Budget in bytes for fixed-size result data per attribute.
	pub memory_budget: u64,
	/// Budget in bytes for var-size result data per attribute.
	pub memory_budget_var: u64,
	/// Budget in bytes for validity result data per attribute.
	pub memory_budget_validity: u64,
	/// Byte budget of the in-iteration sort sub-partitioner; 0 disables it.
	pub sub_partitioner_memory_budget: u64,
	pub offsets_mode: OffsetsMode,
	pub offsets_bits: OffsetsBits,
	/// Append one extra offset holding the total var size.
	pub offsets_extra_element: bool,
	/// Memory ratios of the unordered-with-duplicates reader; sum must not
	/// exceed 1.
	pub ratio_array_data: f64,
	pub ratio_coords: f64,
	pub ratio_query_condition: f64,
	pub ratio_tile_ranges: f64,
}

impl Default for CoreConfig {
	fn default() -> Self {
		Self {
			memory_budget: 5_368_709_120,
			memory_budget_var: 10_737_418_240,
			// The validity vector is a bytemap, so it is budgeted like the
			// fixed data.
			memory_budget_validity: 5_368_709_120,
			sub_partitioner_memory_budget: 0,
			offsets_mode: OffsetsMode::Bytes,
			offsets_bits: OffsetsBits::Bits64,
			offsets_extra_element: false,
			ratio_array_data: 0.1,
			ratio_coords: 0.5,
			ratio_query_condition: 0.25,
			ratio_tile_ranges: 0.1,
		}
	}
}

impl CoreConfig {
	/// Validates cross-option invariants.
	pub fn validate(&self) -> Result<()> {
		ensure!(self.memory_budget > 0, "memory_budget must be positive");
		let ratios = [
			self.ratio_array_data,
			self.ratio_coords,
			self.ratio_query_condition,
			self.ratio_tile_ranges,
		];
		for ratio in ratios {
			ensure!((0.0..=1.0).contains(&ratio), "reader ratios must lie in [0, 1]");
		}
		ensure!(
			ratios.iter().sum::<f64>() <= 1.0,
			"reader memory ratios must sum to at most 1"
		);
		Ok(())
	}

	/// Parses the offsets bit width from its numeric form.
	pub fn set_offsets_bits(&mut self, bits: u32) -> Result<()> {
		self.offsets_bits = match bits {
			32 => OffsetsBits::Bits32,
			64 => OffsetsBits::Bits64,
			_ => anyhow::bail!("unsupported offsets bit width {bits}; expected 32 or 64"),
		};
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults_validate() {
		CoreConfig::default().validate().unwrap();
	}

	#[test]
	fn test_ratio_sum_checked() {
		let mut config = CoreConfig::default();
		config.ratio_coords = 0.9;
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_offsets_bits() {
		let mut config = CoreConfig::default();
		config.set_offsets_bits(32).unwrap();
		assert_eq!(config.offsets_bits, OffsetsBits::Bits32);
		assert_eq!(config.offsets_bits.byte_width(), 4);
		assert!(config.set_offsets_bits(16).is_err());
	}
}
