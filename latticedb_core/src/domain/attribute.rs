//! A named per-cell field stored alongside the coordinates.

use anyhow::{Result, ensure};

use super::FilterList;
use crate::types::{Datatype, PhysicalType};

/// Number of values per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellValNum {
	Fixed(u32),
	Var,
}

/// An attribute: name, datatype, values-per-cell, nullability, fill value and
/// filter pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
	name: String,
	datatype: Datatype,
	cell_val_num: CellValNum,
	nullable: bool,
	fill_value: Vec<u8>,
	filters: FilterList,
}

impl Attribute {
	/// Creates an attribute with one value per cell (or var for strings) and
	/// the default fill value.
	pub fn new(name: &str, datatype: Datatype) -> Result<Self> {
		ensure!(!name.is_empty(), "attribute name must not be empty");
		let cell_val_num = if datatype.is_string() {
			CellValNum::Var
		} else {
			CellValNum::Fixed(1)
		};
		Ok(Self {
			name: name.to_string(),
			datatype,
			cell_val_num,
			nullable: false,
			fill_value: default_fill_value(datatype, cell_val_num),
			filters: FilterList::none(),
		})
	}

	pub fn set_cell_val_num(mut self, cell_val_num: CellValNum) -> Result<Self> {
		if let CellValNum::Fixed(n) = cell_val_num {
			ensure!(n > 0, "cell value number must be positive");
			ensure!(
				!self.datatype.is_string(),
				"string attributes are always var-sized"
			);
		}
		self.cell_val_num = cell_val_num;
		self.fill_value = default_fill_value(self.datatype, cell_val_num);
		Ok(self)
	}

	pub fn set_nullable(mut self, nullable: bool) -> Self {
		self.nullable = nullable;
		self
	}

	/// Overrides the fill value; for fixed-size attributes the length must
	/// equal the cell size.
	pub fn set_fill_value(mut self, fill: Vec<u8>) -> Result<Self> {
		if let CellValNum::Fixed(_) = self.cell_val_num {
			let expected = self.cell_size()?;
			ensure!(
				fill.len() as u64 == expected,
				"fill value must be {expected} bytes for attribute {}",
				self.name
			);
		}
		self.fill_value = fill;
		Ok(self)
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

	pub fn cell_val_num(&self) -> CellValNum {
		self.cell_val_num
	}

	pub fn nullable(&self) -> bool {
		self.nullable
	}

	pub fn fill_value(&self) -> &[u8] {
		&self.fill_value
	}

	pub fn filters(&self) -> &FilterList {
		&self.filters
	}

	pub fn is_var_sized(&self) -> bool {
		matches!(self.cell_val_num, CellValNum::Var) || self.datatype.is_string()
	}

	/// The fixed size of one cell in bytes; fails for var-sized attributes.
	pub fn cell_size(&self) -> Result<u64> {
		match self.cell_val_num {
			CellValNum::Fixed(n) => {
				let value_size = self.datatype.fixed_value_size()?;
				Ok(value_size as u64 * u64::from(n))
			}
			CellValNum::Var => anyhow::bail!("attribute {} is var-sized", self.name),
		}
	}
}

/// The default fill value: minimum for signed integers, maximum for unsigned,
/// NaN for floats, a zero byte for blobs, empty for var-sized cells.
fn default_fill_value(datatype: Datatype, cell_val_num: CellValNum) -> Vec<u8> {
	let n = match cell_val_num {
		CellValNum::Fixed(n) => n as usize,
		CellValNum::Var => return Vec::new(),
	};
	let one: Vec<u8> = match datatype.physical() {
		PhysicalType::I8 => i8::MIN.to_le_bytes().to_vec(),
		PhysicalType::I16 => i16::MIN.to_le_bytes().to_vec(),
		PhysicalType::I32 => i32::MIN.to_le_bytes().to_vec(),
		PhysicalType::I64 => i64::MIN.to_le_bytes().to_vec(),
		PhysicalType::U8 => u8::MAX.to_le_bytes().to_vec(),
		PhysicalType::U16 => u16::MAX.to_le_bytes().to_vec(),
		PhysicalType::U32 => u32::MAX.to_le_bytes().to_vec(),
		PhysicalType::U64 => u64::MAX.to_le_bytes().to_vec(),
		PhysicalType::F32 => f32::NAN.to_le_bytes().to_vec(),
		PhysicalType::F64 => f64::NAN.to_le_bytes().to_vec(),
		PhysicalType::Bytes => vec![0u8],
	};
	one.repeat(n)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fixed_attribute() {
		let a = Attribute::new("a", Datatype::Int32).unwrap();
		assert_eq!(a.cell_size().unwrap(), 4);
		assert!(!a.is_var_sized());
		assert_eq!(a.fill_value(), &i32::MIN.to_le_bytes());
	}

	#[test]
	fn test_multi_value_cell() {
		let a = Attribute::new("a", Datatype::UInt16)
			.unwrap()
			.set_cell_val_num(CellValNum::Fixed(3))
			.unwrap();
		assert_eq!(a.cell_size().unwrap(), 6);
		assert_eq!(a.fill_value().len(), 6);
	}

	#[test]
	fn test_string_attribute_is_var() {
		let a = Attribute::new("s", Datatype::StringUtf8).unwrap();
		assert!(a.is_var_sized());
		assert!(a.cell_size().is_err());
		assert!(a.fill_value().is_empty());
	}

	#[test]
	fn test_custom_fill_value() {
		let a = Attribute::new("a", Datatype::Int32)
			.unwrap()
			.set_fill_value(0i32.to_le_bytes().to_vec())
			.unwrap();
		assert_eq!(a.fill_value(), &0i32.to_le_bytes());
		assert!(
			Attribute::new("a", Datatype::Int32)
				.unwrap()
				.set_fill_value(vec![0u8; 3])
				.is_err()
		);
	}

	#[test]
	fn test_nullable() {
		let a = Attribute::new("a", Datatype::Float64).unwrap().set_nullable(true);
		assert!(a.nullable());
	}
}
