//! The array schema: domain, attributes, array type and storage parameters.

use anyhow::{Result, bail, ensure};
use itertools::Itertools;

use super::{ArrayType, Attribute, Dimension, Domain};
use crate::types::Datatype;

/// Name of the zipped coordinates pseudo-field.
pub const COORDS_FIELD: &str = "__coords";

/// Current on-disk fragment format version. Fragments at version 5 and above
/// store one coordinate file per dimension; earlier versions zip all
/// dimensions into a single file. Versions below 3 are not readable.
pub const FORMAT_VERSION: u32 = 5;

/// Oldest readable fragment format version.
pub const MIN_READABLE_VERSION: u32 = 3;

/// A field is either a dimension or an attribute; buffers are bound by field
/// name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldRef<'a> {
	Dimension(usize, &'a Dimension),
	Attribute(&'a Attribute),
	/// The zipped coordinates pseudo-field covering all dimensions.
	Coords,
}

/// The complete description of an array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySchema {
	array_type: ArrayType,
	domain: Domain,
	attributes: Vec<Attribute>,
	capacity: u64,
	allows_dups: bool,
	version: u32,
}

impl ArraySchema {
	pub fn new(array_type: ArrayType, domain: Domain, attributes: Vec<Attribute>) -> Result<Self> {
		ensure!(!attributes.is_empty(), "an array schema needs at least one attribute");
		ensure!(
			attributes.iter().map(Attribute::name).all_unique(),
			"attribute names must be unique"
		);
		for attribute in &attributes {
			ensure!(
				domain.dimension_by_name(attribute.name()).is_none(),
				"attribute name {} collides with a dimension",
				attribute.name()
			);
			ensure!(
				attribute.name() != COORDS_FIELD,
				"attribute name {COORDS_FIELD} is reserved"
			);
		}
		if array_type == ArrayType::Dense {
			domain.ensure_dense_compatible()?;
		}
		Ok(Self {
			array_type,
			domain,
			attributes,
			capacity: 10_000,
			allows_dups: false,
			version: FORMAT_VERSION,
		})
	}

	/// Sets the sparse tile capacity (cells per data tile).
	pub fn set_capacity(mut self, capacity: u64) -> Result<Self> {
		ensure!(capacity > 0, "capacity must be positive");
		self.capacity = capacity;
		Ok(self)
	}

	/// Allows duplicate coordinates; sparse arrays only.
	pub fn set_allows_dups(mut self, allows_dups: bool) -> Result<Self> {
		if allows_dups {
			ensure!(
				self.array_type == ArrayType::Sparse,
				"dense arrays cannot allow duplicates"
			);
		}
		self.allows_dups = allows_dups;
		Ok(self)
	}

	pub fn array_type(&self) -> ArrayType {
		self.array_type
	}

	pub fn dense(&self) -> bool {
		self.array_type == ArrayType::Dense
	}

	pub fn domain(&self) -> &Domain {
		&self.domain
	}

	pub fn dim_num(&self) -> usize {
		self.domain.dim_num()
	}

	pub fn attributes(&self) -> &[Attribute] {
		&self.attributes
	}

	pub fn attribute(&self, name: &str) -> Option<&Attribute> {
		self.attributes.iter().find(|a| a.name() == name)
	}

	pub fn capacity(&self) -> u64 {
		self.capacity
	}

	pub fn allows_dups(&self) -> bool {
		self.allows_dups
	}

	pub fn version(&self) -> u32 {
		self.version
	}

	pub fn is_dim(&self, name: &str) -> bool {
		self.domain.dimension_by_name(name).is_some()
	}

	pub fn is_attr(&self, name: &str) -> bool {
		self.attribute(name).is_some()
	}

	/// Resolves a field name to a dimension, attribute or the zipped-coords
	/// pseudo-field.
	pub fn field(&self, name: &str) -> Option<FieldRef<'_>> {
		if name == COORDS_FIELD {
			return Some(FieldRef::Coords);
		}
		if let Some((idx, dim)) = self.domain.dimension_by_name(name) {
			return Some(FieldRef::Dimension(idx, dim));
		}
		self.attribute(name).map(FieldRef::Attribute)
	}

	/// `true` when the named field stores variable-length cells.
	pub fn var_sized(&self, name: &str) -> Result<bool> {
		match self.field(name) {
			Some(FieldRef::Dimension(_, dim)) => Ok(dim.is_string()),
			Some(FieldRef::Attribute(attr)) => Ok(attr.is_var_sized()),
			Some(FieldRef::Coords) => Ok(false),
			None => bail!("unknown field {name}"),
		}
	}

	/// `true` when the named field is nullable (attributes only).
	pub fn nullable(&self, name: &str) -> Result<bool> {
		match self.field(name) {
			Some(FieldRef::Attribute(attr)) => Ok(attr.nullable()),
			Some(_) => Ok(false),
			None => bail!("unknown field {name}"),
		}
	}

	/// The datatype of a field; the zipped-coords pseudo-field reports the
	/// first dimension's datatype (all dimensions share it when zipped).
	pub fn field_datatype(&self, name: &str) -> Result<Datatype> {
		match self.field(name) {
			Some(FieldRef::Dimension(_, dim)) => Ok(dim.datatype()),
			Some(FieldRef::Attribute(attr)) => Ok(attr.datatype()),
			Some(FieldRef::Coords) => Ok(self.domain.dimension(0).datatype()),
			None => bail!("unknown field {name}"),
		}
	}

	/// The fixed cell size of a field in bytes; fails for var-sized fields.
	pub fn cell_size(&self, name: &str) -> Result<u64> {
		match self.field(name) {
			Some(FieldRef::Dimension(_, dim)) => Ok(dim.coord_size()? as u64),
			Some(FieldRef::Attribute(attr)) => attr.cell_size(),
			Some(FieldRef::Coords) => {
				let coord = self.domain.dimension(0).coord_size()? as u64;
				Ok(coord * self.dim_num() as u64)
			}
			None => bail!("unknown field {name}"),
		}
	}

	/// The fill value for an attribute; dimensions have none.
	pub fn fill_value(&self, name: &str) -> Result<&[u8]> {
		match self.field(name) {
			Some(FieldRef::Attribute(attr)) => Ok(attr.fill_value()),
			Some(_) => bail!("field {name} has no fill value"),
			None => bail!("unknown field {name}"),
		}
	}
}
