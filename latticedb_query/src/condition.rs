//! The query condition engine: a boolean tree of field comparisons applied
//! to result cell slabs.
//!
//! Two application modes exist. `Subtract` drops non-matching cells from the
//! slab list (the sparse readers). `Fill` replaces them with fill-value runs
//! so dense stride semantics stay intact (the refactored dense reader).

use anyhow::{Result, bail, ensure};
use latticedb_core::{ArraySchema, PhysicalValue, compare_values};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::result_tile::{ResultCellSlab, ResultTile, ResultTileArena};

/// Comparison operator of a condition leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
	Lt,
	Le,
	Eq,
	Ne,
	Ge,
	Gt,
}

impl CompareOp {
	fn matches(self, ordering: Ordering) -> bool {
		match self {
			CompareOp::Lt => ordering == Ordering::Less,
			CompareOp::Le => ordering != Ordering::Greater,
			CompareOp::Eq => ordering == Ordering::Equal,
			CompareOp::Ne => ordering != Ordering::Equal,
			CompareOp::Ge => ordering != Ordering::Less,
			CompareOp::Gt => ordering == Ordering::Greater,
		}
	}
}

/// How non-matching cells are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionMode {
	/// Drop non-matching cells.
	#[default]
	Subtract,
	/// Replace non-matching cells with the field's fill value.
	Fill,
}

/// A boolean tree over `(field, op, constant)` leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryCondition {
	Compare {
		field: String,
		op: CompareOp,
		value: Vec<u8>,
	},
	/// `IS NULL` (or `IS NOT NULL` when negated).
	Null { field: String, negate: bool },
	And(Box<QueryCondition>, Box<QueryCondition>),
	Or(Box<QueryCondition>, Box<QueryCondition>),
	Not(Box<QueryCondition>),
}

impl QueryCondition {
	/// A comparison against a typed constant.
	pub fn compare<T: PhysicalValue>(field: &str, op: CompareOp, value: T) -> Self {
		let mut bytes = Vec::with_capacity(T::SIZE);
		value.append_le(&mut bytes);
		Self::Compare {
			field: field.to_string(),
			op,
			value: bytes,
		}
	}

	/// A comparison against raw bytes (var-sized fields).
	pub fn compare_bytes(field: &str, op: CompareOp, value: &[u8]) -> Self {
		Self::Compare {
			field: field.to_string(),
			op,
			value: value.to_vec(),
		}
	}

	pub fn is_null(field: &str) -> Self {
		Self::Null {
			field: field.to_string(),
			negate: false,
		}
	}

	pub fn not_null(field: &str) -> Self {
		Self::Null {
			field: field.to_string(),
			negate: true,
		}
	}

	pub fn and(self, other: QueryCondition) -> Self {
		Self::And(Box::new(self), Box::new(other))
	}

	pub fn or(self, other: QueryCondition) -> Self {
		Self::Or(Box::new(self), Box::new(other))
	}

	pub fn negate(self) -> Self {
		Self::Not(Box::new(self))
	}

	/// The attribute names the tree references.
	pub fn field_names(&self) -> BTreeSet<String> {
		let mut names = BTreeSet::new();
		self.collect_fields(&mut names);
		names
	}

	fn collect_fields(&self, names: &mut BTreeSet<String>) {
		match self {
			Self::Compare { field, .. } | Self::Null { field, .. } => {
				names.insert(field.clone());
			}
			Self::And(a, b) | Self::Or(a, b) => {
				a.collect_fields(names);
				b.collect_fields(names);
			}
			Self::Not(inner) => inner.collect_fields(names),
		}
	}

	/// Validates the tree against a schema: fields must be attributes, and
	/// fixed-size comparisons must carry a value of the cell size.
	pub fn check(&self, schema: &ArraySchema) -> Result<()> {
		match self {
			Self::Compare { field, value, .. } => {
				let attribute = match schema.attribute(field) {
					Some(attribute) => attribute,
					None => bail!("query conditions apply to attributes; {field} is not one"),
				};
				if !attribute.is_var_sized() {
					let cell_size = attribute.cell_size()?;
					ensure!(
						value.len() as u64 == cell_size,
						"condition value for {field} must be {cell_size} bytes"
					);
				}
				Ok(())
			}
			Self::Null { field, .. } => {
				match schema.attribute(field) {
					Some(attribute) => {
						ensure!(attribute.nullable(), "attribute {field} is not nullable");
						Ok(())
					}
					None => bail!("query conditions apply to attributes; {field} is not one"),
				}
			}
			Self::And(a, b) | Self::Or(a, b) => {
				a.check(schema)?;
				b.check(schema)
			}
			Self::Not(inner) => inner.check(schema),
		}
	}

	/// Evaluates the tree for one cell of a result tile.
	fn eval_cell(&self, schema: &ArraySchema, tile: &ResultTile, cell: u64) -> Result<bool> {
		match self {
			Self::Compare { field, op, value } => {
				let attr_tile = tile.attr_tile(field)?;
				if !attr_tile.cell_valid(cell) {
					return Ok(false);
				}
				let datatype = schema.field_datatype(field)?;
				let ordering = if attr_tile.is_var_sized() {
					attr_tile.var_value(cell)?.cmp(value.as_slice())
				} else {
					let cell_size = schema.cell_size(field)?;
					compare_values(datatype, attr_tile.fixed_value(cell, cell_size), value)
				};
				Ok(op.matches(ordering))
			}
			Self::Null { field, negate } => {
				let attr_tile = tile.attr_tile(field)?;
				Ok(attr_tile.cell_valid(cell) == *negate)
			}
			Self::And(a, b) => Ok(a.eval_cell(schema, tile, cell)? && b.eval_cell(schema, tile, cell)?),
			Self::Or(a, b) => Ok(a.eval_cell(schema, tile, cell)? || b.eval_cell(schema, tile, cell)?),
			Self::Not(inner) => Ok(!inner.eval_cell(schema, tile, cell)?),
		}
	}

	/// Evaluates the tree against the attributes' fill values (for dense
	/// fill runs; nullable attributes fill as null).
	fn eval_fill(&self, schema: &ArraySchema) -> Result<bool> {
		match self {
			Self::Compare { field, op, value } => {
				if schema.nullable(field)? {
					return Ok(false);
				}
				let datatype = schema.field_datatype(field)?;
				let fill = schema.fill_value(field)?;
				let ordering = if schema.var_sized(field)? {
					fill.cmp(value.as_slice())
				} else {
					compare_values(datatype, fill, value)
				};
				Ok(op.matches(ordering))
			}
			Self::Null { field, negate } => Ok(schema.nullable(field)? != *negate),
			Self::And(a, b) => Ok(a.eval_fill(schema)? && b.eval_fill(schema)?),
			Self::Or(a, b) => Ok(a.eval_fill(schema)? || b.eval_fill(schema)?),
			Self::Not(inner) => Ok(!inner.eval_fill(schema)?),
		}
	}
}

/// Applies a condition to a slab list, in place of the original list.
pub fn apply_condition_to_slabs(
	condition: &QueryCondition,
	mode: ConditionMode,
	schema: &ArraySchema,
	arena: &ResultTileArena,
	slabs: Vec<ResultCellSlab>,
) -> Result<Vec<ResultCellSlab>> {
	let fill_passes = condition.eval_fill(schema)?;
	let mut out = Vec::with_capacity(slabs.len());

	for slab in slabs {
		let id = match slab.tile {
			Some(id) => id,
			None => {
				// A fill run stays a fill run; under Subtract it survives
				// only when the fill values match the condition.
				if mode == ConditionMode::Fill || fill_passes {
					out.push(slab);
				}
				continue;
			}
		};
		let tile = arena.get(id);

		// Replace the slab with maximal runs of equally classified cells.
		let mut offset = 0;
		while offset < slab.length {
			let passes = condition.eval_cell(schema, tile, slab.start + offset)?;
			let mut end = offset + 1;
			while end < slab.length
				&& condition.eval_cell(schema, tile, slab.start + end)? == passes
			{
				end += 1;
			}
			if passes {
				out.push(ResultCellSlab::new(id, slab.start + offset, end - offset));
			} else if mode == ConditionMode::Fill {
				out.push(ResultCellSlab::fill(end - offset));
			}
			offset = end;
		}
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use latticedb_core::{
		ArrayType, Attribute, Blob, CellOrder, Datatype, Dimension, Domain, TileOrder, TypedRange,
	};
	use latticedb_storage::Tile;

	fn schema() -> ArraySchema {
		let dim = Dimension::new(
			"d",
			Datatype::Int32,
			TypedRange::from_typed(Datatype::Int32, 1, 100).unwrap(),
			Some(10i32.to_le_bytes().to_vec()),
		)
		.unwrap();
		let domain = Domain::new(vec![dim], TileOrder::RowMajor, CellOrder::RowMajor).unwrap();
		ArraySchema::new(
			ArrayType::Sparse,
			domain,
			vec![
				Attribute::new("a", Datatype::Int32).unwrap(),
				Attribute::new("n", Datatype::Int32).unwrap().set_nullable(true),
			],
		)
		.unwrap()
	}

	fn arena_with_tile(values: &[i32], validity: Option<Vec<u8>>) -> (ResultTileArena, usize) {
		let mut arena = ResultTileArena::new();
		let id = arena.insert(0, 0, values.len() as u64);
		let mut bytes = Vec::new();
		for v in values {
			bytes.extend_from_slice(&v.to_le_bytes());
		}
		let mut tile = Tile::new_fixed(values.len() as u64, Blob::from(bytes));
		if let Some(validity) = validity {
			tile = tile.with_validity(Blob::from(validity)).unwrap();
		}
		arena.get_mut(id).attr_tiles.insert("a".to_string(), tile);
		(arena, id)
	}

	#[test]
	fn test_check_rejects_unknown_and_sized() {
		let schema = schema();
		assert!(QueryCondition::compare("a", CompareOp::Lt, 5i32).check(&schema).is_ok());
		assert!(QueryCondition::compare("d", CompareOp::Lt, 5i32).check(&schema).is_err());
		assert!(QueryCondition::compare("a", CompareOp::Lt, 5i64).check(&schema).is_err());
		assert!(QueryCondition::is_null("a").check(&schema).is_err());
		assert!(QueryCondition::is_null("n").check(&schema).is_ok());
	}

	#[test]
	fn test_subtract_mode_drops_cells() -> Result<()> {
		let schema = schema();
		let (arena, id) = arena_with_tile(&[1, 7, 3, 9, 2], None);
		let condition = QueryCondition::compare("a", CompareOp::Lt, 5i32);
		let slabs = apply_condition_to_slabs(
			&condition,
			ConditionMode::Subtract,
			&schema,
			&arena,
			vec![ResultCellSlab::new(id, 0, 5)],
		)?;
		assert_eq!(
			slabs,
			vec![ResultCellSlab::new(id, 0, 1), ResultCellSlab::new(id, 2, 1), ResultCellSlab::new(id, 4, 1)]
		);
		Ok(())
	}

	#[test]
	fn test_fill_mode_preserves_length() -> Result<()> {
		let schema = schema();
		let (arena, id) = arena_with_tile(&[1, 7, 3], None);
		let condition = QueryCondition::compare("a", CompareOp::Lt, 5i32);
		let slabs = apply_condition_to_slabs(
			&condition,
			ConditionMode::Fill,
			&schema,
			&arena,
			vec![ResultCellSlab::new(id, 0, 3)],
		)?;
		assert_eq!(
			slabs,
			vec![
				ResultCellSlab::new(id, 0, 1),
				ResultCellSlab::fill(1),
				ResultCellSlab::new(id, 2, 1),
			]
		);
		let total: u64 = slabs.iter().map(|s| s.length).sum();
		assert_eq!(total, 3);
		Ok(())
	}

	#[test]
	fn test_null_semantics() -> Result<()> {
		let schema = schema();
		let mut arena = ResultTileArena::new();
		let id = arena.insert(0, 0, 3);
		let mut bytes = Vec::new();
		for v in [5i32, 5, 5] {
			bytes.extend_from_slice(&v.to_le_bytes());
		}
		let tile = Tile::new_fixed(3, Blob::from(bytes))
			.with_validity(Blob::from(vec![1u8, 0, 1]))
			.unwrap();
		arena.get_mut(id).attr_tiles.insert("n".to_string(), tile);

		// A null cell compares false to every ordinary operator.
		let eq = QueryCondition::compare("n", CompareOp::Eq, 5i32);
		let slabs = apply_condition_to_slabs(
			&eq,
			ConditionMode::Subtract,
			&schema,
			&arena,
			vec![ResultCellSlab::new(id, 0, 3)],
		)?;
		assert_eq!(slabs, vec![ResultCellSlab::new(id, 0, 1), ResultCellSlab::new(id, 2, 1)]);

		let null = QueryCondition::is_null("n");
		let slabs = apply_condition_to_slabs(
			&null,
			ConditionMode::Subtract,
			&schema,
			&arena,
			vec![ResultCellSlab::new(id, 0, 3)],
		)?;
		assert_eq!(slabs, vec![ResultCellSlab::new(id, 1, 1)]);
		Ok(())
	}

	#[test]
	fn test_condition_monotonicity() -> Result<()> {
		// Adding a conjunct can only shrink the surviving set.
		let schema = schema();
		let (arena, id) = arena_with_tile(&[1, 7, 3, 9, 2], None);
		let base = QueryCondition::compare("a", CompareOp::Lt, 8i32);
		let narrowed = base.clone().and(QueryCondition::compare("a", CompareOp::Gt, 2i32));

		let count = |condition: &QueryCondition| -> Result<u64> {
			let slabs = apply_condition_to_slabs(
				condition,
				ConditionMode::Subtract,
				&schema,
				&arena,
				vec![ResultCellSlab::new(id, 0, 5)],
			)?;
			Ok(slabs.iter().map(|s| s.length).sum())
		};
		assert!(count(&narrowed)? <= count(&base)?);
		assert_eq!(count(&base)?, 4);
		assert_eq!(count(&narrowed)?, 2);
		Ok(())
	}

	#[test]
	fn test_fill_slab_passthrough() -> Result<()> {
		let schema = schema();
		let arena = ResultTileArena::new();
		// Fill value of `a` is i32::MIN, which is < 5.
		let passes = QueryCondition::compare("a", CompareOp::Lt, 5i32);
		let kept = apply_condition_to_slabs(
			&passes,
			ConditionMode::Subtract,
			&schema,
			&arena,
			vec![ResultCellSlab::fill(4)],
		)?;
		assert_eq!(kept, vec![ResultCellSlab::fill(4)]);

		let fails = QueryCondition::compare("a", CompareOp::Gt, 5i32);
		let dropped = apply_condition_to_slabs(
			&fails,
			ConditionMode::Subtract,
			&schema,
			&arena,
			vec![ResultCellSlab::fill(4)],
		)?;
		assert!(dropped.is_empty());
		Ok(())
	}
}
