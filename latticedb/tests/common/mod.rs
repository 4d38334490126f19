//! Shared fixtures for the end-to-end read tests.

#![allow(dead_code)]

use latticedb::{
	ArraySchema, ArrayType, Attribute, CellOrder, Datatype, Dimension, Domain, TileOrder,
	TypedRange, create_array,
};
use std::path::Path;
use std::sync::Arc;

pub fn int32_range(lo: i32, hi: i32) -> TypedRange {
	TypedRange::from_typed(Datatype::Int32, lo, hi).unwrap()
}

/// `d ∈ [1, 100]`, tile extent 10, attribute `a: i32`.
pub fn dense_1d_schema() -> Arc<ArraySchema> {
	let dim = Dimension::new(
		"d",
		Datatype::Int32,
		int32_range(1, 100),
		Some(10i32.to_le_bytes().to_vec()),
	)
	.unwrap();
	let domain = Domain::new(vec![dim], TileOrder::RowMajor, CellOrder::RowMajor).unwrap();
	Arc::new(
		ArraySchema::new(
			ArrayType::Dense,
			domain,
			vec![Attribute::new("a", Datatype::Int32).unwrap()],
		)
		.unwrap(),
	)
}

/// `d1, d2 ∈ [1, 10]`, attribute `a: i32`.
pub fn sparse_2d_schema(allows_dups: bool, cell_order: CellOrder) -> Arc<ArraySchema> {
	let dim = |name: &str| {
		Dimension::new(
			name,
			Datatype::Int32,
			int32_range(1, 10),
			Some(10i32.to_le_bytes().to_vec()),
		)
		.unwrap()
	};
	let domain = Domain::new(vec![dim("d1"), dim("d2")], TileOrder::RowMajor, cell_order).unwrap();
	Arc::new(
		ArraySchema::new(
			ArrayType::Sparse,
			domain,
			vec![Attribute::new("a", Datatype::Int32).unwrap()],
		)
		.unwrap()
		.set_allows_dups(allows_dups)
		.unwrap(),
	)
}

/// `d ∈ [1, 100]`, tile extent 10, attribute `a: i32`; sparse.
pub fn sparse_1d_schema() -> Arc<ArraySchema> {
	let dim = Dimension::new(
		"d",
		Datatype::Int32,
		int32_range(1, 100),
		Some(10i32.to_le_bytes().to_vec()),
	)
	.unwrap();
	let domain = Domain::new(vec![dim], TileOrder::RowMajor, CellOrder::RowMajor).unwrap();
	Arc::new(
		ArraySchema::new(
			ArrayType::Sparse,
			domain,
			vec![Attribute::new("a", Datatype::Int32).unwrap()],
		)
		.unwrap(),
	)
}

pub fn make_array(path: &Path, schema: &ArraySchema) {
	let _ = env_logger::builder().is_test(true).try_init();
	create_array(path, schema).unwrap();
}

pub fn i32s(bytes: &[u8]) -> Vec<i32> {
	bytes
		.chunks(4)
		.map(|c| i32::from_le_bytes(c.try_into().unwrap()))
		.collect()
}

pub fn u64s(bytes: &[u8]) -> Vec<u64> {
	bytes
		.chunks(8)
		.map(|c| u64::from_le_bytes(c.try_into().unwrap()))
		.collect()
}
