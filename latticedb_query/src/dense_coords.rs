//! Dense coordinate synthesis.
//!
//! When a dense read binds coordinate buffers, the coordinates are generated
//! arithmetically from the partition geometry; no tile is ever read. The
//! `skip`/`take` window keeps the synthesized coordinates aligned with the
//! attribute cells the copy engine actually emitted, across resumed
//! iterations. Global order walks the space tiles and emits each tile's
//! crop in cell order.

use anyhow::{Context, Result, ensure};
use latticedb_core::{ArraySchema, Layout, i128_to_value, value_to_i128};

use crate::buffers::QueryBuffers;
use crate::subarray::Subarray;

/// The coordinate fields the caller bound: the zipped pseudo-field or a
/// subset of the dimensions.
fn bound_coord_fields(schema: &ArraySchema, buffers: &QueryBuffers) -> Vec<String> {
	let mut fields = Vec::new();
	for name in buffers.names() {
		if name == latticedb_core::COORDS_FIELD || schema.is_dim(name) {
			fields.push(name.to_string());
		}
	}
	fields
}

/// `true` when any bound buffer names a coordinate field.
pub fn has_coord_buffers(schema: &ArraySchema, buffers: &QueryBuffers) -> bool {
	!bound_coord_fields(schema, buffers).is_empty()
}

/// How many more cells the bound coordinate buffers can hold.
pub fn coord_cell_capacity(schema: &ArraySchema, buffers: &QueryBuffers) -> Result<Option<u64>> {
	let fields = bound_coord_fields(schema, buffers);
	if fields.is_empty() {
		return Ok(None);
	}
	let mut cap = u64::MAX;
	for field in fields {
		let cell_size = schema.cell_size(&field)?;
		let buffer = buffers.get(&field).context("buffer disappeared")?;
		cap = cap.min((buffer.fixed_capacity() - buffer.fixed_size) / cell_size);
	}
	Ok(Some(cap))
}

/// Writes `take` cells of the partition's coordinates, skipping the first
/// `skip` cells of its geometry. The caller sizes `take` to what fits.
pub fn fill_dense_coords(
	schema: &ArraySchema,
	partition: &Subarray,
	buffers: &mut QueryBuffers,
	skip: u64,
	take: u64,
) -> Result<()> {
	let fields = bound_coord_fields(schema, buffers);
	if fields.is_empty() || take == 0 {
		return Ok(());
	}
	let mut window = Window { skip, take };
	match partition.layout() {
		Layout::RowMajor | Layout::ColMajor => {
			fill_row_col(schema, partition, &fields, buffers, &mut window)?;
		}
		Layout::GlobalOrder => {
			for tile_coords in partition.tile_coords()? {
				if window.take == 0 {
					break;
				}
				let cropped = partition.crop_to_tile(&tile_coords)?;
				fill_row_col(schema, &cropped, &fields, buffers, &mut window)?;
			}
		}
		Layout::Unordered => anyhow::bail!("dense reads do not support the unordered layout"),
	}
	ensure!(window.take == 0, "partition geometry ran out before {take} coordinate cells");
	Ok(())
}

struct Window {
	skip: u64,
	take: u64,
}

fn fill_row_col(
	schema: &ArraySchema,
	partition: &Subarray,
	fields: &[String],
	buffers: &mut QueryBuffers,
	window: &mut Window,
) -> Result<()> {
	let domain = schema.domain();
	let dim_num = domain.dim_num();
	let col = partition.layout() == Layout::ColMajor;
	let fast_dim = if col { 0 } else { dim_num - 1 };

	for flat in 0..partition.flat_range_num() {
		let nd = partition.flat_range(flat)?;
		let mut bounds = Vec::with_capacity(dim_num);
		for (d, range) in nd.into_iter().enumerate() {
			let range = range.context("dense subarrays have bounded dimensions")?;
			let datatype = domain.dimension(d).datatype();
			bounds.push((
				value_to_i128(datatype, range.start_bytes())?,
				value_to_i128(datatype, range.end_bytes())?,
			));
		}
		if bounds.iter().any(|(lo, hi)| lo > hi) {
			continue;
		}

		let mut row: Vec<i128> = bounds.iter().map(|(lo, _)| *lo).collect();
		loop {
			let run_len = (bounds[fast_dim].1 - bounds[fast_dim].0 + 1) as u64;

			if window.skip >= run_len {
				window.skip -= run_len;
			} else {
				let first = window.skip;
				window.skip = 0;
				for step in first..run_len {
					if window.take == 0 {
						return Ok(());
					}
					row[fast_dim] = bounds[fast_dim].0 + step as i128;
					write_cell(domain, fields, buffers, &row)?;
					window.take -= 1;
				}
				row[fast_dim] = bounds[fast_dim].0;
			}

			// Advance the odometer over the non-fast dimensions.
			let order: Vec<usize> = if col {
				(1..dim_num).collect()
			} else {
				(0..dim_num.saturating_sub(1)).rev().collect()
			};
			let mut advanced = false;
			for d in order {
				if row[d] < bounds[d].1 {
					row[d] += 1;
					advanced = true;
					break;
				}
				row[d] = bounds[d].0;
			}
			if !advanced {
				break;
			}
		}
	}
	Ok(())
}

fn write_cell(
	domain: &latticedb_core::Domain,
	fields: &[String],
	buffers: &mut QueryBuffers,
	row: &[i128],
) -> Result<()> {
	for field in fields {
		let buffer = buffers.get_mut(field).context("buffer disappeared")?;
		if field == latticedb_core::COORDS_FIELD {
			for (d, value) in row.iter().enumerate() {
				let bytes = i128_to_value(domain.dimension(d).datatype(), *value)?;
				let at = buffer.fixed_size as usize;
				buffer.fixed[at..at + bytes.len()].copy_from_slice(&bytes);
				buffer.fixed_size += bytes.len() as u64;
			}
		} else {
			let (d, dim) = domain.dimension_by_name(field).context("unknown dimension")?;
			let bytes = i128_to_value(dim.datatype(), row[d])?;
			let at = buffer.fixed_size as usize;
			buffer.fixed[at..at + bytes.len()].copy_from_slice(&bytes);
			buffer.fixed_size += bytes.len() as u64;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::buffers::BufferSpec;
	use latticedb_core::{
		ArrayType, Attribute, CellOrder, Datatype, Dimension, Domain, TileOrder, TypedRange,
	};
	use std::sync::Arc;

	fn int_range(lo: i32, hi: i32) -> TypedRange {
		TypedRange::from_typed(Datatype::Int32, lo, hi).unwrap()
	}

	fn schema_2d() -> Arc<ArraySchema> {
		let dim = |name: &str| {
			Dimension::new(
				name,
				Datatype::Int32,
				int_range(1, 100),
				Some(10i32.to_le_bytes().to_vec()),
			)
			.unwrap()
		};
		let domain = Domain::new(vec![dim("d1"), dim("d2")], TileOrder::RowMajor, CellOrder::RowMajor).unwrap();
		Arc::new(
			ArraySchema::new(
				ArrayType::Dense,
				domain,
				vec![Attribute::new("a", Datatype::Int32).unwrap()],
			)
			.unwrap(),
		)
	}

	fn read_i32s(bytes: &[u8]) -> Vec<i32> {
		bytes
			.chunks(4)
			.map(|c| i32::from_le_bytes(c.try_into().unwrap()))
			.collect()
	}

	#[test]
	fn test_per_dim_row_major() -> Result<()> {
		let schema = schema_2d();
		let mut subarray = Subarray::new(schema.clone(), Layout::RowMajor);
		subarray.add_range(0, int_range(1, 2))?;
		subarray.add_range(1, int_range(5, 6))?;

		let mut buffers = QueryBuffers::default();
		buffers.set("d1", BufferSpec::fixed(64));
		buffers.set("d2", BufferSpec::fixed(64));
		fill_dense_coords(&schema, &subarray, &mut buffers, 0, 4)?;
		assert_eq!(read_i32s(buffers.get("d1").unwrap().view().data), vec![1, 1, 2, 2]);
		assert_eq!(read_i32s(buffers.get("d2").unwrap().view().data), vec![5, 6, 5, 6]);
		Ok(())
	}

	#[test]
	fn test_zipped_col_major() -> Result<()> {
		let schema = schema_2d();
		let mut subarray = Subarray::new(schema.clone(), Layout::ColMajor);
		subarray.add_range(0, int_range(1, 2))?;
		subarray.add_range(1, int_range(5, 6))?;

		let mut buffers = QueryBuffers::default();
		buffers.set(latticedb_core::COORDS_FIELD, BufferSpec::fixed(64));
		fill_dense_coords(&schema, &subarray, &mut buffers, 0, 4)?;
		let zipped = read_i32s(buffers.get(latticedb_core::COORDS_FIELD).unwrap().view().data);
		assert_eq!(zipped, vec![1, 5, 2, 5, 1, 6, 2, 6]);
		Ok(())
	}

	#[test]
	fn test_skip_take_window_resumes() -> Result<()> {
		let schema = schema_2d();
		let mut subarray = Subarray::new(schema.clone(), Layout::RowMajor);
		subarray.add_range(0, int_range(1, 2))?;
		subarray.add_range(1, int_range(1, 3))?;

		let mut buffers = QueryBuffers::default();
		buffers.set("d2", BufferSpec::fixed(64));
		fill_dense_coords(&schema, &subarray, &mut buffers, 0, 2)?;
		fill_dense_coords(&schema, &subarray, &mut buffers, 2, 4)?;
		// The two windows concatenate to the full row-major walk.
		assert_eq!(read_i32s(buffers.get("d2").unwrap().view().data), vec![1, 2, 3, 1, 2, 3]);
		Ok(())
	}

	#[test]
	fn test_capacity_helper() -> Result<()> {
		let schema = schema_2d();
		let mut buffers = QueryBuffers::default();
		assert_eq!(coord_cell_capacity(&schema, &buffers)?, None);
		buffers.set("d1", BufferSpec::fixed(10));
		assert_eq!(coord_cell_capacity(&schema, &buffers)?, Some(2));
		buffers.set(latticedb_core::COORDS_FIELD, BufferSpec::fixed(64));
		assert_eq!(coord_cell_capacity(&schema, &buffers)?, Some(2));
		Ok(())
	}
}
