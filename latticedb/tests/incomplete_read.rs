//! Incremental completion: buffer overflow resumption, forward progress,
//! memory budgets, offsets extra element, cancellation and unsplittable
//! queries.

mod common;

use common::*;
use latticedb::{
	AccessMode, Array, ArraySchema, ArrayType, Attribute, BufferSpec, CellValNum, CoreConfig,
	Datatype, IncompleteReason, Layout, OffsetsMode, Query, QueryError, QueryStatus,
};
use latticedb_storage::testing::{FragmentWriter, fixed_column, var_column};
use std::sync::Arc;

async fn hundred_cell_array(path: &std::path::Path) -> anyhow::Result<Arc<Array>> {
	let schema = dense_1d_schema();
	make_array(path, &schema);
	let values: Vec<i32> = (1..=100).collect();
	FragmentWriter::dense(&schema, vec![int32_range(1, 100)])?
		.with_timestamps(1, 1)
		.put_attribute("a", fixed_column(&values))
		.write(path, 1)?;
	Ok(Array::open(path, AccessMode::Read).await.unwrap())
}

#[tokio::test]
async fn test_overflow_mid_slab_then_resume() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let array = hundred_cell_array(&path).await?;

	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	query.add_range(0, int32_range(1, 100)).unwrap();
	// Room for exactly ten i32 cells.
	query.set_buffer("a", BufferSpec::fixed(40)).unwrap();

	let status = query.submit().await.unwrap();
	assert_eq!(status, QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
	assert_eq!(i32s(query.result("a").unwrap().data), (1..=10).collect::<Vec<i32>>());

	// Rebind a larger buffer; the remaining ninety cells complete.
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();
	let status = query.submit().await.unwrap();
	assert!(status.is_complete());
	assert_eq!(i32s(query.result("a").unwrap().data), (11..=100).collect::<Vec<i32>>());
	Ok(())
}

#[tokio::test]
async fn test_forward_progress_until_complete() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let array = hundred_cell_array(&path).await?;

	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	query.add_range(0, int32_range(1, 100)).unwrap();
	query.set_buffer("a", BufferSpec::fixed(28)).unwrap();

	// Every incomplete submit must make progress; the concatenation equals
	// the reference enumeration.
	let mut collected = Vec::new();
	let mut rounds = 0;
	loop {
		let status = query.submit().await.unwrap();
		let chunk = i32s(query.result("a").unwrap().data);
		assert!(!chunk.is_empty(), "an incomplete submit produced no bytes");
		collected.extend(chunk);
		rounds += 1;
		assert!(rounds <= 100, "no forward progress");
		match status {
			QueryStatus::Complete => break,
			QueryStatus::Incomplete(reason) => {
				assert_eq!(reason, IncompleteReason::UserBufferSize);
			}
		}
	}
	assert!(rounds > 1);
	assert_eq!(collected, (1..=100).collect::<Vec<i32>>());
	Ok(())
}

#[tokio::test]
async fn test_unsplittable_when_no_cell_fits() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let array = hundred_cell_array(&path).await?;

	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	query.add_range(0, int32_range(1, 100)).unwrap();
	// Two bytes cannot hold a single i32 cell.
	query.set_buffer("a", BufferSpec::fixed(2)).unwrap();

	let status = query.submit().await.unwrap();
	assert_eq!(status, QueryStatus::Incomplete(IncompleteReason::Unsplittable));
	let (written, _, _) = query.buffer_sizes("a").unwrap();
	assert_eq!(written, 0);
	// The condition persists on resubmits.
	let status = query.submit().await.unwrap();
	assert_eq!(status, QueryStatus::Incomplete(IncompleteReason::Unsplittable));
	Ok(())
}

#[tokio::test]
async fn test_memory_budget_incomplete() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let schema = sparse_1d_schema();
	make_array(&path, &schema);
	let coords: Vec<i32> = (1..=100).collect();
	FragmentWriter::sparse(&schema)
		.with_timestamps(1, 1)
		.put_dim(fixed_column(&coords))
		.put_attribute("a", fixed_column(&coords))
		.write(&path, 1)?;

	let array = Array::open(&path, AccessMode::Read).await.unwrap();
	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	let mut config = CoreConfig::default();
	// Far too small for even one coordinate tile.
	config.memory_budget = 64;
	config.memory_budget_var = 64;
	config.memory_budget_validity = 64;
	query.set_config(config).unwrap();
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();

	let status = query.submit().await.unwrap();
	assert_eq!(status, QueryStatus::Incomplete(IncompleteReason::MemoryBudget));
	Ok(())
}

fn var_int_schema() -> Arc<ArraySchema> {
	let base = sparse_1d_schema();
	let attr = Attribute::new("v", Datatype::Int32)
		.unwrap()
		.set_cell_val_num(CellValNum::Var)
		.unwrap();
	Arc::new(
		ArraySchema::new(ArrayType::Sparse, base.domain().clone(), vec![attr]).unwrap(),
	)
}

#[tokio::test]
async fn test_offsets_extra_element_bytes_and_elements() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let schema = var_int_schema();
	make_array(&path, &schema);

	// Cell values: one int, two ints, zero ints (a zero-length var cell).
	let mut data = Vec::new();
	let offsets = vec![0u64, 4, 12];
	for v in [7i32, 8, 9] {
		data.extend_from_slice(&v.to_le_bytes());
	}
	FragmentWriter::sparse(&schema)
		.with_timestamps(1, 1)
		.put_dim(fixed_column(&[1i32, 2, 3]))
		.put_attribute("v", latticedb_storage::testing::ColumnData::Var { offsets, data })
		.write(&path, 1)?;

	for (mode, expected) in [
		(OffsetsMode::Bytes, vec![0u64, 4, 12, 12]),
		(OffsetsMode::Elements, vec![0u64, 1, 3, 3]),
	] {
		let array = Array::open(&path, AccessMode::Read).await.unwrap();
		let mut query = Query::new(array);
		query.set_layout(Layout::RowMajor).unwrap();
		query.set_offsets_config(mode, 64, true).unwrap();
		query.set_buffer("v", BufferSpec::var(1024, 1024)).unwrap();

		let status = query.submit().await.unwrap();
		assert!(status.is_complete());
		let view = query.result("v").unwrap();
		assert_eq!(u64s(view.data), expected, "mode {mode:?}");
		assert_eq!(view.var.unwrap().len(), 12);
	}
	Ok(())
}

#[tokio::test]
async fn test_extra_element_with_zero_results() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let schema = var_int_schema();
	make_array(&path, &schema);
	FragmentWriter::sparse(&schema)
		.with_timestamps(1, 1)
		.put_dim(fixed_column(&[50i32]))
		.put_attribute("v", var_column(&[b"abcd".as_slice()]))
		.write(&path, 1)?;

	let array = Array::open(&path, AccessMode::Read).await.unwrap();
	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	query.set_offsets_config(OffsetsMode::Bytes, 64, true).unwrap();
	// A range with no results at all.
	query.add_range(0, int32_range(1, 10)).unwrap();
	query.set_buffer("v", BufferSpec::var(1024, 1024)).unwrap();

	let status = query.submit().await.unwrap();
	assert!(status.is_complete());
	let view = query.result("v").unwrap();
	assert_eq!(u64s(view.data), vec![0], "a single zero offset is mandated");
	Ok(())
}

#[tokio::test]
async fn test_cancellation_poisons_the_query() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let array = hundred_cell_array(&path).await?;

	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();
	query.cancellation_token().cancel();

	let result = query.submit().await;
	assert!(matches!(result, Err(QueryError::Cancelled)));
	let result = query.submit().await;
	assert!(matches!(result, Err(QueryError::Cancelled)));
	Ok(())
}

#[tokio::test]
async fn test_finalized_query_rejects_submit() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let array = hundred_cell_array(&path).await?;

	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();
	query.finalize();
	assert!(matches!(
		query.submit().await,
		Err(QueryError::InvalidArgument(_))
	));
	Ok(())
}
