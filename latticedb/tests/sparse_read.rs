//! End-to-end sparse reads: duplicate handling, layouts, zipped
//! coordinates, string dimensions and Hilbert order.

mod common;

use common::*;
use latticedb::{
	AccessMode, Array, ArraySchema, ArrayType, Attribute, BufferSpec, CellOrder, Datatype,
	Dimension, Domain, Layout, Query, TileOrder, TypedRange, hilbert_index,
};
use latticedb_storage::testing::{FragmentWriter, fixed_column, var_column};
use std::path::Path;
use std::sync::Arc;

/// Writes the two fragments of the duplicate scenarios: A at `(1,1) (1,2)
/// (2,1)` with `10 20 30`, then B at `(1,2) (2,2)` with `21 40`.
fn write_two_fragments(path: &Path, schema: &Arc<ArraySchema>) -> anyhow::Result<()> {
	FragmentWriter::sparse(schema)
		.with_timestamps(1, 1)
		.put_dim(fixed_column(&[1i32, 1, 2]))
		.put_dim(fixed_column(&[1i32, 2, 1]))
		.put_attribute("a", fixed_column(&[10i32, 20, 30]))
		.write(path, 1)?;
	FragmentWriter::sparse(schema)
		.with_timestamps(2, 2)
		.put_dim(fixed_column(&[1i32, 2]))
		.put_dim(fixed_column(&[2i32, 2]))
		.put_attribute("a", fixed_column(&[21i32, 40]))
		.write(path, 2)?;
	Ok(())
}

async fn read_all(
	path: &Path,
	layout: Layout,
) -> (Vec<i32>, Vec<i32>, Vec<i32>) {
	let array = Array::open(path, AccessMode::Read).await.unwrap();
	let mut query = Query::new(array);
	query.set_layout(layout).unwrap();
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();
	query.set_buffer("d1", BufferSpec::fixed(1024)).unwrap();
	query.set_buffer("d2", BufferSpec::fixed(1024)).unwrap();
	let status = query.submit().await.unwrap();
	assert!(status.is_complete());
	(
		i32s(query.result("d1").unwrap().data),
		i32s(query.result("d2").unwrap().data),
		i32s(query.result("a").unwrap().data),
	)
}

#[tokio::test]
async fn test_sparse_dups_row_major() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let schema = sparse_2d_schema(true, CellOrder::RowMajor);
	make_array(&path, &schema);
	write_two_fragments(&path, &schema)?;

	let (d1, d2, a) = read_all(&path, Layout::RowMajor).await;
	assert_eq!(d1, vec![1, 1, 1, 2, 2]);
	assert_eq!(d2, vec![1, 2, 2, 1, 2]);
	assert_eq!(a, vec![10, 20, 21, 30, 40]);
	Ok(())
}

#[tokio::test]
async fn test_sparse_no_dups_newest_wins() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let schema = sparse_2d_schema(false, CellOrder::RowMajor);
	make_array(&path, &schema);
	write_two_fragments(&path, &schema)?;

	let (d1, d2, a) = read_all(&path, Layout::RowMajor).await;
	assert_eq!(d1, vec![1, 1, 2, 2]);
	assert_eq!(d2, vec![1, 2, 1, 2]);
	assert_eq!(a, vec![10, 21, 30, 40]);
	Ok(())
}

#[tokio::test]
async fn test_sparse_col_major_order() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let schema = sparse_2d_schema(true, CellOrder::RowMajor);
	make_array(&path, &schema);
	write_two_fragments(&path, &schema)?;

	let (d1, d2, a) = read_all(&path, Layout::ColMajor).await;
	assert_eq!(d1, vec![1, 2, 1, 1, 2]);
	assert_eq!(d2, vec![1, 1, 2, 2, 2]);
	assert_eq!(a, vec![10, 30, 20, 21, 40]);
	Ok(())
}

#[tokio::test]
async fn test_unordered_dups_with_overlapping_ranges() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let base = sparse_1d_schema();
	let schema = Arc::new(
		ArraySchema::new(
			ArrayType::Sparse,
			base.domain().clone(),
			base.attributes().to_vec(),
		)?
		.set_allows_dups(true)?,
	);
	make_array(&path, &schema);
	FragmentWriter::sparse(&schema)
		.with_timestamps(1, 1)
		.put_dim(fixed_column(&[3i32, 7]))
		.put_attribute("a", fixed_column(&[30i32, 70]))
		.write(&path, 1)?;

	let array = Array::open(&path, AccessMode::Read).await.unwrap();
	let mut query = Query::new(array);
	query.set_layout(Layout::Unordered).unwrap();
	// Cell 3 falls into both ranges and is emitted twice.
	query.add_range(0, int32_range(1, 5)).unwrap();
	query.add_range(0, int32_range(3, 10)).unwrap();
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();

	let status = query.submit().await.unwrap();
	assert!(status.is_complete());
	let mut values = i32s(query.result("a").unwrap().data);
	values.sort_unstable();
	assert_eq!(values, vec![30, 30, 70]);
	Ok(())
}

#[tokio::test]
async fn test_zipped_coordinates_fragment() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let schema = sparse_1d_schema();
	make_array(&path, &schema);

	// Format version 4 stores one interleaved coordinate tile.
	FragmentWriter::sparse(&schema)
		.with_version(4)
		.with_timestamps(1, 1)
		.put_dim(fixed_column(&[20i32, 5, 42]))
		.put_attribute("a", fixed_column(&[2i32, 1, 3]))
		.write(&path, 1)?;

	let array = Array::open(&path, AccessMode::Read).await.unwrap();
	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();
	query.set_buffer("d", BufferSpec::fixed(1024)).unwrap();

	let status = query.submit().await.unwrap();
	assert!(status.is_complete());
	assert_eq!(i32s(query.result("d").unwrap().data), vec![5, 20, 42]);
	assert_eq!(i32s(query.result("a").unwrap().data), vec![1, 2, 3]);
	Ok(())
}

#[tokio::test]
async fn test_string_dimension_ranges() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let dim = Dimension::new_string("key")?;
	let domain = Domain::new(vec![dim], TileOrder::RowMajor, CellOrder::RowMajor)?;
	let schema = Arc::new(ArraySchema::new(
		ArrayType::Sparse,
		domain,
		vec![Attribute::new("a", Datatype::Int32)?],
	)?);
	make_array(&path, &schema);

	FragmentWriter::sparse(&schema)
		.with_timestamps(1, 1)
		.put_dim(var_column(&[b"apple".as_slice(), b"b", b"banana", b"cherry"]))
		.put_attribute("a", fixed_column(&[1i32, 2, 3, 4]))
		.write(&path, 1)?;

	let array = Array::open(&path, AccessMode::Read).await.unwrap();
	let mut query = Query::new(array);
	query.set_layout(Layout::RowMajor).unwrap();
	// The upper bound "b" is a strict byte-wise prefix of "banana": "b"
	// itself is inside the range, "banana" is not.
	query
		.add_range(0, TypedRange::from_bytes(Datatype::StringAscii, b"az", b"b")?)
		.unwrap();
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();
	query.set_buffer("key", BufferSpec::var(1024, 1024)).unwrap();

	let status = query.submit().await.unwrap();
	assert!(status.is_complete());
	assert_eq!(i32s(query.result("a").unwrap().data), vec![2]);
	let key = query.result("key").unwrap();
	assert_eq!(key.var.unwrap(), b"b");
	assert_eq!(u64s(key.data), vec![0]);
	Ok(())
}

#[tokio::test]
async fn test_global_order_hilbert_is_monotone() -> anyhow::Result<()> {
	let dir = tempfile::tempdir()?;
	let path = dir.path().join("array");
	let schema = sparse_2d_schema(false, CellOrder::Hilbert);
	make_array(&path, &schema);

	FragmentWriter::sparse(&schema)
		.with_timestamps(1, 1)
		.put_dim(fixed_column(&[1i32, 10, 3, 7, 5]))
		.put_dim(fixed_column(&[1i32, 10, 8, 2, 5]))
		.put_attribute("a", fixed_column(&[1i32, 2, 3, 4, 5]))
		.write(&path, 1)?;

	let array = Array::open(&path, AccessMode::Read).await.unwrap();
	let schema = array.schema().clone();
	let mut query = Query::new(array);
	query.set_layout(Layout::GlobalOrder).unwrap();
	query.set_buffer("d1", BufferSpec::fixed(1024)).unwrap();
	query.set_buffer("d2", BufferSpec::fixed(1024)).unwrap();
	query.set_buffer("a", BufferSpec::fixed(1024)).unwrap();

	let status = query.submit().await.unwrap();
	assert!(status.is_complete());
	let d1 = i32s(query.result("d1").unwrap().data);
	let d2 = i32s(query.result("d2").unwrap().data);
	assert_eq!(d1.len(), 5);

	// Emitted cells must be non-decreasing under the Hilbert index.
	let indices: Vec<u64> = d1
		.iter()
		.zip(d2.iter())
		.map(|(x, y)| {
			let xb = x.to_le_bytes();
			let yb = y.to_le_bytes();
			hilbert_index(schema.domain(), &[xb.as_slice(), yb.as_slice()]).unwrap()
		})
		.collect();
	assert!(indices.windows(2).all(|w| w[0] <= w[1]), "not in hilbert order: {indices:?}");
	Ok(())
}
