//! Test support: writes real on-disk fragments so the read path can be
//! exercised end to end.
//!
//! The writer is intentionally small: sparse cells are sorted into the
//! schema's global order and chunked into capacity-sized tiles; dense writes
//! must cover a tile-aligned slice of the domain and are re-tiled from the
//! caller's row-major layout. Everything goes through the same filter
//! pipeline and metadata encoding the reader consumes.

use anyhow::{Context, Result, ensure};
use latticedb_core::{
	ArraySchema, Blob, CellOrder, COORDS_FIELD, NDRange, PhysicalValue, TypedRange, compare_values,
	hilbert_index, value_to_i128,
};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use crate::filter::FilterPipeline;
use crate::fragment::{
	FieldMeta, FieldTileAddresses, FragmentMetadata, METADATA_FILE, format_fragment_name,
};
use crate::io::ValueWriterBlob;

/// Column values for one field, in the caller's cell order.
#[derive(Debug, Clone)]
pub enum ColumnData {
	/// `cell_num * cell_size` bytes.
	Fixed(Vec<u8>),
	/// Per-cell start offsets into `data`.
	Var { offsets: Vec<u64>, data: Vec<u8> },
}

impl ColumnData {
	fn cell_num(&self, cell_size: u64) -> u64 {
		match self {
			ColumnData::Fixed(bytes) => bytes.len() as u64 / cell_size.max(1),
			ColumnData::Var { offsets, .. } => offsets.len() as u64,
		}
	}

	fn value(&self, cell: usize, cell_size: u64) -> &[u8] {
		match self {
			ColumnData::Fixed(bytes) => {
				let start = cell * cell_size as usize;
				&bytes[start..start + cell_size as usize]
			}
			ColumnData::Var { offsets, data } => {
				let start = offsets[cell] as usize;
				let end = if cell + 1 < offsets.len() {
					offsets[cell + 1] as usize
				} else {
					data.len()
				};
				&data[start..end]
			}
		}
	}
}

/// Builds a fixed-size column from typed values.
pub fn fixed_column<T: PhysicalValue>(values: &[T]) -> ColumnData {
	let mut bytes = Vec::with_capacity(values.len() * T::SIZE);
	for v in values {
		v.append_le(&mut bytes);
	}
	ColumnData::Fixed(bytes)
}

/// Builds a var-sized column from byte values.
pub fn var_column<S: AsRef<[u8]>>(values: &[S]) -> ColumnData {
	let mut offsets = Vec::with_capacity(values.len());
	let mut data = Vec::new();
	for v in values {
		offsets.push(data.len() as u64);
		data.extend_from_slice(v.as_ref());
	}
	ColumnData::Var { offsets, data }
}

struct AttributeColumn {
	name: String,
	data: ColumnData,
	validity: Option<Vec<u8>>,
}

/// Writes one fragment of an array.
pub struct FragmentWriter {
	schema: Arc<ArraySchema>,
	dense: bool,
	version: u32,
	timestamp: (u64, u64),
	slice: Option<NDRange>,
	dims: Vec<ColumnData>,
	attrs: Vec<AttributeColumn>,
}

impl FragmentWriter {
	/// A dense fragment covering `slice`, which must be tile-aligned.
	/// Attribute data is supplied row-major over the slice.
	pub fn dense(schema: &Arc<ArraySchema>, slice: NDRange) -> Result<Self> {
		ensure!(schema.dense(), "schema is not dense");
		ensure!(slice.len() == schema.dim_num(), "slice arity mismatch");
		let domain = schema.domain();
		for (d, range) in slice.iter().enumerate() {
			let dim = domain.dimension(d);
			let (lo, hi) = dim.domain_i128()?;
			let extent = dim.tile_extent_i128()?;
			let start = value_to_i128(dim.datatype(), range.start_bytes())?;
			let end = value_to_i128(dim.datatype(), range.end_bytes())?;
			ensure!(start >= lo && end <= hi, "slice leaves the domain on {}", dim.name());
			ensure!(
				(start - lo) % extent == 0,
				"slice start is not tile-aligned on {}",
				dim.name()
			);
			ensure!(
				end == hi || (end - lo + 1) % extent == 0,
				"slice end is not tile-aligned on {}",
				dim.name()
			);
		}
		Ok(Self {
			schema: schema.clone(),
			dense: true,
			version: schema.version(),
			timestamp: (0, 0),
			slice: Some(slice),
			dims: Vec::new(),
			attrs: Vec::new(),
		})
	}

	/// A sparse fragment; coordinates are supplied per dimension.
	pub fn sparse(schema: &Arc<ArraySchema>) -> Self {
		Self {
			schema: schema.clone(),
			dense: false,
			version: schema.version(),
			timestamp: (0, 0),
			slice: None,
			dims: Vec::new(),
			attrs: Vec::new(),
		}
	}

	/// Overrides the fragment format version (e.g. 4 to produce zipped
	/// coordinates).
	pub fn with_version(mut self, version: u32) -> Self {
		self.version = version;
		self
	}

	pub fn with_timestamps(mut self, t1: u64, t2: u64) -> Self {
		self.timestamp = (t1, t2);
		self
	}

	/// Supplies the coordinates of dimension `d` (sparse fragments).
	pub fn put_dim(mut self, data: ColumnData) -> Self {
		self.dims.push(data);
		self
	}

	pub fn put_attribute(mut self, name: &str, data: ColumnData) -> Self {
		self.attrs.push(AttributeColumn {
			name: name.to_string(),
			data,
			validity: None,
		});
		self
	}

	pub fn put_nullable_attribute(mut self, name: &str, data: ColumnData, validity: Vec<u8>) -> Self {
		self.attrs.push(AttributeColumn {
			name: name.to_string(),
			data,
			validity: Some(validity),
		});
		self
	}

	/// Writes the fragment into `array_dir` and returns its directory name.
	pub fn write(self, array_dir: &Path, seq: u64) -> Result<String> {
		if self.dense {
			self.write_dense(array_dir, seq)
		} else {
			self.write_sparse(array_dir, seq)
		}
	}

	fn fragment_name(&self, seq: u64) -> String {
		format_fragment_name(self.timestamp.0, self.timestamp.1, seq, self.version)
	}

	fn write_sparse(self, array_dir: &Path, seq: u64) -> Result<String> {
		let schema = self.schema.clone();
		let domain = schema.domain();
		let dim_num = domain.dim_num();
		ensure!(self.dims.len() == dim_num, "one coordinate column per dimension");

		let cell_num = {
			let dim0 = domain.dimension(0);
			let size = if dim0.is_string() { 0 } else { dim0.coord_size()? as u64 };
			self.dims[0].cell_num(size)
		} as usize;

		// Sort into the global order: tile coordinates in tile order first,
		// then the cell order.
		let coord_at = |cell: usize, d: usize| {
			let dim = domain.dimension(d);
			let size = if dim.is_string() { 0 } else { dim.coord_size().unwrap() as u64 };
			self.dims[d].value(cell, size)
		};
		let tile_coord = |cell: usize, d: usize| -> u64 {
			let dim = domain.dimension(d);
			if dim.is_string() || dim.tile_extent_bytes().is_none() {
				return 0;
			}
			let value = value_to_i128(dim.datatype(), coord_at(cell, d)).unwrap();
			domain.tile_index(d, value).unwrap()
		};

		let mut order: Vec<usize> = (0..cell_num).collect();
		let compare = |&a: &usize, &b: &usize| -> Ordering {
			let ta: Vec<u64> = (0..dim_num).map(|d| tile_coord(a, d)).collect();
			let tb: Vec<u64> = (0..dim_num).map(|d| tile_coord(b, d)).collect();
			let tile_cmp = match domain.tile_order() {
				latticedb_core::TileOrder::RowMajor => ta.cmp(&tb),
				latticedb_core::TileOrder::ColMajor => {
					ta.iter().rev().collect::<Vec<_>>().cmp(&tb.iter().rev().collect::<Vec<_>>())
				}
			};
			if tile_cmp != Ordering::Equal {
				return tile_cmp;
			}
			match domain.cell_order() {
				CellOrder::Hilbert => {
					let ca: Vec<&[u8]> = (0..dim_num).map(|d| coord_at(a, d)).collect();
					let cb: Vec<&[u8]> = (0..dim_num).map(|d| coord_at(b, d)).collect();
					hilbert_index(domain, &ca)
						.unwrap()
						.cmp(&hilbert_index(domain, &cb).unwrap())
				}
				CellOrder::RowMajor => {
					for d in 0..dim_num {
						let c = compare_values(domain.dimension(d).datatype(), coord_at(a, d), coord_at(b, d));
						if c != Ordering::Equal {
							return c;
						}
					}
					Ordering::Equal
				}
				CellOrder::ColMajor => {
					for d in (0..dim_num).rev() {
						let c = compare_values(domain.dimension(d).datatype(), coord_at(a, d), coord_at(b, d));
						if c != Ordering::Equal {
							return c;
						}
					}
					Ordering::Equal
				}
			}
		};
		order.sort_by(compare);

		// Chunk into capacity-sized tiles.
		let capacity = schema.capacity() as usize;
		let tiles: Vec<&[usize]> = order.chunks(capacity.max(1)).collect();
		let cell_counts: Vec<u64> = tiles.iter().map(|t| t.len() as u64).collect();

		// MBRs and the non-empty domain.
		let mut mbrs = Vec::with_capacity(tiles.len());
		for tile_cells in &tiles {
			mbrs.push(bounding_range(domain, tile_cells, &self.dims)?);
		}
		let non_empty_domain = bounding_range(domain, &order, &self.dims)?;

		// Build all field columns in sorted order.
		let mut files = FragmentFiles::new(array_dir, self.fragment_name(seq))?;
		let mut fields = Vec::new();

		if self.version < 5 {
			// Zipped coordinates: all dimensions must share a fixed size.
			let coord_size = domain.dimension(0).coord_size()? as u64;
			for d in 1..dim_num {
				ensure!(
					domain.dimension(d).coord_size()? as u64 == coord_size,
					"zipped coordinates require equally sized dimensions"
				);
			}
			let mut zipped = Vec::new();
			for &cell in &order {
				for d in 0..dim_num {
					zipped.extend_from_slice(coord_at(cell, d));
				}
			}
			let stride = (coord_size as usize) * dim_num;
			let column = ColumnData::Fixed(zipped);
			let pipeline = FilterPipeline::new(domain.dimension(0).filters().clone());
			let identity: Vec<usize> = (0..cell_num).collect();
			let tiles_ident: Vec<&[usize]> = identity.chunks(capacity.max(1)).collect();
			fields.push(files.write_field(
				COORDS_FIELD,
				&column,
				stride as u64,
				None,
				&tiles_ident,
				&pipeline,
			)?);
		} else {
			for d in 0..dim_num {
				let dim = domain.dimension(d);
				let size = if dim.is_string() { 0 } else { dim.coord_size()? as u64 };
				let pipeline = FilterPipeline::new(dim.filters().clone());
				fields.push(files.write_field(dim.name(), &self.dims[d], size, None, &tiles, &pipeline)?);
			}
		}

		for attr in &self.attrs {
			let spec = schema
				.attribute(&attr.name)
				.with_context(|| format!("unknown attribute {}", attr.name))?;
			let size = if spec.is_var_sized() { 0 } else { spec.cell_size()? };
			let pipeline = FilterPipeline::new(spec.filters().clone());
			fields.push(files.write_field(
				&attr.name,
				&attr.data,
				size,
				attr.validity.as_deref(),
				&tiles,
				&pipeline,
			)?);
		}

		let metadata = FragmentMetadata::new(
			files.name.clone(),
			files.dir.clone(),
			self.version,
			false,
			self.timestamp,
			cell_counts,
			non_empty_domain,
			mbrs,
			fields,
		);
		files.finish(&metadata)
	}

	fn write_dense(self, array_dir: &Path, seq: u64) -> Result<String> {
		let schema = self.schema.clone();
		let domain = schema.domain();
		let dim_num = domain.dim_num();
		let slice = self.slice.clone().unwrap();

		// Slice bounds and row-major strides over the slice.
		let mut starts = Vec::with_capacity(dim_num);
		let mut lengths = Vec::with_capacity(dim_num);
		for (d, range) in slice.iter().enumerate() {
			let datatype = domain.dimension(d).datatype();
			let start = value_to_i128(datatype, range.start_bytes())?;
			let end = value_to_i128(datatype, range.end_bytes())?;
			starts.push(start);
			lengths.push((end - start + 1) as u64);
		}
		let source_cells: u64 = lengths.iter().product();

		// The slice's tile grid.
		let mut tile_lo = Vec::with_capacity(dim_num);
		let mut tiles_per_dim = Vec::with_capacity(dim_num);
		for d in 0..dim_num {
			let lo_tile = domain.tile_index(d, starts[d])?;
			let hi_tile = domain.tile_index(d, starts[d] + lengths[d] as i128 - 1)?;
			tile_lo.push(lo_tile);
			tiles_per_dim.push(hi_tile - lo_tile + 1);
		}
		let tile_num: u64 = tiles_per_dim.iter().product();
		let cells_per_tile = domain.cells_per_tile()?;

		// Storage order: slice tiles in tile order, full-extent cells within
		// each tile in cell order. Cells outside the slice get the fill
		// value (index u64::MAX).
		let mut storage_to_source: Vec<u64> = Vec::with_capacity((tile_num * cells_per_tile) as usize);
		for flat_tile in 0..tile_num {
			let tile_coords = unflatten(domain, flat_tile, &tiles_per_dim);
			for cell_pos in 0..cells_per_tile {
				let cell = dense_cell_of_pos(domain, &tile_coords, &tile_lo, cell_pos)?;
				let mut source: u64 = 0;
				let mut inside = true;
				for d in 0..dim_num {
					let rel = cell[d] - starts[d];
					if rel < 0 || rel as u64 >= lengths[d] {
						inside = false;
						break;
					}
					source = source * lengths[d] + rel as u64;
				}
				storage_to_source.push(if inside { source } else { u64::MAX });
			}
		}

		let identity: Vec<usize> = storage_to_source.iter().map(|s| *s as usize).collect();
		let tiles: Vec<&[usize]> = identity.chunks(cells_per_tile as usize).collect();
		let cell_counts = vec![cells_per_tile; tile_num as usize];

		let mut files = FragmentFiles::new(array_dir, self.fragment_name(seq))?;
		let mut fields = Vec::new();
		for attr in &self.attrs {
			let spec = schema
				.attribute(&attr.name)
				.with_context(|| format!("unknown attribute {}", attr.name))?;
			ensure!(!spec.is_var_sized(), "the dense test writer only handles fixed attributes");
			let size = spec.cell_size()?;
			ensure!(
				attr.data.cell_num(size) == source_cells,
				"attribute {} does not cover the slice",
				attr.name
			);
			let pipeline = FilterPipeline::new(spec.filters().clone());
			fields.push(files.write_dense_field(
				&attr.name,
				&attr.data,
				size,
				spec.fill_value(),
				attr.validity.as_deref(),
				&tiles,
				&pipeline,
			)?);
		}

		let metadata = FragmentMetadata::new(
			files.name.clone(),
			files.dir.clone(),
			self.version,
			true,
			self.timestamp,
			cell_counts,
			slice,
			Vec::new(),
			fields,
		);
		files.finish(&metadata)
	}
}

fn unflatten(domain: &latticedb_core::Domain, mut flat: u64, tiles_per_dim: &[u64]) -> Vec<u64> {
	let dim_num = tiles_per_dim.len();
	let mut coords = vec![0u64; dim_num];
	match domain.tile_order() {
		latticedb_core::TileOrder::RowMajor => {
			for d in (0..dim_num).rev() {
				coords[d] = flat % tiles_per_dim[d];
				flat /= tiles_per_dim[d];
			}
		}
		latticedb_core::TileOrder::ColMajor => {
			for d in 0..dim_num {
				coords[d] = flat % tiles_per_dim[d];
				flat /= tiles_per_dim[d];
			}
		}
	}
	coords
}

/// The global coordinates of the cell at `cell_pos` (cell order) inside the
/// tile at `tile_coords` (relative to `tile_lo`).
fn dense_cell_of_pos(
	domain: &latticedb_core::Domain,
	tile_coords: &[u64],
	tile_lo: &[u64],
	mut cell_pos: u64,
) -> Result<Vec<i128>> {
	let dim_num = domain.dim_num();
	let mut extents = Vec::with_capacity(dim_num);
	for d in 0..dim_num {
		extents.push(domain.dimension(d).tile_extent_i128()? as u64);
	}
	let mut rel = vec![0u64; dim_num];
	match domain.cell_order() {
		CellOrder::RowMajor => {
			for d in (0..dim_num).rev() {
				rel[d] = cell_pos % extents[d];
				cell_pos /= extents[d];
			}
		}
		CellOrder::ColMajor => {
			for d in 0..dim_num {
				rel[d] = cell_pos % extents[d];
				cell_pos /= extents[d];
			}
		}
		CellOrder::Hilbert => anyhow::bail!("dense domains never use hilbert cell order"),
	}
	let mut cell = Vec::with_capacity(dim_num);
	for d in 0..dim_num {
		let start = domain.tile_start(d, tile_lo[d] + tile_coords[d])?;
		cell.push(start + rel[d] as i128);
	}
	Ok(cell)
}

fn bounding_range(
	domain: &latticedb_core::Domain,
	cells: &[usize],
	dims: &[ColumnData],
) -> Result<NDRange> {
	let mut ranges = Vec::with_capacity(domain.dim_num());
	for d in 0..domain.dim_num() {
		let dim = domain.dimension(d);
		let datatype = dim.datatype();
		let size = if dim.is_string() { 0 } else { dim.coord_size()? as u64 };
		let mut lo = dims[d].value(cells[0], size);
		let mut hi = lo;
		for &cell in &cells[1..] {
			let v = dims[d].value(cell, size);
			if compare_values(datatype, v, lo) == Ordering::Less {
				lo = v;
			}
			if compare_values(datatype, v, hi) == Ordering::Greater {
				hi = v;
			}
		}
		ranges.push(TypedRange::from_bytes(datatype, lo, hi)?);
	}
	Ok(ranges)
}

/// Accumulates the data files of one fragment before flushing them to disk.
struct FragmentFiles {
	dir: std::path::PathBuf,
	name: String,
	files: Vec<(String, Vec<u8>)>,
}

impl FragmentFiles {
	fn new(array_dir: &Path, name: String) -> Result<Self> {
		Ok(Self {
			dir: array_dir.join(&name),
			name,
			files: Vec::new(),
		})
	}

	fn append(&mut self, file: &str, bytes: &[u8]) -> (u64, u64) {
		if let Some((_, existing)) = self.files.iter_mut().find(|(n, _)| n == file) {
			let offset = existing.len() as u64;
			existing.extend_from_slice(bytes);
			(offset, bytes.len() as u64)
		} else {
			self.files.push((file.to_string(), bytes.to_vec()));
			(0, bytes.len() as u64)
		}
	}

	/// Writes one sparse/zipped field in the permuted tile layout. A
	/// `cell_size` of zero marks a var-sized column.
	fn write_field(
		&mut self,
		name: &str,
		column: &ColumnData,
		cell_size: u64,
		validity: Option<&[u8]>,
		tiles: &[&[usize]],
		pipeline: &FilterPipeline,
	) -> Result<FieldMeta> {
		let var_sized = matches!(column, ColumnData::Var { .. });
		let primary_file = if var_sized {
			format!("{name}_offs.dat")
		} else {
			format!("{name}.dat")
		};
		let mut primary = FieldTileAddresses {
			offsets: Vec::new(),
			sizes: Vec::new(),
		};
		let mut var = FieldTileAddresses {
			offsets: Vec::new(),
			sizes: Vec::new(),
		};
		let mut val = FieldTileAddresses {
			offsets: Vec::new(),
			sizes: Vec::new(),
		};

		for tile_cells in tiles {
			let (primary_payload, var_payload) = if var_sized {
				let mut offsets = ValueWriterBlob::new();
				let mut data = Vec::new();
				for &cell in *tile_cells {
					offsets.write_u64(data.len() as u64);
					data.extend_from_slice(column.value(cell, 0));
				}
				(offsets.into_blob(), Some(Blob::from(data)))
			} else {
				let mut data = Vec::with_capacity(tile_cells.len() * cell_size as usize);
				for &cell in *tile_cells {
					data.extend_from_slice(column.value(cell, cell_size));
				}
				(Blob::from(data), None)
			};

			let framed = pipeline.filter(&primary_payload)?;
			let (offset, size) = self.append(&primary_file, framed.as_slice());
			primary.offsets.push(offset);
			primary.sizes.push(size);

			if let Some(var_payload) = var_payload {
				let framed = pipeline.filter(&var_payload)?;
				let (offset, size) = self.append(&format!("{name}_var.dat"), framed.as_slice());
				var.offsets.push(offset);
				var.sizes.push(size);
			}

			if let Some(validity) = validity {
				let mut bytes = Vec::with_capacity(tile_cells.len());
				for &cell in *tile_cells {
					bytes.push(validity[cell]);
				}
				let framed = FilterPipeline::default().filter(&Blob::from(bytes))?;
				let (offset, size) = self.append(&format!("{name}_validity.dat"), framed.as_slice());
				val.offsets.push(offset);
				val.sizes.push(size);
			}
		}

		Ok(FieldMeta {
			name: name.to_string(),
			primary,
			var: var_sized.then_some(var),
			validity: validity.is_some().then_some(val),
		})
	}

	/// Like `write_field`, but cells with source index `u64::MAX` (outside
	/// the written slice) take the fill value.
	#[allow(clippy::too_many_arguments)]
	fn write_dense_field(
		&mut self,
		name: &str,
		column: &ColumnData,
		cell_size: u64,
		fill: &[u8],
		validity: Option<&[u8]>,
		tiles: &[&[usize]],
		pipeline: &FilterPipeline,
	) -> Result<FieldMeta> {
		let mut primary = FieldTileAddresses {
			offsets: Vec::new(),
			sizes: Vec::new(),
		};
		let mut val = FieldTileAddresses {
			offsets: Vec::new(),
			sizes: Vec::new(),
		};

		for tile_cells in tiles {
			let mut data = Vec::with_capacity(tile_cells.len() * cell_size as usize);
			for &cell in *tile_cells {
				if cell == u64::MAX as usize {
					data.extend_from_slice(fill);
				} else {
					data.extend_from_slice(column.value(cell, cell_size));
				}
			}
			let framed = pipeline.filter(&Blob::from(data))?;
			let (offset, size) = self.append(&format!("{name}.dat"), framed.as_slice());
			primary.offsets.push(offset);
			primary.sizes.push(size);

			if let Some(validity) = validity {
				let mut bytes = Vec::with_capacity(tile_cells.len());
				for &cell in *tile_cells {
					bytes.push(if cell == u64::MAX as usize { 0 } else { validity[cell] });
				}
				let framed = FilterPipeline::default().filter(&Blob::from(bytes))?;
				let (offset, size) = self.append(&format!("{name}_validity.dat"), framed.as_slice());
				val.offsets.push(offset);
				val.sizes.push(size);
			}
		}

		Ok(FieldMeta {
			name: name.to_string(),
			primary,
			var: None,
			validity: validity.is_some().then_some(val),
		})
	}

	fn finish(self, metadata: &FragmentMetadata) -> Result<String> {
		std::fs::create_dir_all(&self.dir)?;
		for (file, bytes) in &self.files {
			std::fs::write(self.dir.join(file), bytes)?;
		}
		std::fs::write(self.dir.join(METADATA_FILE), metadata.serialize().as_slice())?;
		Ok(self.name)
	}
}
